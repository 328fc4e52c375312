use anyhow::Context;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::{
  Error, ResourceKind,
  network::{FileObject, Network, Volume},
  service::Service,
};

/// The declared application model. Produced upstream by the
/// file loader; the engine reconciles it against the engine's
/// observed state.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Project {
  /// Short lowercase identifier. Prefixes all resource names
  /// and is written to the project label.
  pub name: String,
  pub services: IndexMap<String, Service>,
  /// Services excluded by profiles. Kept so dependency errors
  /// can name the profiles that would enable them.
  pub disabled_services: IndexMap<String, Service>,
  pub networks: IndexMap<String, Network>,
  pub volumes: IndexMap<String, Volume>,
  pub secrets: IndexMap<String, FileObject>,
  pub configs: IndexMap<String, FileObject>,
  /// Resolved environment the project was loaded with.
  pub environment: IndexMap<String, String>,
  pub working_dir: String,
  /// Source file paths, recorded on created containers.
  pub config_files: Vec<String>,
  /// Join resource names with `_` instead of `-`.
  pub legacy_separator: bool,
}

impl Project {
  pub fn separator(&self) -> char {
    if self.legacy_separator { '_' } else { '-' }
  }

  pub fn service(&self, name: &str) -> anyhow::Result<&Service> {
    self.services.get(name).with_context(|| {
      Error::NotFound {
        kind: ResourceKind::Service,
        name: name.to_string(),
      }
    })
  }

  pub fn service_names(&self) -> Vec<&str> {
    self.services.keys().map(String::as_str).collect()
  }

  /// Environment lookup. Resolution is case-insensitive on
  /// Windows hosts, where env var names are not case-sensitive.
  pub fn env_var(&self, name: &str) -> Option<&str> {
    if let Some(value) = self.environment.get(name) {
      return Some(value);
    }
    if cfg!(windows) {
      return self
        .environment
        .iter()
        .find(|(key, _)| key.eq_ignore_ascii_case(name))
        .map(|(_, value)| value.as_str());
    }
    None
  }

  /// Profiles that would enable a disabled service, for
  /// dependency error messages.
  pub fn profiles_for_disabled(&self, name: &str) -> Vec<&str> {
    self
      .disabled_services
      .get(name)
      .map(|service| {
        service.profiles.iter().map(String::as_str).collect()
      })
      .unwrap_or_default()
  }
}
