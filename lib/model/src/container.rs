use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

use crate::labels;

/// A container as observed on the engine. Built from engine
/// list/inspect payloads at the client boundary; everything the
/// planner and monitor need is carried here so they stay free of
/// wire types.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Container {
  pub id: String,
  /// Canonical name without the engine's leading slash.
  pub name: String,
  pub image: Option<String>,
  pub state: ContainerState,
  pub health: Option<HealthStatus>,
  pub exit_code: Option<i64>,
  /// Engine creation timestamp, unix seconds.
  pub created: i64,
  pub labels: HashMap<String, String>,
  /// Names of named volumes mounted into the container.
  pub volumes: Vec<String>,
}

impl Container {
  fn label(&self, key: &str) -> Option<&str> {
    self.labels.get(key).map(String::as_str)
  }

  pub fn project(&self) -> Option<&str> {
    self.label(labels::PROJECT)
  }

  pub fn service(&self) -> Option<&str> {
    self.label(labels::SERVICE)
  }

  pub fn config_hash(&self) -> Option<&str> {
    self.label(labels::CONFIG_HASH)
  }

  pub fn image_digest(&self) -> Option<&str> {
    self.label(labels::IMAGE_DIGEST)
  }

  /// Replica number, 1-based. Containers created by other tools
  /// may lack the label; they sort first and never match a slot.
  pub fn number(&self) -> i64 {
    self
      .label(labels::CONTAINER_NUMBER)
      .and_then(|n| n.parse().ok())
      .unwrap_or_default()
  }

  pub fn one_off(&self) -> bool {
    self.label(labels::ONE_OFF) == Some("True")
  }

  /// Id of the container this one was created to replace.
  pub fn replaces(&self) -> Option<&str> {
    self.label(labels::CONTAINER_REPLACE)
  }

  pub fn is_running(&self) -> bool {
    self.state == ContainerState::Running
  }

  pub fn is_exited(&self) -> bool {
    self.state == ContainerState::Exited
  }
}

/// Engine container states.
#[derive(
  Debug,
  Clone,
  Copy,
  Default,
  PartialEq,
  Eq,
  Serialize,
  Deserialize,
  Display,
  EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ContainerState {
  #[default]
  Unknown,
  Created,
  Restarting,
  Running,
  Paused,
  Exited,
  Dead,
  Removing,
}

#[derive(
  Debug,
  Clone,
  Copy,
  PartialEq,
  Eq,
  Serialize,
  Deserialize,
  Display,
  EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum HealthStatus {
  /// Healthcheck configured but no status yet.
  None,
  Starting,
  Healthy,
  Unhealthy,
}
