use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

/// When an up-to-date check is allowed to recreate containers.
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
pub enum RecreatePolicy {
  /// Recreate when the config hash or image digest diverged.
  #[default]
  Auto,
  /// Never recreate, reuse whatever exists.
  Never,
  /// Recreate unconditionally.
  Force,
}

/// How previously-deployed containers of services no longer in
/// the project are handled.
#[derive(
  Debug, Clone, Copy, Default, PartialEq, Eq, Serialize,
  Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum OrphanPolicy {
  /// Warn with the orphan names.
  #[default]
  Warn,
  Remove,
  Ignore,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ApplyOptions {
  /// Restrict convergence to these services and their
  /// transitive dependencies. Empty means all.
  pub services: Vec<String>,
  pub recreate: RecreatePolicy,
  pub orphans: OrphanPolicy,
  /// Stop timeout override in seconds, applied when a service
  /// declares no stop grace period.
  pub timeout: Option<i64>,
  /// Consent to removing diverged volumes. Without it the
  /// existing volume is kept unchanged and a warning logged.
  pub assume_yes: bool,
  /// Bound on concurrently converging services.
  /// None means unbounded.
  pub max_concurrency: Option<usize>,
  /// Register the service name and declared aliases on
  /// network endpoints.
  pub use_network_aliases: bool,
}

impl ApplyOptions {
  pub fn with_services(
    services: impl IntoIterator<Item = impl Into<String>>,
  ) -> ApplyOptions {
    ApplyOptions {
      services: services.into_iter().map(Into::into).collect(),
      use_network_aliases: true,
      ..Default::default()
    }
  }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DownOptions {
  pub remove_orphans: bool,
  /// Also remove declared non-external volumes.
  pub volumes: bool,
  pub timeout: Option<i64>,
}

/// Overrides for a one-off container.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RunOptions {
  pub command: Option<Vec<String>>,
  pub entrypoint: Option<Vec<String>>,
  pub environment: Vec<(String, String)>,
  pub labels: Vec<(String, String)>,
  /// Ask the engine to remove the container when it exits.
  pub auto_remove: bool,
  /// Skip converging the service's dependencies first.
  pub no_deps: bool,
  pub use_network_aliases: bool,
  /// Create without starting.
  pub no_start: bool,
}
