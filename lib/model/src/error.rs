use strum::Display;
use thiserror::Error;

/// Kinds of resources an error can reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "lowercase")]
pub enum ResourceKind {
  Project,
  Service,
  Container,
  Network,
  Volume,
  Secret,
  Config,
  Image,
}

/// Typed failures surfaced by the convergence core.
///
/// These are attached as the root cause of the `anyhow` chains
/// the engine returns, so embeddings can `downcast_ref::<Error>()`
/// to dispatch on the failure class.
#[derive(Debug, Error)]
pub enum Error {
  #[error("no such {kind}: {name}")]
  NotFound { kind: ResourceKind, name: String },

  #[error("{kind} name {name} already in use")]
  Conflict { kind: ResourceKind, name: String },

  #[error("dependency cycle detected: {path}")]
  Cycle { path: String },

  #[error(
    "service {service} depends on {dependency}, which is {reason}"
  )]
  MissingDependency {
    service: String,
    dependency: String,
    /// "undeclared", or "disabled by profiles: a, b"
    reason: String,
  },

  #[error(
    "service {service} declares container_name {container_name} \
     and cannot be scaled beyond one container"
  )]
  CustomNameForbidsScale {
    service: String,
    container_name: String,
  },

  #[error("external {kind} {name} is not supported")]
  UnsupportedExternal { kind: ResourceKind, name: String },

  #[error("{field} is not supported on {kind} {name}")]
  UnsupportedField {
    kind: ResourceKind,
    name: String,
    field: String,
  },

  #[error(
    "{feature} requires engine API version {required} \
     or newer, but the engine is running {current}"
  )]
  VersionMismatch {
    feature: String,
    required: String,
    current: String,
  },

  #[error("dependency {dependency} failed to start: {reason}")]
  DependencyFailed {
    dependency: String,
    reason: String,
  },

  #[error(
    "{container} has no healthcheck configured, \
     cannot wait for it to be healthy"
  )]
  NoHealthcheck { container: String },

  #[error("operation cancelled")]
  Cancelled,
}

impl Error {
  /// Process exit code class for scripts dispatching on failure.
  pub fn exit_code(&self) -> i32 {
    match self {
      Error::Cancelled => 130,
      Error::Cycle { .. }
      | Error::MissingDependency { .. }
      | Error::CustomNameForbidsScale { .. }
      | Error::UnsupportedExternal { .. }
      | Error::UnsupportedField { .. } => 15,
      Error::VersionMismatch { .. } => 14,
      _ => 1,
    }
  }
}

/// Extract the typed error kind from an anyhow chain, if any.
pub fn error_kind(err: &anyhow::Error) -> Option<&Error> {
  err.chain().find_map(|cause| cause.downcast_ref::<Error>())
}
