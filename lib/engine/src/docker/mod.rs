//! Thin wrapper around the engine's remote HTTP API. Owns the
//! connection, caches the negotiated API version for feature
//! gating, and converts wire payloads into model entities so
//! nothing above this layer touches wire types.

use anyhow::Context;
use bollard::Docker;
use caravel_model::Error;

mod container;
mod network;
mod volume;

pub use network::NetworkInfo;
pub use volume::VolumeInfo;

/// Engine API level that moved multi-endpoint container create
/// and per-endpoint MAC addresses into the create call.
pub const API_MULTI_ENDPOINT: &str = "1.44";
/// Engine API level introducing image-backed mounts.
pub const API_IMAGE_MOUNTS: &str = "1.48";
/// Engine API level introducing endpoint interface names.
pub const API_INTERFACE_NAME: &str = "1.49";

#[derive(Clone)]
pub struct EngineClient {
  docker: Docker,
  api_version: String,
}

impl EngineClient {
  /// Connect with the standard environment defaults and
  /// negotiate the API version.
  pub async fn connect() -> anyhow::Result<EngineClient> {
    let docker = Docker::connect_with_defaults()
      .context("Failed to connect to the container engine")?;
    let version = docker
      .version()
      .await
      .context("Failed to negotiate engine API version")?;
    let api_version = version
      .api_version
      .unwrap_or_else(|| "1.43".to_string());
    Ok(EngineClient {
      docker,
      api_version,
    })
  }

  pub fn docker(&self) -> &Docker {
    &self.docker
  }

  pub fn api_version(&self) -> &str {
    &self.api_version
  }

  /// Whether the engine speaks at least `version`.
  pub fn version_gte(&self, version: &str) -> bool {
    version_gte(&self.api_version, version)
  }

  /// Gate a feature on a minimum engine API version.
  pub fn require_version(
    &self,
    version: &str,
    feature: &str,
  ) -> Result<(), Error> {
    if self.version_gte(version) {
      return Ok(());
    }
    Err(Error::VersionMismatch {
      feature: feature.to_string(),
      required: version.to_string(),
      current: self.api_version.clone(),
    })
  }

  /// Whether the engine is part of an active cluster. Used to
  /// let external overlay networks resolve lazily.
  pub async fn cluster_enabled(&self) -> bool {
    match self.docker.info().await {
      Ok(info) => info
        .swarm
        .and_then(|swarm| swarm.node_id)
        .is_some_and(|id| !id.is_empty()),
      Err(_) => false,
    }
  }
}

/// Numeric comparison of dotted API versions, eg.
/// `1.44 >= 1.9`.
pub fn version_gte(current: &str, required: &str) -> bool {
  let mut current = current
    .split('.')
    .map(|part| part.parse::<u64>().unwrap_or_default());
  let mut required = required
    .split('.')
    .map(|part| part.parse::<u64>().unwrap_or_default());
  loop {
    match (current.next(), required.next()) {
      (None, None) => return true,
      (cur, req) => {
        let cur = cur.unwrap_or_default();
        let req = req.unwrap_or_default();
        if cur != req {
          return cur > req;
        }
      }
    }
  }
}

/// Engine said 404.
pub fn is_not_found(err: &bollard::errors::Error) -> bool {
  matches!(
    err,
    bollard::errors::Error::DockerResponseServerError {
      status_code: 404,
      ..
    }
  )
}

/// Engine said 409, a name/id clash.
pub fn is_conflict(err: &bollard::errors::Error) -> bool {
  matches!(
    err,
    bollard::errors::Error::DockerResponseServerError {
      status_code: 409,
      ..
    }
  )
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn version_comparison_is_numeric() {
    assert!(version_gte("1.44", "1.44"));
    assert!(version_gte("1.44", "1.9"));
    assert!(version_gte("1.45", "1.44"));
    assert!(!version_gte("1.43", "1.44"));
    assert!(!version_gte("1.9", "1.44"));
  }
}
