//! Content hashes of declared specs. The hex digest is written
//! to the config-hash label on created resources and is the only
//! durable record of which declared configuration produced them.

use anyhow::Context;
use caravel_model::{Network, Service, Volume};
use serde::Serialize;
use sha2::{Digest, Sha256};

/// Hash of a service spec with the fields that do not affect
/// container identity zeroed out: build, pull policy, scale,
/// dependency edges and profiles can all change without the
/// containers needing recreation.
pub fn service_hash(service: &Service) -> anyhow::Result<String> {
  let mut canonical = service.clone();
  canonical.build = None;
  canonical.pull_policy = None;
  canonical.replicas = None;
  canonical.depends_on = Default::default();
  canonical.profiles = Vec::new();
  hash_spec(&canonical).with_context(|| {
    format!("Failed to hash spec of service {}", service.name)
  })
}

pub fn network_hash(network: &Network) -> anyhow::Result<String> {
  hash_spec(network).with_context(|| {
    format!("Failed to hash spec of network {}", network.name)
  })
}

/// Volume hash, with the driver defaulted to `local` so an
/// unset driver and an explicit `local` hash identically.
pub fn volume_hash(volume: &Volume) -> anyhow::Result<String> {
  let mut canonical = volume.clone();
  if canonical.driver.is_none() {
    canonical.driver = Some("local".to_string());
  }
  hash_spec(&canonical)
    .with_context(|| {
      format!("Failed to hash spec of volume {}", volume.name)
    })
}

/// Serialisation goes through `serde_json::Value` first: its
/// object representation keeps keys sorted, which makes the
/// digest independent of map insertion order.
fn hash_spec<T: Serialize>(spec: &T) -> anyhow::Result<String> {
  let canonical = serde_json::to_value(spec)?;
  let bytes = serde_json::to_vec(&canonical)?;
  Ok(hex::encode(Sha256::digest(&bytes)))
}
