use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// Declared network infrastructure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Network {
  /// Engine-side name. Defaults to `<project>_<key>` upstream.
  pub name: String,
  pub external: bool,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub driver: Option<String>,
  #[serde(skip_serializing_if = "IndexMap::is_empty")]
  pub driver_opts: IndexMap<String, String>,
  pub internal: bool,
  pub attachable: bool,
  pub enable_ipv6: bool,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub ipam: Option<Ipam>,
  #[serde(skip_serializing_if = "IndexMap::is_empty")]
  pub labels: IndexMap<String, String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Ipam {
  #[serde(skip_serializing_if = "Option::is_none")]
  pub driver: Option<String>,
  #[serde(skip_serializing_if = "Vec::is_empty")]
  pub config: Vec<IpamPool>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct IpamPool {
  #[serde(skip_serializing_if = "Option::is_none")]
  pub subnet: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub ip_range: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub gateway: Option<String>,
  #[serde(skip_serializing_if = "IndexMap::is_empty")]
  pub aux_addresses: IndexMap<String, String>,
}

/// Declared volume infrastructure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Volume {
  pub name: String,
  pub external: bool,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub driver: Option<String>,
  #[serde(skip_serializing_if = "IndexMap::is_empty")]
  pub driver_opts: IndexMap<String, String>,
  #[serde(skip_serializing_if = "IndexMap::is_empty")]
  pub labels: IndexMap<String, String>,
}

/// A project-level secret or config declaration.
/// Exactly one of `file`, `environment`, `content` carries the
/// payload; `external` declarations are rejected by the engine.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FileObject {
  pub name: String,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub file: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub environment: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub content: Option<String>,
  pub external: bool,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub driver: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub template_driver: Option<String>,
}
