use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

/// One role of the application, realised as zero or more
/// replica containers.
///
/// Field semantics follow the compose file format. Loading and
/// interpolation happen upstream; the engine only reads the
/// resolved values.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Service {
  /// Unique name within the project. Filled by the loader.
  pub name: String,

  /// Explicit container name override. Forbids scale > 1.
  #[serde(skip_serializing_if = "Option::is_none")]
  pub container_name: Option<String>,

  #[serde(skip_serializing_if = "Option::is_none")]
  pub image: Option<String>,

  #[serde(skip_serializing_if = "Option::is_none")]
  pub command: Option<Vec<String>>,

  #[serde(skip_serializing_if = "Option::is_none")]
  pub entrypoint: Option<Vec<String>>,

  #[serde(skip_serializing_if = "IndexMap::is_empty")]
  pub environment: IndexMap<String, Option<String>>,

  /// User-declared labels.
  #[serde(skip_serializing_if = "IndexMap::is_empty")]
  pub labels: IndexMap<String, String>,

  /// Labels computed upstream (eg. the image digest label
  /// written after images are ensured). Merged over `labels`
  /// at create time. Not part of the config hash.
  #[serde(skip)]
  pub custom_labels: IndexMap<String, String>,

  #[serde(skip_serializing_if = "Option::is_none")]
  pub hostname: Option<String>,

  #[serde(skip_serializing_if = "Option::is_none")]
  pub working_dir: Option<String>,

  #[serde(skip_serializing_if = "Option::is_none")]
  pub user: Option<String>,

  pub tty: bool,

  pub stdin_open: bool,

  #[serde(skip_serializing_if = "Vec::is_empty")]
  pub ports: Vec<PortMapping>,

  /// Container ports exposed without a host binding,
  /// `port[/protocol]`.
  #[serde(skip_serializing_if = "Vec::is_empty")]
  pub expose: Vec<String>,

  /// Restart policy by compose name:
  /// no | always | on-failure[:retries] | unless-stopped
  #[serde(skip_serializing_if = "Option::is_none")]
  pub restart: Option<String>,

  #[serde(skip_serializing_if = "Option::is_none")]
  pub healthcheck: Option<Healthcheck>,

  #[serde(skip_serializing_if = "Option::is_none")]
  pub stop_signal: Option<String>,

  /// Seconds the engine waits on stop before killing.
  #[serde(skip_serializing_if = "Option::is_none")]
  pub stop_grace_period: Option<i64>,

  #[serde(skip_serializing_if = "Option::is_none")]
  pub platform: Option<String>,

  /// Desired replica count. Defaults to 1 when unset.
  #[serde(skip_serializing_if = "Option::is_none")]
  pub replicas: Option<u64>,

  #[serde(skip_serializing_if = "IndexMap::is_empty")]
  pub depends_on: IndexMap<String, DependsOn>,

  /// Networks this service attaches to, with optional
  /// per-endpoint configuration.
  #[serde(skip_serializing_if = "IndexMap::is_empty")]
  pub networks: IndexMap<String, Option<EndpointConfig>>,

  /// network | host | none | service:NAME | container:ID
  #[serde(skip_serializing_if = "Option::is_none")]
  pub network_mode: Option<String>,

  /// Service-wide MAC address. Engine API >= 1.44 moves this
  /// onto the primary network endpoint.
  #[serde(skip_serializing_if = "Option::is_none")]
  pub mac_address: Option<String>,

  /// shareable | host | service:NAME | container:ID
  #[serde(skip_serializing_if = "Option::is_none")]
  pub ipc: Option<String>,

  /// host | service:NAME | container:ID
  #[serde(skip_serializing_if = "Option::is_none")]
  pub pid: Option<String>,

  #[serde(skip_serializing_if = "Option::is_none")]
  pub uts: Option<String>,

  #[serde(skip_serializing_if = "Option::is_none")]
  pub userns_mode: Option<String>,

  /// Cgroup namespace mode: host | private
  #[serde(skip_serializing_if = "Option::is_none")]
  pub cgroup: Option<String>,

  #[serde(skip_serializing_if = "Option::is_none")]
  pub cgroup_parent: Option<String>,

  #[serde(skip_serializing_if = "Vec::is_empty")]
  pub volumes: Vec<VolumeMount>,

  /// `SOURCE[:ro|rw]` where SOURCE is a sibling service name or
  /// `container:NAME`.
  #[serde(skip_serializing_if = "Vec::is_empty")]
  pub volumes_from: Vec<String>,

  #[serde(skip_serializing_if = "Vec::is_empty")]
  pub secrets: Vec<FileReference>,

  #[serde(skip_serializing_if = "Vec::is_empty")]
  pub configs: Vec<FileReference>,

  #[serde(skip_serializing_if = "Vec::is_empty")]
  pub cap_add: Vec<String>,

  #[serde(skip_serializing_if = "Vec::is_empty")]
  pub cap_drop: Vec<String>,

  #[serde(skip_serializing_if = "Vec::is_empty")]
  pub security_opt: Vec<String>,

  /// `HOST_PATH:CONTAINER_PATH[:CGROUP_PERMS]`, or a
  /// fully-qualified CDI device name.
  #[serde(skip_serializing_if = "Vec::is_empty")]
  pub devices: Vec<String>,

  #[serde(skip_serializing_if = "Vec::is_empty")]
  pub device_cgroup_rules: Vec<String>,

  #[serde(skip_serializing_if = "Option::is_none")]
  pub gpus: Option<GpuRequest>,

  #[serde(skip_serializing_if = "Vec::is_empty")]
  pub group_add: Vec<String>,

  #[serde(skip_serializing_if = "Vec::is_empty")]
  pub dns: Vec<String>,

  #[serde(skip_serializing_if = "Vec::is_empty")]
  pub dns_opt: Vec<String>,

  #[serde(skip_serializing_if = "Vec::is_empty")]
  pub dns_search: Vec<String>,

  /// `hostname:ip` entries added to /etc/hosts.
  #[serde(skip_serializing_if = "Vec::is_empty")]
  pub extra_hosts: Vec<String>,

  #[serde(skip_serializing_if = "Vec::is_empty")]
  pub links: Vec<String>,

  #[serde(skip_serializing_if = "Vec::is_empty")]
  pub tmpfs: Vec<String>,

  #[serde(skip_serializing_if = "Option::is_none")]
  pub shm_size: Option<i64>,

  #[serde(skip_serializing_if = "Option::is_none")]
  pub init: Option<bool>,

  pub privileged: bool,

  pub read_only: bool,

  #[serde(skip_serializing_if = "IndexMap::is_empty")]
  pub sysctls: IndexMap<String, String>,

  #[serde(skip_serializing_if = "Option::is_none")]
  pub logging: Option<Logging>,

  #[serde(skip_serializing_if = "Option::is_none")]
  pub pids_limit: Option<i64>,

  #[serde(skip_serializing_if = "Option::is_none")]
  pub oom_score_adj: Option<i64>,

  #[serde(skip_serializing_if = "Option::is_none")]
  pub oom_kill_disable: Option<bool>,

  #[serde(skip_serializing_if = "Option::is_none")]
  pub mem_limit: Option<i64>,

  #[serde(skip_serializing_if = "Option::is_none")]
  pub mem_reservation: Option<i64>,

  #[serde(skip_serializing_if = "Option::is_none")]
  pub memswap_limit: Option<i64>,

  #[serde(skip_serializing_if = "Option::is_none")]
  pub mem_swappiness: Option<i64>,

  #[serde(skip_serializing_if = "Option::is_none")]
  pub cpu_shares: Option<i64>,

  #[serde(skip_serializing_if = "Option::is_none")]
  pub cpu_period: Option<i64>,

  #[serde(skip_serializing_if = "Option::is_none")]
  pub cpu_quota: Option<i64>,

  #[serde(skip_serializing_if = "Option::is_none")]
  pub cpu_rt_period: Option<i64>,

  #[serde(skip_serializing_if = "Option::is_none")]
  pub cpu_rt_runtime: Option<i64>,

  /// Fractional CPU count, translated to NanoCpus.
  #[serde(skip_serializing_if = "Option::is_none")]
  pub cpus: Option<f64>,

  #[serde(skip_serializing_if = "Option::is_none")]
  pub cpu_percent: Option<i64>,

  #[serde(skip_serializing_if = "Option::is_none")]
  pub cpuset: Option<String>,

  #[serde(skip_serializing_if = "Option::is_none")]
  pub blkio_config: Option<BlkioConfig>,

  #[serde(skip_serializing_if = "IndexMap::is_empty")]
  pub ulimits: IndexMap<String, Ulimit>,

  #[serde(skip_serializing_if = "Vec::is_empty")]
  pub profiles: Vec<String>,

  /// Image build definition. Building is delegated upstream;
  /// carried only so hashing can strip it.
  #[serde(skip_serializing_if = "Option::is_none")]
  pub build: Option<serde_json::Value>,

  #[serde(skip_serializing_if = "Option::is_none")]
  pub pull_policy: Option<String>,

  /// Opaque `x-*` extension bag.
  #[serde(flatten)]
  pub extensions: IndexMap<String, serde_json::Value>,
}

/// Marker value the engine writes into `x-lifecycle` to cascade
/// recreation onto dependent services.
pub const LIFECYCLE_EXTENSION: &str = "x-lifecycle";
pub const FORCE_RECREATE: &str = "force_recreate";

impl Service {
  /// Declared replica count, never negative.
  pub fn scale(&self) -> usize {
    self.replicas.unwrap_or(1) as usize
  }

  /// Whether the service has been marked (via the lifecycle
  /// extension) to be recreated regardless of hash equality.
  pub fn force_recreate(&self) -> bool {
    self
      .extensions
      .get(LIFECYCLE_EXTENSION)
      .and_then(|value| value.as_str())
      .is_some_and(|value| value == FORCE_RECREATE)
  }

  /// Sibling service referenced through
  /// `network_mode: service:NAME`, if any.
  pub fn network_mode_service(&self) -> Option<&str> {
    service_ref(self.network_mode.as_deref())
  }

  pub fn ipc_service(&self) -> Option<&str> {
    service_ref(self.ipc.as_deref())
  }

  pub fn pid_service(&self) -> Option<&str> {
    service_ref(self.pid.as_deref())
  }

  /// Sibling services referenced through `volumes_from`
  /// (`container:` sources are raw containers, not services).
  pub fn volumes_from_services(
    &self,
  ) -> impl Iterator<Item = &str> {
    self.volumes_from.iter().filter_map(|source| {
      if source.starts_with("container:") {
        return None;
      }
      match source.split_once(':') {
        Some((name, _)) => Some(name),
        None => Some(source.as_str()),
      }
    })
  }

  /// All sibling services this service must start after.
  pub fn dependency_names(&self) -> Vec<&str> {
    let mut names: Vec<&str> =
      self.depends_on.keys().map(String::as_str).collect();
    for name in [
      self.network_mode_service(),
      self.ipc_service(),
      self.pid_service(),
    ]
    .into_iter()
    .flatten()
    {
      if !names.contains(&name) {
        names.push(name);
      }
    }
    for name in self.volumes_from_services() {
      if !names.contains(&name) {
        names.push(name);
      }
    }
    names
  }

  /// `DEP:CONDITION:RESTART` summary written to the
  /// dependencies label.
  pub fn dependencies_label_value(&self) -> String {
    self
      .depends_on
      .iter()
      .map(|(name, dep)| {
        format!("{name}:{}:{}", dep.condition, dep.restart)
      })
      .collect::<Vec<_>>()
      .join(",")
  }
}

fn service_ref(mode: Option<&str>) -> Option<&str> {
  mode.and_then(|mode| mode.strip_prefix("service:"))
}

/// Declared dependency edge.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DependsOn {
  pub condition: Condition,
  /// When false, dependency failures downgrade to warnings
  /// and a missing target drops the edge.
  pub required: bool,
  /// Restart this service when the dependency is recreated.
  pub restart: bool,
}

impl Default for DependsOn {
  fn default() -> Self {
    DependsOn {
      condition: Condition::Started,
      required: true,
      restart: false,
    }
  }
}

/// What a dependency must reach before the dependent starts.
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
pub enum Condition {
  #[default]
  #[serde(rename = "service_started")]
  #[strum(serialize = "service_started")]
  Started,
  #[serde(rename = "service_healthy")]
  #[strum(serialize = "service_healthy")]
  Healthy,
  /// Healthy when a healthcheck exists, running otherwise.
  #[serde(rename = "service_running_or_healthy")]
  #[strum(serialize = "service_running_or_healthy")]
  RunningOrHealthy,
  #[serde(rename = "service_completed_successfully")]
  #[strum(serialize = "service_completed_successfully")]
  CompletedSuccessfully,
}

/// Per-network endpoint configuration for a service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EndpointConfig {
  /// Higher priority wins the primary-endpoint election.
  pub priority: i64,
  #[serde(skip_serializing_if = "Vec::is_empty")]
  pub aliases: Vec<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub ipv4_address: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub ipv6_address: Option<String>,
  #[serde(skip_serializing_if = "Vec::is_empty")]
  pub link_local_ips: Vec<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub mac_address: Option<String>,
  #[serde(skip_serializing_if = "IndexMap::is_empty")]
  pub driver_opts: IndexMap<String, String>,
  /// Requires engine API >= 1.49.
  #[serde(skip_serializing_if = "Option::is_none")]
  pub interface_name: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PortMapping {
  pub target: u16,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub published: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub host_ip: Option<String>,
  /// tcp (default) | udp | sctp
  #[serde(skip_serializing_if = "Option::is_none")]
  pub protocol: Option<String>,
}

impl PortMapping {
  /// `PORT/PROTOCOL` key used by the engine's port maps.
  pub fn container_port(&self) -> String {
    format!(
      "{}/{}",
      self.target,
      self.protocol.as_deref().unwrap_or("tcp")
    )
  }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Healthcheck {
  /// Exec form: `["CMD", ...]` / `["CMD-SHELL", ...]` / `["NONE"]`.
  #[serde(skip_serializing_if = "Vec::is_empty")]
  pub test: Vec<String>,
  /// Nanoseconds between checks.
  #[serde(skip_serializing_if = "Option::is_none")]
  pub interval: Option<i64>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub timeout: Option<i64>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub retries: Option<i64>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub start_period: Option<i64>,
  /// Requires engine API >= 1.44.
  #[serde(skip_serializing_if = "Option::is_none")]
  pub start_interval: Option<i64>,
  pub disable: bool,
}

/// One `volumes` entry of a service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct VolumeMount {
  pub kind: MountKind,
  /// Host path, volume name, or image reference.
  /// Empty for anonymous volumes and tmpfs.
  #[serde(skip_serializing_if = "Option::is_none")]
  pub source: Option<String>,
  pub target: String,
  pub read_only: bool,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub bind: Option<BindOptions>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub volume: Option<VolumeOptions>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub tmpfs_opts: Option<TmpfsOptions>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub consistency: Option<String>,
}

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
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum MountKind {
  #[default]
  Volume,
  Bind,
  Tmpfs,
  Npipe,
  /// Requires engine API >= 1.48.
  Image,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BindOptions {
  #[serde(skip_serializing_if = "Option::is_none")]
  pub propagation: Option<String>,
  pub create_host_path: bool,
  pub recursive: bool,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub selinux: Option<String>,
}

impl BindOptions {
  /// True when the entry can only be expressed through the
  /// structured mount API, not the plain binds list.
  pub fn needs_mount_api(&self) -> bool {
    self.propagation.is_some()
      || self.recursive
      || self.selinux.is_some()
  }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct VolumeOptions {
  pub nocopy: bool,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub subpath: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TmpfsOptions {
  #[serde(skip_serializing_if = "Option::is_none")]
  pub size: Option<i64>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub mode: Option<u32>,
}

/// Reference from a service to a project-level secret/config.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FileReference {
  pub source: String,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub target: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub uid: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub gid: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub mode: Option<u32>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Logging {
  #[serde(skip_serializing_if = "Option::is_none")]
  pub driver: Option<String>,
  #[serde(skip_serializing_if = "IndexMap::is_empty")]
  pub options: IndexMap<String, String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BlkioConfig {
  #[serde(skip_serializing_if = "Option::is_none")]
  pub weight: Option<u16>,
  #[serde(skip_serializing_if = "Vec::is_empty")]
  pub weight_device: Vec<WeightDevice>,
  #[serde(skip_serializing_if = "Vec::is_empty")]
  pub device_read_bps: Vec<ThrottleDevice>,
  #[serde(skip_serializing_if = "Vec::is_empty")]
  pub device_write_bps: Vec<ThrottleDevice>,
  #[serde(skip_serializing_if = "Vec::is_empty")]
  pub device_read_iops: Vec<ThrottleDevice>,
  #[serde(skip_serializing_if = "Vec::is_empty")]
  pub device_write_iops: Vec<ThrottleDevice>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct WeightDevice {
  pub path: String,
  pub weight: u16,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ThrottleDevice {
  pub path: String,
  pub rate: i64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Ulimit {
  pub soft: i64,
  pub hard: i64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GpuRequest {
  /// Negative count requests all devices.
  #[serde(skip_serializing_if = "Option::is_none")]
  pub count: Option<i64>,
  #[serde(skip_serializing_if = "Vec::is_empty")]
  pub device_ids: Vec<String>,
  #[serde(skip_serializing_if = "Vec::is_empty")]
  pub capabilities: Vec<String>,
}

#[cfg(test)]
mod tests {
  use pretty_assertions::assert_eq;

  use super::*;

  #[test]
  fn dependency_names_include_implicit_references() {
    let mut service = Service {
      name: "web".to_string(),
      ..Default::default()
    };
    service
      .depends_on
      .insert("db".to_string(), DependsOn::default());
    service.network_mode = Some("service:proxy".to_string());
    service.pid = Some("service:db".to_string());
    service.volumes_from = vec![
      "storage:ro".to_string(),
      "container:raw".to_string(),
    ];

    let names = service.dependency_names();
    assert_eq!(names, vec!["db", "proxy", "storage"]);
  }

  #[test]
  fn dependencies_label_summarises_conditions() {
    let mut service = Service::default();
    service.depends_on.insert(
      "db".to_string(),
      DependsOn {
        condition: Condition::Healthy,
        required: true,
        restart: true,
      },
    );
    service.depends_on.insert(
      "seed".to_string(),
      DependsOn {
        condition: Condition::CompletedSuccessfully,
        required: false,
        restart: false,
      },
    );
    assert_eq!(
      service.dependencies_label_value(),
      "db:service_healthy:true,\
       seed:service_completed_successfully:false"
    );
  }

  #[test]
  fn lifecycle_extension_flag() {
    let mut service = Service::default();
    assert!(!service.force_recreate());
    service.extensions.insert(
      LIFECYCLE_EXTENSION.to_string(),
      serde_json::Value::String(
        FORCE_RECREATE.to_string(),
      ),
    );
    assert!(service.force_recreate());
  }
}
