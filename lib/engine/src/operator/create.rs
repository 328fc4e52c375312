//! Assembly of the engine-level create payload for one replica
//! container: identity config, host config, and networking
//! config, translated from the declared service.

use std::collections::HashMap;

use anyhow::{Context, anyhow};
use bollard::models::{
  ContainerCreateBody, DeviceMapping, DeviceRequest,
  EndpointIpamConfig, EndpointSettings, HealthConfig,
  HostConfig, HostConfigCgroupnsModeEnum,
  HostConfigLogConfig, NetworkingConfig, PortBinding,
  ResourcesBlkioWeightDevice, ResourcesUlimits,
  RestartPolicy, RestartPolicyNameEnum, ThrottleDevice,
};
use caravel_model::{
  Container, EndpointConfig, Project, Service, labels as keys,
};

use crate::{
  docker::{
    API_IMAGE_MOUNTS, API_INTERFACE_NAME,
    API_MULTI_ENDPOINT, EngineClient,
  },
  hash::service_hash,
  labels::container_labels,
};

use super::mounts::build_mounts;

/// Everything needed to create one container of a service.
pub struct CreateSpec<'a> {
  pub project: &'a Project,
  /// Service with cross-service references already resolved
  /// to concrete container ids.
  pub service: &'a Service,
  pub number: i64,
  /// Engine-side name to create with. May be a temporary name
  /// during recreation.
  pub name: String,
  /// Slug marking a one-off container.
  pub slug: Option<String>,
  /// Container being replaced, recorded in the replace label.
  pub replaces: Option<&'a Container>,
  pub use_network_aliases: bool,
  pub auto_remove: bool,
}

/// The create body, plus endpoints that must be connected
/// after create on engines predating multi-endpoint create.
pub async fn build_create_payload(
  engine: &EngineClient,
  spec: &CreateSpec<'_>,
) -> anyhow::Result<(
  ContainerCreateBody,
  Vec<(String, EndpointSettings)>,
)> {
  let CreateSpec {
    project, service, ..
  } = spec;

  let image = service.image.clone().ok_or_else(|| {
    anyhow!("service {} declares no image", service.name)
  })?;

  let config_hash = service_hash(service)?;
  let mut labels = container_labels(
    project,
    service,
    spec.number,
    spec.slug.as_deref(),
    &config_hash,
    spec.replaces.map(|replaced| replaced.id.as_str()),
  );
  if let Some(digest) =
    service.custom_labels.get(keys::IMAGE_DIGEST)
  {
    labels
      .insert(keys::IMAGE_DIGEST.to_string(), digest.clone());
  }

  let multi_endpoint =
    engine.version_gte(API_MULTI_ENDPOINT);
  let (endpoints, deferred) =
    build_endpoints(engine, spec, multi_endpoint)?;

  // Service-wide MAC address moves onto the primary endpoint
  // once the engine supports endpoint-level placement.
  let container_mac = if multi_endpoint {
    None
  } else {
    let per_endpoint_macs = service
      .networks
      .values()
      .flatten()
      .filter(|endpoint| endpoint.mac_address.is_some())
      .count();
    if per_endpoint_macs > 1
      || (per_endpoint_macs == 1
        && service.mac_address.is_some())
    {
      engine.require_version(
        API_MULTI_ENDPOINT,
        "per-network MAC addresses",
      )?;
    }
    service.mac_address.clone().or_else(|| {
      service
        .networks
        .values()
        .flatten()
        .find_map(|endpoint| endpoint.mac_address.clone())
    })
  };

  let host_config =
    host_config(engine, spec, &endpoints).await?;

  let networking_config = if endpoints.is_empty() {
    None
  } else {
    Some(NetworkingConfig {
      endpoints_config: Some(
        endpoints.iter().cloned().collect(),
      ),
    })
  };

  let body = ContainerCreateBody {
    hostname: service.hostname.clone(),
    user: service.user.clone(),
    exposed_ports: exposed_ports(service),
    tty: Some(service.tty),
    open_stdin: Some(service.stdin_open),
    stdin_once: Some(spec.slug.is_some()
      && service.stdin_open),
    env: Some(engine_env(project, service)),
    cmd: service.command.clone(),
    entrypoint: service.entrypoint.clone(),
    healthcheck: healthcheck(engine, service)?,
    image: Some(image),
    working_dir: service.working_dir.clone(),
    labels: Some(labels),
    mac_address: container_mac,
    stop_signal: service.stop_signal.clone(),
    stop_timeout: service.stop_grace_period,
    host_config: Some(host_config),
    networking_config,
    ..Default::default()
  };

  Ok((body, deferred))
}

/// Declared environment flattened to `KEY=VALUE`, with proxy
/// variables from the project environment overlaid when the
/// service does not set them itself.
fn engine_env(
  project: &Project,
  service: &Service,
) -> Vec<String> {
  const PROXY_VARS: &[&str] = &[
    "HTTP_PROXY",
    "http_proxy",
    "HTTPS_PROXY",
    "https_proxy",
    "NO_PROXY",
    "no_proxy",
    "ALL_PROXY",
    "all_proxy",
  ];
  let mut out = Vec::with_capacity(
    service.environment.len() + PROXY_VARS.len(),
  );
  for (key, value) in &service.environment {
    match value {
      Some(value) => out.push(format!("{key}={value}")),
      // A declared key without a value resolves from the
      // project environment, and is dropped when unset there.
      None => {
        if let Some(value) = project.env_var(key) {
          out.push(format!("{key}={value}"));
        }
      }
    }
  }
  for var in PROXY_VARS {
    if service.environment.contains_key(*var) {
      continue;
    }
    if let Some(value) = project.env_var(var) {
      out.push(format!("{var}={value}"));
    }
  }
  out
}

fn exposed_ports(
  service: &Service,
) -> Option<HashMap<String, HashMap<(), ()>>> {
  let mut out = HashMap::new();
  for port in &service.ports {
    out.insert(port.container_port(), HashMap::new());
  }
  for exposed in &service.expose {
    let key = if exposed.contains('/') {
      exposed.clone()
    } else {
      format!("{exposed}/tcp")
    };
    out.insert(key, HashMap::new());
  }
  (!out.is_empty()).then_some(out)
}

fn healthcheck(
  engine: &EngineClient,
  service: &Service,
) -> anyhow::Result<Option<HealthConfig>> {
  let Some(declared) = &service.healthcheck else {
    return Ok(None);
  };
  if declared.disable {
    return Ok(Some(HealthConfig {
      test: Some(vec!["NONE".to_string()]),
      ..Default::default()
    }));
  }
  if declared.start_interval.is_some() {
    engine.require_version(
      API_MULTI_ENDPOINT,
      "healthcheck.start_interval",
    )?;
  }
  Ok(Some(HealthConfig {
    test: (!declared.test.is_empty())
      .then(|| declared.test.clone()),
    interval: declared.interval,
    timeout: declared.timeout,
    retries: declared.retries,
    start_period: declared.start_period,
    start_interval: declared.start_interval,
  }))
}

fn restart_policy(
  service: &Service,
) -> Option<RestartPolicy> {
  let declared = service.restart.as_deref()?;
  let (name, retries) = match declared
    .split_once(':')
    .unwrap_or((declared, ""))
  {
    ("no", _) | ("", _) => {
      (RestartPolicyNameEnum::NO, None)
    }
    ("always", _) => (RestartPolicyNameEnum::ALWAYS, None),
    ("unless-stopped", _) => {
      (RestartPolicyNameEnum::UNLESS_STOPPED, None)
    }
    ("on-failure", retries) => (
      RestartPolicyNameEnum::ON_FAILURE,
      retries.parse::<i64>().ok(),
    ),
    _ => (RestartPolicyNameEnum::NO, None),
  };
  Some(RestartPolicy {
    name: Some(name),
    maximum_retry_count: retries,
  })
}

async fn host_config(
  engine: &EngineClient,
  spec: &CreateSpec<'_>,
  endpoints: &[(String, EndpointSettings)],
) -> anyhow::Result<HostConfig> {
  let CreateSpec {
    project, service, ..
  } = spec;

  let mount_set = build_mounts(project, service)?;
  if mount_set.uses_image_mounts {
    engine
      .require_version(API_IMAGE_MOUNTS, "image mounts")?;
  }

  let (security_opt, masked_cleared) =
    security_opts(project, service).await?;
  let (devices, device_requests) =
    devices(service);

  let network_mode = service
    .network_mode
    .clone()
    .or_else(|| {
      endpoints
        .first()
        .map(|(network, _)| network.clone())
    });

  let volumes_from = (!service.volumes_from.is_empty())
    .then(|| {
      service
        .volumes_from
        .iter()
        .map(|source| {
          source
            .strip_prefix("container:")
            .unwrap_or(source)
            .to_string()
        })
        .collect()
    });

  Ok(HostConfig {
    binds: (!mount_set.binds.is_empty())
      .then_some(mount_set.binds),
    mounts: (!mount_set.mounts.is_empty())
      .then_some(mount_set.mounts),
    volumes_from,
    port_bindings: port_bindings(service),
    restart_policy: restart_policy(service),
    auto_remove: Some(spec.auto_remove),
    cap_add: (!service.cap_add.is_empty())
      .then(|| service.cap_add.clone()),
    cap_drop: (!service.cap_drop.is_empty())
      .then(|| service.cap_drop.clone()),
    security_opt,
    masked_paths: masked_cleared
      .then(Vec::new),
    readonly_paths: masked_cleared
      .then(Vec::new),
    network_mode,
    ipc_mode: service.ipc.clone(),
    pid_mode: service.pid.clone(),
    uts_mode: service.uts.clone(),
    userns_mode: service.userns_mode.clone(),
    cgroupns_mode: match service.cgroup.as_deref() {
      Some("host") => {
        Some(HostConfigCgroupnsModeEnum::HOST)
      }
      Some("private") => {
        Some(HostConfigCgroupnsModeEnum::PRIVATE)
      }
      _ => None,
    },
    cgroup_parent: service.cgroup_parent.clone(),
    privileged: Some(service.privileged),
    readonly_rootfs: Some(service.read_only),
    init: service.init,
    shm_size: service.shm_size,
    sysctls: (!service.sysctls.is_empty()).then(|| {
      service
        .sysctls
        .iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
    }),
    tmpfs: tmpfs_map(service),
    dns: (!service.dns.is_empty())
      .then(|| service.dns.clone()),
    dns_options: (!service.dns_opt.is_empty())
      .then(|| service.dns_opt.clone()),
    dns_search: (!service.dns_search.is_empty())
      .then(|| service.dns_search.clone()),
    extra_hosts: (!service.extra_hosts.is_empty())
      .then(|| service.extra_hosts.clone()),
    links: (!service.links.is_empty())
      .then(|| service.links.clone()),
    group_add: (!service.group_add.is_empty())
      .then(|| service.group_add.clone()),
    log_config: service.logging.as_ref().map(|logging| {
      HostConfigLogConfig {
        typ: logging.driver.clone(),
        config: (!logging.options.is_empty()).then(|| {
          logging
            .options
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
        }),
      }
    }),
    oom_score_adj: service.oom_score_adj,
    oom_kill_disable: service.oom_kill_disable,
    memory: service.mem_limit,
    memory_reservation: service.mem_reservation,
    memory_swap: service.memswap_limit,
    memory_swappiness: service.mem_swappiness,
    nano_cpus: service
      .cpus
      .map(|cpus| (cpus * 1e9) as i64),
    cpu_shares: service.cpu_shares,
    cpu_period: service.cpu_period,
    cpu_quota: service.cpu_quota,
    cpu_realtime_period: service.cpu_rt_period,
    cpu_realtime_runtime: service.cpu_rt_runtime,
    cpu_percent: service.cpu_percent,
    cpuset_cpus: service.cpuset.clone(),
    pids_limit: service.pids_limit,
    blkio_weight: service
      .blkio_config
      .as_ref()
      .and_then(|blkio| blkio.weight),
    blkio_weight_device: service
      .blkio_config
      .as_ref()
      .map(|blkio| {
        blkio
          .weight_device
          .iter()
          .map(|device| ResourcesBlkioWeightDevice {
            path: Some(device.path.clone()),
            weight: Some(device.weight.into()),
          })
          .collect()
      }),
    blkio_device_read_bps: throttle_devices(
      service,
      |blkio| &blkio.device_read_bps,
    ),
    blkio_device_write_bps: throttle_devices(
      service,
      |blkio| &blkio.device_write_bps,
    ),
    blkio_device_read_iops: throttle_devices(
      service,
      |blkio| &blkio.device_read_iops,
    ),
    blkio_device_write_iops: throttle_devices(
      service,
      |blkio| &blkio.device_write_iops,
    ),
    devices,
    device_requests,
    device_cgroup_rules: (!service
      .device_cgroup_rules
      .is_empty())
    .then(|| service.device_cgroup_rules.clone()),
    ulimits: (!service.ulimits.is_empty()).then(|| {
      service
        .ulimits
        .iter()
        .map(|(name, ulimit)| ResourcesUlimits {
          name: Some(name.clone()),
          soft: Some(ulimit.soft),
          hard: Some(ulimit.hard),
        })
        .collect()
    }),
    ..Default::default()
  })
}

fn throttle_devices(
  service: &Service,
  select: impl Fn(
    &caravel_model::BlkioConfig,
  ) -> &Vec<caravel_model::ThrottleDevice>,
) -> Option<Vec<ThrottleDevice>> {
  let devices =
    service.blkio_config.as_ref().map(select)?;
  (!devices.is_empty()).then(|| {
    devices
      .iter()
      .map(|device| ThrottleDevice {
        path: Some(device.path.clone()),
        rate: Some(device.rate),
      })
      .collect()
  })
}

/// Splits declared devices into path mappings and CDI device
/// requests. CDI names are fully qualified
/// (`vendor.com/class=name`) and are routed through the cdi
/// driver instead of a path mapping.
fn devices(
  service: &Service,
) -> (
  Option<Vec<DeviceMapping>>,
  Option<Vec<DeviceRequest>>,
) {
  let mut mappings = Vec::new();
  let mut cdi_names = Vec::new();
  for declared in &service.devices {
    if !declared.starts_with('/') && declared.contains('=')
    {
      cdi_names.push(declared.clone());
      continue;
    }
    let mut parts = declared.split(':');
    let host = parts.next().unwrap_or_default();
    let container = parts.next().unwrap_or(host);
    let permissions = parts.next().unwrap_or("rwm");
    mappings.push(DeviceMapping {
      path_on_host: Some(host.to_string()),
      path_in_container: Some(container.to_string()),
      cgroup_permissions: Some(permissions.to_string()),
    });
  }

  let mut requests = Vec::new();
  if !cdi_names.is_empty() {
    requests.push(DeviceRequest {
      driver: Some("cdi".to_string()),
      device_ids: Some(cdi_names),
      count: Some(0),
      ..Default::default()
    });
  }
  if let Some(gpus) = &service.gpus {
    requests.push(DeviceRequest {
      count: if gpus.device_ids.is_empty() {
        Some(gpus.count.unwrap_or(-1))
      } else {
        None
      },
      device_ids: (!gpus.device_ids.is_empty())
        .then(|| gpus.device_ids.clone()),
      capabilities: Some(vec![
        if gpus.capabilities.is_empty() {
          vec!["gpu".to_string()]
        } else {
          gpus.capabilities.clone()
        },
      ]),
      ..Default::default()
    });
  }

  (
    (!mappings.is_empty()).then_some(mappings),
    (!requests.is_empty()).then_some(requests),
  )
}

fn port_bindings(
  service: &Service,
) -> Option<HashMap<String, Option<Vec<PortBinding>>>> {
  let mut out: HashMap<String, Option<Vec<PortBinding>>> =
    HashMap::new();
  for port in &service.ports {
    let binding = PortBinding {
      host_ip: port.host_ip.clone(),
      host_port: port.published.clone(),
    };
    out
      .entry(port.container_port())
      .or_insert_with(|| Some(Vec::new()))
      .get_or_insert_with(Vec::new)
      .push(binding);
  }
  (!out.is_empty()).then_some(out)
}

fn tmpfs_map(
  service: &Service,
) -> Option<HashMap<String, String>> {
  (!service.tmpfs.is_empty()).then(|| {
    service
      .tmpfs
      .iter()
      .map(|entry| {
        match entry.split_once(':') {
          Some((path, options)) => {
            (path.to_string(), options.to_string())
          }
          None => (entry.clone(), String::new()),
        }
      })
      .collect()
  })
}

/// Security options pass through, with two engine quirks
/// handled: `seccomp=PATH` inlines the compacted profile from a
/// project-relative file, and `systempaths=unconfined` clears
/// the masked and read-only path lists instead of being sent.
/// Returns the options and whether paths were cleared.
async fn security_opts(
  project: &Project,
  service: &Service,
) -> anyhow::Result<(Option<Vec<String>>, bool)> {
  if service.security_opt.is_empty() {
    return Ok((None, false));
  }
  let mut out = Vec::with_capacity(service.security_opt.len());
  let mut unconfined_paths = false;
  for declared in &service.security_opt {
    match declared.split_once('=') {
      Some(("systempaths", "unconfined")) => {
        unconfined_paths = true;
      }
      Some(("seccomp", profile))
        if profile != "unconfined" =>
      {
        out.push(format!(
          "seccomp={}",
          load_seccomp_profile(project, profile).await?
        ));
      }
      _ => out.push(declared.clone()),
    }
  }
  Ok(((!out.is_empty()).then_some(out), unconfined_paths))
}

/// Seccomp profiles are passed to the engine inline, as
/// compacted JSON.
async fn load_seccomp_profile(
  project: &Project,
  path: &str,
) -> anyhow::Result<String> {
  let full_path = if path.starts_with('/') {
    path.to_string()
  } else {
    format!(
      "{}/{path}",
      project.working_dir.trim_end_matches('/')
    )
  };
  let contents = tokio::fs::read_to_string(&full_path)
    .await
    .with_context(|| {
      format!(
        "Failed to read seccomp profile at {full_path}"
      )
    })?;
  let profile: serde_json::Value =
    serde_json::from_str(&contents).with_context(|| {
      format!(
        "Failed to parse seccomp profile at {full_path}"
      )
    })?;
  serde_json::to_string(&profile)
    .context("Failed to serialize seccomp profile")
}

/// Endpoints for every declared network attachment, primary
/// first (by priority, then declaration order). When the
/// engine predates multi-endpoint create, only the primary is
/// sent with the create call and the rest are returned for
/// post-create connection.
fn build_endpoints(
  engine: &EngineClient,
  spec: &CreateSpec<'_>,
  multi_endpoint: bool,
) -> anyhow::Result<(
  Vec<(String, EndpointSettings)>,
  Vec<(String, EndpointSettings)>,
)> {
  let CreateSpec {
    project, service, ..
  } = spec;

  if service.network_mode.is_some() {
    // Shared or special network namespaces take no endpoints.
    return Ok((Vec::new(), Vec::new()));
  }

  let mut ordered: Vec<(
    &String,
    Option<&EndpointConfig>,
  )> = service
    .networks
    .iter()
    .map(|(key, endpoint)| (key, endpoint.as_ref()))
    .collect();
  ordered.sort_by(|(a_key, a), (b_key, b)| {
    let a_priority =
      a.map(|cfg| cfg.priority).unwrap_or_default();
    let b_priority =
      b.map(|cfg| cfg.priority).unwrap_or_default();
    b_priority.cmp(&a_priority).then(a_key.cmp(b_key))
  });

  let mut endpoints = Vec::with_capacity(ordered.len());
  for (index, (key, declared)) in
    ordered.into_iter().enumerate()
  {
    let network_name = project
      .networks
      .get(key)
      .map(|network| network.name.clone())
      .unwrap_or_else(|| {
        format!(
          "{}{}{key}",
          project.name,
          project.separator()
        )
      });

    let mut aliases = vec![spec.name.clone()];
    if spec.use_network_aliases {
      aliases.push(service.name.clone());
      if let Some(declared) = declared {
        aliases.extend(declared.aliases.iter().cloned());
      }
    }

    let mut settings = EndpointSettings {
      aliases: Some(aliases),
      ..Default::default()
    };
    if let Some(declared) = declared {
      if declared.ipv4_address.is_some()
        || declared.ipv6_address.is_some()
        || !declared.link_local_ips.is_empty()
      {
        settings.ipam_config = Some(EndpointIpamConfig {
          ipv4_address: declared.ipv4_address.clone(),
          ipv6_address: declared.ipv6_address.clone(),
          link_local_ips: (!declared
            .link_local_ips
            .is_empty())
          .then(|| declared.link_local_ips.clone()),
        });
      }
      if !declared.driver_opts.is_empty() {
        settings.driver_opts = Some(
          declared
            .driver_opts
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect(),
        );
      }
      if declared.interface_name.is_some() {
        engine.require_version(
          API_INTERFACE_NAME,
          "network interface_name",
        )?;
      }
      if multi_endpoint {
        settings.mac_address =
          declared.mac_address.clone();
      }
    }
    // The service-wide MAC lands on the primary endpoint on
    // engines with endpoint-level placement.
    if multi_endpoint
      && index == 0
      && settings.mac_address.is_none()
    {
      settings.mac_address = service.mac_address.clone();
    }
    endpoints.push((network_name, settings));
  }

  if multi_endpoint || endpoints.len() <= 1 {
    Ok((endpoints, Vec::new()))
  } else {
    let deferred = endpoints.split_off(1);
    Ok((endpoints, deferred))
  }
}

#[cfg(test)]
mod tests {
  use pretty_assertions::assert_eq;

  use super::*;

  #[test]
  fn restart_policy_names_map_to_engine_names() {
    let mut service = Service::default();
    service.restart = Some("on-failure:3".to_string());
    let policy = restart_policy(&service).unwrap();
    assert_eq!(
      policy.name,
      Some(RestartPolicyNameEnum::ON_FAILURE)
    );
    assert_eq!(policy.maximum_retry_count, Some(3));

    service.restart =
      Some("unless-stopped".to_string());
    assert_eq!(
      restart_policy(&service).unwrap().name,
      Some(RestartPolicyNameEnum::UNLESS_STOPPED)
    );

    service.restart = None;
    assert!(restart_policy(&service).is_none());
  }

  #[test]
  fn cdi_devices_route_to_device_requests() {
    let mut service = Service::default();
    service
      .devices
      .push("/dev/snd:/dev/snd:rwm".to_string());
    service
      .devices
      .push("vendor.com/gpu=0".to_string());
    let (mappings, requests) = devices(&service);
    let mappings = mappings.unwrap();
    assert_eq!(mappings.len(), 1);
    assert_eq!(
      mappings[0].path_on_host.as_deref(),
      Some("/dev/snd")
    );
    let requests = requests.unwrap();
    assert_eq!(
      requests[0].driver.as_deref(),
      Some("cdi")
    );
    assert_eq!(
      requests[0].device_ids.as_deref(),
      Some(&["vendor.com/gpu=0".to_string()][..])
    );
  }

  #[test]
  fn env_overlay_adds_proxy_variables() {
    let mut project = Project::default();
    project.environment.insert(
      "HTTP_PROXY".to_string(),
      "http://proxy:3128".to_string(),
    );
    let mut service = Service::default();
    service.environment.insert(
      "HTTP_PROXY".to_string(),
      Some("http://other:8080".to_string()),
    );
    service
      .environment
      .insert("PASSTHROUGH".to_string(), None);
    project.environment.insert(
      "PASSTHROUGH".to_string(),
      "from-host".to_string(),
    );

    let env = engine_env(&project, &service);
    // Service-level proxy wins over the overlay.
    assert!(env.contains(
      &"HTTP_PROXY=http://other:8080".to_string()
    ));
    assert!(!env.contains(
      &"HTTP_PROXY=http://proxy:3128".to_string()
    ));
    assert!(
      env.contains(&"PASSTHROUGH=from-host".to_string())
    );
  }

  #[test]
  fn tmpfs_entries_split_into_path_and_options() {
    let mut service = Service::default();
    service.tmpfs.push("/run".to_string());
    service
      .tmpfs
      .push("/tmp:size=100m".to_string());
    let map = tmpfs_map(&service).unwrap();
    assert_eq!(map["/run"], "");
    assert_eq!(map["/tmp"], "size=100m");
  }
}
