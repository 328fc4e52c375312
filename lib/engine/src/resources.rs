//! Reconciliation of declared networks and volumes: assert
//! external resources exist, keep matching ones, replace
//! diverged ones (tearing attached services down first), and
//! create missing ones with ownership labels.

use std::collections::HashSet;

use anyhow::Context;
use caravel_model::{
  Error, Network, Project, ResourceKind, Volume, labels,
};

use crate::{
  docker::{EngineClient, is_conflict},
  graph::ServiceGraph,
  hash::{network_hash, volume_hash},
  labels::{OneOff, resource_labels},
  operator::Operator,
  progress::{Event, EventStatus, Progress},
};

pub async fn ensure_networks(
  engine: &EngineClient,
  project: &Project,
  graph: &ServiceGraph,
  progress: &dyn Progress,
  timeout: Option<i64>,
) -> anyhow::Result<()> {
  for (key, network) in &project.networks {
    ensure_network(
      engine, project, graph, key, network, progress,
      timeout,
    )
    .await
    .with_context(|| format!("network {key}"))?;
  }
  Ok(())
}

async fn ensure_network(
  engine: &EngineClient,
  project: &Project,
  graph: &ServiceGraph,
  key: &str,
  network: &Network,
  progress: &dyn Progress,
  timeout: Option<i64>,
) -> anyhow::Result<()> {
  if network.external {
    if engine.inspect_network(&network.name).await?.is_some()
    {
      return Ok(());
    }
    // Overlay networks on a cluster-enabled engine resolve
    // lazily on the first container attach.
    if network.driver.as_deref() == Some("overlay")
      && engine.cluster_enabled().await
    {
      tracing::debug!(
        "external overlay network {} not resolvable yet, \
         deferring to the engine",
        network.name
      );
      return Ok(());
    }
    return Err(
      Error::NotFound {
        kind: ResourceKind::Network,
        name: network.name.clone(),
      }
      .into(),
    );
  }

  let declared_hash = network_hash(network)?;
  if let Some(observed) =
    engine.inspect_network(&network.name).await?
  {
    let ours = observed
      .labels
      .get(labels::PROJECT)
      .is_some_and(|p| p == &project.name)
      && observed
        .labels
        .get(labels::NETWORK)
        .is_some_and(|n| n == key);
    if !ours {
      tracing::warn!(
        "network {} already exists but was not created by \
         this project; set external: true to use it as is",
        network.name
      );
      return Ok(());
    }
    if observed.labels.get(labels::CONFIG_HASH).map(String::as_str)
      == Some(declared_hash.as_str())
    {
      return Ok(());
    }

    // Declared configuration diverged: recreate. Anything
    // attached stops first, dependents before dependencies.
    stop_attached_services(
      engine,
      project,
      graph,
      progress,
      &attached_to_network(project, key),
      timeout,
    )
    .await?;
    progress.event(Event::network(
      &network.name,
      EventStatus::Removing,
    ));
    engine.remove_network(&network.name).await?;
    progress.event(Event::network(
      &network.name,
      EventStatus::Removed,
    ));
  }

  progress.event(Event::network(
    &network.name,
    EventStatus::Creating,
  ));
  let network_labels = resource_labels(
    &project.name,
    labels::NETWORK,
    key,
    &declared_hash,
    &network.labels,
  );
  match engine
    .create_network(network, network_labels)
    .await
  {
    Ok(()) => {}
    Err(err)
      if err
        .downcast_ref::<bollard::errors::Error>()
        .is_some_and(is_conflict) =>
    {
      // A concurrent deployer may have won the create race.
      // One retry through inspect settles it; any further
      // conflict surfaces to the caller.
      engine
        .inspect_network(&network.name)
        .await?
        .ok_or(err)?;
    }
    Err(err) => return Err(err),
  }
  progress.event(Event::network(
    &network.name,
    EventStatus::Created,
  ));
  Ok(())
}

pub async fn ensure_volumes(
  engine: &EngineClient,
  project: &Project,
  graph: &ServiceGraph,
  progress: &dyn Progress,
  assume_yes: bool,
  timeout: Option<i64>,
) -> anyhow::Result<()> {
  for (key, volume) in &project.volumes {
    ensure_volume(
      engine, project, graph, key, volume, progress,
      assume_yes, timeout,
    )
    .await
    .with_context(|| format!("volume {key}"))?;
  }
  Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn ensure_volume(
  engine: &EngineClient,
  project: &Project,
  graph: &ServiceGraph,
  key: &str,
  volume: &Volume,
  progress: &dyn Progress,
  assume_yes: bool,
  timeout: Option<i64>,
) -> anyhow::Result<()> {
  if volume.external {
    return match engine
      .inspect_volume(&volume.name)
      .await?
    {
      Some(_) => Ok(()),
      None => Err(
        Error::NotFound {
          kind: ResourceKind::Volume,
          name: volume.name.clone(),
        }
        .into(),
      ),
    };
  }

  let declared_hash = volume_hash(volume)?;
  if let Some(observed) =
    engine.inspect_volume(&volume.name).await?
  {
    let ours = observed
      .labels
      .get(labels::PROJECT)
      .is_some_and(|p| p == &project.name)
      && observed
        .labels
        .get(labels::VOLUME)
        .is_some_and(|v| v == key);
    if !ours {
      tracing::warn!(
        "volume {} already exists but was not created by \
         this project; set external: true to use it as is",
        volume.name
      );
      return Ok(());
    }
    if observed.labels.get(labels::CONFIG_HASH).map(String::as_str)
      == Some(declared_hash.as_str())
    {
      return Ok(());
    }

    // Replacing a volume loses its data, so it only happens
    // with explicit consent.
    if !assume_yes {
      tracing::warn!(
        "volume {} configuration diverged but recreating it \
         would lose its data; keeping the existing volume",
        volume.name
      );
      progress.event(Event::volume(
        &volume.name,
        EventStatus::Skipped,
      ));
      return Ok(());
    }

    stop_attached_services(
      engine,
      project,
      graph,
      progress,
      &attached_to_volume(project, key, &volume.name),
      timeout,
    )
    .await?;
    progress.event(Event::volume(
      &volume.name,
      EventStatus::Removing,
    ));
    engine.remove_volume(&volume.name, false).await?;
    progress.event(Event::volume(
      &volume.name,
      EventStatus::Removed,
    ));
  }

  progress.event(Event::volume(
    &volume.name,
    EventStatus::Creating,
  ));
  let volume_labels = resource_labels(
    &project.name,
    labels::VOLUME,
    key,
    &declared_hash,
    &volume.labels,
  );
  match engine
    .create_volume(volume, volume_labels)
    .await
  {
    Ok(()) => {}
    Err(err)
      if err
        .downcast_ref::<bollard::errors::Error>()
        .is_some_and(is_conflict) =>
    {
      engine
        .inspect_volume(&volume.name)
        .await?
        .ok_or(err)?;
    }
    Err(err) => return Err(err),
  }
  progress.event(Event::volume(
    &volume.name,
    EventStatus::Created,
  ));
  Ok(())
}

/// Services attached to a declared network, by network key.
fn attached_to_network<'a>(
  project: &'a Project,
  key: &str,
) -> HashSet<&'a str> {
  project
    .services
    .iter()
    .filter(|(_, service)| {
      service.networks.contains_key(key)
    })
    .map(|(name, _)| name.as_str())
    .collect()
}

/// Services mounting a declared volume, by key or engine name.
fn attached_to_volume<'a>(
  project: &'a Project,
  key: &str,
  name: &str,
) -> HashSet<&'a str> {
  project
    .services
    .iter()
    .filter(|(_, service)| {
      service.volumes.iter().any(|mount| {
        mount
          .source
          .as_deref()
          .is_some_and(|source| {
            source == key || source == name
          })
      })
    })
    .map(|(service, _)| service.as_str())
    .collect()
}

/// Stop and remove the containers of the given services,
/// dependents before their dependencies.
async fn stop_attached_services(
  engine: &EngineClient,
  project: &Project,
  graph: &ServiceGraph,
  progress: &dyn Progress,
  attached: &HashSet<&str>,
  timeout: Option<i64>,
) -> anyhow::Result<()> {
  if attached.is_empty() {
    return Ok(());
  }
  let operator = Operator {
    engine,
    project,
    progress,
  };
  for service in graph.sorted().iter().rev() {
    if !attached.contains(service.as_str()) {
      continue;
    }
    let selected = [service.clone()];
    let containers = engine
      .list_project_containers(
        project,
        OneOff::Include,
        &selected,
      )
      .await?;
    let timeout = project
      .services
      .get(service)
      .and_then(|service| service.stop_grace_period)
      .or(timeout);
    for container in &containers {
      operator.stop_and_remove(container, timeout).await?;
    }
  }
  Ok(())
}

#[cfg(test)]
mod tests {
  use caravel_model::{Service, VolumeMount};
  use pretty_assertions::assert_eq;

  use super::*;

  #[test]
  fn attachment_lookups() {
    let mut project = Project::default();
    let mut web = Service {
      name: "web".to_string(),
      ..Default::default()
    };
    web.networks.insert("backend".to_string(), None);
    web.volumes.push(VolumeMount {
      kind: caravel_model::MountKind::Volume,
      source: Some("data".to_string()),
      target: "/data".to_string(),
      ..Default::default()
    });
    project.services.insert("web".to_string(), web);
    project.services.insert(
      "other".to_string(),
      Service {
        name: "other".to_string(),
        ..Default::default()
      },
    );

    assert_eq!(
      attached_to_network(&project, "backend"),
      HashSet::from(["web"])
    );
    assert!(
      attached_to_network(&project, "frontend").is_empty()
    );
    assert_eq!(
      attached_to_volume(&project, "data", "app_data"),
      HashSet::from(["web"])
    );
  }
}
