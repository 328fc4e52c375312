use std::collections::HashMap;

use anyhow::Context;
use bollard::{
  models::{
    ContainerInspectResponse, ContainerState as WireState,
    ContainerStateStatusEnum, ContainerSummary,
    ContainerSummaryStateEnum, HealthStatusEnum,
    MountPointTypeEnum,
  },
  query_parameters::{
    InspectContainerOptions, ListContainersOptions,
    RemoveContainerOptions, RenameContainerOptions,
    RestartContainerOptions, StartContainerOptions,
    StopContainerOptions,
  },
};
use caravel_model::{
  Container, ContainerState, Error, HealthStatus, Project,
  ResourceKind,
};

use crate::labels::{OneOff, default_filters};

use super::EngineClient;

impl EngineClient {
  /// All containers matching the label filters, regardless of
  /// state.
  pub async fn list_containers(
    &self,
    filters: HashMap<String, Vec<String>>,
  ) -> anyhow::Result<Vec<Container>> {
    let mut containers: Vec<Container> = self
      .docker()
      .list_containers(Some(ListContainersOptions {
        all: true,
        filters: Some(filters),
        ..Default::default()
      }))
      .await
      .context("Failed to list containers")?
      .into_iter()
      .map(container_from_summary)
      .collect();
    containers.sort_by(|a, b| {
      a.number()
        .cmp(&b.number())
        .then(a.created.cmp(&b.created))
    });
    Ok(containers)
  }

  /// Project containers, optionally narrowed to selected
  /// services. Multi-service selection filters client-side.
  pub async fn list_project_containers(
    &self,
    project: &Project,
    one_off: OneOff,
    selected: &[String],
  ) -> anyhow::Result<Vec<Container>> {
    let filters =
      default_filters(&project.name, one_off, selected);
    let mut containers = self.list_containers(filters).await?;
    if selected.len() > 1 {
      containers.retain(|container| {
        container
          .service()
          .is_some_and(|service| {
            selected.iter().any(|s| s == service)
          })
      });
    }
    Ok(containers)
  }

  /// One container of a service by replica index (1-based).
  /// One-offs sort last so replicas are preferred.
  pub async fn get_specified_container(
    &self,
    project: &Project,
    service: &str,
    index: usize,
  ) -> anyhow::Result<Container> {
    let selected = [service.to_string()];
    let mut containers = self
      .list_project_containers(
        project,
        OneOff::Include,
        &selected,
      )
      .await?;
    containers.sort_by(|a, b| {
      a.one_off()
        .cmp(&b.one_off())
        .then(a.number().cmp(&b.number()))
    });
    containers
      .into_iter()
      .nth(index.saturating_sub(1))
      .with_context(|| Error::NotFound {
        kind: ResourceKind::Container,
        name: format!("{service} (not running, index {index})"),
      })
  }

  /// Fresh state of one container, with health detail the list
  /// endpoint does not carry.
  pub async fn inspect_container(
    &self,
    id: &str,
  ) -> anyhow::Result<Container> {
    let response = self
      .docker()
      .inspect_container(
        id,
        None::<InspectContainerOptions>,
      )
      .await
      .with_context(|| {
        format!("Failed to inspect container {id}")
      })?;
    Ok(container_from_inspect(response))
  }

  pub async fn start_container(
    &self,
    id: &str,
  ) -> anyhow::Result<()> {
    self
      .docker()
      .start_container(id, None::<StartContainerOptions>)
      .await
      .with_context(|| {
        format!("Failed to start container {id}")
      })
  }

  /// Stop with an optional timeout in seconds. Stopping an
  /// already-stopped container succeeds.
  pub async fn stop_container(
    &self,
    id: &str,
    timeout: Option<i64>,
  ) -> anyhow::Result<()> {
    self
      .docker()
      .stop_container(
        id,
        Some(StopContainerOptions {
          t: timeout.map(|t| t as i32),
          ..Default::default()
        }),
      )
      .await
      .with_context(|| {
        format!("Failed to stop container {id}")
      })
  }

  pub async fn restart_container(
    &self,
    id: &str,
    timeout: Option<i64>,
  ) -> anyhow::Result<()> {
    self
      .docker()
      .restart_container(
        id,
        Some(RestartContainerOptions {
          t: timeout.map(|t| t as i32),
          ..Default::default()
        }),
      )
      .await
      .with_context(|| {
        format!("Failed to restart container {id}")
      })
  }

  /// Remove a container. Absence is success when the intent is
  /// "ensure absent".
  pub async fn remove_container(
    &self,
    id: &str,
    force: bool,
    volumes: bool,
  ) -> anyhow::Result<()> {
    match self
      .docker()
      .remove_container(
        id,
        Some(RemoveContainerOptions {
          force,
          v: volumes,
          ..Default::default()
        }),
      )
      .await
    {
      Ok(()) => Ok(()),
      Err(err) if super::is_not_found(&err) => Ok(()),
      Err(err) => Err(err).with_context(|| {
        format!("Failed to remove container {id}")
      }),
    }
  }

  pub async fn rename_container(
    &self,
    id: &str,
    name: &str,
  ) -> anyhow::Result<()> {
    self
      .docker()
      .rename_container(
        id,
        RenameContainerOptions {
          name: name.to_string(),
        },
      )
      .await
      .with_context(|| {
        format!("Failed to rename container {id} to {name}")
      })
  }
}

pub fn container_from_summary(
  summary: ContainerSummary,
) -> Container {
  let volumes = summary
    .mounts
    .unwrap_or_default()
    .into_iter()
    .filter(|mount| {
      matches!(mount.typ, Some(MountPointTypeEnum::VOLUME))
    })
    .filter_map(|mount| mount.name)
    .collect();
  Container {
    id: summary.id.unwrap_or_default(),
    name: summary
      .names
      .unwrap_or_default()
      .into_iter()
      .next()
      .map(|name| {
        name.strip_prefix('/').unwrap_or(&name).to_string()
      })
      .unwrap_or_default(),
    image: summary.image,
    state: summary
      .state
      .map(convert_summary_state)
      .unwrap_or_default(),
    health: None,
    exit_code: None,
    created: summary.created.unwrap_or_default(),
    labels: summary.labels.unwrap_or_default(),
    volumes,
  }
}

pub fn container_from_inspect(
  response: ContainerInspectResponse,
) -> Container {
  let (state, health, exit_code) = response
    .state
    .map(convert_state)
    .unwrap_or_default();
  Container {
    id: response.id.unwrap_or_default(),
    name: response
      .name
      .map(|name| {
        name.strip_prefix('/').unwrap_or(&name).to_string()
      })
      .unwrap_or_default(),
    image: response.image,
    state,
    health,
    exit_code,
    // Creation ordering is only needed on list payloads.
    created: 0,
    labels: response
      .config
      .and_then(|config| config.labels)
      .unwrap_or_default(),
    volumes: Vec::new(),
  }
}

fn convert_state(
  state: WireState,
) -> (ContainerState, Option<HealthStatus>, Option<i64>) {
  let status = state
    .status
    .map(|status| match status {
      ContainerStateStatusEnum::CREATED => {
        ContainerState::Created
      }
      ContainerStateStatusEnum::RUNNING => {
        ContainerState::Running
      }
      ContainerStateStatusEnum::PAUSED => {
        ContainerState::Paused
      }
      ContainerStateStatusEnum::RESTARTING => {
        ContainerState::Restarting
      }
      ContainerStateStatusEnum::REMOVING => {
        ContainerState::Removing
      }
      ContainerStateStatusEnum::EXITED => {
        ContainerState::Exited
      }
      ContainerStateStatusEnum::DEAD => ContainerState::Dead,
      ContainerStateStatusEnum::EMPTY => {
        ContainerState::Unknown
      }
    })
    .unwrap_or_default();
  let health =
    state.health.and_then(|health| health.status).and_then(
      |status| match status {
        HealthStatusEnum::NONE => Some(HealthStatus::None),
        HealthStatusEnum::STARTING => {
          Some(HealthStatus::Starting)
        }
        HealthStatusEnum::HEALTHY => {
          Some(HealthStatus::Healthy)
        }
        HealthStatusEnum::UNHEALTHY => {
          Some(HealthStatus::Unhealthy)
        }
        HealthStatusEnum::EMPTY => None,
      },
    );
  (status, health, state.exit_code)
}

fn convert_summary_state(
  state: ContainerSummaryStateEnum,
) -> ContainerState {
  match state {
    ContainerSummaryStateEnum::CREATED => {
      ContainerState::Created
    }
    ContainerSummaryStateEnum::RUNNING => {
      ContainerState::Running
    }
    ContainerSummaryStateEnum::PAUSED => {
      ContainerState::Paused
    }
    ContainerSummaryStateEnum::RESTARTING => {
      ContainerState::Restarting
    }
    ContainerSummaryStateEnum::REMOVING => {
      ContainerState::Removing
    }
    ContainerSummaryStateEnum::EXITED => {
      ContainerState::Exited
    }
    ContainerSummaryStateEnum::DEAD => ContainerState::Dead,
    ContainerSummaryStateEnum::EMPTY => {
      ContainerState::Unknown
    }
  }
}
