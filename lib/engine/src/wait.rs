//! Dependency-wait protocol: blocks a starting service until
//! each declared dependency reaches its required condition.
//! Start ordering itself is handled by the graph traversal;
//! this module only polls the stronger conditions (healthy,
//! running-or-healthy, completed-successfully).

use std::time::Duration;

use anyhow::Context;
use caravel_model::{
  Condition, Container, Error, HealthStatus, Project, Service,
};
use futures_util::future::try_join_all;
use tokio_util::sync::CancellationToken;

use crate::{
  docker::EngineClient,
  labels::OneOff,
  progress::{Event, EventStatus, Progress},
};

const POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Result of one condition check against fresh state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
  Satisfied,
  Pending,
}

/// Evaluate a wait condition against the dependency's current
/// containers. Failures (exited dependencies, missing
/// healthchecks, unhealthy containers) surface as errors for
/// the caller to downgrade when the dependency is optional.
pub fn check_condition(
  dependency: &str,
  condition: Condition,
  containers: &[Container],
) -> anyhow::Result<WaitOutcome> {
  if containers.is_empty() {
    return Err(
      Error::DependencyFailed {
        dependency: dependency.to_string(),
        reason: "it has no containers".to_string(),
      }
      .into(),
    );
  }
  match condition {
    Condition::Started => Ok(WaitOutcome::Satisfied),
    Condition::Healthy => {
      healthy(dependency, containers, true)
    }
    Condition::RunningOrHealthy => {
      healthy(dependency, containers, false)
    }
    Condition::CompletedSuccessfully => {
      completed(dependency, containers)
    }
  }
}

fn healthy(
  dependency: &str,
  containers: &[Container],
  healthcheck_required: bool,
) -> anyhow::Result<WaitOutcome> {
  for container in containers {
    if container.is_exited() {
      return Err(
        Error::DependencyFailed {
          dependency: dependency.to_string(),
          reason: format!(
            "container {} exited ({})",
            container.name,
            container.exit_code.unwrap_or_default()
          ),
        }
        .into(),
      );
    }
    match container.health {
      Some(HealthStatus::Healthy) => {}
      Some(HealthStatus::Unhealthy) => {
        return Err(
          Error::DependencyFailed {
            dependency: dependency.to_string(),
            reason: format!(
              "container {} is unhealthy",
              container.name
            ),
          }
          .into(),
        );
      }
      Some(
        HealthStatus::Starting | HealthStatus::None,
      ) => return Ok(WaitOutcome::Pending),
      None if healthcheck_required => {
        return Err(
          Error::NoHealthcheck {
            container: container.name.clone(),
          }
          .into(),
        );
      }
      None => {
        if !container.is_running() {
          return Ok(WaitOutcome::Pending);
        }
      }
    }
  }
  Ok(WaitOutcome::Satisfied)
}

fn completed(
  dependency: &str,
  containers: &[Container],
) -> anyhow::Result<WaitOutcome> {
  for container in containers {
    if !container.is_exited() {
      return Ok(WaitOutcome::Pending);
    }
    match container.exit_code.unwrap_or_default() {
      0 => {}
      code => {
        return Err(
          Error::DependencyFailed {
            dependency: dependency.to_string(),
            reason: format!(
              "container {} exited ({code})",
              container.name
            ),
          }
          .into(),
        );
      }
    }
  }
  Ok(WaitOutcome::Satisfied)
}

/// Block until every declared dependency of `service` with a
/// non-started condition is satisfied. Optional dependencies
/// downgrade failures to warnings.
pub async fn wait_for_dependencies(
  engine: &EngineClient,
  project: &Project,
  service: &Service,
  progress: &dyn Progress,
  cancel: &CancellationToken,
) -> anyhow::Result<()> {
  let waits = service
    .depends_on
    .iter()
    .filter(|(_, dep)| {
      dep.condition != Condition::Started
    })
    .filter(|(name, _)| {
      // Disabled dependencies and scale-zero dependencies
      // have nothing to wait on. Required-but-undeclared is
      // already rejected at graph build.
      match project.services.get(*name) {
        Some(dependency) => dependency.scale() > 0,
        None => false,
      }
    });

  try_join_all(waits.map(|(name, dep)| async move {
    progress.event(Event::container(
      name,
      EventStatus::Waiting,
    ));
    let result = poll_dependency(
      engine,
      project,
      name,
      dep.condition,
      cancel,
    )
    .await;
    match result {
      Ok(()) => {
        progress.event(Event::container(
          name,
          EventStatus::Healthy,
        ));
        Ok(())
      }
      Err(err)
        if !dep.required
          && caravel_model::error_kind(&err)
            .is_none_or(|kind| {
              !matches!(kind, Error::Cancelled)
            }) =>
      {
        tracing::warn!(
          "optional dependency {name} of service {} \
           not satisfied: {err:#}",
          service.name
        );
        progress.event(Event::with_text(
          format!("Container {name}"),
          EventStatus::Warning,
          format!("{err:#}"),
        ));
        Ok(())
      }
      Err(err) => Err(err).with_context(|| {
        format!(
          "waiting for dependency {name} of service {}",
          service.name
        )
      }),
    }
  }))
  .await?;
  Ok(())
}

async fn poll_dependency(
  engine: &EngineClient,
  project: &Project,
  dependency: &str,
  condition: Condition,
  cancel: &CancellationToken,
) -> anyhow::Result<()> {
  let selected = [dependency.to_string()];
  let mut ticker = tokio::time::interval(POLL_INTERVAL);
  loop {
    tokio::select! {
      _ = cancel.cancelled() => {
        return Err(Error::Cancelled.into());
      }
      _ = ticker.tick() => {}
    }

    let listed = engine
      .list_project_containers(
        project,
        OneOff::Exclude,
        &selected,
      )
      .await?;
    // Health and exit codes only come from inspect.
    let containers =
      try_join_all(listed.iter().map(|container| {
        engine.inspect_container(&container.id)
      }))
      .await?;

    match check_condition(
      dependency, condition, &containers,
    )? {
      WaitOutcome::Satisfied => return Ok(()),
      WaitOutcome::Pending => {}
    }
  }
}

#[cfg(test)]
mod tests {
  use caravel_model::ContainerState;
  use pretty_assertions::assert_eq;

  use super::*;

  fn container(
    name: &str,
    state: ContainerState,
    health: Option<HealthStatus>,
    exit_code: Option<i64>,
  ) -> Container {
    Container {
      id: name.to_string(),
      name: name.to_string(),
      state,
      health,
      exit_code,
      ..Default::default()
    }
  }

  #[test]
  fn healthy_requires_all_replicas_healthy() {
    let containers = [
      container(
        "db-1",
        ContainerState::Running,
        Some(HealthStatus::Healthy),
        None,
      ),
      container(
        "db-2",
        ContainerState::Running,
        Some(HealthStatus::Starting),
        None,
      ),
    ];
    assert_eq!(
      check_condition(
        "db",
        Condition::Healthy,
        &containers
      )
      .unwrap(),
      WaitOutcome::Pending
    );

    let containers = [container(
      "db-1",
      ContainerState::Running,
      Some(HealthStatus::Healthy),
      None,
    )];
    assert_eq!(
      check_condition(
        "db",
        Condition::Healthy,
        &containers
      )
      .unwrap(),
      WaitOutcome::Satisfied
    );
  }

  #[test]
  fn healthy_without_healthcheck_fails() {
    let containers = [container(
      "db-1",
      ContainerState::Running,
      None,
      None,
    )];
    let err = check_condition(
      "db",
      Condition::Healthy,
      &containers,
    )
    .unwrap_err();
    assert!(matches!(
      caravel_model::error_kind(&err),
      Some(Error::NoHealthcheck { .. })
    ));
  }

  #[test]
  fn running_or_healthy_accepts_plain_running() {
    let containers = [container(
      "db-1",
      ContainerState::Running,
      None,
      None,
    )];
    assert_eq!(
      check_condition(
        "db",
        Condition::RunningOrHealthy,
        &containers
      )
      .unwrap(),
      WaitOutcome::Satisfied
    );
  }

  #[test]
  fn exited_dependency_fails_health_wait() {
    let containers = [container(
      "db-1",
      ContainerState::Exited,
      None,
      Some(1),
    )];
    let err = check_condition(
      "db",
      Condition::Healthy,
      &containers,
    )
    .unwrap_err();
    assert!(matches!(
      caravel_model::error_kind(&err),
      Some(Error::DependencyFailed { .. })
    ));
  }

  #[test]
  fn completed_successfully_needs_zero_exit() {
    let pending = [container(
      "job-1",
      ContainerState::Running,
      None,
      None,
    )];
    assert_eq!(
      check_condition(
        "job",
        Condition::CompletedSuccessfully,
        &pending
      )
      .unwrap(),
      WaitOutcome::Pending
    );

    let done = [container(
      "job-1",
      ContainerState::Exited,
      None,
      Some(0),
    )];
    assert_eq!(
      check_condition(
        "job",
        Condition::CompletedSuccessfully,
        &done
      )
      .unwrap(),
      WaitOutcome::Satisfied
    );

    let failed = [container(
      "job-1",
      ContainerState::Exited,
      None,
      Some(3),
    )];
    assert!(
      check_condition(
        "job",
        Condition::CompletedSuccessfully,
        &failed
      )
      .is_err()
    );
  }

  #[test]
  fn vanished_dependency_fails() {
    let err = check_condition(
      "db",
      Condition::Healthy,
      &[],
    )
    .unwrap_err();
    assert!(matches!(
      caravel_model::error_kind(&err),
      Some(Error::DependencyFailed { .. })
    ));
  }
}
