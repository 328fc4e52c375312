//! Engine event monitor: follows the container event stream of
//! one project, maintains the set of live containers, surfaces
//! lifecycle transitions to a listener, and terminates when the
//! application has no containers left.

use std::collections::{HashMap, HashSet};

use anyhow::Context;
use bollard::query_parameters::EventsOptions;
use caravel_model::{Container, Project, labels};
use futures_util::StreamExt;
use tokio_util::sync::CancellationToken;

use crate::{docker::EngineClient, labels::project_filter};

/// A container lifecycle transition observed on the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerLifecycle {
  pub id: String,
  pub name: String,
  pub event: LifecycleEvent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleEvent {
  /// `recreated` when the container replaces an older one.
  Created { recreated: bool },
  /// `restarted` when the start follows a crash the engine is
  /// recovering from.
  Started { restarted: bool },
  Restarted,
  /// `restarting` when the engine will bring the container
  /// back up; the monitor keeps tracking it.
  Exited { restarting: bool },
}

/// Pure transition core of the monitor: the live set and the
/// restart-pending set. The async loop feeds engine events in;
/// tests drive it directly.
#[derive(Debug, Default)]
pub struct Monitor {
  tracked: HashSet<String>,
  restart_pending: HashSet<String>,
}

impl Monitor {
  /// Seed with the containers observed before the stream
  /// started (replicas only, carrying a config hash).
  pub fn new(initial: &[Container]) -> Monitor {
    Monitor {
      tracked: initial
        .iter()
        .filter(|container| {
          !container.one_off()
            && container.config_hash().is_some()
        })
        .map(|container| container.id.clone())
        .collect(),
      restart_pending: HashSet::new(),
    }
  }

  /// No live containers left: the application terminated.
  pub fn is_done(&self) -> bool {
    self.tracked.is_empty()
  }

  pub fn tracked_len(&self) -> usize {
    self.tracked.len()
  }

  pub fn on_create(
    &mut self,
    id: &str,
    replaces: bool,
  ) -> LifecycleEvent {
    self.tracked.insert(id.to_string());
    LifecycleEvent::Created {
      recreated: replaces,
    }
  }

  pub fn on_start(&mut self, id: &str) -> LifecycleEvent {
    self.tracked.insert(id.to_string());
    LifecycleEvent::Started {
      restarted: self.restart_pending.remove(id),
    }
  }

  pub fn on_restart(&mut self, id: &str) -> LifecycleEvent {
    self.tracked.insert(id.to_string());
    LifecycleEvent::Restarted
  }

  /// `stop` drops the container from the live set without an
  /// exit event; a crashing container can be stopped
  /// externally while aborting on exit, which must still
  /// terminate the monitor.
  pub fn on_stop(&mut self, id: &str) {
    self.tracked.remove(id);
    self.restart_pending.remove(id);
  }

  /// `engine_restarting` reflects the inspected state at the
  /// time of the die event: the engine reporting restarting
  /// (or already running again) means a restart is in flight.
  pub fn on_die(
    &mut self,
    id: &str,
    engine_restarting: bool,
  ) -> LifecycleEvent {
    if engine_restarting {
      self.restart_pending.insert(id.to_string());
    } else {
      self.tracked.remove(id);
    }
    LifecycleEvent::Exited {
      restarting: engine_restarting,
    }
  }
}

/// Follow the project's container events until the application
/// terminates, the stream fails, or `cancel` fires.
pub async fn watch(
  engine: &EngineClient,
  project: &Project,
  initial: &[Container],
  cancel: &CancellationToken,
  listener: impl Fn(ContainerLifecycle),
) -> anyhow::Result<()> {
  let mut monitor = Monitor::new(initial);
  if monitor.is_done() {
    return Ok(());
  }

  let filters = HashMap::from([
    ("type".to_string(), vec!["container".to_string()]),
    (
      "label".to_string(),
      vec![project_filter(&project.name)],
    ),
  ]);
  let mut events =
    engine.docker().events(Some(EventsOptions {
      filters: Some(filters),
      ..Default::default()
    }));

  loop {
    let message = tokio::select! {
      _ = cancel.cancelled() => return Ok(()),
      message = events.next() => message,
    };
    let Some(message) = message else {
      // Stream closed by the engine.
      return Ok(());
    };
    let message =
      message.context("Engine event stream failed")?;

    let Some(actor) = message.actor else {
      continue;
    };
    let id = actor.id.unwrap_or_default();
    let attributes = actor.attributes.unwrap_or_default();
    let name = attributes
      .get("name")
      .cloned()
      .unwrap_or_else(|| id.clone());

    let event = match message.action.as_deref() {
      Some("create") => Some(monitor.on_create(
        &id,
        attributes
          .contains_key(labels::CONTAINER_REPLACE),
      )),
      Some("start") => Some(monitor.on_start(&id)),
      Some("restart") => Some(monitor.on_restart(&id)),
      Some("stop") => {
        monitor.on_stop(&id);
        None
      }
      Some("die") => {
        let restarting = match engine
          .inspect_container(&id)
          .await
        {
          Ok(container) => matches!(
            container.state,
            caravel_model::ContainerState::Restarting
              | caravel_model::ContainerState::Running
          ),
          // Gone before we could look: not restarting.
          Err(_) => false,
        };
        Some(monitor.on_die(&id, restarting))
      }
      _ => None,
    };

    if let Some(event) = event {
      listener(ContainerLifecycle { id, name, event });
    }
    if monitor.is_done() {
      return Ok(());
    }
  }
}

#[cfg(test)]
mod tests {
  use pretty_assertions::assert_eq;

  use super::*;

  fn seeded(ids: &[&str]) -> Monitor {
    let containers: Vec<Container> = ids
      .iter()
      .map(|id| {
        let mut container = Container {
          id: id.to_string(),
          name: id.to_string(),
          ..Default::default()
        };
        container.labels.insert(
          labels::CONFIG_HASH.to_string(),
          "abc".to_string(),
        );
        container
          .labels
          .insert(labels::ONE_OFF.to_string(), "False".to_string());
        container
      })
      .collect();
    Monitor::new(&containers)
  }

  #[test]
  fn one_offs_are_not_seeded() {
    let mut container = Container {
      id: "x".to_string(),
      ..Default::default()
    };
    container.labels.insert(
      labels::CONFIG_HASH.to_string(),
      "abc".to_string(),
    );
    container.labels.insert(
      labels::ONE_OFF.to_string(),
      "True".to_string(),
    );
    let monitor = Monitor::new(&[container]);
    assert!(monitor.is_done());
  }

  #[test]
  fn recreate_never_double_counts() {
    let mut monitor = seeded(&["old"]);
    assert_eq!(monitor.tracked_len(), 1);

    // Replacement appears with the replace label.
    assert_eq!(
      monitor.on_create("new", true),
      LifecycleEvent::Created { recreated: true }
    );
    assert_eq!(
      monitor.on_start("new"),
      LifecycleEvent::Started { restarted: false }
    );
    assert_eq!(monitor.tracked_len(), 2);

    // Old container dies and is taken away.
    assert_eq!(
      monitor.on_die("old", false),
      LifecycleEvent::Exited { restarting: false }
    );
    monitor.on_stop("old");
    assert_eq!(monitor.tracked_len(), 1);
    assert!(!monitor.is_done());
  }

  #[test]
  fn die_while_engine_restarts_keeps_tracking() {
    let mut monitor = seeded(&["app"]);
    assert_eq!(
      monitor.on_die("app", true),
      LifecycleEvent::Exited { restarting: true }
    );
    assert!(!monitor.is_done());
    assert_eq!(
      monitor.on_start("app"),
      LifecycleEvent::Started { restarted: true }
    );
    assert_eq!(
      monitor.on_start("app"),
      LifecycleEvent::Started { restarted: false }
    );
  }

  #[test]
  fn terminates_when_last_container_dies() {
    let mut monitor = seeded(&["app"]);
    monitor.on_die("app", false);
    assert!(monitor.is_done());
  }

  #[test]
  fn external_stop_terminates_without_exit_event() {
    let mut monitor = seeded(&["app"]);
    monitor.on_stop("app");
    assert!(monitor.is_done());
  }
}
