//! The convergence orchestrator: one `apply` pass reconciles a
//! declared project against the engine's observed state, walking
//! the service graph in dependency order and converging each
//! service with bounded concurrency. Teardown and the narrower
//! operations (stop, start, restart, one-off runs) reuse the
//! same machinery.

use std::collections::{HashMap, HashSet};

use anyhow::Context;
use cache::{CloneCache, SharedSet};
use caravel_model::{
  ApplyOptions, Container, ContainerState, DownOptions,
  Error, OrphanPolicy, Project, RecreatePolicy, ResourceKind,
  RunOptions, Service, labels as keys,
};
use futures_util::future::try_join_all;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use crate::{
  docker::EngineClient,
  graph::{Direction, ServiceGraph},
  labels::{OneOff, new_slug},
  operator::Operator,
  progress::{Event, EventStatus, Progress},
  resources,
  wait::wait_for_dependencies,
};

mod plan;

pub use plan::{ServicePlan, must_recreate, plan_service};

pub struct Orchestrator {
  engine: EngineClient,
  progress: Box<dyn Progress>,
}

impl Orchestrator {
  pub fn new(
    engine: EngineClient,
    progress: impl Progress + 'static,
  ) -> Orchestrator {
    Orchestrator {
      engine,
      progress: Box::new(progress),
    }
  }

  /// Bring the engine's state in line with the declared
  /// project: realise infrastructure, then converge services
  /// in dependency order.
  pub async fn apply(
    &self,
    project: &Project,
    options: &ApplyOptions,
    cancel: &CancellationToken,
  ) -> anyhow::Result<()> {
    check_container_name_uniqueness(project)?;

    let graph = ServiceGraph::build(project)?;
    resources::ensure_networks(
      &self.engine,
      project,
      &graph,
      self.progress.as_ref(),
      options.timeout,
    )
    .await?;
    resources::ensure_volumes(
      &self.engine,
      project,
      &graph,
      self.progress.as_ref(),
      options.assume_yes,
      options.timeout,
    )
    .await?;

    let all = self
      .engine
      .list_project_containers(
        project,
        OneOff::Include,
        &[],
      )
      .await?;
    self
      .handle_orphans(project, &all, options)
      .await?;

    let observed: CloneCache<String, Vec<Container>> =
      CloneCache::default();
    for name in project.services.keys() {
      let containers: Vec<Container> = all
        .iter()
        .filter(|container| {
          !container.one_off()
            && container.service() == Some(name)
        })
        .cloned()
        .collect();
      observed.insert(name.clone(), containers).await;
    }

    let scope = if options.services.is_empty() {
      None
    } else {
      Some(graph.with_dependencies(&options.services)?)
    };

    let force = SharedSet::default();
    // Per-container operations inside a visitor draw from the
    // same admission pool as the traversal itself.
    let limiter = Semaphore::new(
      options
        .max_concurrency
        .unwrap_or(Semaphore::MAX_PERMITS),
    );
    let context = ApplyContext {
      engine: &self.engine,
      project,
      graph: &graph,
      observed: &observed,
      force: &force,
      limiter: &limiter,
      options,
      progress: self.progress.as_ref(),
      cancel,
    };
    let context = &context;
    graph
      .walk(
        Direction::Forward,
        scope.as_ref(),
        options.max_concurrency,
        cancel,
        |name| async move {
          context.converge(&name).await
        },
      )
      .await
  }

  /// Reverse-order teardown: stop and remove every service's
  /// containers, then the project's networks, and volumes on
  /// request.
  pub async fn down(
    &self,
    project: &Project,
    options: &DownOptions,
    cancel: &CancellationToken,
  ) -> anyhow::Result<()> {
    let graph = ServiceGraph::build(project)?;
    let operator = self.operator(project);

    let operator = &operator;
    graph
      .walk(
        Direction::Reverse,
        None,
        None,
        cancel,
        |name| async move {
          let service = operator.project.service(&name)?;
          let timeout =
            service.stop_grace_period.or(options.timeout);
          let selected = [name.clone()];
          let containers = operator
            .engine
            .list_project_containers(
              operator.project,
              OneOff::Include,
              &selected,
            )
            .await?;
          try_join_all(containers.iter().map(
            |container| {
              operator.stop_and_remove(container, timeout)
            },
          ))
          .await?;
          Ok(())
        },
      )
      .await?;

    if options.remove_orphans {
      let leftover = self
        .engine
        .list_project_containers(
          project,
          OneOff::Include,
          &[],
        )
        .await?;
      let orphans: Vec<Container> = leftover
        .into_iter()
        .filter(|container| is_orphan(project, container))
        .collect();
      operator
        .remove_orphans(&orphans, options.timeout)
        .await?;
    }

    for network in project.networks.values() {
      if network.external {
        continue;
      }
      if let Some(observed) =
        self.engine.inspect_network(&network.name).await?
      {
        if observed
          .labels
          .get(keys::PROJECT)
          .is_some_and(|p| p == &project.name)
        {
          self.progress.event(Event::network(
            &network.name,
            EventStatus::Removing,
          ));
          self
            .engine
            .remove_network(&network.name)
            .await?;
          self.progress.event(Event::network(
            &network.name,
            EventStatus::Removed,
          ));
        }
      }
    }

    if options.volumes {
      for volume in project.volumes.values() {
        if volume.external {
          continue;
        }
        self.progress.event(Event::volume(
          &volume.name,
          EventStatus::Removing,
        ));
        self
          .engine
          .remove_volume(&volume.name, false)
          .await?;
        self.progress.event(Event::volume(
          &volume.name,
          EventStatus::Removed,
        ));
      }
    }
    Ok(())
  }

  /// Stop the selected services (all when empty) and every
  /// service depending on them, dependents first. Containers
  /// are kept around for a later `start`.
  pub async fn stop(
    &self,
    project: &Project,
    services: &[String],
    timeout: Option<i64>,
    cancel: &CancellationToken,
  ) -> anyhow::Result<()> {
    let graph = ServiceGraph::build(project)?;
    let scope = if services.is_empty() {
      None
    } else {
      Some(graph.with_dependents(services)?)
    };
    let engine = &self.engine;
    let progress = self.progress.as_ref();
    graph
      .walk(
        Direction::Reverse,
        scope.as_ref(),
        None,
        cancel,
        |name| async move {
          let service = project.service(&name)?;
          let stop_timeout =
            service.stop_grace_period.or(timeout);
          let selected = [name.clone()];
          let containers = engine
            .list_project_containers(
              project,
              OneOff::Exclude,
              &selected,
            )
            .await?;
          for container in &containers {
            if !container.is_running() {
              continue;
            }
            progress.event(Event::container(
              &container.name,
              EventStatus::Killing,
            ));
            engine
              .stop_container(&container.id, stop_timeout)
              .await?;
            progress.event(Event::container(
              &container.name,
              EventStatus::Killed,
            ));
          }
          Ok(())
        },
      )
      .await
  }

  /// Start existing containers of the selected services (all
  /// when empty) in dependency order, honouring wait
  /// conditions. Nothing is created.
  pub async fn start(
    &self,
    project: &Project,
    services: &[String],
    cancel: &CancellationToken,
  ) -> anyhow::Result<()> {
    let graph = ServiceGraph::build(project)?;
    let scope = if services.is_empty() {
      None
    } else {
      Some(graph.with_dependencies(services)?)
    };
    let operator = self.operator(project);
    let operator = &operator;
    graph
      .walk(
        Direction::Forward,
        scope.as_ref(),
        None,
        cancel,
        |name| async move {
          let service = project.service(&name)?;
          wait_for_dependencies(
            operator.engine,
            project,
            service,
            operator.progress,
            cancel,
          )
          .await?;
          let selected = [name.clone()];
          let containers = operator
            .engine
            .list_project_containers(
              project,
              OneOff::Exclude,
              &selected,
            )
            .await?;
          for container in &containers {
            if needs_start(container) {
              operator.start_container(container).await?;
            }
          }
          Ok(())
        },
      )
      .await
  }

  /// Restart the selected services (all when empty) in
  /// dependency order, without recreating anything.
  pub async fn restart(
    &self,
    project: &Project,
    services: &[String],
    timeout: Option<i64>,
    cancel: &CancellationToken,
  ) -> anyhow::Result<()> {
    let graph = ServiceGraph::build(project)?;
    for service in services {
      project.service(service)?;
    }
    let scope = if services.is_empty() {
      None
    } else {
      Some(HashSet::from_iter(services.iter().cloned()))
    };
    let engine = &self.engine;
    let progress = self.progress.as_ref();
    graph
      .walk(
        Direction::Forward,
        scope.as_ref(),
        None,
        cancel,
        |name| async move {
          let service = project.service(&name)?;
          let stop_timeout =
            service.stop_grace_period.or(timeout);
          let selected = [name.clone()];
          let containers = engine
            .list_project_containers(
              project,
              OneOff::Exclude,
              &selected,
            )
            .await?;
          for container in &containers {
            progress.event(Event::container(
              &container.name,
              EventStatus::Restarting,
            ));
            engine
              .restart_container(
                &container.id,
                stop_timeout,
              )
              .await?;
            progress.event(Event::container(
              &container.name,
              EventStatus::Restarted,
            ));
          }
          Ok(())
        },
      )
      .await
  }

  /// Create (and unless `no_start`, start) a single one-off
  /// container of a service, converging its dependencies
  /// first.
  pub async fn run_one_off(
    &self,
    project: &Project,
    service_name: &str,
    options: &RunOptions,
    cancel: &CancellationToken,
  ) -> anyhow::Result<Container> {
    let mut service =
      project.service(service_name)?.clone();
    if let Some(command) = &options.command {
      service.command = Some(command.clone());
    }
    if let Some(entrypoint) = &options.entrypoint {
      service.entrypoint = Some(entrypoint.clone());
    }
    for (key, value) in &options.environment {
      service
        .environment
        .insert(key.clone(), Some(value.clone()));
    }
    for (key, value) in &options.labels {
      service.labels.insert(key.clone(), value.clone());
    }

    if !options.no_deps {
      let dependencies: Vec<String> = service
        .dependency_names()
        .into_iter()
        .map(str::to_string)
        .collect();
      if !dependencies.is_empty() {
        let apply_options = ApplyOptions {
          services: dependencies,
          use_network_aliases: options
            .use_network_aliases,
          ..Default::default()
        };
        self
          .apply(project, &apply_options, cancel)
          .await?;
      }
    }

    let observed = CloneCache::default();
    for dependency in service.dependency_names() {
      let selected = [dependency.to_string()];
      let containers = self
        .engine
        .list_project_containers(
          project,
          OneOff::Exclude,
          &selected,
        )
        .await?;
      observed
        .insert(dependency.to_string(), containers)
        .await;
    }
    let service = resolve_service_references(
      project, service, &observed,
    )
    .await?;

    let operator = self.operator(project);
    let container = operator
      .create_one_off(
        &service,
        new_slug(),
        options.use_network_aliases,
        options.auto_remove,
      )
      .await?;

    if !options.no_start {
      wait_for_dependencies(
        &self.engine,
        project,
        &service,
        self.progress.as_ref(),
        cancel,
      )
      .await?;
      operator.start_container(&container).await?;
    }
    Ok(container)
  }

  /// Observed project containers, one-offs included.
  pub async fn ps(
    &self,
    project: &Project,
  ) -> anyhow::Result<Vec<Container>> {
    self
      .engine
      .list_project_containers(
        project,
        OneOff::Include,
        &[],
      )
      .await
  }

  fn operator<'a>(
    &'a self,
    project: &'a Project,
  ) -> Operator<'a> {
    Operator {
      engine: &self.engine,
      project,
      progress: self.progress.as_ref(),
    }
  }

  async fn handle_orphans(
    &self,
    project: &Project,
    all: &[Container],
    options: &ApplyOptions,
  ) -> anyhow::Result<()> {
    let orphans: Vec<Container> = all
      .iter()
      .filter(|container| is_orphan(project, container))
      .cloned()
      .collect();
    if orphans.is_empty() {
      return Ok(());
    }
    match options.orphans {
      OrphanPolicy::Remove => {
        self
          .operator(project)
          .remove_orphans(&orphans, options.timeout)
          .await
      }
      OrphanPolicy::Ignore => Ok(()),
      OrphanPolicy::Warn => {
        let names: Vec<&str> = orphans
          .iter()
          .map(|orphan| orphan.name.as_str())
          .collect();
        tracing::warn!(
          "found orphan containers ({}) for this project; \
           remove them to avoid stale state",
          names.join(", ")
        );
        self.progress.event(Event::with_text(
          format!("Project {}", project.name),
          EventStatus::Warning,
          format!(
            "orphan containers: {}",
            names.join(", ")
          ),
        ));
        Ok(())
      }
    }
  }
}

struct ApplyContext<'a> {
  engine: &'a EngineClient,
  project: &'a Project,
  graph: &'a ServiceGraph,
  observed: &'a CloneCache<String, Vec<Container>>,
  /// Services whose dependencies were recreated, so they must
  /// recreate as well when their turn comes.
  force: &'a SharedSet<String>,
  /// Admission control for per-container engine operations,
  /// sized to the configured max concurrency.
  limiter: &'a Semaphore,
  options: &'a ApplyOptions,
  progress: &'a dyn Progress,
  cancel: &'a CancellationToken,
}

impl ApplyContext<'_> {
  async fn converge(&self, name: &str) -> anyhow::Result<()> {
    let service = self.project.service(name)?.clone();
    let service = resolve_service_references(
      self.project,
      service,
      self.observed,
    )
    .await?;

    let snapshot = self
      .observed
      .get(&name.to_string())
      .await
      .unwrap_or_default();
    let policy = if self.force.contains(&name.to_string()).await
    {
      RecreatePolicy::Force
    } else {
      self.options.recreate
    };
    let plan =
      plan_service(&service, &snapshot, policy)?;

    let operator = Operator {
      engine: self.engine,
      project: self.project,
      progress: self.progress,
    };

    let timeout = service
      .stop_grace_period
      .or(self.options.timeout);

    let operator = &operator;
    let service = &service;
    try_join_all(plan.scale_down.iter().map(
      |container| async move {
        let _permit = self.limiter.acquire().await?;
        operator.stop_and_remove(container, timeout).await
      },
    ))
    .await?;

    if !plan.recreate.is_empty() {
      try_join_all(plan.recreate.iter().map(
        |container| async move {
          let _permit = self.limiter.acquire().await?;
          operator
            .recreate_container(
              service,
              container,
              timeout,
              self.options.use_network_aliases,
            )
            .await
        },
      ))
      .await?;
      // Dependents must pick up the new containers, even when
      // their own configuration is unchanged.
      for dependent in self.graph.dependents_of(name) {
        self.force.insert(dependent).await;
      }
    }

    try_join_all(plan.create_numbers.iter().map(
      |&number| async move {
        let _permit = self.limiter.acquire().await?;
        operator
          .create_container(
            service,
            number,
            self.options.use_network_aliases,
          )
          .await
      },
    ))
    .await?;

    for container in &plan.running {
      self.progress.event(Event::container(
        &container.name,
        EventStatus::Running,
      ));
    }
    for container in &plan.exited {
      self.progress.event(Event::container(
        &container.name,
        EventStatus::Created,
      ));
    }

    wait_for_dependencies(
      self.engine,
      self.project,
      &service,
      self.progress,
      self.cancel,
    )
    .await?;

    // Start phase: everything that is not already running or
    // under the engine's own restart control.
    let selected = [name.to_string()];
    let containers = self
      .engine
      .list_project_containers(
        self.project,
        OneOff::Exclude,
        &selected,
      )
      .await?;
    for container in &containers {
      if needs_start(container) {
        operator.start_container(container).await?;
      }
    }

    // Publish fresh state for later-visited dependents.
    let containers = self
      .engine
      .list_project_containers(
        self.project,
        OneOff::Exclude,
        &selected,
      )
      .await?;
    self
      .observed
      .insert(name.to_string(), containers)
      .await;
    Ok(())
  }
}

fn needs_start(container: &Container) -> bool {
  !matches!(
    container.state,
    ContainerState::Running | ContainerState::Restarting
  )
}

/// A project container is an orphan when its service is no
/// longer declared (or disabled), or when it is a finished
/// one-off left behind by an interactive run.
pub fn is_orphan(
  project: &Project,
  container: &Container,
) -> bool {
  let Some(service) = container.service() else {
    return false;
  };
  let declared = project.services.contains_key(service)
    || project.disabled_services.contains_key(service);
  if !declared {
    return true;
  }
  container.one_off()
    && matches!(
      container.state,
      ContainerState::Exited | ContainerState::Dead
    )
}

/// Custom container names must be unique across the project,
/// and scaling makes them impossible.
pub fn check_container_name_uniqueness(
  project: &Project,
) -> anyhow::Result<()> {
  let mut owners: HashMap<&str, &str> = HashMap::new();
  for (name, service) in &project.services {
    let Some(container_name) = &service.container_name
    else {
      continue;
    };
    if service.scale() > 1 {
      return Err(
        Error::CustomNameForbidsScale {
          service: name.clone(),
          container_name: container_name.clone(),
        }
        .into(),
      );
    }
    if let Some(previous) =
      owners.insert(container_name.as_str(), name)
    {
      return Err(anyhow::Error::new(Error::Conflict {
        kind: ResourceKind::Container,
        name: container_name.clone(),
      })
      .context(format!(
        "services {previous} and {name} both declare \
         container_name {container_name}"
      )));
    }
  }
  Ok(())
}

/// Replace `service:NAME` references (shared namespaces,
/// volumes_from) with concrete `container:<id>` references
/// using the first observed container of the target service.
pub async fn resolve_service_references(
  project: &Project,
  mut service: Service,
  observed: &CloneCache<String, Vec<Container>>,
) -> anyhow::Result<Service> {
  let resolve = |target: &str| {
    let target = target.to_string();
    async move {
      let containers = observed
        .get(&target)
        .await
        .unwrap_or_default();
      containers
        .first()
        .map(|container| container.id.clone())
        .with_context(|| Error::NotFound {
          kind: ResourceKind::Container,
          name: format!(
            "service {target} has no container to share \
             with"
          ),
        })
    }
  };

  if let Some(target) = service
    .network_mode_service()
    .map(str::to_string)
  {
    service.network_mode =
      Some(format!("container:{}", resolve(&target).await?));
  }
  if let Some(target) =
    service.ipc_service().map(str::to_string)
  {
    service.ipc =
      Some(format!("container:{}", resolve(&target).await?));
  }
  if let Some(target) =
    service.pid_service().map(str::to_string)
  {
    service.pid =
      Some(format!("container:{}", resolve(&target).await?));
  }

  let mut volumes_from =
    Vec::with_capacity(service.volumes_from.len());
  for source in &service.volumes_from {
    if source.starts_with("container:") {
      volumes_from.push(source.clone());
      continue;
    }
    let (target, mode) = match source.split_once(':') {
      Some((target, mode)) => (target, Some(mode)),
      None => (source.as_str(), None),
    };
    if !project.services.contains_key(target) {
      volumes_from.push(source.clone());
      continue;
    }
    let id = resolve(target).await?;
    volumes_from.push(match mode {
      Some(mode) => format!("{id}:{mode}"),
      None => id,
    });
  }
  service.volumes_from = volumes_from;

  Ok(service)
}

#[cfg(test)]
mod tests {
  use pretty_assertions::assert_eq;

  use super::*;

  fn project_with(
    services: &[(&str, Option<&str>, u64)],
  ) -> Project {
    let mut project = Project {
      name: "app".to_string(),
      ..Default::default()
    };
    for (name, container_name, replicas) in services {
      project.services.insert(
        name.to_string(),
        Service {
          name: name.to_string(),
          container_name: container_name
            .map(str::to_string),
          replicas: Some(*replicas),
          ..Default::default()
        },
      );
    }
    project
  }

  #[test]
  fn duplicate_container_names_conflict() {
    let project = project_with(&[
      ("a", Some("shared"), 1),
      ("b", Some("shared"), 1),
    ]);
    let err = check_container_name_uniqueness(&project)
      .unwrap_err();
    assert!(matches!(
      caravel_model::error_kind(&err),
      Some(Error::Conflict { .. })
    ));
  }

  #[test]
  fn scaled_custom_name_is_rejected() {
    let project =
      project_with(&[("a", Some("only"), 2)]);
    let err = check_container_name_uniqueness(&project)
      .unwrap_err();
    assert!(matches!(
      caravel_model::error_kind(&err),
      Some(Error::CustomNameForbidsScale { .. })
    ));
  }

  #[test]
  fn orphan_detection() {
    let project = project_with(&[("web", None, 1)]);

    let mut gone = Container::default();
    gone.labels.insert(
      keys::SERVICE.to_string(),
      "removed".to_string(),
    );
    assert!(is_orphan(&project, &gone));

    let mut current = Container::default();
    current.labels.insert(
      keys::SERVICE.to_string(),
      "web".to_string(),
    );
    assert!(!is_orphan(&project, &current));

    let mut finished_run = Container {
      state: ContainerState::Exited,
      ..Default::default()
    };
    finished_run.labels.insert(
      keys::SERVICE.to_string(),
      "web".to_string(),
    );
    finished_run.labels.insert(
      keys::ONE_OFF.to_string(),
      "True".to_string(),
    );
    assert!(is_orphan(&project, &finished_run));
  }

  #[tokio::test]
  async fn service_references_resolve_to_containers() {
    let mut project = project_with(&[
      ("web", None, 1),
      ("db", None, 1),
    ]);
    project
      .services
      .get_mut("web")
      .unwrap()
      .network_mode = Some("service:db".to_string());
    project
      .services
      .get_mut("web")
      .unwrap()
      .volumes_from = vec!["db:ro".to_string()];

    let observed = CloneCache::default();
    observed
      .insert(
        "db".to_string(),
        vec![Container {
          id: "db-container-id".to_string(),
          ..Default::default()
        }],
      )
      .await;

    let web =
      project.services.get("web").unwrap().clone();
    let resolved = resolve_service_references(
      &project, web, &observed,
    )
    .await
    .unwrap();
    assert_eq!(
      resolved.network_mode.as_deref(),
      Some("container:db-container-id")
    );
    assert_eq!(
      resolved.volumes_from,
      vec!["db-container-id:ro"]
    );
  }

  #[tokio::test]
  async fn unresolvable_reference_fails() {
    let mut project = project_with(&[
      ("web", None, 1),
      ("db", None, 1),
    ]);
    project
      .services
      .get_mut("web")
      .unwrap()
      .ipc = Some("service:db".to_string());
    let web =
      project.services.get("web").unwrap().clone();
    let err = resolve_service_references(
      &project,
      web,
      &CloneCache::default(),
    )
    .await
    .unwrap_err();
    assert!(matches!(
      caravel_model::error_kind(&err),
      Some(Error::NotFound { .. })
    ));
  }
}
