//! Pure planning step of per-service convergence: given the
//! declared service and the observed replica containers, decide
//! what must be created, recreated, started, or removed. No
//! engine calls happen here, which keeps the decision table
//! testable in isolation.

use caravel_model::{
  Container, ContainerState, Error, RecreatePolicy, Service,
  labels,
};

use crate::hash::service_hash;

/// Outcome of planning one service against its observed state.
#[derive(Debug, Clone, Default)]
pub struct ServicePlan {
  pub expected: usize,
  /// Diverged containers to replace, oldest first.
  pub recreate: Vec<Container>,
  /// Containers beyond the declared scale, to stop and remove.
  pub scale_down: Vec<Container>,
  /// Replica numbers for containers that do not exist yet.
  pub create_numbers: Vec<i64>,
  /// Up to date and running; nothing to do but report.
  pub running: Vec<Container>,
  /// Up to date but exited; the start phase brings them up.
  pub exited: Vec<Container>,
  /// `created` or `restarting`; left to the engine.
  pub untouched: Vec<Container>,
  /// Any other state (eg. paused); started directly.
  pub start_now: Vec<Container>,
}

impl ServicePlan {
  /// True when a second apply of an unchanged project would
  /// mutate nothing.
  pub fn is_noop(&self) -> bool {
    self.recreate.is_empty()
      && self.scale_down.is_empty()
      && self.create_numbers.is_empty()
  }
}

/// Whether the observed container no longer matches the
/// declared configuration and must be replaced.
pub fn must_recreate(
  service: &Service,
  container: &Container,
  policy: RecreatePolicy,
) -> anyhow::Result<bool> {
  match policy {
    RecreatePolicy::Never => return Ok(false),
    RecreatePolicy::Force => return Ok(true),
    RecreatePolicy::Auto => {}
  }
  if service.force_recreate() {
    return Ok(true);
  }
  let declared_hash = service_hash(service)?;
  if container.config_hash() != Some(declared_hash.as_str()) {
    return Ok(true);
  }
  // The digest comparison only applies once images have been
  // ensured and the declared digest recorded.
  if let Some(declared_digest) =
    service.custom_labels.get(labels::IMAGE_DIGEST)
  {
    if container.image_digest()
      != Some(declared_digest.as_str())
    {
      return Ok(true);
    }
  }
  Ok(false)
}

pub fn plan_service(
  service: &Service,
  observed: &[Container],
  policy: RecreatePolicy,
) -> anyhow::Result<ServicePlan> {
  let expected = service.scale();
  if expected > 1 {
    if let Some(container_name) = &service.container_name {
      return Err(Error::CustomNameForbidsScale {
        service: service.name.clone(),
        container_name: container_name.clone(),
      }
      .into());
    }
  }

  let mut sorted: Vec<(bool, Container)> = observed
    .iter()
    .map(|container| {
      must_recreate(service, container, policy)
        .map(|obsolete| (obsolete, container.clone()))
    })
    .collect::<anyhow::Result<_>>()?;
  sorted.sort_by(|(a_obsolete, a), (b_obsolete, b)| {
    b_obsolete
      .cmp(a_obsolete)
      .then(a.number().cmp(&b.number()))
      .then(a.created.cmp(&b.created))
  });

  let mut plan = ServicePlan {
    expected,
    ..Default::default()
  };
  for (i, (obsolete, container)) in
    sorted.into_iter().enumerate()
  {
    if i >= expected {
      plan.scale_down.push(container);
    } else if obsolete {
      plan.recreate.push(container);
    } else {
      match container.state {
        ContainerState::Running => {
          plan.running.push(container)
        }
        ContainerState::Exited => {
          plan.exited.push(container)
        }
        ContainerState::Created
        | ContainerState::Restarting => {
          plan.untouched.push(container)
        }
        _ => plan.start_now.push(container),
      }
    }
  }

  let actual = observed.len() - plan.scale_down.len();
  if actual < expected {
    let next = 1 + observed
      .iter()
      .map(Container::number)
      .max()
      .unwrap_or_default();
    plan.create_numbers = (0..(expected - actual) as i64)
      .map(|i| next + i)
      .collect();
  }

  Ok(plan)
}

#[cfg(test)]
mod tests {
  use pretty_assertions::assert_eq;

  use super::*;

  fn service(name: &str) -> Service {
    Service {
      name: name.to_string(),
      image: Some("redis:7".to_string()),
      ..Default::default()
    }
  }

  fn container(
    service: &Service,
    number: i64,
    state: ContainerState,
  ) -> Container {
    let mut container = Container {
      id: format!("id-{number}"),
      name: format!("app-{}-{number}", service.name),
      state,
      created: number,
      ..Default::default()
    };
    container.labels.insert(
      labels::CONFIG_HASH.to_string(),
      service_hash(service).unwrap(),
    );
    container.labels.insert(
      labels::CONTAINER_NUMBER.to_string(),
      number.to_string(),
    );
    container.labels.insert(
      labels::SERVICE.to_string(),
      service.name.clone(),
    );
    container
  }

  #[test]
  fn fresh_service_creates_contiguous_numbers() {
    let mut web = service("web");
    web.replicas = Some(3);
    let plan =
      plan_service(&web, &[], RecreatePolicy::Auto)
        .unwrap();
    assert_eq!(plan.create_numbers, vec![1, 2, 3]);
    assert!(plan.recreate.is_empty());
    assert!(plan.scale_down.is_empty());
  }

  #[test]
  fn up_to_date_running_service_is_a_noop() {
    let web = service("web");
    let observed =
      [container(&web, 1, ContainerState::Running)];
    let plan =
      plan_service(&web, &observed, RecreatePolicy::Auto)
        .unwrap();
    assert!(plan.is_noop());
    assert_eq!(plan.running.len(), 1);
  }

  #[test]
  fn scale_up_continues_numbering() {
    let mut web = service("web");
    web.replicas = Some(3);
    let observed =
      [container(&web, 1, ContainerState::Running)];
    let plan =
      plan_service(&web, &observed, RecreatePolicy::Auto)
        .unwrap();
    assert_eq!(plan.create_numbers, vec![2, 3]);
  }

  #[test]
  fn scale_down_drops_excess_containers() {
    let web = service("web");
    let observed = [
      container(&web, 1, ContainerState::Running),
      container(&web, 2, ContainerState::Running),
      container(&web, 3, ContainerState::Running),
    ];
    let plan =
      plan_service(&web, &observed, RecreatePolicy::Auto)
        .unwrap();
    assert_eq!(plan.scale_down.len(), 2);
    assert_eq!(plan.running.len(), 1);
    assert!(plan.create_numbers.is_empty());
  }

  #[test]
  fn diverged_hash_forces_recreate() {
    let old = service("web");
    let observed =
      [container(&old, 1, ContainerState::Running)];
    let mut new = service("web");
    new.image = Some("redis:8".to_string());
    let plan =
      plan_service(&new, &observed, RecreatePolicy::Auto)
        .unwrap();
    assert_eq!(plan.recreate.len(), 1);
    assert!(plan.create_numbers.is_empty());
  }

  #[test]
  fn recreate_policy_never_keeps_diverged() {
    let old = service("web");
    let observed =
      [container(&old, 1, ContainerState::Running)];
    let mut new = service("web");
    new.image = Some("redis:8".to_string());
    let plan =
      plan_service(&new, &observed, RecreatePolicy::Never)
        .unwrap();
    assert!(plan.is_noop());
  }

  #[test]
  fn recreate_policy_force_recreates_up_to_date() {
    let web = service("web");
    let observed =
      [container(&web, 1, ContainerState::Running)];
    let plan =
      plan_service(&web, &observed, RecreatePolicy::Force)
        .unwrap();
    assert_eq!(plan.recreate.len(), 1);
  }

  #[test]
  fn lifecycle_extension_forces_recreate() {
    let mut web = service("web");
    let observed =
      [container(&web, 1, ContainerState::Running)];
    web.extensions.insert(
      caravel_model::LIFECYCLE_EXTENSION.to_string(),
      serde_json::Value::String(
        caravel_model::FORCE_RECREATE.to_string(),
      ),
    );
    assert!(
      must_recreate(
        &web,
        &observed[0],
        RecreatePolicy::Auto
      )
      .unwrap()
    );
  }

  #[test]
  fn image_digest_divergence_forces_recreate() {
    let mut web = service("web");
    web.custom_labels.insert(
      labels::IMAGE_DIGEST.to_string(),
      "sha256:new".to_string(),
    );
    let mut observed =
      container(&web, 1, ContainerState::Running);
    observed.labels.insert(
      labels::IMAGE_DIGEST.to_string(),
      "sha256:old".to_string(),
    );
    assert!(
      must_recreate(&web, &observed, RecreatePolicy::Auto)
        .unwrap()
    );
  }

  #[test]
  fn custom_name_forbids_scale() {
    let mut web = service("web");
    web.container_name = Some("frontend".to_string());
    web.replicas = Some(2);
    let err =
      plan_service(&web, &[], RecreatePolicy::Auto)
        .unwrap_err();
    assert!(matches!(
      caravel_model::error_kind(&err),
      Some(Error::CustomNameForbidsScale { .. })
    ));
  }

  #[test]
  fn exited_containers_wait_for_the_start_phase() {
    let web = service("web");
    let observed =
      [container(&web, 1, ContainerState::Exited)];
    let plan =
      plan_service(&web, &observed, RecreatePolicy::Auto)
        .unwrap();
    assert!(plan.is_noop());
    assert_eq!(plan.exited.len(), 1);
  }
}
