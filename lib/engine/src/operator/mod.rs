//! Container lifecycle operations: create, recreate, start,
//! stop-and-remove, and orphan cleanup. Every operation reports
//! its outcome as progress events and leans on the engine's
//! idempotency (absent-on-remove is success).

use anyhow::Context;
use bollard::query_parameters::CreateContainerOptions;
use caravel_model::{Container, Project, Service};
use futures_util::future::try_join_all;

use crate::{
  docker::EngineClient,
  labels::{container_name, one_off_name},
  progress::{Event, EventStatus, Progress},
};

mod create;
mod inject;
mod mounts;

pub use create::CreateSpec;
pub use mounts::{MountSet, build_mounts};

pub struct Operator<'a> {
  pub engine: &'a EngineClient,
  pub project: &'a Project,
  pub progress: &'a dyn Progress,
}

impl Operator<'_> {
  /// Create one replica container. The service must already
  /// have cross-service references resolved.
  pub async fn create_container(
    &self,
    service: &Service,
    number: i64,
    use_network_aliases: bool,
  ) -> anyhow::Result<Container> {
    let name = container_name(self.project, service, number);
    self
      .create(CreateSpec {
        project: self.project,
        service,
        number,
        name,
        slug: None,
        replaces: None,
        use_network_aliases,
        auto_remove: false,
      })
      .await
  }

  /// Create a one-off container, named and labelled with a
  /// fresh slug so it never counts against declared scale.
  pub async fn create_one_off(
    &self,
    service: &Service,
    slug: String,
    use_network_aliases: bool,
    auto_remove: bool,
  ) -> anyhow::Result<Container> {
    let name = one_off_name(self.project, service, &slug);
    self
      .create(CreateSpec {
        project: self.project,
        service,
        number: 1,
        name,
        slug: Some(slug),
        replaces: None,
        use_network_aliases,
        auto_remove,
      })
      .await
  }

  /// Replace a diverged container while keeping its replica
  /// number and canonical name. The replacement is created
  /// under a temporary name first so the canonical name frees
  /// up only after the old container is gone.
  ///
  /// The stop/remove/rename tail runs on a detached task:
  /// cancelling the surrounding operation drops this future,
  /// but the tail still completes, so a replacement is never
  /// stranded under its temporary name.
  pub async fn recreate_container(
    &self,
    service: &Service,
    replaced: &Container,
    timeout: Option<i64>,
    use_network_aliases: bool,
  ) -> anyhow::Result<Container> {
    let number = replaced.number();
    let target =
      container_name(self.project, service, number);
    self.progress.event(Event::container(
      &target,
      EventStatus::Recreating,
    ));

    let temporary = format!(
      "{}_{target}",
      &replaced.id[..replaced.id.len().min(12)]
    );
    let mut replacement = self
      .create(CreateSpec {
        project: self.project,
        service,
        number,
        name: temporary,
        slug: None,
        replaces: Some(replaced),
        use_network_aliases,
        auto_remove: false,
      })
      .await?;

    let timeout = service.stop_grace_period.or(timeout);
    let engine = self.engine.clone();
    let replaced_id = replaced.id.clone();
    let replacement_id = replacement.id.clone();
    let canonical = target.clone();
    tokio::spawn(async move {
      engine.stop_container(&replaced_id, timeout).await?;
      engine
        .remove_container(&replaced_id, false, false)
        .await?;
      engine
        .rename_container(&replacement_id, &canonical)
        .await
    })
    .await
    .context("Recreate cleanup task failed")??;
    replacement.name = target.clone();

    self.progress.event(Event::container(
      &target,
      EventStatus::Recreated,
    ));
    Ok(replacement)
  }

  async fn create(
    &self,
    spec: CreateSpec<'_>,
  ) -> anyhow::Result<Container> {
    self.progress.event(Event::container(
      &spec.name,
      EventStatus::Creating,
    ));
    let (body, deferred) =
      create::build_create_payload(self.engine, &spec)
        .await?;
    let response = self
      .engine
      .docker()
      .create_container(
        Some(CreateContainerOptions {
          name: Some(spec.name.clone()),
          platform: spec.service.platform.clone().unwrap_or_default(),
        }),
        body,
      )
      .await
      .with_context(|| {
        format!("Failed to create container {}", spec.name)
      })?;

    // Engines predating multi-endpoint create only accept the
    // primary endpoint in the create call; the rest attach
    // before start.
    for (network, endpoint) in deferred {
      self
        .engine
        .connect_network(&network, &response.id, endpoint)
        .await?;
    }

    inject::inject_file_objects(
      self.engine,
      self.project,
      spec.service,
      &response.id,
    )
    .await?;

    self.progress.event(Event::container(
      &spec.name,
      EventStatus::Created,
    ));
    self.engine.inspect_container(&response.id).await
  }

  pub async fn start_container(
    &self,
    container: &Container,
  ) -> anyhow::Result<()> {
    self.progress.event(Event::container(
      &container.name,
      EventStatus::Starting,
    ));
    match self.engine.start_container(&container.id).await {
      Ok(()) => {
        self.progress.event(Event::container(
          &container.name,
          EventStatus::Started,
        ));
        Ok(())
      }
      Err(err) => {
        self.progress.event(Event::with_text(
          format!("Container {}", container.name),
          EventStatus::Error,
          err.to_string(),
        ));
        Err(err)
      }
    }
  }

  pub async fn stop_and_remove(
    &self,
    container: &Container,
    timeout: Option<i64>,
  ) -> anyhow::Result<()> {
    self.progress.event(Event::container(
      &container.name,
      EventStatus::Removing,
    ));
    self
      .engine
      .stop_container(&container.id, timeout)
      .await?;
    self
      .engine
      .remove_container(&container.id, false, false)
      .await?;
    self.progress.event(Event::container(
      &container.name,
      EventStatus::Removed,
    ));
    Ok(())
  }

  /// Stop and remove containers whose service is no longer
  /// declared, concurrently.
  pub async fn remove_orphans(
    &self,
    orphans: &[Container],
    timeout: Option<i64>,
  ) -> anyhow::Result<()> {
    try_join_all(orphans.iter().map(|orphan| {
      self.stop_and_remove(orphan, timeout)
    }))
    .await?;
    Ok(())
  }
}
