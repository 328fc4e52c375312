use std::collections::HashMap;

use anyhow::Context;
use bollard::{
  models::VolumeCreateOptions,
  query_parameters::RemoveVolumeOptions,
};
use caravel_model::Volume;

use super::EngineClient;

/// Observed volume, reduced to what reconciliation needs.
#[derive(Debug, Clone, Default)]
pub struct VolumeInfo {
  pub name: String,
  pub driver: String,
  pub labels: HashMap<String, String>,
}

impl EngineClient {
  /// Inspect by name; absence is `None`, not an error.
  pub async fn inspect_volume(
    &self,
    name: &str,
  ) -> anyhow::Result<Option<VolumeInfo>> {
    match self.docker().inspect_volume(name).await {
      Ok(volume) => Ok(Some(VolumeInfo {
        name: volume.name,
        driver: volume.driver,
        labels: volume.labels,
      })),
      Err(err) if super::is_not_found(&err) => Ok(None),
      Err(err) => Err(err).with_context(|| {
        format!("Failed to inspect volume {name}")
      }),
    }
  }

  pub async fn create_volume(
    &self,
    volume: &Volume,
    labels: HashMap<String, String>,
  ) -> anyhow::Result<()> {
    self
      .docker()
      .create_volume(VolumeCreateOptions {
        name: Some(volume.name.clone()),
        driver: volume.driver.clone(),
        driver_opts: if volume.driver_opts.is_empty() {
          None
        } else {
          Some(
            volume
              .driver_opts
              .iter()
              .map(|(k, v)| (k.clone(), v.clone()))
              .collect(),
          )
        },
        labels: Some(labels),
        ..Default::default()
      })
      .await
      .with_context(|| {
        format!("Failed to create volume {}", volume.name)
      })?;
    Ok(())
  }

  /// Remove by name. Absence is success.
  pub async fn remove_volume(
    &self,
    name: &str,
    force: bool,
  ) -> anyhow::Result<()> {
    match self
      .docker()
      .remove_volume(
        name,
        Some(RemoveVolumeOptions { force }),
      )
      .await
    {
      Ok(()) => Ok(()),
      Err(err) if super::is_not_found(&err) => Ok(()),
      Err(err) => Err(err).with_context(|| {
        format!("Failed to remove volume {name}")
      }),
    }
  }
}
