use std::collections::HashMap;

use anyhow::Context;
use bollard::{
  models::{
    EndpointSettings, Ipam, IpamConfig,
    NetworkConnectRequest, NetworkCreateRequest,
  },
  query_parameters::InspectNetworkOptions,
};
use caravel_model::Network;

use super::EngineClient;

/// Observed network, reduced to what reconciliation needs.
#[derive(Debug, Clone, Default)]
pub struct NetworkInfo {
  pub id: String,
  pub name: String,
  pub driver: Option<String>,
  pub labels: HashMap<String, String>,
}

impl EngineClient {
  /// Inspect by name; absence is `None`, not an error.
  pub async fn inspect_network(
    &self,
    name: &str,
  ) -> anyhow::Result<Option<NetworkInfo>> {
    match self
      .docker()
      .inspect_network(name, None::<InspectNetworkOptions>)
      .await
    {
      Ok(network) => Ok(Some(NetworkInfo {
        id: network.id.unwrap_or_default(),
        name: network.name.unwrap_or_default(),
        driver: network.driver,
        labels: network.labels.unwrap_or_default(),
      })),
      Err(err) if super::is_not_found(&err) => Ok(None),
      Err(err) => Err(err).with_context(|| {
        format!("Failed to inspect network {name}")
      }),
    }
  }

  pub async fn create_network(
    &self,
    network: &Network,
    labels: HashMap<String, String>,
  ) -> anyhow::Result<()> {
    let ipam = network.ipam.as_ref().map(|ipam| Ipam {
      driver: ipam.driver.clone(),
      config: Some(
        ipam
          .config
          .iter()
          .map(|pool| IpamConfig {
            subnet: pool.subnet.clone(),
            ip_range: pool.ip_range.clone(),
            gateway: pool.gateway.clone(),
            auxiliary_addresses: if pool
              .aux_addresses
              .is_empty()
            {
              None
            } else {
              Some(
                pool
                  .aux_addresses
                  .iter()
                  .map(|(k, v)| (k.clone(), v.clone()))
                  .collect(),
              )
            },
          })
          .collect(),
      ),
      options: None,
    });
    self
      .docker()
      .create_network(NetworkCreateRequest {
        name: network.name.clone(),
        driver: network.driver.clone(),
        internal: Some(network.internal),
        attachable: Some(network.attachable),
        enable_ipv6: Some(network.enable_ipv6),
        ipam,
        options: if network.driver_opts.is_empty() {
          None
        } else {
          Some(
            network
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
        format!("Failed to create network {}", network.name)
      })?;
    Ok(())
  }

  /// Remove by name. Absence is success.
  pub async fn remove_network(
    &self,
    name: &str,
  ) -> anyhow::Result<()> {
    match self.docker().remove_network(name).await {
      Ok(()) => Ok(()),
      Err(err) if super::is_not_found(&err) => Ok(()),
      Err(err) => Err(err).with_context(|| {
        format!("Failed to remove network {name}")
      }),
    }
  }

  /// Attach a container to a network after create, for engines
  /// predating multi-endpoint create.
  pub async fn connect_network(
    &self,
    network: &str,
    container: &str,
    endpoint: EndpointSettings,
  ) -> anyhow::Result<()> {
    self
      .docker()
      .connect_network(network, NetworkConnectRequest {
        container: Some(container.to_string()),
        endpoint_config: Some(endpoint),
      })
      .await
      .with_context(|| {
        format!(
          "Failed to connect container {container} \
           to network {network}"
        )
      })
  }
}
