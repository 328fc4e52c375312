//! Engine-query predicates and canonical resource names derived
//! from the ownership label schema.

use std::collections::HashMap;

use caravel_model::{Project, Service, labels};

/// One-off containers in list queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OneOff {
  Include,
  Exclude,
  Only,
}

pub fn project_filter(project: &str) -> String {
  format!("{}={project}", labels::PROJECT)
}

pub fn service_filter(service: &str) -> String {
  format!("{}={service}", labels::SERVICE)
}

pub fn one_off_filter(one_off: bool) -> String {
  format!(
    "{}={}",
    labels::ONE_OFF,
    if one_off { "True" } else { "False" }
  )
}

/// Presence of the config-hash label marks a container as
/// created by us, as opposed to manually-run containers that
/// only carry the project label.
pub fn has_config_hash_filter() -> String {
  labels::CONFIG_HASH.to_string()
}

pub fn container_number_filter(number: i64) -> String {
  format!("{}={number}", labels::CONTAINER_NUMBER)
}

/// Standard label filters for listing project containers.
///
/// A service filter is only pushed down to the engine when
/// exactly one service is selected; multi-service selection is
/// filtered client-side after listing.
pub fn default_filters(
  project: &str,
  one_off: OneOff,
  selected: &[String],
) -> HashMap<String, Vec<String>> {
  let mut label_filters = vec![
    project_filter(project),
    has_config_hash_filter(),
  ];
  if let [service] = selected {
    label_filters.push(service_filter(service));
  }
  match one_off {
    OneOff::Exclude => {
      label_filters.push(one_off_filter(false))
    }
    OneOff::Only => label_filters.push(one_off_filter(true)),
    OneOff::Include => {}
  }
  HashMap::from([("label".to_string(), label_filters)])
}

/// Deterministic name of a replica container:
/// `<project><sep><service><sep><number>`, unless the service
/// declares an explicit container name.
pub fn container_name(
  project: &Project,
  service: &Service,
  number: i64,
) -> String {
  if let Some(name) = &service.container_name {
    return name.clone();
  }
  let sep = project.separator();
  format!("{}{sep}{}{sep}{number}", project.name, service.name)
}

/// Name of a one-off container:
/// `<project><sep><service><sep>run<sep><short-slug>`.
pub fn one_off_name(
  project: &Project,
  service: &Service,
  slug: &str,
) -> String {
  let sep = project.separator();
  format!(
    "{}{sep}{}{sep}run{sep}{}",
    project.name,
    service.name,
    short_slug(slug)
  )
}

/// Random lowercase-hex slug identifying a one-off container.
pub fn new_slug() -> String {
  use rand::Rng;
  const HEX: &[u8] = b"0123456789abcdef";
  let mut rng = rand::rng();
  (0..32)
    .map(|_| HEX[rng.random_range(0..HEX.len())] as char)
    .collect()
}

pub fn short_slug(slug: &str) -> &str {
  &slug[..slug.len().min(12)]
}

/// Ownership labels applied to every container we create.
pub fn container_labels(
  project: &Project,
  service: &Service,
  number: i64,
  one_off: Option<&str>,
  config_hash: &str,
  replaces: Option<&str>,
) -> HashMap<String, String> {
  let mut out: HashMap<String, String> = service
    .labels
    .iter()
    .chain(service.custom_labels.iter())
    .map(|(k, v)| (k.clone(), v.clone()))
    .collect();
  out.insert(
    labels::PROJECT.to_string(),
    project.name.clone(),
  );
  out.insert(
    labels::SERVICE.to_string(),
    service.name.clone(),
  );
  out.insert(
    labels::CONFIG_HASH.to_string(),
    config_hash.to_string(),
  );
  out.insert(
    labels::CONTAINER_NUMBER.to_string(),
    number.to_string(),
  );
  out.insert(
    labels::VERSION.to_string(),
    labels::VERSION_MARKER.to_string(),
  );
  out.insert(
    labels::ONE_OFF.to_string(),
    if one_off.is_some() { "True" } else { "False" }
      .to_string(),
  );
  if let Some(slug) = one_off {
    out.insert(labels::SLUG.to_string(), slug.to_string());
  }
  out.insert(
    labels::WORKING_DIR.to_string(),
    project.working_dir.clone(),
  );
  out.insert(
    labels::CONFIG_FILES.to_string(),
    project.config_files.join(","),
  );
  out.insert(
    labels::DEPENDENCIES.to_string(),
    service.dependencies_label_value(),
  );
  if let Some(replaced) = replaces {
    out.insert(
      labels::CONTAINER_REPLACE.to_string(),
      replaced.to_string(),
    );
  }
  out
}

/// Labels applied to networks and volumes we create.
pub fn resource_labels(
  project: &str,
  kind_label: &str,
  resource: &str,
  config_hash: &str,
  extra: &indexmap::IndexMap<String, String>,
) -> HashMap<String, String> {
  let mut out: HashMap<String, String> = extra
    .iter()
    .map(|(k, v)| (k.clone(), v.clone()))
    .collect();
  out.insert(labels::PROJECT.to_string(), project.to_string());
  out.insert(kind_label.to_string(), resource.to_string());
  out.insert(
    labels::VERSION.to_string(),
    labels::VERSION_MARKER.to_string(),
  );
  out.insert(
    labels::CONFIG_HASH.to_string(),
    config_hash.to_string(),
  );
  out
}

#[cfg(test)]
mod tests {
  use pretty_assertions::assert_eq;

  use super::*;

  fn project(name: &str) -> Project {
    Project {
      name: name.to_string(),
      ..Default::default()
    }
  }

  fn service(name: &str) -> Service {
    Service {
      name: name.to_string(),
      ..Default::default()
    }
  }

  #[test]
  fn canonical_names() {
    let project = project("myapp");
    let web = service("web");
    assert_eq!(
      container_name(&project, &web, 1),
      "myapp-web-1"
    );

    let mut legacy = project.clone();
    legacy.legacy_separator = true;
    assert_eq!(
      container_name(&legacy, &web, 2),
      "myapp_web_2"
    );

    let mut named = service("web");
    named.container_name = Some("frontend".to_string());
    assert_eq!(container_name(&project, &named, 1), "frontend");

    assert_eq!(
      one_off_name(&project, &web, "0123456789abcdef"),
      "myapp-web-run-0123456789ab"
    );
  }

  #[test]
  fn default_filters_single_service_pushdown() {
    let filters = default_filters(
      "myapp",
      OneOff::Exclude,
      &["web".to_string()],
    );
    let labels = &filters["label"];
    assert!(labels.contains(
      &"com.docker.compose.project=myapp".to_string()
    ));
    assert!(labels
      .contains(&"com.docker.compose.config-hash".to_string()));
    assert!(labels.contains(
      &"com.docker.compose.service=web".to_string()
    ));
    assert!(labels
      .contains(&"com.docker.compose.oneoff=False".to_string()));

    // Multiple selected services filter client-side instead.
    let filters = default_filters(
      "myapp",
      OneOff::Include,
      &["web".to_string(), "db".to_string()],
    );
    assert!(!filters["label"]
      .iter()
      .any(|label| label.contains("compose.service")));
    assert!(!filters["label"]
      .iter()
      .any(|label| label.contains("oneoff")));
  }

  #[test]
  fn slugs_are_lowercase_hex() {
    let slug = new_slug();
    assert_eq!(slug.len(), 32);
    assert!(slug
      .chars()
      .all(|c| c.is_ascii_hexdigit() && !c.is_uppercase()));
    assert_eq!(short_slug(&slug).len(), 12);
  }
}
