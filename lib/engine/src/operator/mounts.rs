//! Translation of declared volume entries into the engine's two
//! mount representations. The engine accepts both a plain binds
//! list and a structured mounts list; only binds support host
//! path creation without the richer API, so the split is: bind
//! iff the entry is a plain bind mount without options that
//! require the structured form. Named pipes always use the
//! structured form.

use bollard::models::{
  Mount, MountBindOptions,
  MountBindOptionsPropagationEnum, MountTypeEnum,
  MountVolumeOptions, MountTmpfsOptions,
};
use caravel_model::{
  Error, FileObject, FileReference, MountKind, Project,
  ResourceKind, Service, VolumeMount,
};

/// Secrets mount under this directory unless the declaration
/// targets an absolute path.
pub const SECRETS_DIR: &str = "/run/secrets";

#[derive(Debug, Clone, Default)]
pub struct MountSet {
  pub binds: Vec<String>,
  pub mounts: Vec<Mount>,
  /// Whether any entry requires image-mount support.
  pub uses_image_mounts: bool,
}

pub fn build_mounts(
  project: &Project,
  service: &Service,
) -> anyhow::Result<MountSet> {
  let mut set = MountSet::default();

  for entry in &service.volumes {
    if entry.kind == MountKind::Image {
      set.uses_image_mounts = true;
    }
    if as_plain_bind(entry) {
      set.binds.push(bind_string(project, entry));
    } else {
      set.mounts.push(structured_mount(project, entry));
    }
  }

  for reference in &service.secrets {
    if let Some(bind) = file_object_bind(
      project,
      reference,
      project.secrets.get(&reference.source),
      ResourceKind::Secret,
    )? {
      set.binds.push(bind);
    }
  }
  for reference in &service.configs {
    if let Some(bind) = file_object_bind(
      project,
      reference,
      project.configs.get(&reference.source),
      ResourceKind::Config,
    )? {
      set.binds.push(bind);
    }
  }

  Ok(set)
}

/// The plain binds list is only usable for bind mounts with no
/// propagation/recursion/selinux options.
fn as_plain_bind(entry: &VolumeMount) -> bool {
  entry.kind == MountKind::Bind
    && entry
      .bind
      .as_ref()
      .is_none_or(|bind| !bind.needs_mount_api())
}

fn bind_string(
  project: &Project,
  entry: &VolumeMount,
) -> String {
  let source = absolute_source(
    project,
    entry.source.as_deref().unwrap_or_default(),
  );
  if entry.read_only {
    format!("{source}:{}:ro", entry.target)
  } else {
    format!("{source}:{}", entry.target)
  }
}

fn structured_mount(
  project: &Project,
  entry: &VolumeMount,
) -> Mount {
  let source = entry.source.as_ref().map(|source| {
    if entry.kind == MountKind::Bind {
      absolute_source(project, source)
    } else {
      source.clone()
    }
  });
  Mount {
    target: Some(entry.target.clone()),
    source,
    typ: Some(match entry.kind {
      MountKind::Volume => MountTypeEnum::VOLUME,
      MountKind::Bind => MountTypeEnum::BIND,
      MountKind::Tmpfs => MountTypeEnum::TMPFS,
      MountKind::Npipe => MountTypeEnum::NPIPE,
      MountKind::Image => MountTypeEnum::IMAGE,
    }),
    read_only: Some(entry.read_only),
    consistency: entry.consistency.clone(),
    bind_options: entry.bind.as_ref().map(|bind| {
      MountBindOptions {
        propagation: bind
          .propagation
          .as_deref()
          .map(propagation),
        non_recursive: Some(!bind.recursive),
        create_mountpoint: Some(bind.create_host_path),
        ..Default::default()
      }
    }),
    volume_options: entry.volume.as_ref().map(|volume| {
      MountVolumeOptions {
        no_copy: Some(volume.nocopy),
        subpath: volume.subpath.clone(),
        ..Default::default()
      }
    }),
    tmpfs_options: entry.tmpfs_opts.as_ref().map(|tmpfs| {
      MountTmpfsOptions {
        size_bytes: tmpfs.size,
        mode: tmpfs.mode.map(|mode| mode as i64),
        ..Default::default()
      }
    }),
    ..Default::default()
  }
}

fn propagation(
  value: &str,
) -> MountBindOptionsPropagationEnum {
  match value {
    "private" => MountBindOptionsPropagationEnum::PRIVATE,
    "rprivate" => MountBindOptionsPropagationEnum::RPRIVATE,
    "shared" => MountBindOptionsPropagationEnum::SHARED,
    "rshared" => MountBindOptionsPropagationEnum::RSHARED,
    "slave" => MountBindOptionsPropagationEnum::SLAVE,
    "rslave" => MountBindOptionsPropagationEnum::RSLAVE,
    _ => MountBindOptionsPropagationEnum::EMPTY,
  }
}

/// File-backed secrets and configs become read-only binds into
/// their canonical directories. Inline payloads (content or
/// environment) return `None` here and are copied into the
/// container after create instead.
fn file_object_bind(
  project: &Project,
  reference: &FileReference,
  declaration: Option<&FileObject>,
  kind: ResourceKind,
) -> anyhow::Result<Option<String>> {
  let declaration = declaration.ok_or_else(|| {
    Error::NotFound {
      kind,
      name: reference.source.clone(),
    }
  })?;
  validate_file_object(declaration, kind)?;
  let Some(file) = &declaration.file else {
    return Ok(None);
  };
  let source = absolute_source(project, file);
  let target = file_target(reference, kind);
  Ok(Some(format!("{source}:{target}:ro")))
}

pub fn validate_file_object(
  declaration: &FileObject,
  kind: ResourceKind,
) -> anyhow::Result<()> {
  if declaration.external {
    return Err(Error::UnsupportedExternal {
      kind,
      name: declaration.name.clone(),
    }
    .into());
  }
  if declaration.driver.is_some() {
    return Err(Error::UnsupportedField {
      kind,
      name: declaration.name.clone(),
      field: "driver".to_string(),
    }
    .into());
  }
  if declaration.template_driver.is_some() {
    return Err(Error::UnsupportedField {
      kind,
      name: declaration.name.clone(),
      field: "template_driver".to_string(),
    }
    .into());
  }
  Ok(())
}

/// Target path inside the container for a secret/config
/// reference.
pub fn file_target(
  reference: &FileReference,
  kind: ResourceKind,
) -> String {
  match &reference.target {
    Some(target) if target.starts_with('/') => target.clone(),
    Some(target) if kind == ResourceKind::Secret => {
      format!("{SECRETS_DIR}/{target}")
    }
    Some(target) => format!("/{target}"),
    None if kind == ResourceKind::Secret => {
      format!("{SECRETS_DIR}/{}", reference.source)
    }
    None => format!("/{}", reference.source),
  }
}

fn absolute_source(project: &Project, source: &str) -> String {
  if source.starts_with('/') || source.contains(':') {
    // Already absolute, or a Windows drive / npipe path.
    return source.to_string();
  }
  let source =
    source.strip_prefix("./").unwrap_or(source);
  format!(
    "{}/{source}",
    project.working_dir.trim_end_matches('/')
  )
}

#[cfg(test)]
mod tests {
  use caravel_model::BindOptions;
  use pretty_assertions::assert_eq;

  use super::*;

  fn project() -> Project {
    Project {
      name: "app".to_string(),
      working_dir: "/srv/app".to_string(),
      ..Default::default()
    }
  }

  #[test]
  fn plain_bind_goes_to_binds_list() {
    let mut service = Service::default();
    service.volumes.push(VolumeMount {
      kind: MountKind::Bind,
      source: Some("./data".to_string()),
      target: "/data".to_string(),
      read_only: true,
      ..Default::default()
    });
    let set = build_mounts(&project(), &service).unwrap();
    assert_eq!(set.binds, vec!["/srv/app/data:/data:ro"]);
    assert!(set.mounts.is_empty());
  }

  #[test]
  fn propagation_requires_structured_mount() {
    let mut service = Service::default();
    service.volumes.push(VolumeMount {
      kind: MountKind::Bind,
      source: Some("/host".to_string()),
      target: "/data".to_string(),
      bind: Some(BindOptions {
        propagation: Some("rshared".to_string()),
        ..Default::default()
      }),
      ..Default::default()
    });
    let set = build_mounts(&project(), &service).unwrap();
    assert!(set.binds.is_empty());
    assert_eq!(set.mounts.len(), 1);
    assert_eq!(
      set.mounts[0].typ,
      Some(MountTypeEnum::BIND)
    );
  }

  #[test]
  fn named_volumes_use_structured_mounts() {
    let mut service = Service::default();
    service.volumes.push(VolumeMount {
      kind: MountKind::Volume,
      source: Some("data".to_string()),
      target: "/var/lib/data".to_string(),
      ..Default::default()
    });
    let set = build_mounts(&project(), &service).unwrap();
    assert!(set.binds.is_empty());
    assert_eq!(
      set.mounts[0].source.as_deref(),
      Some("data")
    );
  }

  #[test]
  fn file_secret_becomes_readonly_bind() {
    let mut project = project();
    project.secrets.insert(
      "api_key".to_string(),
      FileObject {
        name: "api_key".to_string(),
        file: Some("./secrets/key.txt".to_string()),
        ..Default::default()
      },
    );
    let mut service = Service::default();
    service.secrets.push(FileReference {
      source: "api_key".to_string(),
      ..Default::default()
    });
    let set = build_mounts(&project, &service).unwrap();
    assert_eq!(set.binds, vec![
      "/srv/app/secrets/key.txt:/run/secrets/api_key:ro"
    ]);
  }

  #[test]
  fn inline_secret_is_not_a_mount() {
    let mut project = project();
    project.secrets.insert(
      "token".to_string(),
      FileObject {
        name: "token".to_string(),
        content: Some("hunter2".to_string()),
        ..Default::default()
      },
    );
    let mut service = Service::default();
    service.secrets.push(FileReference {
      source: "token".to_string(),
      ..Default::default()
    });
    let set = build_mounts(&project, &service).unwrap();
    assert!(set.binds.is_empty());
    assert!(set.mounts.is_empty());
  }

  #[test]
  fn external_secret_is_rejected() {
    let mut project = project();
    project.secrets.insert(
      "vault".to_string(),
      FileObject {
        name: "vault".to_string(),
        external: true,
        ..Default::default()
      },
    );
    let mut service = Service::default();
    service.secrets.push(FileReference {
      source: "vault".to_string(),
      ..Default::default()
    });
    let err =
      build_mounts(&project, &service).unwrap_err();
    assert!(matches!(
      caravel_model::error_kind(&err),
      Some(Error::UnsupportedExternal { .. })
    ));
  }
}
