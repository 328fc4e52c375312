//! Post-create injection of inline secrets and configs. Inline
//! payloads (declared `content` or sourced from an environment
//! variable) have no host file to bind mount, so they are
//! packed into an in-memory tar archive and copied into the
//! container over the engine's archive endpoint before start.

use anyhow::Context;
use bollard::query_parameters::UploadToContainerOptions;
use bytes::Bytes;
use caravel_model::{
  Error, FileObject, FileReference, Project, ResourceKind,
  Service,
};

use crate::docker::EngineClient;

use super::mounts::{file_target, validate_file_object};

const SECRET_MODE: u32 = 0o400;
const CONFIG_MODE: u32 = 0o444;

pub async fn inject_file_objects(
  engine: &EngineClient,
  project: &Project,
  service: &Service,
  container_id: &str,
) -> anyhow::Result<()> {
  for reference in &service.secrets {
    inject(
      engine,
      project,
      reference,
      project.secrets.get(&reference.source),
      ResourceKind::Secret,
      container_id,
    )
    .await?;
  }
  for reference in &service.configs {
    inject(
      engine,
      project,
      reference,
      project.configs.get(&reference.source),
      ResourceKind::Config,
      container_id,
    )
    .await?;
  }
  Ok(())
}

async fn inject(
  engine: &EngineClient,
  project: &Project,
  reference: &FileReference,
  declaration: Option<&FileObject>,
  kind: ResourceKind,
  container_id: &str,
) -> anyhow::Result<()> {
  let declaration = declaration.ok_or_else(|| {
    Error::NotFound {
      kind,
      name: reference.source.clone(),
    }
  })?;
  validate_file_object(declaration, kind)?;
  let Some(payload) = payload(project, declaration, kind)?
  else {
    // File-backed declarations were bind mounted at create.
    return Ok(());
  };

  let archive = build_archive(
    &file_target(reference, kind),
    reference.mode.unwrap_or(match kind {
      ResourceKind::Secret => SECRET_MODE,
      _ => CONFIG_MODE,
    }),
    parse_id(reference.uid.as_deref())?,
    parse_id(reference.gid.as_deref())?,
    payload.as_bytes(),
  )?;

  engine
    .docker()
    .upload_to_container(
      container_id,
      Some(UploadToContainerOptions {
        path: "/".to_string(),
        ..Default::default()
      }),
      bollard::body_full(Bytes::from(archive)),
    )
    .await
    .with_context(|| {
      format!(
        "Failed to copy {kind} {} into container \
         {container_id}",
        reference.source
      )
    })
}

/// Inline payload of a declaration, or `None` when it is
/// file-backed.
fn payload(
  project: &Project,
  declaration: &FileObject,
  kind: ResourceKind,
) -> anyhow::Result<Option<String>> {
  if let Some(variable) = &declaration.environment {
    let value =
      project.env_var(variable).ok_or_else(|| {
        Error::NotFound {
          kind,
          name: format!(
            "{} (environment variable {variable} \
             is not set)",
            declaration.name
          ),
        }
      })?;
    return Ok(Some(value.to_string()));
  }
  Ok(declaration.content.clone())
}

/// Single-entry tar archive addressed from the container root.
fn build_archive(
  target: &str,
  mode: u32,
  uid: u64,
  gid: u64,
  data: &[u8],
) -> anyhow::Result<Vec<u8>> {
  let mut builder = tar::Builder::new(Vec::new());
  let mut header = tar::Header::new_gnu();
  header.set_size(data.len() as u64);
  header.set_mode(mode);
  header.set_uid(uid);
  header.set_gid(gid);
  header.set_mtime(0);
  builder
    .append_data(
      &mut header,
      target.trim_start_matches('/'),
      data,
    )
    .context("Failed to append tar entry")?;
  builder
    .into_inner()
    .context("Failed to finish tar archive")
}

fn parse_id(id: Option<&str>) -> anyhow::Result<u64> {
  match id {
    None => Ok(0),
    Some(id) => id.parse().with_context(|| {
      format!("Invalid file owner id {id}")
    }),
  }
}

#[cfg(test)]
mod tests {
  use pretty_assertions::assert_eq;

  use super::*;

  #[test]
  fn archive_carries_mode_owner_and_payload() {
    let archive = build_archive(
      "/run/secrets/token",
      0o400,
      0,
      0,
      b"hunter2",
    )
    .unwrap();

    let mut reader =
      tar::Archive::new(archive.as_slice());
    let mut entries = reader.entries().unwrap();
    let entry = entries.next().unwrap().unwrap();
    let header = entry.header();
    assert_eq!(
      header.path().unwrap().to_str().unwrap(),
      "run/secrets/token"
    );
    assert_eq!(header.mode().unwrap(), 0o400);
    assert_eq!(header.uid().unwrap(), 0);
    assert_eq!(entry.size(), 7);
    assert!(entries.next().is_none());
  }

  #[test]
  fn environment_payload_resolves_from_project() {
    let mut project = Project::default();
    project.environment.insert(
      "TOKEN".to_string(),
      "hunter2".to_string(),
    );
    let declaration = FileObject {
      name: "token".to_string(),
      environment: Some("TOKEN".to_string()),
      ..Default::default()
    };
    let payload =
      payload(&project, &declaration, ResourceKind::Secret)
        .unwrap();
    assert_eq!(payload.as_deref(), Some("hunter2"));
  }

  #[test]
  fn missing_environment_variable_fails() {
    let declaration = FileObject {
      name: "token".to_string(),
      environment: Some("MISSING".to_string()),
      ..Default::default()
    };
    let err = payload(
      &Project::default(),
      &declaration,
      ResourceKind::Secret,
    )
    .unwrap_err();
    assert!(matches!(
      caravel_model::error_kind(&err),
      Some(Error::NotFound { .. })
    ));
  }
}
