//! Ownership label schema. The keys are consumed by other
//! tooling and must not change.

pub const PROJECT: &str = "com.docker.compose.project";
pub const SERVICE: &str = "com.docker.compose.service";
pub const CONFIG_HASH: &str = "com.docker.compose.config-hash";
pub const CONTAINER_NUMBER: &str =
  "com.docker.compose.container-number";
pub const ONE_OFF: &str = "com.docker.compose.oneoff";
pub const VERSION: &str = "com.docker.compose.version";
pub const DEPENDENCIES: &str = "com.docker.compose.depends_on";
pub const IMAGE_DIGEST: &str = "com.docker.compose.image";
pub const CONTAINER_REPLACE: &str =
  "com.docker.compose.container-replace";
pub const SLUG: &str = "com.docker.compose.slug";
pub const WORKING_DIR: &str = "com.docker.compose.working-dir";
pub const CONFIG_FILES: &str = "com.docker.compose.config-files";
pub const NETWORK: &str = "com.docker.compose.network";
pub const VOLUME: &str = "com.docker.compose.volume";

/// Dialect marker written to the version label.
pub const VERSION_MARKER: &str = "2.0";
