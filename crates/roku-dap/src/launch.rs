//! Collaborators of the launch path.
//!
//! Packaging a project directory into a channel archive and sideloading
//! it over the installer's HTTP interface are external concerns; the
//! bridge drives them through [`LaunchSupport`] so front-ends (and
//! tests) can supply their own implementations.

use std::path::{Path, PathBuf};

/// Packaging and sideloading operations the launch request depends on.
pub trait LaunchSupport: Send + Sync {
    /// Produce the channel archive for a project, returning its path.
    fn package(&self, project_root: &Path, out_dir: &Path) -> anyhow::Result<PathBuf>;

    /// Remove the currently sideloaded channel, if any.
    fn remove_installed(&self, device_ip: &str, password: &str) -> anyhow::Result<()>;

    /// Sideload the archive; `remote_debug` asks the device to open its
    /// debug control port.
    fn install(
        &self,
        device_ip: &str,
        password: &str,
        archive: &Path,
        remote_debug: bool,
    ) -> anyhow::Result<()>;
}
