//! Packaging and sideloading as the DAP bridge sees them.

use std::path::{Path, PathBuf};

use anyhow::Context;
use roku_dap::LaunchSupport;

use crate::installer::AppInstallerClient;

/// Launch support backed by the installer client and a prebuilt channel
/// archive. Directory zipping is left to the project's own build
/// tooling: `package` hands the bridge an archive that already exists:
/// either one named explicitly on the command line, or the newest
/// `.zip` in the launch request's output folder.
pub struct PrebuiltChannelSupport {
    archive_override: Option<PathBuf>,
}

impl PrebuiltChannelSupport {
    pub fn new(archive_override: Option<PathBuf>) -> Self {
        Self { archive_override }
    }

    fn newest_zip(out_dir: &Path) -> Option<PathBuf> {
        let mut newest: Option<(std::time::SystemTime, PathBuf)> = None;
        for entry in std::fs::read_dir(out_dir).ok()?.flatten() {
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext.eq_ignore_ascii_case("zip")) {
                let Ok(modified) = entry.metadata().and_then(|m| m.modified()) else { continue };
                if newest.as_ref().is_none_or(|(when, _)| modified > *when) {
                    newest = Some((modified, path));
                }
            }
        }
        newest.map(|(_, path)| path)
    }
}

impl LaunchSupport for PrebuiltChannelSupport {
    fn package(&self, _project_root: &Path, out_dir: &Path) -> anyhow::Result<PathBuf> {
        if let Some(archive) = &self.archive_override {
            anyhow::ensure!(archive.is_file(), "channel archive not found: {}", archive.display());
            return Ok(archive.clone());
        }
        Self::newest_zip(out_dir).with_context(|| {
            format!(
                "no channel archive in {}; build one or pass --channel",
                out_dir.display()
            )
        })
    }

    fn remove_installed(&self, device_ip: &str, password: &str) -> anyhow::Result<()> {
        AppInstallerClient::new(device_ip, password).remove()
    }

    fn install(
        &self,
        device_ip: &str,
        password: &str,
        archive: &Path,
        remote_debug: bool,
    ) -> anyhow::Result<()> {
        AppInstallerClient::new(device_ip, password).install(archive, remote_debug)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explicit_archive_wins() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("my.zip");
        std::fs::write(&archive, b"zip").unwrap();
        let support = PrebuiltChannelSupport::new(Some(archive.clone()));
        let found = support.package(dir.path(), dir.path()).unwrap();
        assert_eq!(found, archive);
    }

    #[test]
    fn missing_explicit_archive_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let support = PrebuiltChannelSupport::new(Some(dir.path().join("absent.zip")));
        assert!(support.package(dir.path(), dir.path()).is_err());
    }

    #[test]
    fn newest_zip_in_out_dir_is_picked() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("old.zip"), b"a").unwrap();
        std::thread::sleep(std::time::Duration::from_millis(20));
        std::fs::write(dir.path().join("new.zip"), b"b").unwrap();
        std::fs::write(dir.path().join("notes.txt"), b"c").unwrap();

        let support = PrebuiltChannelSupport::new(None);
        let found = support.package(dir.path(), dir.path()).unwrap();
        assert_eq!(found.file_name().unwrap(), "new.zip");
    }

    #[test]
    fn empty_out_dir_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let support = PrebuiltChannelSupport::new(None);
        assert!(support.package(dir.path(), dir.path()).is_err());
    }
}
