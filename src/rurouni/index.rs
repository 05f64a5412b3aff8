//! The symlink/discovery layer: for every metric, a symlink at
//! `<link_dir>/<instance>/<dotted.metric>.hs` pointing at the bundle file
//! that holds it. Purely for external tooling to find a metric's bundle by
//! name; the engine never reads through it.
//!
//! Spec'd as an external collaborator (filesystem layout is someone else's
//! concern) but named as its own module with a concrete format, so it's
//! implemented here behind a [`LinkManager`] trait — the cache can be
//! exercised in tests with a fake that never touches a real filesystem.

use std::fs;
use std::path::{Path, PathBuf};

use crate::rurouni::error::Result;

/// Abstracts the symlink tree so `MetricCache` doesn't need a real
/// filesystem under test.
pub trait LinkManager: Send + Sync {
    fn link(&self, instance: &str, metric: &str, bundle_path: &Path) -> Result<()>;
}

/// Real symlink manager: `<link_dir>/<instance>/<dotted.metric>.hs`,
/// replacing any existing link with a `.bak` rename first (so a crash
/// mid-relink leaves the old link recoverable rather than missing).
pub struct FsLinkManager {
    link_dir: PathBuf,
}

impl FsLinkManager {
    pub fn new(link_dir: PathBuf) -> FsLinkManager {
        FsLinkManager { link_dir }
    }

    fn link_path(&self, instance: &str, metric: &str) -> PathBuf {
        self.link_dir.join(instance).join(format!("{}.hs", metric))
    }
}

impl LinkManager for FsLinkManager {
    fn link(&self, instance: &str, metric: &str, bundle_path: &Path) -> Result<()> {
        let link_path = self.link_path(instance, metric);
        if let Some(parent) = link_path.parent() {
            fs::create_dir_all(parent)?;
        }
        if link_path.symlink_metadata().is_ok() {
            let backup = link_path.with_extension("hs.bak");
            fs::rename(&link_path, &backup)?;
        }
        #[cfg(unix)]
        std::os::unix::fs::symlink(bundle_path, &link_path)?;
        #[cfg(not(unix))]
        fs::copy(bundle_path, &link_path).map(|_| ())?;
        Ok(())
    }
}

/// No-op manager for environments (and most tests) that don't care about
/// the discovery tree.
pub struct NullLinkManager;

impl LinkManager for NullLinkManager {
    fn link(&self, _instance: &str, _metric: &str, _bundle_path: &Path) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relinking_backs_up_the_old_link() {
        let dir = tempfile::tempdir().unwrap();
        let bundle_a = dir.path().join("a.hs");
        let bundle_b = dir.path().join("b.hs");
        fs::write(&bundle_a, b"a").unwrap();
        fs::write(&bundle_b, b"b").unwrap();

        let manager = FsLinkManager::new(dir.path().join("links"));
        manager.link("x", "metric.one", &bundle_a).unwrap();
        manager.link("x", "metric.one", &bundle_b).unwrap();

        let link_path = dir.path().join("links/x/metric.one.hs");
        assert!(link_path.symlink_metadata().unwrap().file_type().is_symlink());
        assert!(dir.path().join("links/x/metric.one.hs.bak").exists());
    }
}
