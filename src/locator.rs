//! Finds the bundled proxy-core executable and its data assets.
//!
//! Packaging differs between development runs, installers and app bundles, so
//! several resource roots are probed in a fixed order. Nothing is cached: the
//! filesystem is checked on every call.

use std::path::{Path, PathBuf};

use crate::error::LocateError;

#[cfg(windows)]
pub const CORE_BINARY_NAME: &str = "EdNovas-Core.exe";
#[cfg(not(windows))]
pub const CORE_BINARY_NAME: &str = "EdNovas-Core";

/// Data files the core wants next to its config. Optional.
pub const GEO_FILES: &[&str] = &["geoip.metadb", "geosite.dat"];

#[derive(Debug, Clone)]
pub struct Locator {
    roots: Vec<PathBuf>,
}

impl Locator {
    /// Candidate resource roots for the running process, most specific
    /// first, with `extra` (user override) ahead of all of them.
    pub fn for_current_process(extra: Option<PathBuf>) -> Self {
        let cwd = std::env::current_dir().ok();
        let exe_dir = std::env::current_exe()
            .ok()
            .and_then(|p| p.parent().map(Path::to_path_buf));
        Self::with_layout(extra, cwd.as_deref(), exe_dir.as_deref())
    }

    fn with_layout(extra: Option<PathBuf>, cwd: Option<&Path>, exe_dir: Option<&Path>) -> Self {
        let mut roots: Vec<PathBuf> = extra.into_iter().collect();
        if let Some(cwd) = cwd {
            roots.push(cwd.join("resources"));
        }
        if let Some(exe_dir) = exe_dir {
            // Installed next to the executable.
            roots.push(exe_dir.join("resources"));
            // macOS bundle: Contents/MacOS/<exe> -> Contents/Resources/resources
            roots.push(exe_dir.join("..").join("Resources").join("resources"));
            // Build tree: target/<profile>/<exe> -> <repo>/resources
            roots.push(exe_dir.join("..").join("..").join("resources"));
        }
        Self { roots }
    }

    /// Locator over an explicit list of roots.
    pub fn with_roots(roots: Vec<PathBuf>) -> Self {
        Self { roots }
    }

    pub fn roots(&self) -> &[PathBuf] {
        &self.roots
    }

    /// First `<root>/bin/EdNovas-Core` that exists as a file.
    pub fn locate_binary(&self) -> Result<PathBuf, LocateError> {
        let candidates: Vec<PathBuf> = self
            .roots
            .iter()
            .map(|root| root.join("bin").join(CORE_BINARY_NAME))
            .collect();
        for candidate in &candidates {
            if candidate.is_file() {
                tracing::debug!("proxy core binary at {}", candidate.display());
                return Ok(candidate.clone());
            }
        }
        Err(LocateError::NotFound {
            name: CORE_BINARY_NAME.to_string(),
            searched: candidates,
        })
    }

    /// First `<root>/<name>` that exists.
    pub fn locate_asset(&self, name: &str) -> Option<PathBuf> {
        self.roots
            .iter()
            .map(|root| root.join(name))
            .find(|p| p.exists())
    }

    /// Copy the geo databases into `dest` unless already present.
    ///
    /// Returns the names that were copied. Missing sources are skipped.
    pub fn seed_geo_files(&self, dest: &Path) -> std::io::Result<Vec<String>> {
        std::fs::create_dir_all(dest)?;
        let mut copied = Vec::new();
        for name in GEO_FILES {
            let target = dest.join(name);
            if target.exists() {
                continue;
            }
            match self.locate_asset(name) {
                Some(source) => {
                    std::fs::copy(&source, &target)?;
                    tracing::info!("seeded {name} from {}", source.display());
                    copied.push((*name).to_string());
                }
                None => tracing::debug!("no bundled {name}; the core will download it"),
            }
        }
        Ok(copied)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn touch(path: &Path) {
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, b"x").unwrap();
    }

    #[test]
    fn first_existing_root_wins() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a");
        let b = dir.path().join("b");
        let c = dir.path().join("c");
        touch(&b.join("bin").join(CORE_BINARY_NAME));
        touch(&c.join("bin").join(CORE_BINARY_NAME));

        let locator = Locator::with_roots(vec![a, b.clone(), c]);
        assert_eq!(
            locator.locate_binary().unwrap(),
            b.join("bin").join(CORE_BINARY_NAME)
        );
    }

    #[test]
    fn not_found_reports_all_candidates() {
        let dir = tempfile::tempdir().unwrap();
        let locator = Locator::with_roots(vec![dir.path().join("x"), dir.path().join("y")]);
        match locator.locate_binary().unwrap_err() {
            LocateError::NotFound { searched, .. } => assert_eq!(searched.len(), 2),
        }
    }

    #[test]
    fn no_caching_between_calls() {
        let dir = tempfile::tempdir().unwrap();
        let locator = Locator::with_roots(vec![dir.path().to_path_buf()]);
        assert!(locator.locate_binary().is_err());
        touch(&dir.path().join("bin").join(CORE_BINARY_NAME));
        assert!(locator.locate_binary().is_ok());
    }

    #[test]
    fn directories_are_not_binaries() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("bin").join(CORE_BINARY_NAME)).unwrap();
        let locator = Locator::with_roots(vec![dir.path().to_path_buf()]);
        assert!(locator.locate_binary().is_err());
    }

    #[test]
    fn layout_order() {
        let locator = Locator::with_layout(
            Some(PathBuf::from("/override")),
            Some(Path::new("/work")),
            Some(Path::new("/opt/app")),
        );
        let roots: Vec<_> = locator.roots().iter().map(|p| p.to_path_buf()).collect();
        assert_eq!(roots[0], PathBuf::from("/override"));
        assert_eq!(roots[1], PathBuf::from("/work/resources"));
        assert_eq!(roots[2], PathBuf::from("/opt/app/resources"));
        assert_eq!(roots.len(), 5);
    }

    #[test]
    fn geo_seeding_skips_existing_and_missing() {
        let dir = tempfile::tempdir().unwrap();
        let res = dir.path().join("resources");
        touch(&res.join("geoip.metadb"));
        touch(&res.join("geosite.dat"));
        let dest = dir.path().join("core");
        std::fs::create_dir_all(&dest).unwrap();
        std::fs::write(dest.join("geosite.dat"), b"newer").unwrap();

        let locator = Locator::with_roots(vec![res]);
        let copied = locator.seed_geo_files(&dest).unwrap();
        assert_eq!(copied, ["geoip.metadb"]);
        assert_eq!(std::fs::read(dest.join("geosite.dat")).unwrap(), b"newer");

        let empty = Locator::with_roots(vec![dir.path().join("nothing")]);
        assert!(empty.seed_geo_files(&dir.path().join("other")).unwrap().is_empty());
    }
}
