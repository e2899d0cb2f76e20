//! Immutable snapshot of which artifacts exist under the pipeline root.
//!
//! There is no database: the file system is the ledger, and the catalog is
//! a point-in-time index of it. A catalog is never mutated in place;
//! refreshing means a new [`Catalog::scan`], and the coordinator replaces
//! its snapshot wholesale so readers never see a torn view.

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use tracing::debug;

use crate::codec::{decode_any, CAMA_FLOOD_DIR};
use crate::ident::{ArtifactId, ArtifactKind};
use crate::manifest::RunManifest;

/// One observed artifact: identity plus last-observed file metadata.
#[derive(Debug, Clone)]
pub struct CatalogEntry {
    pub id: ArtifactId,
    pub size: u64,
    pub modified: Option<SystemTime>,
}

/// Point-in-time index of the artifact tree.
#[derive(Debug, Default)]
pub struct Catalog {
    root: PathBuf,
    entries: HashMap<ArtifactId, CatalogEntry>,
    unrecognized: Vec<PathBuf>,
}

impl Catalog {
    /// Walk the tree under `root` once, decoding every regular file against
    /// every kind's template.
    ///
    /// Files that decode under no kind are recorded as unrecognized and
    /// logged; they are never deleted or otherwise touched. The routing
    /// model installation (`CaMa-Flood/`) and the run manifest are skipped,
    /// as are dotfiles. A missing root yields an empty catalog.
    pub fn scan(root: &Path) -> io::Result<Catalog> {
        let mut catalog = Catalog {
            root: root.to_path_buf(),
            entries: HashMap::new(),
            unrecognized: Vec::new(),
        };
        if root.is_dir() {
            catalog.walk(root)?;
        }
        debug!(
            root = %root.display(),
            artifacts = catalog.entries.len(),
            unrecognized = catalog.unrecognized.len(),
            "catalog scan complete"
        );
        Ok(catalog)
    }

    fn walk(&mut self, dir: &Path) -> io::Result<()> {
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            let path = entry.path();
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if name.starts_with('.') {
                continue;
            }
            let file_type = entry.file_type()?;
            if file_type.is_dir() {
                if path.parent() == Some(self.root.as_path()) && name == CAMA_FLOOD_DIR {
                    continue;
                }
                self.walk(&path)?;
            } else if file_type.is_file() {
                if path.parent() == Some(self.root.as_path()) && name == RunManifest::FILE_NAME {
                    continue;
                }
                self.record(&path)?;
            }
        }
        Ok(())
    }

    fn record(&mut self, path: &Path) -> io::Result<()> {
        let rel = path
            .strip_prefix(&self.root)
            .expect("walked path is under root")
            .to_path_buf();
        match decode_any(&rel) {
            Some(id) => {
                let meta = fs::metadata(path)?;
                self.entries.insert(
                    id.clone(),
                    CatalogEntry {
                        id,
                        size: meta.len(),
                        modified: meta.modified().ok(),
                    },
                );
            }
            None => {
                debug!(path = %rel.display(), "unrecognized file in artifact tree");
                self.unrecognized.push(rel);
            }
        }
        Ok(())
    }

    /// Root this snapshot was taken from.
    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn lookup(&self, id: &ArtifactId) -> Option<&CatalogEntry> {
        self.entries.get(id)
    }

    pub fn contains(&self, id: &ArtifactId) -> bool {
        self.entries.contains_key(id)
    }

    /// Whether every identifier in the set exists in this snapshot.
    pub fn exists_all<'a, I>(&self, ids: I) -> bool
    where
        I: IntoIterator<Item = &'a ArtifactId>,
    {
        ids.into_iter().all(|id| self.contains(id))
    }

    /// The subset of `ids` absent from this snapshot, in input order.
    pub fn missing(&self, ids: &[ArtifactId]) -> Vec<ArtifactId> {
        ids.iter().filter(|id| !self.contains(id)).cloned().collect()
    }

    /// All identifiers of one kind in this snapshot.
    pub fn ids_of_kind(&self, kind: ArtifactKind) -> impl Iterator<Item = &ArtifactId> {
        self.entries.keys().filter(move |id| id.kind() == kind)
    }

    /// Files that decoded under no template, relative to the root.
    pub fn unrecognized(&self) -> &[PathBuf] {
        &self.unrecognized
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::encode;

    fn touch(root: &Path, rel: &str) {
        let path = root.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, b"x").unwrap();
    }

    #[test]
    fn test_scan_indexes_known_artifacts() {
        let dir = tempfile::tempdir().unwrap();
        let id = ArtifactId::cama_output("M1", "ssp245", "r1", 0, "fldfrc", 2015).unwrap();
        touch(dir.path(), encode(&id).to_str().unwrap());

        let catalog = Catalog::scan(dir.path()).unwrap();
        assert_eq!(catalog.len(), 1);
        assert!(catalog.contains(&id));
        let entry = catalog.lookup(&id).unwrap();
        assert_eq!(entry.size, 1);
    }

    #[test]
    fn test_scan_records_unrecognized_without_touching() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), "cama_outputs/garbage.txt");

        let catalog = Catalog::scan(dir.path()).unwrap();
        assert!(catalog.is_empty());
        assert_eq!(catalog.unrecognized().len(), 1);
        assert!(dir.path().join("cama_outputs/garbage.txt").exists());
    }

    #[test]
    fn test_scan_skips_cama_flood_installation_and_manifest() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), "CaMa-Flood/gosh/template.sh");
        touch(dir.path(), "manifest.json");

        let catalog = Catalog::scan(dir.path()).unwrap();
        assert!(catalog.is_empty());
        assert!(catalog.unrecognized().is_empty());
    }

    #[test]
    fn test_missing_root_is_empty_catalog() {
        let dir = tempfile::tempdir().unwrap();
        let catalog = Catalog::scan(&dir.path().join("does-not-exist")).unwrap();
        assert!(catalog.is_empty());
    }

    #[test]
    fn test_exists_all_and_missing() {
        let dir = tempfile::tempdir().unwrap();
        let present = ArtifactId::raw_result("ssp245", "fldfrc", "M1", "r1").unwrap();
        let absent = ArtifactId::raw_result("ssp245", "fldfrc", "M2", "r1").unwrap();
        touch(dir.path(), encode(&present).to_str().unwrap());

        let catalog = Catalog::scan(dir.path()).unwrap();
        assert!(catalog.exists_all([&present]));
        assert!(!catalog.exists_all([&present, &absent]));
        assert_eq!(
            catalog.missing(&[present.clone(), absent.clone()]),
            vec![absent]
        );
    }
}
