//! Filesystem artifact backend.
//!
//! Artifacts live flat under one directory as `<uuid>-<name>`.

use std::fs;
use std::path::{Path, PathBuf};

use log::debug;
use uuid::Uuid;

use super::{sanitize_name, ArtifactError, ArtifactStore, FileRef};

/// Stores artifacts as plain files under a root directory.
#[derive(Debug, Clone)]
pub struct FsArtifactStore {
    root: PathBuf,
}

impl FsArtifactStore {
    /// Opens (and creates if needed) an artifact directory.
    pub fn new(root: impl AsRef<Path>) -> Result<Self, ArtifactError> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn allocate(&self, name: &str) -> Result<(FileRef, PathBuf), ArtifactError> {
        let id = Uuid::new_v4().simple().to_string();
        let file = FileRef::parse(&format!("{}-{}", &id[..12], sanitize_name(name)))?;
        let path = self.root.join(file.as_str());
        Ok((file, path))
    }
}

impl ArtifactStore for FsArtifactStore {
    fn put(&self, name: &str, bytes: &[u8]) -> Result<FileRef, ArtifactError> {
        let (file, path) = self.allocate(name)?;
        fs::write(&path, bytes)?;
        debug!("Stored artifact {} ({} bytes)", file, bytes.len());
        Ok(file)
    }

    fn reserve(&self, name: &str) -> Result<(FileRef, PathBuf), ArtifactError> {
        let (file, path) = self.allocate(name)?;
        fs::File::create(&path)?;
        Ok((file, path))
    }

    fn path(&self, file: &FileRef) -> Result<PathBuf, ArtifactError> {
        let path = self.root.join(file.as_str());
        if path.is_file() {
            Ok(path)
        } else {
            Err(ArtifactError::NotFound(file.to_string()))
        }
    }

    fn open(&self, file: &FileRef) -> Result<fs::File, ArtifactError> {
        let path = self.path(file)?;
        Ok(fs::File::open(path)?)
    }

    fn delete(&self, file: &FileRef) -> Result<(), ArtifactError> {
        let path = self.root.join(file.as_str());
        match fs::remove_file(&path) {
            Ok(()) => {
                debug!("Deleted artifact {}", file);
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn exists(&self, file: &FileRef) -> bool {
        self.root.join(file.as_str()).is_file()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use tempfile::tempdir;

    #[test]
    fn test_put_and_open() {
        let dir = tempdir().unwrap();
        let store = FsArtifactStore::new(dir.path()).unwrap();

        let file = store.put("targets.txt", b"2001:db8::1\n").unwrap();
        assert!(file.as_str().ends_with("-targets.txt"));
        assert!(store.exists(&file));

        let mut content = String::new();
        store.open(&file).unwrap().read_to_string(&mut content).unwrap();
        assert_eq!(content, "2001:db8::1\n");
    }

    #[test]
    fn test_reserve_creates_empty_file() {
        let dir = tempdir().unwrap();
        let store = FsArtifactStore::new(dir.path()).unwrap();

        let (file, path) = store.reserve("result.json").unwrap();
        assert!(path.exists());
        assert_eq!(fs::metadata(&path).unwrap().len(), 0);
        assert_eq!(store.path(&file).unwrap(), path);
    }

    #[test]
    fn test_delete_is_idempotent() {
        let dir = tempdir().unwrap();
        let store = FsArtifactStore::new(dir.path()).unwrap();

        let file = store.put("x", b"1").unwrap();
        store.delete(&file).unwrap();
        store.delete(&file).unwrap();
        assert!(!store.exists(&file));
    }

    #[test]
    fn test_missing_artifact() {
        let dir = tempdir().unwrap();
        let store = FsArtifactStore::new(dir.path()).unwrap();
        let file = FileRef::parse("deadbeef-none.txt").unwrap();

        assert!(matches!(store.open(&file), Err(ArtifactError::NotFound(_))));
    }
}
