//! Result store backed by a local directory

use std::io::Write;
use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use walkdir::WalkDir;

use super::ResultStore;
use crate::error::{Result, TurbineError};

/// Directory under the root holding writes in progress
const STAGING_DIR: &str = ".staging";

/// Objects stored as files under a root directory
#[derive(Debug, Clone)]
pub struct LocalStore {
    root: PathBuf,
}

impl LocalStore {
    /// Create a store rooted at `root`; the directory is created on first write
    pub fn new(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
        }
    }

    /// Root directory
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Map an object name to a file, refusing names that escape the root
    fn path_for(&self, name: &str) -> Result<PathBuf> {
        let relative = Path::new(name);
        let valid = !name.is_empty()
            && relative
                .components()
                .all(|c| matches!(c, Component::Normal(_)))
            && relative.components().next() != Some(Component::Normal(std::ffi::OsStr::new(STAGING_DIR)));
        if !valid {
            return Err(TurbineError::invalid_name(name, "object names must be relative paths"));
        }
        Ok(self.root.join(relative))
    }
}

#[async_trait]
impl ResultStore for LocalStore {
    async fn put(&self, name: &str, data: Vec<u8>, _content_type: &str) -> Result<()> {
        let path = self.path_for(name)?;
        let staging = self.root.join(STAGING_DIR);

        // readers never see a partial object: write aside, then rename
        tokio::task::spawn_blocking(move || -> Result<()> {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::create_dir_all(&staging)?;
            let mut file = tempfile::NamedTempFile::new_in(&staging)?;
            file.write_all(&data)?;
            file.persist(&path).map_err(|e| TurbineError::Io(e.error))?;
            Ok(())
        })
        .await
        .map_err(|e| TurbineError::Other(e.to_string()))?
    }

    async fn get(&self, name: &str) -> Result<Vec<u8>> {
        let path = self.path_for(name)?;
        match tokio::fs::read(&path).await {
            Ok(data) => Ok(data),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(TurbineError::NotFound(name.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn exists(&self, name: &str) -> Result<bool> {
        let path = self.path_for(name)?;
        Ok(tokio::fs::metadata(&path).await.map(|m| m.is_file()).unwrap_or(false))
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let root = self.root.clone();
        let prefix = prefix.to_string();

        tokio::task::spawn_blocking(move || -> Result<Vec<String>> {
            if !root.exists() {
                return Ok(Vec::new());
            }

            let mut names = Vec::new();
            let walker = WalkDir::new(&root)
                .into_iter()
                .filter_entry(|entry| !(entry.depth() == 1 && entry.file_name() == STAGING_DIR));
            for entry in walker {
                let entry = entry?;
                if !entry.file_type().is_file() {
                    continue;
                }
                let Ok(relative) = entry.path().strip_prefix(&root) else {
                    continue;
                };
                let name = relative
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy())
                    .collect::<Vec<_>>()
                    .join("/");
                if name.starts_with(&prefix) {
                    names.push(name);
                }
            }
            names.sort();
            Ok(names)
        })
        .await
        .map_err(|e| TurbineError::Other(e.to_string()))?
    }

    async fn delete(&self, name: &str) -> Result<()> {
        let path = self.path_for(name)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_put_get_list_delete() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::new(&dir.path().join("store"));

        assert!(store.list("").await.unwrap().is_empty());

        store.put("jobs/a/results/a-00000.json", b"{}".to_vec(), "application/json").await.unwrap();
        store.put("jobs/a/output/a-00000/stdout", b"hi".to_vec(), "text/plain").await.unwrap();
        store.put("jobs/b/manifest.json", b"{}".to_vec(), "application/json").await.unwrap();

        assert_eq!(store.get("jobs/a/output/a-00000/stdout").await.unwrap(), b"hi");
        assert!(store.exists("jobs/b/manifest.json").await.unwrap());
        assert!(!store.exists("jobs/b/other.json").await.unwrap());

        let listed = store.list("jobs/a/").await.unwrap();
        assert_eq!(
            listed,
            vec!["jobs/a/output/a-00000/stdout", "jobs/a/results/a-00000.json"]
        );

        store.delete("jobs/b/manifest.json").await.unwrap();
        store.delete("jobs/b/manifest.json").await.unwrap();
        assert!(matches!(
            store.get("jobs/b/manifest.json").await,
            Err(TurbineError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_rejects_escaping_names() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::new(dir.path());

        assert!(store.put("../evil", vec![], "text/plain").await.is_err());
        assert!(store.put("/etc/passwd", vec![], "text/plain").await.is_err());
        assert!(store.get("").await.is_err());
        assert!(store.put(".staging/x", vec![], "text/plain").await.is_err());
    }

    #[tokio::test]
    async fn test_any_extension_is_listed() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::new(dir.path());

        store.put("bundle/x.partial", b"p".to_vec(), "text/plain").await.unwrap();
        store.put("bundle/a.json", b"j".to_vec(), "application/json").await.unwrap();
        store.put("bundle/a.txt", b"t".to_vec(), "text/plain").await.unwrap();

        assert_eq!(
            store.list("bundle/").await.unwrap(),
            vec!["bundle/a.json", "bundle/a.txt", "bundle/x.partial"]
        );
        assert_eq!(store.get("bundle/a.json").await.unwrap(), b"j");
        assert_eq!(store.get("bundle/a.txt").await.unwrap(), b"t");
        assert_eq!(store.get("bundle/x.partial").await.unwrap(), b"p");
        assert_eq!(store.list("").await.unwrap().len(), 3);
    }
}
