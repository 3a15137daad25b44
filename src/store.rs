//! Object store interface and a filesystem-backed implementation.
//!
//! The engine only needs five operations, all blocking. Keys are
//! `/`-separated strings; listings are returned in lexicographic order
//! with strictly-greater-than `start_after` semantics, matching the
//! range-listing contract the partition key scheme is built on.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};

pub trait ObjectStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Vec<u8>>;

    fn put(&self, key: &str, data: &[u8]) -> Result<()>;

    /// Deleting an absent key succeeds.
    fn delete(&self, key: &str) -> Result<()>;

    fn delete_batch(&self, keys: &[String]) -> Result<()> {
        for key in keys {
            self.delete(key)?;
        }
        Ok(())
    }

    /// All keys beginning with `prefix` that sort strictly after
    /// `start_after`, ascending.
    fn list_after(&self, prefix: &str, start_after: &str) -> Result<Vec<String>>;
}

/// Store rooted at a local directory. `put` stages to a temp file and
/// renames, so a reader never observes a partially written object.
pub struct FsStore {
    root: PathBuf,
}

impl FsStore {
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)
            .with_context(|| format!("create store root {}", root.display()))?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn object_path(&self, key: &str) -> Result<PathBuf> {
        if key.is_empty() || key.starts_with('/') || key.split('/').any(|s| s == "..") {
            bail!("invalid object key {key:?}");
        }
        Ok(self.root.join(key))
    }
}

impl ObjectStore for FsStore {
    fn get(&self, key: &str) -> Result<Vec<u8>> {
        let path = self.object_path(key)?;
        fs::read(&path).with_context(|| format!("read object {key}"))
    }

    fn put(&self, key: &str, data: &[u8]) -> Result<()> {
        let path = self.object_path(key)?;
        let parent = path
            .parent()
            .with_context(|| format!("object key {key} has no parent"))?;
        fs::create_dir_all(parent).with_context(|| format!("create prefix for {key}"))?;

        let temp = path.with_extension(format!("tmp-{}", std::process::id()));
        let mut file = fs::File::create(&temp).with_context(|| format!("stage object {key}"))?;
        file.write_all(data)?;
        file.sync_all()?;
        fs::rename(&temp, &path).with_context(|| format!("publish object {key}"))?;
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<()> {
        let path = self.object_path(key)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err).with_context(|| format!("delete object {key}")),
        }
    }

    fn list_after(&self, prefix: &str, start_after: &str) -> Result<Vec<String>> {
        // Walk from the deepest directory implied by the prefix.
        let dir_part = prefix.rsplit_once('/').map(|(dir, _)| dir).unwrap_or("");
        let start_dir = if dir_part.is_empty() {
            self.root.clone()
        } else {
            self.root.join(dir_part)
        };

        let mut keys = Vec::new();
        if start_dir.is_dir() {
            walk(&start_dir, &mut |path| {
                let relative = path.strip_prefix(&self.root).expect("path under root");
                let key = relative
                    .iter()
                    .map(|part| part.to_string_lossy())
                    .collect::<Vec<_>>()
                    .join("/");
                if key.starts_with(prefix) && key.as_str() > start_after {
                    keys.push(key);
                }
            })?;
        }
        keys.sort();
        Ok(keys)
    }
}

fn walk(dir: &Path, visit: &mut impl FnMut(&Path)) -> Result<()> {
    for entry in fs::read_dir(dir).with_context(|| format!("list {}", dir.display()))? {
        let entry = entry?;
        let path = entry.path();
        if entry.file_type()?.is_dir() {
            walk(&path, visit)?;
        } else if path
            .extension()
            .map_or(true, |ext| !ext.to_string_lossy().starts_with("tmp-"))
        {
            visit(&path);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_put_get_round_trip() -> Result<()> {
        let temp = tempdir()?;
        let store = FsStore::open(temp.path())?;
        store.put("a/b/object.bin", b"payload")?;
        assert_eq!(store.get("a/b/object.bin")?, b"payload");
        Ok(())
    }

    #[test]
    fn test_delete_missing_is_ok() -> Result<()> {
        let temp = tempdir()?;
        let store = FsStore::open(temp.path())?;
        store.delete("no/such/key")?;
        Ok(())
    }

    #[test]
    fn test_list_after_is_sorted_and_strict() -> Result<()> {
        let temp = tempdir()?;
        let store = FsStore::open(temp.path())?;
        store.put("p/2021/b", b"1")?;
        store.put("p/2021/a", b"1")?;
        store.put("p/2022/c", b"1")?;
        store.put("q/2021/a", b"1")?;

        let keys = store.list_after("p/", "")?;
        assert_eq!(keys, ["p/2021/a", "p/2021/b", "p/2022/c"]);

        // start_after is exclusive.
        let keys = store.list_after("p/", "p/2021/a")?;
        assert_eq!(keys, ["p/2021/b", "p/2022/c"]);

        // A prefix of an existing key still returns that key.
        let keys = store.list_after("p/", "p/2021")?;
        assert_eq!(keys, ["p/2021/a", "p/2021/b", "p/2022/c"]);
        Ok(())
    }

    #[test]
    fn test_rejects_traversal_keys() -> Result<()> {
        let temp = tempdir()?;
        let store = FsStore::open(temp.path())?;
        assert!(store.put("../escape", b"x").is_err());
        assert!(store.get("/absolute").is_err());
        Ok(())
    }
}
