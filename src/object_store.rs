use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use camino::{Utf8Path, Utf8PathBuf};

use crate::error::ExprcatError;

/// Sidecar suffix for per-object metadata kept next to the payload.
const META_SUFFIX: &str = ".meta.json";

/// Remote object storage seen through its four primitive operations. Keys
/// are slash-separated, cohort-scoped paths such as
/// `raw/TCGA-LUAD/samples/S1.csv`.
pub trait ObjectStore: Send + Sync {
    fn list(&self, prefix: &str) -> Result<Vec<String>, ExprcatError>;
    fn head(&self, key: &str) -> Result<BTreeMap<String, String>, ExprcatError>;
    fn get(&self, key: &str) -> Result<Vec<u8>, ExprcatError>;
    fn put(
        &self,
        key: &str,
        bytes: &[u8],
        metadata: &BTreeMap<String, String>,
    ) -> Result<(), ExprcatError>;
}

/// Filesystem-backed store rooted at a single directory. Object metadata
/// lives in a `<key>.meta.json` sidecar so `head` works without touching
/// the payload.
#[derive(Debug, Clone)]
pub struct FsObjectStore {
    root: Utf8PathBuf,
}

impl FsObjectStore {
    pub fn new(root: Utf8PathBuf) -> Self {
        Self { root }
    }

    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> Result<Utf8PathBuf, ExprcatError> {
        let valid = !key.is_empty()
            && !key.starts_with('/')
            && !key.split('/').any(|part| part.is_empty() || part == "..");
        if !valid {
            return Err(ExprcatError::Store(format!("invalid object key: {key}")));
        }
        Ok(self.root.join(key))
    }

    fn write_atomic(path: &Utf8Path, content: &[u8]) -> Result<(), ExprcatError> {
        let parent = path
            .parent()
            .ok_or_else(|| ExprcatError::Store("invalid destination path".to_string()))?;
        fs::create_dir_all(parent.as_std_path())
            .map_err(|err| ExprcatError::Store(err.to_string()))?;
        let temp = tempfile::Builder::new()
            .prefix("exprcat-put")
            .tempfile_in(parent.as_std_path())
            .map_err(|err| ExprcatError::Store(err.to_string()))?;
        fs::write(temp.path(), content).map_err(|err| ExprcatError::Store(err.to_string()))?;
        if path.as_std_path().exists() {
            fs::remove_file(path.as_std_path())
                .map_err(|err| ExprcatError::Store(err.to_string()))?;
        }
        temp.persist(path.as_std_path())
            .map_err(|err| ExprcatError::Store(err.to_string()))?;
        Ok(())
    }
}

impl ObjectStore for FsObjectStore {
    fn list(&self, prefix: &str) -> Result<Vec<String>, ExprcatError> {
        let dir = self.path_for(prefix.trim_end_matches('/'))?;
        if !dir.as_std_path().is_dir() {
            return Ok(Vec::new());
        }
        let mut keys = Vec::new();
        for path in walk_dir(dir.as_std_path())? {
            if !path.is_file() {
                continue;
            }
            let relative = path
                .strip_prefix(self.root.as_std_path())
                .map_err(|err| ExprcatError::Store(err.to_string()))?;
            let key = relative.to_string_lossy().replace('\\', "/");
            if key.ends_with(META_SUFFIX) {
                continue;
            }
            keys.push(key);
        }
        keys.sort();
        Ok(keys)
    }

    fn head(&self, key: &str) -> Result<BTreeMap<String, String>, ExprcatError> {
        let sidecar = self.path_for(&format!("{key}{META_SUFFIX}"))?;
        if !sidecar.as_std_path().is_file() {
            return Ok(BTreeMap::new());
        }
        let content = fs::read_to_string(sidecar.as_std_path())
            .map_err(|err| ExprcatError::Store(format!("{key}: {err}")))?;
        serde_json::from_str(&content)
            .map_err(|err| ExprcatError::Store(format!("{key}: bad metadata sidecar: {err}")))
    }

    fn get(&self, key: &str) -> Result<Vec<u8>, ExprcatError> {
        let path = self.path_for(key)?;
        fs::read(path.as_std_path()).map_err(|err| ExprcatError::Store(format!("{key}: {err}")))
    }

    fn put(
        &self,
        key: &str,
        bytes: &[u8],
        metadata: &BTreeMap<String, String>,
    ) -> Result<(), ExprcatError> {
        let path = self.path_for(key)?;
        Self::write_atomic(&path, bytes)?;
        let sidecar = self.path_for(&format!("{key}{META_SUFFIX}"))?;
        if metadata.is_empty() {
            if sidecar.as_std_path().exists() {
                fs::remove_file(sidecar.as_std_path())
                    .map_err(|err| ExprcatError::Store(err.to_string()))?;
            }
            return Ok(());
        }
        let content = serde_json::to_vec_pretty(metadata)
            .map_err(|err| ExprcatError::Store(err.to_string()))?;
        Self::write_atomic(&sidecar, &content)
    }
}

fn walk_dir(root: &Path) -> Result<Vec<PathBuf>, ExprcatError> {
    let mut items = Vec::new();
    let mut stack = vec![root.to_path_buf()];
    while let Some(path) = stack.pop() {
        let entries = fs::read_dir(&path).map_err(|err| ExprcatError::Store(err.to_string()))?;
        for entry in entries {
            let entry = entry.map_err(|err| ExprcatError::Store(err.to_string()))?;
            let path = entry.path();
            if path.is_dir() {
                stack.push(path.clone());
            }
            items.push(path);
        }
    }
    Ok(items)
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    fn temp_store() -> (tempfile::TempDir, FsObjectStore) {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
        (dir, FsObjectStore::new(root))
    }

    #[test]
    fn put_get_round_trip_with_metadata() {
        let (_dir, store) = temp_store();
        let mut meta = BTreeMap::new();
        meta.insert("patient-id".to_string(), "P1".to_string());

        store
            .put("raw/demo/samples/S1.csv", b"gene_id,unstranded\n", &meta)
            .unwrap();

        assert_eq!(
            store.get("raw/demo/samples/S1.csv").unwrap(),
            b"gene_id,unstranded\n"
        );
        assert_eq!(
            store.head("raw/demo/samples/S1.csv").unwrap(),
            meta
        );
    }

    #[test]
    fn head_without_sidecar_is_empty() {
        let (_dir, store) = temp_store();
        store
            .put("raw/demo/samples/S1.csv", b"x", &BTreeMap::new())
            .unwrap();
        assert!(store.head("raw/demo/samples/S1.csv").unwrap().is_empty());
    }

    #[test]
    fn list_returns_keys_under_prefix_without_sidecars() {
        let (_dir, store) = temp_store();
        let mut meta = BTreeMap::new();
        meta.insert("sample-id".to_string(), "S2".to_string());
        store
            .put("raw/demo/samples/S1.csv", b"a", &BTreeMap::new())
            .unwrap();
        store.put("raw/demo/samples/S2.csv", b"b", &meta).unwrap();
        store.put("raw/other/samples/S3.csv", b"c", &BTreeMap::new())
            .unwrap();

        let keys = store.list("raw/demo/samples/").unwrap();
        assert_eq!(
            keys,
            vec![
                "raw/demo/samples/S1.csv".to_string(),
                "raw/demo/samples/S2.csv".to_string(),
            ]
        );
    }

    #[test]
    fn list_missing_prefix_is_empty() {
        let (_dir, store) = temp_store();
        assert!(store.list("raw/nothing/samples/").unwrap().is_empty());
    }

    #[test]
    fn rejects_escaping_keys() {
        let (_dir, store) = temp_store();
        let err = store.get("../outside").unwrap_err();
        assert_matches!(err, ExprcatError::Store(_));
    }

    #[test]
    fn overwrite_replaces_payload_and_metadata() {
        let (_dir, store) = temp_store();
        let mut meta = BTreeMap::new();
        meta.insert("k".to_string(), "v".to_string());
        store.put("processed/demo/out.csv", b"one", &meta).unwrap();
        store
            .put("processed/demo/out.csv", b"two", &BTreeMap::new())
            .unwrap();

        assert_eq!(store.get("processed/demo/out.csv").unwrap(), b"two");
        assert!(store.head("processed/demo/out.csv").unwrap().is_empty());
    }
}
