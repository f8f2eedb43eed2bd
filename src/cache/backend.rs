use crate::error::{MimirError, Result};
use dashmap::DashMap;
use std::io::{Read, Write};
use std::path::Path;

/// Storage the cache adapter writes through to. The in-process backend is
/// the default; a durable key-value store slots in behind the same trait.
pub trait CacheBackend: Send + Sync {
    fn get(&self, key: &[u8]) -> Option<Vec<u8>>;
    fn set(&self, key: &[u8], value: Vec<u8>);
    fn remove(&self, key: &[u8]);
    /// Snapshot of every live pair, for persistence.
    fn dump(&self) -> Vec<(Vec<u8>, Vec<u8>)>;
}

/// Sharded in-memory backend.
#[derive(Default)]
pub struct MemoryBackend {
    entries: DashMap<Vec<u8>, Vec<u8>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        MemoryBackend::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl CacheBackend for MemoryBackend {
    fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        self.entries.get(key).map(|v| v.clone())
    }

    fn set(&self, key: &[u8], value: Vec<u8>) {
        self.entries.insert(key.to_vec(), value);
    }

    fn remove(&self, key: &[u8]) {
        self.entries.remove(key);
    }

    fn dump(&self) -> Vec<(Vec<u8>, Vec<u8>)> {
        self.entries
            .iter()
            .map(|pair| (pair.key().clone(), pair.value().clone()))
            .collect()
    }
}

/// Write a backend snapshot as length-prefixed pairs.
pub fn save_snapshot(backend: &dyn CacheBackend, path: &Path) -> Result<usize> {
    let pairs = backend.dump();
    let mut file = std::fs::File::create(path)?;
    for (key, value) in &pairs {
        file.write_all(&(key.len() as u32).to_be_bytes())?;
        file.write_all(key)?;
        file.write_all(&(value.len() as u32).to_be_bytes())?;
        file.write_all(value)?;
    }
    Ok(pairs.len())
}

/// Load a snapshot written by [`save_snapshot`] into the backend.
pub fn load_snapshot(backend: &dyn CacheBackend, path: &Path) -> Result<usize> {
    let mut data = Vec::new();
    std::fs::File::open(path)?.read_to_end(&mut data)?;
    let mut pos = 0;
    let mut count = 0;
    let read_chunk = |pos: &mut usize| -> Result<Vec<u8>> {
        if *pos + 4 > data.len() {
            return Err(MimirError::Cache("truncated cache snapshot".into()));
        }
        let len = u32::from_be_bytes([data[*pos], data[*pos + 1], data[*pos + 2], data[*pos + 3]])
            as usize;
        *pos += 4;
        if *pos + len > data.len() {
            return Err(MimirError::Cache("truncated cache snapshot".into()));
        }
        let chunk = data[*pos..*pos + len].to_vec();
        *pos += len;
        Ok(chunk)
    };
    while pos < data.len() {
        let key = read_chunk(&mut pos)?;
        let value = read_chunk(&mut pos)?;
        backend.set(&key, value);
        count += 1;
    }
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.bin");

        let backend = MemoryBackend::new();
        backend.set(b"key-a", b"value-a".to_vec());
        backend.set(b"key-b", b"value-b".to_vec());
        assert_eq!(save_snapshot(&backend, &path).unwrap(), 2);

        let restored = MemoryBackend::new();
        assert_eq!(load_snapshot(&restored, &path).unwrap(), 2);
        assert_eq!(restored.get(b"key-a"), Some(b"value-a".to_vec()));
        assert_eq!(restored.get(b"key-b"), Some(b"value-b".to_vec()));
    }

    #[test]
    fn truncated_snapshot_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.bin");
        std::fs::write(&path, [0, 0, 0, 9, 1, 2]).unwrap();
        let backend = MemoryBackend::new();
        assert!(load_snapshot(&backend, &path).is_err());
    }
}
