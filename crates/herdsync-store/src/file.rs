//! Directory-backed key-value store.
//!
//! Each key maps to one `<encoded-key>.json` file. Writes go to a sibling
//! temporary file that is flushed, synced and then renamed over the target,
//! so a crash mid-write leaves the previous value intact. Every write gets
//! its own temporary file, so concurrent writes to one key never share one
//! and the last rename wins.

use crate::error::{Result, StoreError};
use crate::kv::KvStore;
use async_trait::async_trait;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::fs;
use tokio::io::AsyncWriteExt;

const VALUE_EXT: &str = "json";
const TEMP_EXT: &str = "tmp";

/// Process-wide so two stores opened on one directory never collide.
static WRITE_SEQ: AtomicU64 = AtomicU64::new(0);

/// Persistent store rooted at a directory.
#[derive(Clone, Debug)]
pub struct FileKvStore {
    root: PathBuf,
}

impl FileKvStore {
    /// Open (creating if needed) a store rooted at `root`.
    ///
    /// Leftover temporary files from an interrupted write are deleted.
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        let label = root.display().to_string();
        fs::create_dir_all(&root)
            .await
            .map_err(|e| StoreError::io(&label, e))?;

        let store = Self { root };
        store.sweep_temp_files().await?;
        Ok(store)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn value_path(&self, key: &str) -> PathBuf {
        self.root
            .join(format!("{}.{}", encode_key(key), VALUE_EXT))
    }

    /// `<encoded-key>.<pid>-<seq>.tmp`, unique per write.
    fn temp_path(&self, key: &str) -> PathBuf {
        let seq = WRITE_SEQ.fetch_add(1, Ordering::Relaxed);
        self.root.join(format!(
            "{}.{}-{}.{}",
            encode_key(key),
            std::process::id(),
            seq,
            TEMP_EXT
        ))
    }

    async fn sweep_temp_files(&self) -> Result<()> {
        let label = self.root.display().to_string();
        let mut dir = fs::read_dir(&self.root)
            .await
            .map_err(|e| StoreError::io(&label, e))?;

        while let Some(entry) = dir
            .next_entry()
            .await
            .map_err(|e| StoreError::io(&label, e))?
        {
            let path = entry.path();
            if path.extension().and_then(|s| s.to_str()) == Some(TEMP_EXT) {
                tracing::warn!(path = %path.display(), "removing interrupted write");
                fs::remove_file(&path)
                    .await
                    .map_err(|e| StoreError::io(&label, e))?;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl KvStore for FileKvStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        match fs::read_to_string(self.value_path(key)).await {
            Ok(raw) => Ok(Some(raw)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StoreError::io(key, e)),
        }
    }

    async fn set(&self, key: &str, value: String) -> Result<()> {
        let temp = self.temp_path(key);
        let mut file = fs::File::create(&temp)
            .await
            .map_err(|e| StoreError::io(key, e))?;
        file.write_all(value.as_bytes())
            .await
            .map_err(|e| StoreError::io(key, e))?;
        file.sync_all().await.map_err(|e| StoreError::io(key, e))?;
        drop(file);

        if let Err(e) = fs::rename(&temp, self.value_path(key)).await {
            let _ = fs::remove_file(&temp).await;
            return Err(StoreError::io(key, e));
        }
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<()> {
        match fs::remove_file(self.value_path(key)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StoreError::io(key, e)),
        }
    }

    async fn keys(&self) -> Result<Vec<String>> {
        let label = self.root.display().to_string();
        let mut dir = fs::read_dir(&self.root)
            .await
            .map_err(|e| StoreError::io(&label, e))?;

        let mut keys = Vec::new();
        while let Some(entry) = dir
            .next_entry()
            .await
            .map_err(|e| StoreError::io(&label, e))?
        {
            let path = entry.path();
            if path.extension().and_then(|s| s.to_str()) != Some(VALUE_EXT) {
                continue;
            }
            if let Some(key) = path
                .file_stem()
                .and_then(|s| s.to_str())
                .and_then(decode_key)
            {
                keys.push(key);
            }
        }
        keys.sort();
        Ok(keys)
    }
}

/// Escape a key into a portable file name: `[A-Za-z0-9_-]` pass through,
/// every other byte becomes `%XX`.
fn encode_key(key: &str) -> String {
    let mut out = String::with_capacity(key.len());
    for byte in key.bytes() {
        if byte.is_ascii_alphanumeric() || byte == b'_' || byte == b'-' {
            out.push(byte as char);
        } else {
            out.push_str(&format!("%{:02X}", byte));
        }
    }
    out
}

fn decode_key(name: &str) -> Option<String> {
    let bytes = name.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = name.get(i + 1..i + 3)?;
            out.push(u8::from_str_radix(hex, 16).ok()?);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_encoding() {
        assert_eq!(encode_key("offline_queue"), "offline_queue");
        assert_eq!(encode_key("cache:herd/7"), "cache%3Aherd%2F7");
        assert_eq!(decode_key("cache%3Aherd%2F7").as_deref(), Some("cache:herd/7"));
        assert_eq!(decode_key("bad%4"), None);
    }

    #[tokio::test]
    async fn test_file_store_persists_values() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileKvStore::open(dir.path()).await.unwrap();

        store.set("cache:herd", "[1]".to_string()).await.unwrap();
        store.set("cache:herd", "[1,2]".to_string()).await.unwrap();
        assert_eq!(store.get("cache:herd").await.unwrap().as_deref(), Some("[1,2]"));
        assert_eq!(store.keys().await.unwrap(), vec!["cache:herd".to_string()]);

        let reopened = FileKvStore::open(dir.path()).await.unwrap();
        assert_eq!(reopened.get("cache:herd").await.unwrap().as_deref(), Some("[1,2]"));
    }

    #[tokio::test]
    async fn test_remove_absent_key_is_ok() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileKvStore::open(dir.path()).await.unwrap();
        store.remove("missing").await.unwrap();
        assert!(store.get("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_open_sweeps_interrupted_writes() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("offline_queue.tmp"), "[{\"half").unwrap();
        std::fs::write(dir.path().join("offline_queue.4242-7.tmp"), "[{\"ha").unwrap();
        std::fs::write(dir.path().join("offline_queue.json"), "[]").unwrap();

        let store = FileKvStore::open(dir.path()).await.unwrap();
        assert!(!dir.path().join("offline_queue.tmp").exists());
        assert!(!dir.path().join("offline_queue.4242-7.tmp").exists());
        assert_eq!(store.get("offline_queue").await.unwrap().as_deref(), Some("[]"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_writes_to_one_key_never_tear() {
        let dir = tempfile::tempdir().unwrap();
        let store = std::sync::Arc::new(FileKvStore::open(dir.path()).await.unwrap());
        let long = "A".repeat(50_000);
        let short = "B".repeat(10);

        for _ in 0..50 {
            let (a, b) = tokio::join!(
                tokio::spawn({
                    let store = store.clone();
                    let value = long.clone();
                    async move { store.set("cache:k", value).await }
                }),
                tokio::spawn({
                    let store = store.clone();
                    let value = short.clone();
                    async move { store.set("cache:k", value).await }
                }),
            );
            a.unwrap().unwrap();
            b.unwrap().unwrap();

            let stored = store.get("cache:k").await.unwrap().unwrap();
            assert!(stored == long || stored == short, "torn write of {} bytes", stored.len());
        }

        let leftovers = std::fs::read_dir(dir.path())
            .unwrap()
            .filter(|e| e.as_ref().unwrap().path().extension().and_then(|s| s.to_str()) == Some("tmp"))
            .count();
        assert_eq!(leftovers, 0);
        assert_eq!(store.keys().await.unwrap(), vec!["cache:k".to_string()]);
    }
}
