//! Async services (SPEC_FULL.md §6.1, §6.2): timers, HTTP, and the flat
//! virtual filesystem. Each returns a `tokio::task::JoinHandle`, which
//! doubles as the "abortable handle" the spec requires — a process that
//! holds one must call `.abort()` on interrupt/exit, mirroring the
//! `JoinHandle::abort()` idiom the pack's remote-shell tunnel/session code
//! uses for its own background I/O tasks.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::warn;

use crate::error::ServiceError;

/// `timeout(ms)`: resolves after `ms` milliseconds.
pub fn timeout(ms: u64) -> JoinHandle<()> {
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(ms)).await;
    })
}

/// `request(method, url, timeout_ms)`: resolves with the body on HTTP 200,
/// rejects with the numeric status otherwise.
pub fn request(
    method: reqwest::Method,
    url: String,
    timeout_ms: u64,
) -> JoinHandle<Result<String, ServiceError>> {
    tokio::spawn(async move {
        let client = reqwest::Client::new();
        let req = client.request(method, &url);
        let fut = req.send();
        let resp = if timeout_ms > 0 {
            match tokio::time::timeout(Duration::from_millis(timeout_ms), fut).await {
                Ok(r) => r?,
                Err(_) => return Err(ServiceError::Aborted),
            }
        } else {
            fut.await?
        };
        let status = resp.status();
        if status.is_success() {
            Ok(resp.text().await?)
        } else {
            Err(ServiceError::Http(status.as_u16()))
        }
    })
}

/// The flat key→string virtual filesystem. `path` has no hierarchy beyond
/// being an opaque key — there is no directory structure (Non-goal).
#[derive(Clone)]
pub struct Storage {
    inner: Arc<Mutex<HashMap<String, String>>>,
    /// Optional on-disk snapshot path; flushed after every mutation so
    /// state survives a restart, mirroring what browser-resident key-value
    /// storage would give for free.
    snapshot_path: Option<std::path::PathBuf>,
}

impl Storage {
    pub fn new() -> Self {
        Storage {
            inner: Arc::new(Mutex::new(HashMap::new())),
            snapshot_path: None,
        }
    }

    /// Load an existing JSON snapshot (if present) and remember the path
    /// for future flushes.
    pub async fn with_snapshot(path: std::path::PathBuf) -> Self {
        let loaded = match tokio::fs::read_to_string(&path).await {
            Ok(content) => serde_json::from_str(&content).unwrap_or_default(),
            Err(_) => HashMap::new(),
        };
        Storage {
            inner: Arc::new(Mutex::new(loaded)),
            snapshot_path: Some(path),
        }
    }

    async fn flush(&self) {
        let Some(path) = &self.snapshot_path else {
            return;
        };
        let map = self.inner.lock().await;
        match serde_json::to_string(&*map) {
            Ok(json) => {
                if let Err(e) = tokio::fs::write(path, json).await {
                    warn!(error = %e, "storage snapshot flush failed");
                }
            }
            Err(e) => warn!(error = %e, "storage snapshot serialize failed"),
        }
    }

    pub async fn read(&self, path: &str) -> Result<String, ServiceError> {
        let map = self.inner.lock().await;
        map.get(path)
            .cloned()
            .ok_or_else(|| ServiceError::NotFound(path.to_string()))
    }

    pub async fn write(&self, path: &str, content: String) -> Result<(), ServiceError> {
        {
            let mut map = self.inner.lock().await;
            map.insert(path.to_string(), content);
        }
        self.flush().await;
        Ok(())
    }

    pub async fn append(&self, path: &str, content: &str) -> Result<(), ServiceError> {
        {
            let mut map = self.inner.lock().await;
            map.entry(path.to_string()).or_default().push_str(content);
        }
        self.flush().await;
        Ok(())
    }

    pub async fn list(&self, _path: &str) -> Result<Vec<String>, ServiceError> {
        let map = self.inner.lock().await;
        let mut keys: Vec<String> = map.keys().cloned().collect();
        keys.sort();
        Ok(keys)
    }

    pub async fn mv(&self, path: &str, target: &str) -> Result<(), ServiceError> {
        {
            let mut map = self.inner.lock().await;
            let value = map
                .remove(path)
                .ok_or_else(|| ServiceError::NotFound(path.to_string()))?;
            map.insert(target.to_string(), value);
        }
        self.flush().await;
        Ok(())
    }

    pub async fn remove(&self, path: &str) -> Result<(), ServiceError> {
        {
            let mut map = self.inner.lock().await;
            map.remove(path);
        }
        self.flush().await;
        Ok(())
    }
}

impl Default for Storage {
    fn default() -> Self {
        Storage::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn write_then_read_roundtrips() {
        let s = Storage::new();
        s.write("a", "hello".into()).await.unwrap();
        assert_eq!(s.read("a").await.unwrap(), "hello");
    }

    #[tokio::test]
    async fn read_missing_is_not_found() {
        let s = Storage::new();
        let err = s.read("nope").await.unwrap_err();
        assert!(matches!(err, ServiceError::NotFound(_)));
    }

    #[tokio::test]
    async fn append_creates_key_if_absent() {
        let s = Storage::new();
        s.append("log", "a").await.unwrap();
        s.append("log", "b").await.unwrap();
        assert_eq!(s.read("log").await.unwrap(), "ab");
    }

    #[tokio::test]
    async fn list_returns_sorted_keys() {
        let s = Storage::new();
        s.write("zz", "1".into()).await.unwrap();
        s.write("a", "1".into()).await.unwrap();
        s.write("ab", "1".into()).await.unwrap();
        assert_eq!(s.list("").await.unwrap(), vec!["a", "ab", "zz"]);
    }

    #[tokio::test]
    async fn mv_renames_key() {
        let s = Storage::new();
        s.write("old", "v".into()).await.unwrap();
        s.mv("old", "new").await.unwrap();
        assert!(s.read("old").await.is_err());
        assert_eq!(s.read("new").await.unwrap(), "v");
    }

    #[tokio::test]
    async fn remove_is_idempotent() {
        let s = Storage::new();
        s.write("k", "v".into()).await.unwrap();
        s.remove("k").await.unwrap();
        s.remove("k").await.unwrap();
        assert!(s.read("k").await.is_err());
    }

    #[tokio::test]
    async fn timeout_resolves_and_is_abortable() {
        let handle = timeout(50);
        handle.abort();
        let result = handle.await;
        assert!(result.unwrap_err().is_cancelled());
    }
}
