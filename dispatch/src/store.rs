//! State persistence with automatic failover to process memory.
//!
//! Backends implement [`PersistentStore`] and are allowed to fail.
//! [`ResilientStore`] wraps one durable backend plus an in-memory fallback
//! and guarantees its callers never see an error: the loop keeps polling on
//! degraded state rather than stopping because storage is down.

use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tracing::{info, warn};

/// Errors raised by store backends.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("store lock poisoned")]
    LockPoisoned,
}

/// Result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Current Unix time in seconds, as carried in persisted state blobs.
pub fn unix_now() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// Durable key-to-JSON storage backend.
///
/// Keys are flat strings; values are whole JSON blobs replaced atomically
/// per write. Backends may fail on any call.
pub trait PersistentStore: Send + Sync {
    fn get(&self, key: &str) -> StoreResult<Option<Value>>;
    fn set(&self, key: &str, value: &Value) -> StoreResult<()>;
    /// Cheap liveness check, used to notice recovery without waiting for
    /// the next write.
    fn probe(&self) -> StoreResult<()>;
    fn name(&self) -> &str;
}

/// File-backed store: one JSON file per key under a state directory.
///
/// Writes go to a temp file first and are renamed into place, so a crash
/// mid-write never leaves a torn blob behind.
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    /// Open the store, creating the directory if needed.
    pub fn open(dir: impl Into<PathBuf>) -> StoreResult<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    fn path_for(&self, key: &str) -> PathBuf {
        // Keys may carry ':' namespacing; keep file names flat.
        let safe: String = key
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        self.dir.join(format!("{safe}.json"))
    }
}

impl PersistentStore for FileStore {
    fn get(&self, key: &str) -> StoreResult<Option<Value>> {
        let path = self.path_for(key);
        let raw = match fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        Ok(Some(serde_json::from_str(&raw)?))
    }

    fn set(&self, key: &str, value: &Value) -> StoreResult<()> {
        let path = self.path_for(key);
        let tmp = path.with_extension("json.tmp");
        let raw = serde_json::to_string(value)?;
        let mut file = fs::File::create(&tmp)?;
        file.write_all(raw.as_bytes())?;
        file.sync_all()?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    fn probe(&self) -> StoreResult<()> {
        fs::metadata(&self.dir)?;
        Ok(())
    }

    fn name(&self) -> &str {
        "file"
    }
}

/// In-memory store. Used standalone in tests and as the failover backend
/// inside [`ResilientStore`].
#[derive(Default)]
pub struct MemoryStore {
    data: Mutex<HashMap<String, Value>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl PersistentStore for MemoryStore {
    fn get(&self, key: &str) -> StoreResult<Option<Value>> {
        let data = self.data.lock().map_err(|_| StoreError::LockPoisoned)?;
        Ok(data.get(key).cloned())
    }

    fn set(&self, key: &str, value: &Value) -> StoreResult<()> {
        let mut data = self.data.lock().map_err(|_| StoreError::LockPoisoned)?;
        data.insert(key.to_string(), value.clone());
        Ok(())
    }

    fn probe(&self) -> StoreResult<()> {
        Ok(())
    }

    fn name(&self) -> &str {
        "memory"
    }
}

/// Health snapshot of a [`ResilientStore`], for diagnostics.
#[derive(Debug, Clone, Serialize)]
pub struct StoreHealth {
    pub active_backend: String,
    pub degraded: bool,
    pub last_error: Option<String>,
    pub last_ok_at: Option<f64>,
}

struct HealthState {
    degraded: bool,
    last_error: Option<String>,
    last_ok_at: Option<f64>,
}

/// Store wrapper that never fails.
///
/// Every call tries the durable primary first. A primary error flips the
/// store into degraded mode and the call is served from the in-memory
/// fallback instead; a later success flips it back. Both transitions are
/// logged once, not on every call. Writes that succeed on the primary are
/// mirrored into the fallback as well, so a failover reads the latest data
/// rather than whatever the fallback last happened to hold.
pub struct ResilientStore {
    primary: Arc<dyn PersistentStore>,
    fallback: MemoryStore,
    health: Mutex<HealthState>,
}

/// Shared handle to the resilient store.
pub type SharedResilientStore = Arc<ResilientStore>;

impl ResilientStore {
    pub fn new(primary: Arc<dyn PersistentStore>) -> Self {
        Self {
            primary,
            fallback: MemoryStore::new(),
            health: Mutex::new(HealthState {
                degraded: false,
                last_error: None,
                last_ok_at: None,
            }),
        }
    }

    /// Wrap in an `Arc` for sharing across components.
    pub fn shared(self) -> SharedResilientStore {
        Arc::new(self)
    }

    /// Read a raw JSON blob. Falls back to memory when the primary errors;
    /// absent keys are `None` either way.
    pub fn get(&self, key: &str) -> Option<Value> {
        match self.primary.get(key) {
            Ok(value) => {
                self.mark_ok();
                value
            }
            Err(e) => {
                self.mark_fail(&e);
                self.fallback.get(key).ok().flatten()
            }
        }
    }

    /// Write a raw JSON blob. Never fails: on primary error the value lands
    /// in the fallback so the current process keeps a consistent view.
    pub fn set(&self, key: &str, value: &Value) {
        match self.primary.set(key, value) {
            Ok(()) => {
                self.mark_ok();
                if let Err(e) = self.fallback.set(key, value) {
                    warn!(key, error = %e, "memory mirror write failed");
                }
            }
            Err(e) => {
                self.mark_fail(&e);
                if let Err(e2) = self.fallback.set(key, value) {
                    warn!(key, error = %e2, "fallback write failed");
                }
            }
        }
    }

    /// Deserialize the blob at `key`. Absent or malformed blobs are `None`;
    /// malformed ones are logged and discarded rather than crashing the loop.
    pub fn get_typed<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let value = self.get(key)?;
        match serde_json::from_value(value) {
            Ok(parsed) => Some(parsed),
            Err(e) => {
                warn!(key, error = %e, "discarding malformed state blob");
                None
            }
        }
    }

    /// Serialize and write a typed blob.
    pub fn set_typed<T: Serialize>(&self, key: &str, value: &T) {
        match serde_json::to_value(value) {
            Ok(json) => self.set(key, &json),
            Err(e) => warn!(key, error = %e, "failed to serialize state blob"),
        }
    }

    /// Liveness check against the primary. Returns whether the primary is
    /// currently healthy and updates degradation state accordingly.
    pub fn probe(&self) -> bool {
        match self.primary.probe() {
            Ok(()) => {
                self.mark_ok();
                true
            }
            Err(e) => {
                self.mark_fail(&e);
                false
            }
        }
    }

    pub fn is_degraded(&self) -> bool {
        self.health.lock().map(|h| h.degraded).unwrap_or(true)
    }

    /// Name of the backend currently serving calls.
    pub fn backend_name(&self) -> &str {
        if self.is_degraded() {
            self.fallback.name()
        } else {
            self.primary.name()
        }
    }

    pub fn health(&self) -> StoreHealth {
        let (degraded, last_error, last_ok_at) = match self.health.lock() {
            Ok(h) => (h.degraded, h.last_error.clone(), h.last_ok_at),
            Err(_) => (true, Some("health lock poisoned".to_string()), None),
        };
        StoreHealth {
            active_backend: self.backend_name().to_string(),
            degraded,
            last_error,
            last_ok_at,
        }
    }

    fn mark_ok(&self) {
        if let Ok(mut health) = self.health.lock() {
            if health.degraded {
                info!(backend = self.primary.name(), "store backend recovered");
            }
            health.degraded = false;
            health.last_error = None;
            health.last_ok_at = Some(unix_now());
        }
    }

    fn mark_fail(&self, error: &StoreError) {
        if let Ok(mut health) = self.health.lock() {
            if !health.degraded {
                warn!(
                    backend = self.primary.name(),
                    error = %error,
                    "store backend failed, serving from memory"
                );
            }
            health.degraded = true;
            health.last_error = Some(error.to_string());
        }
    }
}
