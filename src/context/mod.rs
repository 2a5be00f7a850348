//! C3 — [`AsyncContext`] and [`AsyncContextManager`]: the process-wide
//! registry of suspended request contexts, with a background reaper.

mod id;
mod reaper;

pub use id::ContextId;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::RwLock;

use crate::config::ContextManagerConfig;
use crate::error::Error;
use crate::wire::Request;

/// CREATED → PROCESSING → (WAITING ↔ PROCESSING)* → {COMPLETED, ERROR, TIMEOUT}.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextState {
    Created,
    Processing,
    Waiting,
    Completed,
    Error,
    Timeout,
}

/// One suspended request's bookkeeping record.
#[derive(Debug, Clone)]
pub struct AsyncContext {
    pub id: ContextId,
    pub request: Arc<Request>,
    pub created_at: Instant,
    pub expires_at: Instant,
    pub last_access_at: Instant,
    pub created_thread: String,
    pub state: ContextState,
    pub state_data: Option<String>,
    pub last_error: Option<String>,
    pub attributes: HashMap<String, String>,
    pub processing_thread: Option<String>,
    pub processing_start_at: Option<Instant>,
}

impl AsyncContext {
    pub fn is_expired_at(&self, now: Instant) -> bool {
        now > self.expires_at
    }
}

#[derive(Debug, Default, Clone)]
pub struct ContextManagerStats {
    pub created: u64,
    pub removed: u64,
    pub expired: u64,
    pub live: u64,
}

/// The process-wide table. Constructed once and shared via `Arc` with the
/// [`crate::switching::ContextSwitchingHandler`] and the reactor's
/// dispatch closures (Design Notes §9: own the global table explicitly,
/// never ambient-static).
pub struct AsyncContextManager {
    table: DashMap<ContextId, AsyncContext>,
    ids: id::IdGenerator,
    config: ContextManagerConfig,
    created: AtomicU64,
    removed: AtomicU64,
    expired: AtomicU64,
    reaper: RwLock<Option<reaper::ReaperHandle>>,
}

impl AsyncContextManager {
    pub fn new(config: ContextManagerConfig) -> Arc<Self> {
        let manager = Arc::new(AsyncContextManager {
            table: DashMap::new(),
            ids: id::IdGenerator::new(),
            config,
            created: AtomicU64::new(0),
            removed: AtomicU64::new(0),
            expired: AtomicU64::new(0),
            reaper: RwLock::new(None),
        });
        let handle = reaper::spawn(Arc::clone(&manager));
        *manager.reaper.write() = Some(handle);
        manager
    }

    pub fn create(&self, request: Request) -> ContextId {
        let id = self.ids.next();
        let now = Instant::now();
        let ctx = AsyncContext {
            id: id.clone(),
            request: Arc::new(request),
            created_at: now,
            expires_at: now + self.config.default_timeout,
            last_access_at: now,
            created_thread: current_thread_name(),
            state: ContextState::Created,
            state_data: None,
            last_error: None,
            attributes: HashMap::new(),
            processing_thread: None,
            processing_start_at: None,
        };
        self.table.insert(id.clone(), ctx);
        self.created.fetch_add(1, Ordering::Relaxed);
        id
    }

    /// `Ok(None)` if `id` was never created (or already removed); `Err`
    /// if it existed but its TTL has passed, in which case the entry is
    /// also removed (§7: `ContextExpired` raised "on `get` past expiry",
    /// caller decides how to treat it rather than it silently collapsing
    /// into "not found").
    pub fn get(&self, id: &ContextId) -> Result<Option<AsyncContext>, Error> {
        let now = Instant::now();
        let expired = match self.table.get(id) {
            Some(entry) => entry.is_expired_at(now),
            None => return Ok(None),
        };
        if expired {
            self.remove(id);
            return Err(Error::ContextExpired);
        }
        let mut entry = match self.table.get_mut(id) {
            Some(entry) => entry,
            None => return Ok(None),
        };
        entry.last_access_at = now;
        Ok(Some(entry.clone()))
    }

    /// Idempotent: removing a missing id is a no-op, not an error.
    pub fn remove(&self, id: &ContextId) {
        if self.table.remove(id).is_some() {
            self.removed.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn update_state(&self, id: &ContextId, state: ContextState, data: Option<String>) {
        if let Some(mut entry) = self.table.get_mut(id) {
            entry.state = state;
            entry.state_data = data;
            entry.last_access_at = Instant::now();
            if state == ContextState::Processing && entry.processing_start_at.is_none() {
                entry.processing_thread = Some(current_thread_name());
                entry.processing_start_at = Some(Instant::now());
            }
        }
    }

    pub fn set_error(&self, id: &ContextId, error: impl Into<String>) {
        if let Some(mut entry) = self.table.get_mut(id) {
            entry.last_error = Some(error.into());
            entry.state = ContextState::Error;
            entry.last_access_at = Instant::now();
        }
    }

    pub fn set_attribute(&self, id: &ContextId, key: impl Into<String>, value: impl Into<String>) {
        if let Some(mut entry) = self.table.get_mut(id) {
            entry.attributes.insert(key.into(), value.into());
            entry.last_access_at = Instant::now();
        }
    }

    pub fn get_attribute(&self, id: &ContextId, key: &str) -> Option<String> {
        let mut entry = self.table.get_mut(id)?;
        entry.last_access_at = Instant::now();
        entry.attributes.get(key).cloned()
    }

    /// Diagnostic: live, non-expired contexts currently in `state`.
    pub fn by_state(&self, state: ContextState) -> Vec<AsyncContext> {
        let now = Instant::now();
        self.table
            .iter()
            .filter(|entry| entry.state == state && !entry.is_expired_at(now))
            .map(|entry| entry.clone())
            .collect()
    }

    /// Force-removes every entry. Emergency use only.
    pub fn clear_all(&self) {
        let removed = self.table.len() as u64;
        self.table.clear();
        self.removed.fetch_add(removed, Ordering::Relaxed);
    }

    pub(crate) fn reap_expired(&self) -> u64 {
        let now = Instant::now();
        let expired_ids: Vec<ContextId> = self
            .table
            .iter()
            .filter(|entry| entry.is_expired_at(now))
            .map(|entry| entry.id.clone())
            .collect();
        for id in &expired_ids {
            self.table.remove(id);
        }
        let count = expired_ids.len() as u64;
        self.expired.fetch_add(count, Ordering::Relaxed);
        self.removed.fetch_add(count, Ordering::Relaxed);
        count
    }

    pub fn stats(&self) -> ContextManagerStats {
        ContextManagerStats {
            created: self.created.load(Ordering::Relaxed),
            removed: self.removed.load(Ordering::Relaxed),
            expired: self.expired.load(Ordering::Relaxed),
            live: self.table.len() as u64,
        }
    }

    /// Stops the reaper, then force-removes everything.
    pub fn shutdown(&self) {
        if let Some(handle) = self.reaper.write().take() {
            handle.stop();
        }
        self.clear_all();
    }

    pub(crate) fn reap_interval(&self) -> Duration {
        self.config.reap_interval
    }
}

impl Drop for AsyncContextManager {
    fn drop(&mut self) {
        if let Some(handle) = self.reaper.write().take() {
            handle.stop();
        }
    }
}

fn current_thread_name() -> String {
    std::thread::current()
        .name()
        .unwrap_or("unnamed")
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::Method;

    fn sample_request() -> Request {
        Request {
            method: Method::GET,
            uri: "/".parse().unwrap(),
            version: http::Version::HTTP_11,
            headers: http::HeaderMap::new(),
            body: bytes::Bytes::new(),
        }
    }

    #[test]
    fn create_get_remove_round_trip() {
        let manager = AsyncContextManager::new(ContextManagerConfig::default());
        let id = manager.create(sample_request());
        assert_eq!(manager.stats().live, 1);

        let ctx = manager.get(&id).unwrap().expect("present");
        assert_eq!(ctx.state, ContextState::Created);

        manager.remove(&id);
        assert!(manager.get(&id).unwrap().is_none());
        assert_eq!(manager.stats().live, 0);

        // idempotent
        manager.remove(&id);
    }

    #[test]
    fn get_past_expiry_surfaces_context_expired() {
        let config = ContextManagerConfig {
            default_timeout: Duration::from_millis(1),
            reap_interval: Duration::from_secs(3600),
        };
        let manager = AsyncContextManager::new(config);
        let id = manager.create(sample_request());
        std::thread::sleep(Duration::from_millis(20));
        assert!(matches!(manager.get(&id), Err(Error::ContextExpired)));
        // the expired entry is also removed as a side effect
        assert_eq!(manager.stats().live, 0);
    }

    #[test]
    fn get_on_unknown_id_is_ok_none() {
        let manager = AsyncContextManager::new(ContextManagerConfig::default());
        let id = manager.create(sample_request());
        manager.remove(&id);
        assert!(manager.get(&id).unwrap().is_none());
    }

    #[test]
    fn reaper_sweeps_expired_entries() {
        let config = ContextManagerConfig {
            default_timeout: Duration::from_millis(1),
            reap_interval: Duration::from_millis(20),
        };
        let manager = AsyncContextManager::new(config);
        let _id = manager.create(sample_request());
        std::thread::sleep(Duration::from_millis(200));
        assert_eq!(manager.stats().live, 0);
        assert!(manager.stats().expired >= 1);
        manager.shutdown();
    }

    #[test]
    fn state_transitions_update_last_access() {
        let manager = AsyncContextManager::new(ContextManagerConfig::default());
        let id = manager.create(sample_request());
        manager.update_state(&id, ContextState::Processing, Some("working".into()));
        let ctx = manager.get(&id).unwrap().unwrap();
        assert_eq!(ctx.state, ContextState::Processing);
        assert!(ctx.processing_start_at.is_some());
    }
}
