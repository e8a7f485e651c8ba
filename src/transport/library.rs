// src/transport/library.rs
// Process-wide, reference-counted transport library initialization

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use tracing::{debug, info};

use super::errors::{TransportError, TransportResult};
use super::TransportConnector;

static LIBRARY_USERS: Mutex<BTreeMap<String, usize>> = Mutex::new(BTreeMap::new());

/// Holds one reference on a transport library. The library is initialized
/// when the first guard for its key is acquired and shut down when the last
/// one is dropped.
pub struct LibraryGuard {
    key: String,
    connector: Arc<dyn TransportConnector>,
}

impl LibraryGuard {
    pub fn acquire(connector: Arc<dyn TransportConnector>) -> TransportResult<Self> {
        let key = connector.library_key();
        let mut users = LIBRARY_USERS
            .lock()
            .map_err(|_| TransportError::LibraryInit("library registry lock poisoned".to_string()))?;

        let count = users.get(&key).copied().unwrap_or(0);
        if count == 0 {
            info!(library = %key, "Initializing transport library");
            connector.initialize_library()?;
        }
        users.insert(key.clone(), count + 1);
        debug!(library = %key, users = count + 1, "Acquired transport library");

        Ok(Self { key, connector })
    }

    pub fn key(&self) -> &str {
        &self.key
    }
}

impl Drop for LibraryGuard {
    fn drop(&mut self) {
        // A poisoned registry still holds valid counts
        let mut users = LIBRARY_USERS.lock().unwrap_or_else(|poisoned| poisoned.into_inner());

        let remaining = users.get(&self.key).copied().unwrap_or(1).saturating_sub(1);
        if remaining == 0 {
            users.remove(&self.key);
            info!(library = %self.key, "Shutting down transport library");
            self.connector.shutdown_library();
        } else {
            users.insert(self.key.clone(), remaining);
            debug!(library = %self.key, users = remaining, "Released transport library");
        }
    }
}

/// Number of live guards for `key`.
pub fn users_of(key: &str) -> usize {
    LIBRARY_USERS
        .lock()
        .map(|users| users.get(key).copied().unwrap_or(0))
        .unwrap_or(0)
}
