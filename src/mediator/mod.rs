//! Secret mediator
//!
//! Client for the transient expiring key-value cache that ferries secret
//! variables to running jobs instead of the durable ledger. Values are
//! typed — scalar text, mapping, or ordered list — and decode back to the
//! type they were stored as.
//!
//! Connection discipline: every operation probes the connection first; on
//! a transport failure the connection is dropped and recreated exactly
//! once before the error surfaces. A stale connection is therefore never
//! a caller-visible error of its own. Missing configuration is a fatal
//! configuration error, distinct from transient connectivity failures.

mod conn;

pub use conn::{
    CacheConn, ConnError, ConnFactory, FlakyFactory, MemoryBackend, MemoryConn, TcpConn,
    TcpFactory,
};

use std::collections::BTreeMap;
use std::sync::Mutex;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::MediatorConfig;
use crate::ledger::RequestId;

/// Key under which a request's secret variables live
pub fn secret_key(request_id: RequestId) -> String {
    format!("job_requests:{request_id}:vars")
}

/// A typed cache value
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "t", content = "v", rename_all = "lowercase")]
pub enum Value {
    /// Scalar text
    Text(String),
    /// Mapping of names to text values; replaces, never merges
    Map(BTreeMap<String, String>),
    /// Ordered sequence of text values; replaces, never merges
    List(Vec<String>),
}

/// Mediator errors
#[derive(Debug, thiserror::Error)]
pub enum MediatorError {
    /// No cache is configured at all; fatal, not transient
    #[error("mediator is not configured")]
    NotConfigured,

    /// The cache stayed unreachable after one reconnect
    #[error("mediator unreachable: {0}")]
    Transport(String),

    /// The peer violated the protocol; not retried
    #[error("mediator protocol error: {0}")]
    Protocol(String),

    /// A stored payload failed to decode
    #[error("mediator payload corrupt: {0}")]
    Codec(#[from] serde_json::Error),
}

impl From<MediatorError> for crate::error::Error {
    fn from(err: MediatorError) -> Self {
        match err {
            MediatorError::NotConfigured => {
                crate::error::Error::Configuration(err.to_string())
            }
            other => crate::error::Error::Transient(other.to_string()),
        }
    }
}

/// Client for the secret cache
///
/// The connection is shared behind a mutex, so concurrent request
/// creations serialize on it; a reconnect replaces only this client's
/// connection and never touches operations running on other clients.
pub struct Mediator {
    factory: Box<dyn ConnFactory>,
    conn: Mutex<Option<Box<dyn CacheConn>>>,
}

impl Mediator {
    /// Build a mediator over an explicit connection factory
    pub fn new(factory: Box<dyn ConnFactory>) -> Self {
        Self {
            factory,
            conn: Mutex::new(None),
        }
    }

    /// Build a mediator from configuration; an absent address is a fatal
    /// configuration error
    pub fn from_config(config: &MediatorConfig) -> Result<Self, MediatorError> {
        let address = config.address.as_ref().ok_or(MediatorError::NotConfigured)?;
        let timeout = Duration::from_secs(config.connect_timeout_seconds);
        Ok(Self::new(Box::new(TcpFactory::new(address.clone(), timeout))))
    }

    /// Fetch the value under `key`, `None` if absent or expired
    pub fn get(&self, key: &str) -> Result<Option<Value>, MediatorError> {
        let payload = self.with_conn(|conn| conn.load(key))?;
        match payload {
            None => Ok(None),
            Some(encoded) => Ok(Some(serde_json::from_str(&encoded)?)),
        }
    }

    /// Store `value` under `key`, fully replacing any existing value;
    /// `expire` attaches a TTL in seconds
    pub fn set(&self, key: &str, value: &Value, expire: Option<u64>) -> Result<(), MediatorError> {
        let encoded = serde_json::to_string(value)?;
        self.with_conn(|conn| conn.store(key, &encoded, expire))
    }

    /// Delete the value under `key`; deleting an absent key succeeds
    pub fn set_none(&self, key: &str) -> Result<(), MediatorError> {
        self.with_conn(|conn| conn.delete(key))
    }

    /// Fetch and delete in one call; the read-once path used by job runs
    pub fn take(&self, key: &str) -> Result<Option<Value>, MediatorError> {
        let value = self.get(key)?;
        if value.is_some() {
            self.set_none(key)?;
        }
        Ok(value)
    }

    /// Run `op` against a probed connection, transparently recreating the
    /// connection once on transport failure.
    fn with_conn<T>(
        &self,
        mut op: impl FnMut(&mut dyn CacheConn) -> Result<T, ConnError>,
    ) -> Result<T, MediatorError> {
        let mut slot = self.conn.lock().unwrap_or_else(|e| e.into_inner());

        for attempt in 0..2 {
            if slot.is_none() {
                match self.factory.connect() {
                    Ok(conn) => *slot = Some(conn),
                    Err(ConnError::Transport(msg)) if attempt == 0 => {
                        debug!(error = %msg, "mediator connect failed, retrying once");
                        continue;
                    }
                    Err(err) => return Err(lift(err)),
                }
            }
            let conn = match slot.as_mut() {
                Some(c) => c.as_mut(),
                None => continue,
            };
            let result = conn.probe().and_then(|()| op(conn));
            match result {
                Ok(value) => return Ok(value),
                Err(ConnError::Transport(msg)) => {
                    // Drop the stale connection; one fresh attempt follows.
                    *slot = None;
                    if attempt == 0 {
                        warn!(error = %msg, "mediator connection stale, reconnecting");
                        continue;
                    }
                    return Err(MediatorError::Transport(msg));
                }
                Err(err) => return Err(lift(err)),
            }
        }
        Err(MediatorError::Transport("connection could not be established".into()))
    }
}

fn lift(err: ConnError) -> MediatorError {
    match err {
        ConnError::Transport(msg) => MediatorError::Transport(msg),
        ConnError::Protocol(msg) => MediatorError::Protocol(msg),
    }
}
