//! Cache connection layer
//!
//! Abstracts the wire behind the mediator for testability:
//! - `CacheConn` trait: probe/load/store/delete of encoded entries
//! - `MemoryConn`: process-local TTL store for embedding and unit tests
//! - `TcpConn`: line-protocol client for a networked cache daemon
//! - `FlakyConn`: failure-injecting decorator for exercising the
//!   reconnect-once discipline

use std::collections::HashMap;
use std::io::{self, BufRead, BufReader, Write};
use std::net::TcpStream;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Connection-level errors
#[derive(Debug, thiserror::Error)]
pub enum ConnError {
    /// The transport is gone; the client may recreate the connection once
    #[error("transport failure: {0}")]
    Transport(String),

    /// The peer answered with something the protocol does not allow
    #[error("protocol error: {0}")]
    Protocol(String),
}

impl From<io::Error> for ConnError {
    fn from(err: io::Error) -> Self {
        ConnError::Transport(err.to_string())
    }
}

/// One live connection to the cache
pub trait CacheConn: Send {
    /// Cheap liveness check, run before every operation
    fn probe(&mut self) -> Result<(), ConnError>;

    /// Fetch the encoded entry under `key`, if present and unexpired
    fn load(&mut self, key: &str) -> Result<Option<String>, ConnError>;

    /// Store an encoded entry, optionally with a TTL in seconds
    fn store(&mut self, key: &str, payload: &str, expire: Option<u64>) -> Result<(), ConnError>;

    /// Remove the entry under `key`; removing an absent key is not an error
    fn delete(&mut self, key: &str) -> Result<(), ConnError>;
}

/// Creates connections on demand so the client can drop and recreate a
/// stale one
pub trait ConnFactory: Send + Sync {
    /// Open a fresh connection
    fn connect(&self) -> Result<Box<dyn CacheConn>, ConnError>;
}

// ---------------------------------------------------------------------------
// In-memory backend
// ---------------------------------------------------------------------------

#[derive(Default)]
struct MemoryStore {
    entries: HashMap<String, (String, Option<Instant>)>,
}

impl MemoryStore {
    fn sweep(&mut self) {
        let now = Instant::now();
        self.entries
            .retain(|_, (_, deadline)| deadline.map_or(true, |d| d > now));
    }
}

/// Shared state behind every [`MemoryConn`] cloned from one backend
#[derive(Clone, Default)]
pub struct MemoryBackend {
    store: Arc<Mutex<MemoryStore>>,
}

impl MemoryBackend {
    /// Create an empty backend
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live (unexpired) entries; test helper
    pub fn len(&self) -> usize {
        let mut store = self.store.lock().unwrap_or_else(|e| e.into_inner());
        store.sweep();
        store.entries.len()
    }

    /// Whether the backend holds no live entries
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// TTL remaining on `key`, if the entry exists and carries one;
    /// test helper for asserting expiry arithmetic
    pub fn ttl_remaining(&self, key: &str) -> Option<Duration> {
        let store = self.store.lock().unwrap_or_else(|e| e.into_inner());
        store
            .entries
            .get(key)
            .and_then(|(_, deadline)| *deadline)
            .map(|d| d.saturating_duration_since(Instant::now()))
    }
}

impl ConnFactory for MemoryBackend {
    fn connect(&self) -> Result<Box<dyn CacheConn>, ConnError> {
        Ok(Box::new(MemoryConn {
            backend: self.clone(),
        }))
    }
}

/// Connection into a [`MemoryBackend`]
pub struct MemoryConn {
    backend: MemoryBackend,
}

impl CacheConn for MemoryConn {
    fn probe(&mut self) -> Result<(), ConnError> {
        Ok(())
    }

    fn load(&mut self, key: &str) -> Result<Option<String>, ConnError> {
        let mut store = self
            .backend
            .store
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        store.sweep();
        Ok(store.entries.get(key).map(|(payload, _)| payload.clone()))
    }

    fn store(&mut self, key: &str, payload: &str, expire: Option<u64>) -> Result<(), ConnError> {
        let deadline = expire.map(|secs| Instant::now() + Duration::from_secs(secs));
        let mut store = self
            .backend
            .store
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        store
            .entries
            .insert(key.to_string(), (payload.to_string(), deadline));
        Ok(())
    }

    fn delete(&mut self, key: &str) -> Result<(), ConnError> {
        let mut store = self
            .backend
            .store
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        store.entries.remove(key);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// TCP line protocol
// ---------------------------------------------------------------------------

/// Factory for [`TcpConn`] connections
pub struct TcpFactory {
    address: String,
    connect_timeout: Duration,
}

impl TcpFactory {
    /// Create a factory for the given `host:port` address
    pub fn new(address: impl Into<String>, connect_timeout: Duration) -> Self {
        Self {
            address: address.into(),
            connect_timeout,
        }
    }
}

impl ConnFactory for TcpFactory {
    fn connect(&self) -> Result<Box<dyn CacheConn>, ConnError> {
        let addrs: Vec<_> = std::net::ToSocketAddrs::to_socket_addrs(self.address.as_str())
            .map_err(|e| ConnError::Transport(format!("resolve {}: {e}", self.address)))?
            .collect();
        let addr = addrs
            .first()
            .ok_or_else(|| ConnError::Transport(format!("{} resolves to nothing", self.address)))?;
        let stream = TcpStream::connect_timeout(addr, self.connect_timeout)?;
        stream.set_read_timeout(Some(self.connect_timeout))?;
        stream.set_write_timeout(Some(self.connect_timeout))?;
        let reader = BufReader::new(stream.try_clone()?);
        Ok(Box::new(TcpConn { stream, reader }))
    }
}

/// Cache connection speaking a newline-delimited text protocol:
///
/// ```text
/// > PING                          < +PONG
/// > GET <key>                     < +<payload> | -missing
/// > SET <key> <ttl|-> <payload>   < +OK
/// > DEL <key>                     < +OK
/// ```
///
/// Payloads are single-line JSON, so no escaping is needed.
pub struct TcpConn {
    stream: TcpStream,
    reader: BufReader<TcpStream>,
}

impl TcpConn {
    fn round_trip(&mut self, command: &str) -> Result<String, ConnError> {
        self.stream.write_all(command.as_bytes())?;
        self.stream.write_all(b"\n")?;
        self.stream.flush()?;
        let mut line = String::new();
        let n = self.reader.read_line(&mut line)?;
        if n == 0 {
            return Err(ConnError::Transport("connection closed by peer".into()));
        }
        Ok(line.trim_end().to_string())
    }
}

impl CacheConn for TcpConn {
    fn probe(&mut self) -> Result<(), ConnError> {
        match self.round_trip("PING")?.as_str() {
            "+PONG" => Ok(()),
            other => Err(ConnError::Protocol(format!("unexpected PING reply: {other}"))),
        }
    }

    fn load(&mut self, key: &str) -> Result<Option<String>, ConnError> {
        let reply = self.round_trip(&format!("GET {key}"))?;
        if reply == "-missing" {
            Ok(None)
        } else if let Some(payload) = reply.strip_prefix('+') {
            Ok(Some(payload.to_string()))
        } else {
            Err(ConnError::Protocol(format!("unexpected GET reply: {reply}")))
        }
    }

    fn store(&mut self, key: &str, payload: &str, expire: Option<u64>) -> Result<(), ConnError> {
        let ttl = expire.map_or_else(|| "-".to_string(), |s| s.to_string());
        let reply = self.round_trip(&format!("SET {key} {ttl} {payload}"))?;
        if reply == "+OK" {
            Ok(())
        } else {
            Err(ConnError::Protocol(format!("unexpected SET reply: {reply}")))
        }
    }

    fn delete(&mut self, key: &str) -> Result<(), ConnError> {
        let reply = self.round_trip(&format!("DEL {key}"))?;
        if reply == "+OK" {
            Ok(())
        } else {
            Err(ConnError::Protocol(format!("unexpected DEL reply: {reply}")))
        }
    }
}

// ---------------------------------------------------------------------------
// Failure injection
// ---------------------------------------------------------------------------

/// Decorator that fails the first `failures` operations of every
/// connection it hands out, then behaves normally. Lets tests prove that
/// one transparent reconnect absorbs a single stale connection but a
/// persistent outage surfaces.
pub struct FlakyFactory {
    inner: Box<dyn ConnFactory>,
    budget: Arc<Mutex<u32>>,
}

impl FlakyFactory {
    /// Wrap `inner`, failing the next `failures` operations across all
    /// connections
    pub fn new(inner: Box<dyn ConnFactory>, failures: u32) -> Self {
        Self {
            inner,
            budget: Arc::new(Mutex::new(failures)),
        }
    }
}

impl ConnFactory for FlakyFactory {
    fn connect(&self) -> Result<Box<dyn CacheConn>, ConnError> {
        Ok(Box::new(FlakyConn {
            inner: self.inner.connect()?,
            budget: Arc::clone(&self.budget),
        }))
    }
}

struct FlakyConn {
    inner: Box<dyn CacheConn>,
    budget: Arc<Mutex<u32>>,
}

impl FlakyConn {
    fn maybe_fail(&self) -> Result<(), ConnError> {
        let mut budget = self.budget.lock().unwrap_or_else(|e| e.into_inner());
        if *budget > 0 {
            *budget -= 1;
            return Err(ConnError::Transport("injected failure".into()));
        }
        Ok(())
    }
}

impl CacheConn for FlakyConn {
    fn probe(&mut self) -> Result<(), ConnError> {
        self.maybe_fail()?;
        self.inner.probe()
    }

    fn load(&mut self, key: &str) -> Result<Option<String>, ConnError> {
        self.maybe_fail()?;
        self.inner.load(key)
    }

    fn store(&mut self, key: &str, payload: &str, expire: Option<u64>) -> Result<(), ConnError> {
        self.maybe_fail()?;
        self.inner.store(key, payload, expire)
    }

    fn delete(&mut self, key: &str) -> Result<(), ConnError> {
        self.maybe_fail()?;
        self.inner.delete(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_conn_round_trips_and_deletes() {
        let backend = MemoryBackend::new();
        let mut conn = backend.connect().unwrap();
        conn.store("k", "payload", None).unwrap();
        assert_eq!(conn.load("k").unwrap().as_deref(), Some("payload"));
        conn.delete("k").unwrap();
        assert_eq!(conn.load("k").unwrap(), None);
        // deleting again is fine
        conn.delete("k").unwrap();
    }

    #[test]
    fn test_expired_entries_are_invisible() {
        let backend = MemoryBackend::new();
        let mut conn = backend.connect().unwrap();
        conn.store("gone", "x", Some(0)).unwrap();
        assert_eq!(conn.load("gone").unwrap(), None);
        assert!(backend.is_empty());
    }

    #[test]
    fn test_flaky_factory_spends_its_failure_budget() {
        let factory = FlakyFactory::new(Box::new(MemoryBackend::new()), 2);
        let mut conn = factory.connect().unwrap();
        assert!(conn.probe().is_err());
        assert!(conn.probe().is_err());
        assert!(conn.probe().is_ok());
    }
}
