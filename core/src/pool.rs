//! Shared outbound connection pool.
//!
//! # Design
//! One `ConnectionPool` is meant to be shared by every client in a process.
//! It is an explicit, cloneable handle: the application builds it (or takes
//! the lazily created `ConnectionPool::shared()` default) and hands it to
//! each `DaprClient`. Dropping a client never tears the pool down.
//!
//! The pool bounds in-flight requests with a semaphore and recycles its
//! underlying `reqwest::Client` once per lease interval. A fresh client
//! generation opens fresh connections (and re-resolves DNS), so traffic
//! moves off a decommissioned sidecar replica even when the old connections
//! would otherwise stay alive forever. Idle connections are closed after
//! `idle_timeout` independently of the lease interval.

use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, warn};

use crate::error::{Error, Result};

static SHARED: OnceLock<ConnectionPool> = OnceLock::new();

/// Pool tuning.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum number of concurrent requests (and pooled connections).
    pub max_connections: usize,
    /// Idle connections are closed after this long.
    pub idle_timeout: Duration,
    /// A client generation serves new requests for at most this long.
    pub lease_timeout: Duration,
    /// TCP connect timeout.
    pub connect_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: 50,
            idle_timeout: Duration::from_secs(120),
            lease_timeout: Duration::from_secs(120),
            connect_timeout: Duration::from_secs(2),
        }
    }
}

struct Generation {
    id: u64,
    client: reqwest::Client,
    created: Instant,
}

struct PoolInner {
    config: PoolConfig,
    permits: Arc<Semaphore>,
    current: RwLock<Generation>,
}

/// Cloneable handle to the process-wide HTTP connection pool.
#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

/// A pooled client plus the permit that counts it against
/// `max_connections`. The permit is returned when the lease drops.
pub(crate) struct Lease {
    client: reqwest::Client,
    _permit: OwnedSemaphorePermit,
}

impl Lease {
    pub(crate) fn client(&self) -> &reqwest::Client {
        &self.client
    }
}

impl ConnectionPool {
    pub fn new(config: PoolConfig) -> Result<Self> {
        if config.max_connections == 0 {
            return Err(Error::configuration(
                "max_connections=0",
                "the pool needs at least one connection",
            ));
        }
        let client = build_client(&config)
            .map_err(|e| Error::configuration("connection pool", e.to_string()))?;
        Ok(Self {
            inner: Arc::new(PoolInner {
                permits: Arc::new(Semaphore::new(config.max_connections)),
                current: RwLock::new(Generation {
                    id: 0,
                    client,
                    created: Instant::now(),
                }),
                config,
            }),
        })
    }

    /// The process-wide default pool, created with `PoolConfig::default()`
    /// on first use.
    pub fn shared() -> Result<Self> {
        if let Some(pool) = SHARED.get() {
            return Ok(pool.clone());
        }
        let pool = Self::new(PoolConfig::default())?;
        Ok(SHARED.get_or_init(|| pool).clone())
    }

    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    /// Number of times the underlying client has been recycled.
    pub fn generation(&self) -> u64 {
        self.inner.current.read().id
    }

    /// Requests that can start right now without waiting for a permit.
    pub fn available_permits(&self) -> usize {
        self.inner.permits.available_permits()
    }

    /// Stop handing out leases. In-flight requests finish normally.
    pub fn close(&self) {
        self.inner.permits.close();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.permits.is_closed()
    }

    pub(crate) async fn lease(&self) -> Result<Lease> {
        let permit = Arc::clone(&self.inner.permits)
            .acquire_owned()
            .await
            .map_err(|_| Error::PoolClosed)?;
        Ok(Lease {
            client: self.current_client(),
            _permit: permit,
        })
    }

    fn current_client(&self) -> reqwest::Client {
        let lease_timeout = self.inner.config.lease_timeout;
        {
            let current = self.inner.current.read();
            if current.created.elapsed() < lease_timeout {
                return current.client.clone();
            }
        }

        let mut current = self.inner.current.write();
        // Another task may have recycled while we waited for the write lock.
        if current.created.elapsed() < lease_timeout {
            return current.client.clone();
        }
        match build_client(&self.inner.config) {
            Ok(client) => {
                current.id += 1;
                current.client = client;
                current.created = Instant::now();
                debug!("Recycled HTTP connection pool (generation {})", current.id);
            }
            Err(e) => {
                warn!("Failed to rebuild HTTP client, keeping generation {}: {}", current.id, e);
                current.created = Instant::now();
            }
        }
        current.client.clone()
    }
}

impl std::fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("config", &self.inner.config)
            .field("generation", &self.generation())
            .field("available_permits", &self.available_permits())
            .finish()
    }
}

fn build_client(config: &PoolConfig) -> std::result::Result<reqwest::Client, reqwest::Error> {
    reqwest::Client::builder()
        .pool_max_idle_per_host(config.max_connections)
        .pool_idle_timeout(config.idle_timeout)
        .connect_timeout(config.connect_timeout)
        .tcp_keepalive(Duration::from_secs(15))
        .build()
}
