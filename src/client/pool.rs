//! Per-endpoint connection pools.
//!
//! Connections are opened lazily on the first call to an endpoint and kept
//! up to `connections_per_endpoint`. Creation is serialized per endpoint,
//! so calls that arrive while a connection is logging in wait for it
//! instead of opening their own. A closed connection removes itself; the
//! next call opens a fresh one.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};

use super::connection::ClientConnection;
use crate::config::ClientConfig;
use crate::error::Result;
use crate::transport::{self, Endpoint, TlsUpgrade};

/// Connections to one endpoint.
struct EndpointPool {
    endpoint: Endpoint,
    connections: RwLock<Vec<Arc<ClientConnection>>>,
    next: AtomicUsize,
    create_lock: tokio::sync::Mutex<()>,
}

impl EndpointPool {
    fn new(endpoint: Endpoint) -> Self {
        Self {
            endpoint,
            connections: RwLock::new(Vec::new()),
            next: AtomicUsize::new(0),
            create_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Round-robin over ready connections.
    fn pick(&self) -> Option<Arc<ClientConnection>> {
        let connections = self.connections.read();
        let ready: Vec<_> = connections.iter().filter(|c| c.is_ready()).collect();
        if ready.is_empty() {
            return None;
        }
        let index = self.next.fetch_add(1, Ordering::Relaxed) % ready.len();
        Some(ready[index].clone())
    }

    fn ready_count(&self) -> usize {
        self.connections.read().iter().filter(|c| c.is_ready()).count()
    }

    fn remove(&self, connection: &Arc<ClientConnection>) {
        self.connections
            .write()
            .retain(|c| !Arc::ptr_eq(c, connection));
    }
}

/// Shared index from endpoint to its connections.
pub struct ConnectionPool {
    config: Arc<ClientConfig>,
    tls: Option<Arc<dyn TlsUpgrade>>,
    endpoints: Mutex<HashMap<Endpoint, Arc<EndpointPool>>>,
}

impl ConnectionPool {
    /// Create an empty pool.
    pub fn new(config: Arc<ClientConfig>, tls: Option<Arc<dyn TlsUpgrade>>) -> Self {
        Self {
            config,
            tls,
            endpoints: Mutex::new(HashMap::new()),
        }
    }

    /// Get a ready connection to `endpoint`, opening one if the pool is
    /// below its target size.
    pub async fn get(&self, endpoint: &Endpoint) -> Result<Arc<ClientConnection>> {
        let pool = self.endpoint_pool(endpoint);
        let target = self.config.connections_per_endpoint;

        if pool.ready_count() >= target {
            if let Some(connection) = pool.pick() {
                return Ok(connection);
            }
        }

        let _creating = pool.create_lock.lock().await;

        // Someone else may have filled the pool while we waited.
        if pool.ready_count() >= target {
            if let Some(connection) = pool.pick() {
                return Ok(connection);
            }
        }

        match self.open(&pool).await {
            Ok(connection) => Ok(connection),
            Err(e) => match pool.pick() {
                Some(existing) => {
                    tracing::warn!(
                        endpoint = %endpoint,
                        error = %e,
                        "Could not grow pool, reusing existing connection"
                    );
                    Ok(existing)
                }
                None => Err(e),
            },
        }
    }

    /// Number of live connections to `endpoint`.
    pub fn connection_count(&self, endpoint: &Endpoint) -> usize {
        self.endpoints
            .lock()
            .get(endpoint)
            .map(|pool| pool.connections.read().len())
            .unwrap_or(0)
    }

    /// Close every connection to every endpoint.
    pub fn close_all(&self) {
        let pools: Vec<_> = self.endpoints.lock().drain().map(|(_, pool)| pool).collect();
        for pool in pools {
            let connections: Vec<_> = pool.connections.write().drain(..).collect();
            for connection in connections {
                connection.close("Client shutting down");
            }
        }
    }

    fn endpoint_pool(&self, endpoint: &Endpoint) -> Arc<EndpointPool> {
        self.endpoints
            .lock()
            .entry(endpoint.clone())
            .or_insert_with(|| Arc::new(EndpointPool::new(endpoint.clone())))
            .clone()
    }

    async fn open(&self, pool: &Arc<EndpointPool>) -> Result<Arc<ClientConnection>> {
        let endpoint = &pool.endpoint;
        tracing::debug!(endpoint = %endpoint, "Opening connection");

        let stream = transport::connect(endpoint, self.tls.as_ref()).await?;
        let connection =
            ClientConnection::establish(stream, endpoint.clone(), &self.config).await?;

        pool.connections.write().push(connection.clone());
        tokio::spawn(evict_on_close(Arc::downgrade(pool), connection.clone()));

        Ok(connection)
    }
}

impl Drop for ConnectionPool {
    fn drop(&mut self) {
        self.close_all();
    }
}

async fn evict_on_close(pool: Weak<EndpointPool>, connection: Arc<ClientConnection>) {
    connection.closed().await;
    if let Some(pool) = pool.upgrade() {
        pool.remove(&connection);
        tracing::debug!(endpoint = %pool.endpoint, "Evicted closed connection");
    }
}
