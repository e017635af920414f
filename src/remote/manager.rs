//! Process-wide pool holding one live [`RemoteConnection`] per host.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

use super::cache::ResultCache;
use super::connection::RemoteConnection;
use super::error::RemoteError;
use super::runner::CommandRunner;
use crate::config::ConnectionSettings;
use crate::models::HostConfig;

struct ManagedConnection {
    connection: Arc<RemoteConnection>,
    last_used: Instant,
    last_health_check: Instant,
}

pub struct ConnectionManager {
    settings: ConnectionSettings,
    runner: Arc<dyn CommandRunner>,
    cache: Arc<ResultCache>,
    connections: Mutex<HashMap<String, ManagedConnection>>,
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("settings", &self.settings)
            .field("active", &self.get_active_connections())
            .finish_non_exhaustive()
    }
}

static INSTANCE: Mutex<Option<Arc<ConnectionManager>>> = Mutex::new(None);

fn lock_instance() -> MutexGuard<'static, Option<Arc<ConnectionManager>>> {
    INSTANCE.lock().unwrap_or_else(PoisonError::into_inner)
}

impl ConnectionManager {
    fn new(
        settings: ConnectionSettings,
        runner: Arc<dyn CommandRunner>,
        cache: Arc<ResultCache>,
    ) -> Self {
        Self {
            settings,
            runner,
            cache,
            connections: Mutex::new(HashMap::new()),
        }
    }

    /// Create the shared manager. Fails if one is already installed.
    pub fn install(
        settings: ConnectionSettings,
        runner: Arc<dyn CommandRunner>,
        cache: Arc<ResultCache>,
    ) -> Result<Arc<Self>, RemoteError> {
        let mut slot = lock_instance();
        if slot.is_some() {
            return Err(RemoteError::Operation(
                "Connection manager is already initialised".to_string(),
            ));
        }

        let manager = Arc::new(Self::new(settings, runner, cache));
        *slot = Some(manager.clone());
        Ok(manager)
    }

    /// The shared manager created by [`ConnectionManager::install`].
    pub fn instance() -> Result<Arc<Self>, RemoteError> {
        lock_instance().clone().ok_or_else(|| {
            RemoteError::Operation("Connection manager is not initialised".to_string())
        })
    }

    /// Drop the shared manager after closing its connections, so a fresh one
    /// can be installed.
    pub fn reset() {
        let previous = lock_instance().take();
        if let Some(manager) = previous {
            manager.close_all();
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, ManagedConnection>> {
        self.connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn health_check_interval(&self) -> Duration {
        self.settings.health_check_interval()
    }

    /// Returns `(healthy, performed_real_check)`. Inside the interval the
    /// connection's own flag is trusted.
    fn probe_health(
        &self,
        hostname: &str,
        connection: &RemoteConnection,
        last_check: Instant,
    ) -> (bool, bool) {
        if last_check.elapsed() < self.health_check_interval() {
            return (connection.connected_flag(), false);
        }

        let healthy = connection.is_connected();
        if !healthy {
            warn!("Health check failed for {}: control master not active", hostname);
        }
        (healthy, true)
    }

    fn open(
        &self,
        hostname: &str,
        config: &HostConfig,
    ) -> Result<Arc<RemoteConnection>, RemoteError> {
        let connection = Arc::new(RemoteConnection::new(
            hostname,
            config,
            &self.settings,
            self.runner.clone(),
            self.cache.clone(),
        ));
        connection.connect()?;
        Ok(connection)
    }

    fn insert(
        connections: &mut HashMap<String, ManagedConnection>,
        hostname: &str,
        connection: Arc<RemoteConnection>,
    ) {
        let now = Instant::now();
        connections.insert(
            hostname.to_string(),
            ManagedConnection {
                connection,
                last_used: now,
                last_health_check: now,
            },
        );
    }

    /// A connected [`RemoteConnection`] for `hostname`.
    ///
    /// An existing connection is reused while healthy. An unhealthy one is
    /// replaced by exactly one reconnect attempt whose error is returned
    /// as is.
    pub fn get_connection(
        &self,
        hostname: &str,
        config: &HostConfig,
    ) -> Result<Arc<RemoteConnection>, RemoteError> {
        let existing = self
            .lock()
            .get(hostname)
            .map(|m| (m.connection.clone(), m.last_health_check));

        // Health checks spawn processes; run them without the table lock.
        let probe = existing.map(|(connection, last_check)| {
            let (healthy, checked) = self.probe_health(hostname, &connection, last_check);
            (connection, healthy, checked)
        });

        let mut connections = self.lock();

        if let Some((probed, healthy, checked)) = probe {
            if let Some(managed) = connections.get_mut(hostname) {
                let now = Instant::now();
                if !Arc::ptr_eq(&managed.connection, &probed) {
                    // Replaced by another thread while we were probing.
                    managed.last_used = now;
                    return Ok(managed.connection.clone());
                }

                if healthy {
                    managed.last_used = now;
                    if checked {
                        managed.last_health_check = now;
                    }
                    debug!("Reusing connection to {}", hostname);
                    return Ok(probed);
                }

                warn!("Connection to {} unhealthy, attempting reconnection", hostname);
                connections.remove(hostname);
                let connection = self.open(hostname, config).map_err(|e| {
                    error!("Reconnection to {} failed: {}", hostname, e);
                    e
                })?;
                Self::insert(&mut connections, hostname, connection.clone());
                info!("Reconnected to {}", hostname);
                return Ok(connection);
            }
        } else if let Some(managed) = connections.get_mut(hostname) {
            managed.last_used = Instant::now();
            return Ok(managed.connection.clone());
        }

        let connection = self.open(hostname, config)?;
        Self::insert(&mut connections, hostname, connection.clone());
        info!("Created new connection to {}", hostname);
        Ok(connection)
    }

    pub fn close_connection(&self, hostname: &str) {
        let removed = self.lock().remove(hostname);
        if let Some(managed) = removed {
            managed.connection.disconnect();
            info!("Closed connection to {}", hostname);
        }
    }

    /// Disconnect everything. Individual failures are logged by the
    /// connections themselves and do not stop the rest.
    pub fn close_all(&self) {
        let drained: Vec<(String, ManagedConnection)> = self.lock().drain().collect();
        for (hostname, managed) in drained {
            debug!("Closing connection to {}", hostname);
            managed.connection.disconnect();
        }
        info!("Closed all connections");
    }

    /// Close connections unused for longer than the idle timeout and return
    /// their hostnames. Meant to be called periodically.
    pub fn cleanup_idle_connections(&self) -> Vec<String> {
        let idle_timeout = self.settings.idle_timeout();
        let idle: Vec<(String, ManagedConnection)> = {
            let mut connections = self.lock();
            let names: Vec<String> = connections
                .iter()
                .filter(|(_, m)| m.last_used.elapsed() > idle_timeout)
                .map(|(name, _)| name.clone())
                .collect();
            names
                .into_iter()
                .filter_map(|name| connections.remove(&name).map(|m| (name, m)))
                .collect()
        };

        let mut closed = Vec::with_capacity(idle.len());
        for (hostname, managed) in idle {
            info!("Closing idle connection to {}", hostname);
            managed.connection.disconnect();
            closed.push(hostname);
        }
        closed.sort();
        closed
    }

    /// Verify a pooled connection right now, bypassing the pool's interval.
    pub fn check_connection_health(&self, hostname: &str) -> bool {
        let connection = self.lock().get(hostname).map(|m| m.connection.clone());
        match connection {
            Some(connection) => connection.is_connected(),
            None => false,
        }
    }

    pub fn get_active_connections(&self) -> Vec<String> {
        let mut names: Vec<String> = self.lock().keys().cloned().collect();
        names.sort();
        names
    }
}

/// Close every pooled connection. Call once at process exit.
pub fn shutdown() {
    match ConnectionManager::instance() {
        Ok(manager) => manager.close_all(),
        Err(e) => debug!("Nothing to shut down: {}", e),
    }
}
