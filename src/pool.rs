//! Connection pool (C6).
//!
//! The only process-wide shared state in this service (§5, §4.6): bounds
//! concurrent sessions, rate-limits new admissions, heartbeats live
//! connections, and prunes dead or idle ones. Generalized from
//! `src/server/device.rs`'s `RwLock<HashMap<...>>` registry pattern.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{debug, info, warn};

const RATE_LIMIT_WINDOW: Duration = Duration::from_millis(1000);
const RATE_LIMIT_MAX: usize = 10;
const ADMISSION_HISTORY_RETENTION: Duration = Duration::from_secs(5 * 60);
const CONNECTIONS_PER_SEC_WINDOW: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub max_connections: usize,
    pub heartbeat_interval: Duration,
    pub connection_timeout: Duration,
    pub resource_cleanup_interval: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: 100,
            heartbeat_interval: Duration::from_secs(30),
            connection_timeout: Duration::from_secs(60),
            resource_cleanup_interval: Duration::from_secs(60),
        }
    }
}

/// A pooled connection's metadata (§3). The socket itself lives with the
/// session supervisor task; the pool tracks liveness and activity only.
struct PooledConnection {
    created_at: Instant,
    last_activity_at: Instant,
    is_alive: bool,
    awaiting_pong: bool,
    session_id: Option<String>,
    ping_tx: tokio::sync::mpsc::UnboundedSender<PoolSignal>,
}

/// Signals the pool sends to a connection's owning task.
#[derive(Debug, Clone, Copy)]
pub enum PoolSignal {
    Ping,
    Close,
}

#[derive(Debug, Default)]
struct PoolMetrics {
    total_connections: AtomicU64,
    max_concurrent: AtomicU64,
    failed_connections: AtomicU64,
}

#[derive(Debug, Clone, Default)]
pub struct PoolMetricsSnapshot {
    pub total_connections: u64,
    pub active: u64,
    pub max_concurrent: u64,
    pub connections_per_sec: f64,
    pub average_connection_duration_secs: f64,
    pub failed_connections: u64,
}

struct AdmissionLog {
    timestamps: VecDeque<Instant>,
    /// Completed connection durations, retained only for the 60s
    /// connections/sec window and the running average.
    closed_durations: VecDeque<(Instant, Duration)>,
}

impl AdmissionLog {
    fn new() -> Self {
        Self { timestamps: VecDeque::new(), closed_durations: VecDeque::new() }
    }
}

/// Bounds concurrent client sessions (C6). Cloned handles share the same
/// underlying state; all mutating operations take the pool's lock.
#[derive(Clone)]
pub struct ConnectionPool {
    config: PoolConfig,
    connections: Arc<RwLock<HashMap<String, PooledConnection>>>,
    admissions: Arc<RwLock<AdmissionLog>>,
    metrics: Arc<PoolMetrics>,
}

#[derive(Debug, PartialEq, Eq)]
pub enum AdmitError {
    /// Pool is at `maxConnections`.
    Full,
    /// More than `RATE_LIMIT_MAX` admissions within `RATE_LIMIT_WINDOW`.
    RateLimited,
}

impl ConnectionPool {
    pub fn new(config: PoolConfig) -> Self {
        Self {
            config,
            connections: Arc::new(RwLock::new(HashMap::new())),
            admissions: Arc::new(RwLock::new(AdmissionLog::new())),
            metrics: Arc::new(PoolMetrics::default()),
        }
    }

    /// Attempt to admit a new connection. Enforces `maxConnections` (§8
    /// property 7) and the rolling-window rate limit (§8 property 8).
    pub async fn admit(
        &self,
        id: String,
        ping_tx: tokio::sync::mpsc::UnboundedSender<PoolSignal>,
    ) -> Result<(), AdmitError> {
        let now = Instant::now();
        {
            let connections = self.connections.read().await;
            if connections.len() >= self.config.max_connections {
                self.metrics.failed_connections.fetch_add(1, Ordering::Relaxed);
                return Err(AdmitError::Full);
            }
        }
        {
            let mut admissions = self.admissions.write().await;
            prune_admission_timestamps(&mut admissions.timestamps, now);
            let recent = admissions
                .timestamps
                .iter()
                .filter(|t| now.duration_since(**t) < RATE_LIMIT_WINDOW)
                .count();
            if recent >= RATE_LIMIT_MAX {
                self.metrics.failed_connections.fetch_add(1, Ordering::Relaxed);
                return Err(AdmitError::RateLimited);
            }
            admissions.timestamps.push_back(now);
        }

        let mut connections = self.connections.write().await;
        connections.insert(
            id,
            PooledConnection {
                created_at: now,
                last_activity_at: now,
                is_alive: true,
                awaiting_pong: false,
                session_id: None,
                ping_tx,
            },
        );
        drop(connections);

        self.metrics.total_connections.fetch_add(1, Ordering::Relaxed);
        let active = self.connections.read().await.len() as u64;
        self.metrics.max_concurrent.fetch_max(active, Ordering::Relaxed);
        Ok(())
    }

    /// Record a `session.start` binding a pooled connection to its session id.
    pub async fn bind_session(&self, id: &str, session_id: String) {
        if let Some(conn) = self.connections.write().await.get_mut(id) {
            conn.session_id = Some(session_id);
        }
    }

    /// Update `lastActivityAt` — called on every inbound frame.
    pub async fn touch(&self, id: &str) {
        if let Some(conn) = self.connections.write().await.get_mut(id) {
            conn.last_activity_at = Instant::now();
        }
    }

    /// Mark a connection's pong received, clearing its liveness flag.
    pub async fn mark_pong(&self, id: &str) {
        if let Some(conn) = self.connections.write().await.get_mut(id) {
            conn.is_alive = true;
            conn.awaiting_pong = false;
        }
    }

    pub async fn remove(&self, id: &str) {
        let mut connections = self.connections.write().await;
        if let Some(conn) = connections.remove(id) {
            let duration = conn.created_at.elapsed();
            drop(connections);
            let mut admissions = self.admissions.write().await;
            let now = Instant::now();
            admissions.closed_durations.push_back((now, duration));
            prune_closed_durations(&mut admissions.closed_durations, now);
        }
    }

    pub async fn active_count(&self) -> usize {
        self.connections.read().await.len()
    }

    /// One heartbeat tick (§4.6): ping connections that answered last time,
    /// remove ones that didn't or that have gone idle past `connectionTimeout`.
    pub async fn heartbeat_tick(&self) {
        let now = Instant::now();
        let mut to_remove = Vec::new();
        let mut to_ping = Vec::new();
        {
            let connections = self.connections.read().await;
            for (id, conn) in connections.iter() {
                let idle = now.duration_since(conn.last_activity_at);
                if conn.awaiting_pong || idle > self.config.connection_timeout {
                    to_remove.push(id.clone());
                } else {
                    to_ping.push(id.clone());
                }
            }
        }

        for id in &to_remove {
            warn!(connection_id = %id, "heartbeat: removing dead connection");
            if let Some(conn) = self.connections.write().await.get(id) {
                let _ = conn.ping_tx.send(PoolSignal::Close);
            }
            self.remove(id).await;
        }

        let mut connections = self.connections.write().await;
        for id in &to_ping {
            if let Some(conn) = connections.get_mut(id) {
                conn.is_alive = false;
                conn.awaiting_pong = true;
                let _ = conn.ping_tx.send(PoolSignal::Ping);
            }
        }
    }

    /// Periodic prune of stale admission timestamps (§4.6).
    pub async fn cleanup_tick(&self) {
        let now = Instant::now();
        let mut admissions = self.admissions.write().await;
        prune_admission_timestamps(&mut admissions.timestamps, now);
        prune_closed_durations(&mut admissions.closed_durations, now);
    }

    /// Close every connection with code 1001 and clear pool state (§4.6,
    /// §6 graceful-shutdown contract).
    pub async fn shutdown(&self) {
        info!("pool shutdown: closing all connections");
        let mut connections = self.connections.write().await;
        for conn in connections.values() {
            let _ = conn.ping_tx.send(PoolSignal::Close);
        }
        connections.clear();
    }

    pub async fn metrics(&self) -> PoolMetricsSnapshot {
        let now = Instant::now();
        let connections = self.connections.read().await;
        let active = connections.len() as u64;
        drop(connections);

        let admissions = self.admissions.read().await;
        let connections_per_sec = admissions
            .timestamps
            .iter()
            .filter(|t| now.duration_since(**t) < CONNECTIONS_PER_SEC_WINDOW)
            .count() as f64
            / CONNECTIONS_PER_SEC_WINDOW.as_secs_f64();

        let recent_durations: Vec<Duration> = admissions
            .closed_durations
            .iter()
            .filter(|(t, _)| now.duration_since(*t) < CONNECTIONS_PER_SEC_WINDOW)
            .map(|(_, d)| *d)
            .collect();
        let average_connection_duration_secs = if recent_durations.is_empty() {
            0.0
        } else {
            recent_durations.iter().map(Duration::as_secs_f64).sum::<f64>()
                / recent_durations.len() as f64
        };

        PoolMetricsSnapshot {
            total_connections: self.metrics.total_connections.load(Ordering::Relaxed),
            active,
            max_concurrent: self.metrics.max_concurrent.load(Ordering::Relaxed),
            connections_per_sec,
            average_connection_duration_secs,
            failed_connections: self.metrics.failed_connections.load(Ordering::Relaxed),
        }
    }

    /// Spawn the background heartbeat and cleanup ticks. Returns a handle
    /// the caller can abort on shutdown.
    pub fn spawn_maintenance(&self) -> tokio::task::JoinHandle<()> {
        let pool = self.clone();
        tokio::spawn(async move {
            let mut heartbeat = tokio::time::interval(pool.config.heartbeat_interval);
            let mut cleanup = tokio::time::interval(pool.config.resource_cleanup_interval);
            loop {
                tokio::select! {
                    _ = heartbeat.tick() => pool.heartbeat_tick().await,
                    _ = cleanup.tick() => pool.cleanup_tick().await,
                }
            }
        })
    }
}

fn prune_admission_timestamps(timestamps: &mut VecDeque<Instant>, now: Instant) {
    while let Some(front) = timestamps.front() {
        if now.duration_since(*front) > ADMISSION_HISTORY_RETENTION {
            timestamps.pop_front();
        } else {
            break;
        }
    }
}

fn prune_closed_durations(durations: &mut VecDeque<(Instant, Duration)>, now: Instant) {
    while let Some((t, _)) = durations.front() {
        if now.duration_since(*t) > CONNECTIONS_PER_SEC_WINDOW {
            durations.pop_front();
        } else {
            break;
        }
    }
}
