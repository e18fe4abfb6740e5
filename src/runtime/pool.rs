/// Outbound connection pool
///
/// Two kinds of reusable transport:
/// - HTTP: one keep-alive `reqwest::Client` per `scheme://host:port`, created
///   lazily, with at most `max_connections` requests in flight per origin
/// - Database: logical handles opened through a `DbConnector`, bounded by the
///   configured maximum, with a FIFO wait list for callers beyond it
///
/// A released database handle, or the slot of a failed open, goes straight to
/// the longest-waiting caller when there is one, so a newcomer can never steal
/// it. Whatever reaches a caller that has already given up is passed on.
/// A periodic sweep closes idle transports but keeps a warm floor of half the
/// configured maximum.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use sqlx::{Connection, SqliteConnection};
use std::collections::{HashMap, HashSet, VecDeque};
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{oneshot, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::{DatabasePoolConfig, HttpPoolConfig, PoolConfig};
use crate::error::{Result, RuntimeError};
use crate::runtime::events::{EventBus, RuntimeEvent};

const SAMPLE_BUFFER: usize = 100;

/// Fixed-size buffer of recent durations in milliseconds
#[derive(Debug, Default)]
struct Samples(VecDeque<u64>);

impl Samples {
    fn record(&mut self, value: Duration) {
        if self.0.len() == SAMPLE_BUFFER {
            self.0.pop_front();
        }
        self.0.push_back(value.as_millis() as u64);
    }

    fn average(&self) -> f64 {
        if self.0.is_empty() {
            0.0
        } else {
            self.0.iter().sum::<u64>() as f64 / self.0.len() as f64
        }
    }
}

// ---------------------------------------------------------------------------
// HTTP agents
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct HttpAgent {
    client: reqwest::Client,
    /// One permit per concurrent request to this origin
    slots: Arc<Semaphore>,
    total_requests: u64,
    last_used: Instant,
}

impl HttpAgent {
    fn active_requests(&self, max_connections: usize) -> usize {
        max_connections.saturating_sub(self.slots.available_permits())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HttpPoolMetrics {
    pub agents: usize,
    pub active_requests: usize,
    pub total_requests: u64,
    pub average_response_ms: f64,
}

/// One in-flight request slot on an origin's client
///
/// The slot is freed when the lease is dropped; hand it to
/// `release_http_connection` to also record the response time.
#[derive(Debug)]
pub struct HttpLease {
    origin: String,
    client: reqwest::Client,
    _permit: OwnedSemaphorePermit,
}

impl HttpLease {
    pub fn client(&self) -> &reqwest::Client {
        &self.client
    }

    pub fn origin(&self) -> &str {
        &self.origin
    }
}

/// Keep-alive HTTP clients keyed by origin, each capped at `max_connections`
/// concurrent requests
#[derive(Debug)]
pub struct HttpAgentPool {
    config: HttpPoolConfig,
    agents: Mutex<HashMap<String, HttpAgent>>,
    response_times: Mutex<Samples>,
    events: EventBus,
}

/// `scheme://host:port` of a URL, with the scheme's default port filled in
pub fn origin_of(url: &str) -> Result<String> {
    let parsed = reqwest::Url::parse(url)
        .map_err(|e| RuntimeError::Pool(format!("invalid url '{}': {}", url, e)))?;
    let host = parsed
        .host_str()
        .ok_or_else(|| RuntimeError::Pool(format!("url '{}' has no host", url)))?;
    let port = parsed
        .port_or_known_default()
        .ok_or_else(|| RuntimeError::Pool(format!("url '{}' has no known port", url)))?;
    Ok(format!("{}://{}:{}", parsed.scheme(), host, port))
}

impl HttpAgentPool {
    pub fn new(config: HttpPoolConfig, events: EventBus) -> Self {
        Self {
            config,
            agents: Mutex::new(HashMap::new()),
            response_times: Mutex::new(Samples::default()),
            events,
        }
    }

    fn build_client(&self) -> Result<reqwest::Client> {
        let idle_per_host = if self.config.keep_alive {
            self.config.max_connections
        } else {
            0
        };
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(self.config.timeout_ms))
            .pool_max_idle_per_host(idle_per_host)
            .pool_idle_timeout(Duration::from_millis(self.config.keep_alive_timeout_ms))
            .build()?;
        Ok(client)
    }

    /// Client and semaphore for an origin, creating the agent on first use
    fn agent_for(&self, origin: &str) -> Result<(reqwest::Client, Arc<Semaphore>)> {
        let mut agents = self.agents.lock();
        if let Some(agent) = agents.get(origin) {
            return Ok((agent.client.clone(), agent.slots.clone()));
        }

        let agent = HttpAgent {
            client: self.build_client()?,
            slots: Arc::new(Semaphore::new(self.config.max_connections)),
            total_requests: 0,
            last_used: Instant::now(),
        };
        let handles = (agent.client.clone(), agent.slots.clone());
        agents.insert(origin.to_string(), agent);
        drop(agents);

        tracing::debug!("🌐 Created HTTP agent for {}", origin);
        self.events.emit(RuntimeEvent::HttpAgentCreated { origin: origin.to_string() });
        Ok(handles)
    }

    /// Request slot on the URL's origin, waiting up to the request timeout
    /// when `max_connections` requests are already in flight there
    pub async fn get_http_agent(&self, url: &str) -> Result<HttpLease> {
        let origin = origin_of(url)?;
        let (client, slots) = self.agent_for(&origin)?;

        let limit = Duration::from_millis(self.config.timeout_ms);
        let permit = match tokio::time::timeout(limit, slots.acquire_owned()).await {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => return Err(RuntimeError::Pool(format!("agent for {} was closed", origin))),
            Err(_) => {
                tracing::warn!("⏳ Timed out after {:?} waiting for an HTTP slot on {}", limit, origin);
                return Err(RuntimeError::PoolTimeout {
                    waited_ms: self.config.timeout_ms,
                });
            }
        };

        if let Some(agent) = self.agents.lock().get_mut(&origin) {
            agent.total_requests += 1;
            agent.last_used = Instant::now();
        }
        Ok(HttpLease {
            origin,
            client,
            _permit: permit,
        })
    }

    /// Finish a request started with `get_http_agent`
    pub fn release_http_connection(&self, lease: HttpLease, response_time: Duration) {
        if let Some(agent) = self.agents.lock().get_mut(&lease.origin) {
            agent.last_used = Instant::now();
        }
        self.response_times.lock().record(response_time);
        drop(lease);
    }

    /// Close idle agents past the keep-alive timeout, keeping a warm floor
    pub fn sweep_idle(&self) -> usize {
        let idle_timeout = Duration::from_millis(self.config.keep_alive_timeout_ms);
        let max = self.config.max_connections;
        let floor = max / 2;
        let now = Instant::now();

        let closed: Vec<String> = {
            let mut agents = self.agents.lock();
            let mut idle: Vec<(String, Instant)> = agents
                .iter()
                .filter(|(_, a)| a.active_requests(max) == 0 && now.duration_since(a.last_used) > idle_timeout)
                .map(|(origin, a)| (origin.clone(), a.last_used))
                .collect();
            idle.sort_by_key(|(_, last_used)| *last_used);

            let closable = agents.len().saturating_sub(floor);
            idle.into_iter()
                .take(closable)
                .map(|(origin, _)| {
                    agents.remove(&origin);
                    origin
                })
                .collect()
        };

        for origin in &closed {
            tracing::debug!("🔌 Closed idle HTTP agent for {}", origin);
            self.events.emit(RuntimeEvent::HttpAgentClosed { origin: origin.clone() });
        }
        closed.len()
    }

    pub fn metrics(&self) -> HttpPoolMetrics {
        let max = self.config.max_connections;
        let agents = self.agents.lock();
        HttpPoolMetrics {
            agents: agents.len(),
            active_requests: agents.values().map(|a| a.active_requests(max)).sum(),
            total_requests: agents.values().map(|a| a.total_requests).sum(),
            average_response_ms: self.response_times.lock().average(),
        }
    }
}

// ---------------------------------------------------------------------------
// Database handles
// ---------------------------------------------------------------------------

/// Opens and closes the underlying database sessions
#[async_trait]
pub trait DbConnector: Send + Sync + 'static {
    type Connection: Send + 'static;

    async fn connect(&self) -> Result<Self::Connection>;

    async fn close(&self, connection: Self::Connection) -> Result<()>;
}

/// SQLite sessions opened from a sqlx URL
#[derive(Debug, Clone)]
pub struct SqliteConnector {
    url: String,
}

impl SqliteConnector {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

#[async_trait]
impl DbConnector for SqliteConnector {
    type Connection = SqliteConnection;

    async fn connect(&self) -> Result<SqliteConnection> {
        Ok(SqliteConnection::connect(&self.url).await?)
    }

    async fn close(&self, connection: SqliteConnection) -> Result<()> {
        Ok(connection.close().await?)
    }
}

/// A pooled database handle
#[derive(Debug)]
pub struct PooledHandle<T> {
    id: String,
    connection: T,
    last_used: Instant,
    queries_executed: u64,
}

/// What a queued caller is woken with
#[derive(Debug)]
enum Handoff<T> {
    /// A released handle, already counted as in use
    Handle(PooledHandle<T>),
    /// A free opening slot, already counted in `opening`
    Slot,
}

#[derive(Debug)]
struct DbState<T> {
    idle: VecDeque<PooledHandle<T>>,
    in_use: HashSet<String>,
    /// Connections being opened right now; they count against the maximum
    opening: usize,
    waiters: VecDeque<oneshot::Sender<Handoff<T>>>,
    total_created: u64,
    total_closed: u64,
    timeouts: u64,
    query_times: Samples,
}

impl<T> Default for DbState<T> {
    fn default() -> Self {
        Self {
            idle: VecDeque::new(),
            in_use: HashSet::new(),
            opening: 0,
            waiters: VecDeque::new(),
            total_created: 0,
            total_closed: 0,
            timeouts: 0,
            query_times: Samples::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DbPoolMetrics {
    pub idle: usize,
    pub in_use: usize,
    pub opening: usize,
    pub waiting: usize,
    pub total_created: u64,
    pub total_closed: u64,
    pub timeouts: u64,
    pub average_query_ms: f64,
}

/// Bounded pool of database handles with a FIFO wait list
pub struct DatabasePool<C: DbConnector> {
    connector: C,
    config: DatabasePoolConfig,
    state: Mutex<DbState<C::Connection>>,
    events: EventBus,
}

impl<C: DbConnector> std::fmt::Debug for DatabasePool<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DatabasePool")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

enum Acquire<T> {
    Ready(PooledHandle<T>),
    Open,
    Wait(oneshot::Receiver<Handoff<T>>),
}

/// A reserved opening slot; gives the slot up if dropped before `commit`
struct OpenSlot<'a, C: DbConnector> {
    pool: &'a DatabasePool<C>,
    armed: bool,
}

impl<'a, C: DbConnector> OpenSlot<'a, C> {
    fn new(pool: &'a DatabasePool<C>) -> Self {
        Self { pool, armed: true }
    }

    /// Turn the reservation into an in-use handle id
    fn commit(mut self, id: &str) {
        self.armed = false;
        let mut state = self.pool.state.lock();
        state.opening = state.opening.saturating_sub(1);
        state.in_use.insert(id.to_string());
        state.total_created += 1;
    }
}

impl<C: DbConnector> Drop for OpenSlot<'_, C> {
    fn drop(&mut self) {
        if self.armed {
            self.pool.give_up_slot();
        }
    }
}

/// A place in the wait list; anything handed over after the caller stopped
/// listening goes back to the pool
struct WaitTicket<'a, C: DbConnector> {
    pool: &'a DatabasePool<C>,
    rx: oneshot::Receiver<Handoff<C::Connection>>,
}

impl<C: DbConnector> Drop for WaitTicket<'_, C> {
    fn drop(&mut self) {
        self.rx.close();
        match self.rx.try_recv() {
            Ok(Handoff::Handle(handle)) => self.pool.recycle(handle),
            Ok(Handoff::Slot) => self.pool.give_up_slot(),
            Err(_) => {}
        }
    }
}

impl<C: DbConnector> DatabasePool<C> {
    pub fn new(connector: C, config: DatabasePoolConfig, events: EventBus) -> Self {
        Self {
            connector,
            config,
            state: Mutex::new(DbState::default()),
            events,
        }
    }

    /// Idle handle, else a new one under the maximum, else wait in line
    pub async fn acquire_db_connection(self: &Arc<Self>) -> Result<DbLease<C>> {
        let step = {
            let mut state = self.state.lock();
            if let Some(handle) = state.idle.pop_front() {
                state.in_use.insert(handle.id.clone());
                Acquire::Ready(handle)
            } else if state.in_use.len() + state.opening < self.config.max_connections {
                state.opening += 1;
                Acquire::Open
            } else {
                let (tx, rx) = oneshot::channel();
                state.waiters.push_back(tx);
                Acquire::Wait(rx)
            }
        };

        let handle = match step {
            Acquire::Ready(handle) => handle,
            Acquire::Open => self.open(OpenSlot::new(self)).await?,
            Acquire::Wait(rx) => match self.wait(rx).await? {
                Handoff::Handle(handle) => handle,
                Handoff::Slot => self.open(OpenSlot::new(self)).await?,
            },
        };

        Ok(DbLease {
            handle: Some(handle),
            pool: self.clone(),
        })
    }

    async fn open(&self, slot: OpenSlot<'_, C>) -> Result<PooledHandle<C::Connection>> {
        let connection = match self.connector.connect().await {
            Ok(connection) => connection,
            Err(e) => {
                tracing::warn!("⚠️ Failed to open database connection: {}", e);
                return Err(e);
            }
        };

        let id = uuid::Uuid::new_v4().to_string();
        slot.commit(&id);

        tracing::debug!("🗄️ Opened database connection {}", id);
        self.events.emit(RuntimeEvent::DbConnectionCreated { connection_id: id.clone() });
        Ok(PooledHandle {
            id,
            connection,
            last_used: Instant::now(),
            queries_executed: 0,
        })
    }

    async fn wait(&self, rx: oneshot::Receiver<Handoff<C::Connection>>) -> Result<Handoff<C::Connection>> {
        let mut ticket = WaitTicket { pool: self, rx };
        let limit = Duration::from_millis(self.config.connection_timeout_ms);
        match tokio::time::timeout(limit, &mut ticket.rx).await {
            Ok(Ok(handoff)) => Ok(handoff),
            Ok(Err(_)) => Err(RuntimeError::Pool("database pool shut down".into())),
            Err(_) => {
                // Something may have been handed over just as the timer fired
                ticket.rx.close();
                if let Ok(handoff) = ticket.rx.try_recv() {
                    return Ok(handoff);
                }
                self.state.lock().timeouts += 1;
                tracing::warn!("⏳ Timed out after {:?} waiting for a database connection", limit);
                Err(RuntimeError::PoolTimeout {
                    waited_ms: self.config.connection_timeout_ms,
                })
            }
        }
    }

    fn release(&self, mut handle: PooledHandle<C::Connection>, query_time: Duration) {
        handle.last_used = Instant::now();
        handle.queries_executed += 1;
        self.state.lock().query_times.record(query_time);
        self.recycle(handle);
    }

    /// Pass an in-use handle to the longest waiter, else park it idle
    fn recycle(&self, handle: PooledHandle<C::Connection>) {
        let mut state = self.state.lock();
        let mut handoff = Handoff::Handle(handle);
        while let Some(waiter) = state.waiters.pop_front() {
            match waiter.send(handoff) {
                Ok(()) => return,
                Err(returned) => handoff = returned,
            }
        }
        if let Handoff::Handle(handle) = handoff {
            state.in_use.remove(&handle.id);
            state.idle.push_back(handle);
        }
    }

    /// Pass a reserved opening slot to the longest waiter, else free it
    fn give_up_slot(&self) {
        let mut state = self.state.lock();
        while let Some(waiter) = state.waiters.pop_front() {
            if waiter.send(Handoff::Slot).is_ok() {
                return;
            }
        }
        state.opening = state.opening.saturating_sub(1);
    }

    /// Close handles idle past the timeout, never dropping below half the maximum
    pub async fn sweep_idle(&self) -> usize {
        let idle_timeout = Duration::from_millis(self.config.idle_timeout_ms);
        let floor = self.config.max_connections / 2;
        let now = Instant::now();

        let stale: Vec<PooledHandle<C::Connection>> = {
            let mut state = self.state.lock();
            let mut closable = (state.idle.len() + state.in_use.len()).saturating_sub(floor);
            let mut keep = VecDeque::with_capacity(state.idle.len());
            let mut stale = Vec::new();
            while let Some(handle) = state.idle.pop_front() {
                if closable > 0 && now.duration_since(handle.last_used) > idle_timeout {
                    closable -= 1;
                    stale.push(handle);
                } else {
                    keep.push_back(handle);
                }
            }
            state.idle = keep;
            state.total_closed += stale.len() as u64;
            stale
        };

        let closed = stale.len();
        for handle in stale {
            let id = handle.id;
            if let Err(e) = self.connector.close(handle.connection).await {
                tracing::warn!("⚠️ Error closing database connection {}: {}", id, e);
            }
            tracing::debug!("🔌 Closed idle database connection {}", id);
            self.events.emit(RuntimeEvent::DbConnectionClosed { connection_id: id });
        }
        closed
    }

    /// Close every idle handle and fail every waiter
    pub async fn close_all(&self) {
        let (idle, waiters) = {
            let mut state = self.state.lock();
            state.total_closed += state.idle.len() as u64;
            (std::mem::take(&mut state.idle), std::mem::take(&mut state.waiters))
        };
        drop(waiters);
        for handle in idle {
            let id = handle.id;
            let _ = self.connector.close(handle.connection).await;
            self.events.emit(RuntimeEvent::DbConnectionClosed { connection_id: id });
        }
    }

    pub fn metrics(&self) -> DbPoolMetrics {
        let state = self.state.lock();
        DbPoolMetrics {
            idle: state.idle.len(),
            in_use: state.in_use.len(),
            opening: state.opening,
            waiting: state.waiters.iter().filter(|w| !w.is_closed()).count(),
            total_created: state.total_created,
            total_closed: state.total_closed,
            timeouts: state.timeouts,
            average_query_ms: state.query_times.average(),
        }
    }
}

/// Exclusive use of one database handle; returned to the pool on release or drop
pub struct DbLease<C: DbConnector> {
    handle: Option<PooledHandle<C::Connection>>,
    pool: Arc<DatabasePool<C>>,
}

impl<C: DbConnector> DbLease<C> {
    pub fn id(&self) -> &str {
        self.handle.as_ref().map(|h| h.id.as_str()).unwrap_or_default()
    }

    pub fn queries_executed(&self) -> u64 {
        self.handle.as_ref().map(|h| h.queries_executed).unwrap_or(0)
    }

    /// Give the handle back, recording how long the work took
    pub fn release(mut self, query_time: Duration) {
        if let Some(handle) = self.handle.take() {
            self.pool.release(handle, query_time);
        }
    }
}

impl<C: DbConnector> std::fmt::Debug for DbLease<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DbLease").field("id", &self.id()).finish_non_exhaustive()
    }
}

impl<C: DbConnector> Deref for DbLease<C> {
    type Target = C::Connection;

    fn deref(&self) -> &Self::Target {
        match &self.handle {
            Some(handle) => &handle.connection,
            None => unreachable!("lease used after release"),
        }
    }
}

impl<C: DbConnector> DerefMut for DbLease<C> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        match &mut self.handle {
            Some(handle) => &mut handle.connection,
            None => unreachable!("lease used after release"),
        }
    }
}

impl<C: DbConnector> Drop for DbLease<C> {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            self.pool.release(handle, Duration::ZERO);
        }
    }
}

// ---------------------------------------------------------------------------
// Combined pool
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct PoolMetrics {
    pub http: HttpPoolMetrics,
    pub database: DbPoolMetrics,
}

/// HTTP agents plus SQLite handles, owned by one runtime
#[derive(Debug)]
pub struct ConnectionPool {
    config: PoolConfig,
    http: HttpAgentPool,
    database: Arc<DatabasePool<SqliteConnector>>,
}

impl ConnectionPool {
    pub fn new(config: PoolConfig, events: EventBus) -> Self {
        let connector = SqliteConnector::new(config.database.url.clone());
        Self {
            http: HttpAgentPool::new(config.http.clone(), events.clone()),
            database: Arc::new(DatabasePool::new(connector, config.database.clone(), events)),
            config,
        }
    }

    pub fn http(&self) -> &HttpAgentPool {
        &self.http
    }

    pub fn database(&self) -> &Arc<DatabasePool<SqliteConnector>> {
        &self.database
    }

    pub async fn get_http_agent(&self, url: &str) -> Result<HttpLease> {
        self.http.get_http_agent(url).await
    }

    pub fn release_http_connection(&self, lease: HttpLease, response_time: Duration) {
        self.http.release_http_connection(lease, response_time)
    }

    pub async fn acquire_db_connection(&self) -> Result<DbLease<SqliteConnector>> {
        self.database.acquire_db_connection().await
    }

    pub async fn sweep_idle(&self) -> usize {
        self.http.sweep_idle() + self.database.sweep_idle().await
    }

    pub async fn shutdown(&self) {
        self.database.close_all().await;
        tracing::info!("🔌 Connection pool closed");
    }

    pub fn metrics(&self) -> PoolMetrics {
        PoolMetrics {
            http: self.http.metrics(),
            database: self.database.metrics(),
        }
    }

    /// Periodic idle sweep until cancelled or dropped
    pub fn spawn_sweeper(self: &Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        let pool: Weak<Self> = Arc::downgrade(self);
        let period = Duration::from_millis(self.config.sweep_interval_ms);

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let Some(pool) = pool.upgrade() else { break };
                        let closed = pool.sweep_idle().await;
                        if closed > 0 {
                            tracing::debug!("🧽 Pool sweep closed {} idle transports", closed);
                        }
                    }
                    _ = shutdown.cancelled() => break,
                }
            }
        })
    }
}
