//! A fixed-size pool of clients for a single endpoint configuration.
//!
//! The pool owns exactly `num_connections` client slots. Slots are either
//! ready (holding a connected client) or building (a spawned task driving
//! the client factory, with backoff on failure). Handout is round-robin
//! over the ready clients; callers that arrive before any client is ready
//! park on a oneshot waiter completed by the first build result.

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::client::{KvClient, KvClientConfig};
use crate::error::Error;
use crate::Result;

/// Backoff after the second consecutive build failure; the first failure
/// retries immediately.
const INITIAL_BUILD_BACKOFF: Duration = Duration::from_millis(50);
/// Cap on the exponential build backoff.
const MAX_BUILD_BACKOFF: Duration = Duration::from_millis(2500);

/// A client the pool can manage.
///
/// [`KvClient`] is the production implementation; tests supply mocks
/// through the pool's injectable factory.
pub trait ManagedClient: Send + Sync + 'static {
    /// Apply a new configuration to the live client.
    fn reconfigure(&self, config: KvClientConfig) -> impl Future<Output = Result<()>> + Send;

    /// Close the client.
    fn close(&self) -> impl Future<Output = Result<()>> + Send;
}

impl ManagedClient for KvClient {
    fn reconfigure(&self, config: KvClientConfig) -> impl Future<Output = Result<()>> + Send {
        KvClient::reconfigure(self, config)
    }

    fn close(&self) -> impl Future<Output = Result<()>> + Send {
        KvClient::close(self)
    }
}

/// Factory used by the pool to establish clients.
pub type NewKvClientFn<C> = Arc<
    dyn Fn(KvClientConfig) -> Pin<Box<dyn Future<Output = Result<Arc<C>>> + Send>> + Send + Sync,
>;

/// Configuration for a [`KvClientPool`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KvClientPoolConfig {
    /// Number of connections the pool maintains. Must be positive.
    pub num_connections: usize,
    /// Configuration applied to every client.
    pub client_config: KvClientConfig,
}

/// Options for constructing a [`KvClientPool`].
pub struct KvClientPoolOptions<C> {
    /// Factory invoked to establish each client.
    pub new_kv_client: Option<NewKvClientFn<C>>,
}

impl<C> Default for KvClientPoolOptions<C> {
    fn default() -> Self {
        KvClientPoolOptions { new_kv_client: None }
    }
}

struct PoolState<C> {
    config: KvClientPoolConfig,
    ready: Vec<Arc<C>>,
    building: usize,
    build_tasks: Vec<JoinHandle<()>>,
    waiters: VecDeque<oneshot::Sender<Result<Arc<C>>>>,
    last_error: Option<Arc<Error>>,
    closed: bool,
}

struct PoolInner<C> {
    factory: NewKvClientFn<C>,
    state: Mutex<PoolState<C>>,
    next_client: AtomicUsize,
    reconfigure_guard: tokio::sync::Mutex<()>,
}

/// A pool of exactly `num_connections` clients for one endpoint.
pub struct KvClientPool<C: ManagedClient = KvClient> {
    inner: Arc<PoolInner<C>>,
}

impl<C: ManagedClient> std::fmt::Debug for KvClientPool<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KvClientPool").finish()
    }
}

impl<C: ManagedClient> Clone for KvClientPool<C> {
    fn clone(&self) -> Self {
        KvClientPool {
            inner: self.inner.clone(),
        }
    }
}

impl KvClientPool<KvClient> {
    /// Create a pool that establishes real connections with
    /// [`KvClient::connect`].
    pub fn connect(config: KvClientPoolConfig) -> Result<Self> {
        let factory: NewKvClientFn<KvClient> = Arc::new(|config| {
            Box::pin(async move { Ok(Arc::new(KvClient::connect(config).await?)) })
        });
        Self::with_factory(config, factory)
    }
}

impl<C: ManagedClient> KvClientPool<C> {
    /// Create a pool with an injected client factory.
    ///
    /// Returns immediately; connection establishment begins in the
    /// background.
    pub fn new(config: KvClientPoolConfig, options: KvClientPoolOptions<C>) -> Result<Self> {
        let factory = options
            .new_kv_client
            .ok_or_else(|| Error::invalid_argument("a client factory is required"))?;
        Self::with_factory(config, factory)
    }

    fn with_factory(config: KvClientPoolConfig, factory: NewKvClientFn<C>) -> Result<Self> {
        if config.num_connections == 0 {
            return Err(Error::invalid_argument(
                "num_connections must be positive",
            ));
        }

        let num_connections = config.num_connections;
        let inner = Arc::new(PoolInner {
            factory,
            state: Mutex::new(PoolState {
                config,
                ready: Vec::with_capacity(num_connections),
                building: 0,
                build_tasks: Vec::new(),
                waiters: VecDeque::new(),
                last_error: None,
                closed: false,
            }),
            next_client: AtomicUsize::new(0),
            reconfigure_guard: tokio::sync::Mutex::new(()),
        });

        for _ in 0..num_connections {
            spawn_build(&inner);
        }

        Ok(KvClientPool { inner })
    }

    /// Yield a ready client.
    ///
    /// If at least one client is ready it is returned immediately,
    /// selected round-robin. Otherwise the most recent build failure is
    /// surfaced, or the call suspends until the first build completes.
    /// Cancel-safe: dropping the future abandons the wait.
    pub async fn get_client(&self) -> Result<Arc<C>> {
        let receiver = {
            let mut state = self.inner.state.lock().expect("pool mutex poisoned");
            if state.closed {
                return Err(Error::PoolClosed);
            }

            if !state.ready.is_empty() {
                let idx = self.inner.next_client.fetch_add(1, Ordering::Relaxed);
                return Ok(state.ready[idx % state.ready.len()].clone());
            }

            if let Some(err) = &state.last_error {
                return Err(Error::ConnectFailed(err.clone()));
            }

            let (sender, receiver) = oneshot::channel();
            state.waiters.push_back(sender);
            receiver
        };

        receiver.await.map_err(|_| Error::PoolClosed)?
    }

    /// Apply a new pool configuration.
    ///
    /// At most one reconfigure may be in flight. Growing spawns new
    /// builds; shrinking retires surplus clients; a changed client
    /// configuration is pushed to every remaining client.
    pub async fn reconfigure(&self, config: KvClientPoolConfig) -> Result<()> {
        if config.num_connections == 0 {
            return Err(Error::invalid_argument(
                "num_connections must be positive",
            ));
        }

        let _guard = self
            .inner
            .reconfigure_guard
            .try_lock()
            .map_err(|_| Error::ReconfigureInProgress)?;

        let client_config = config.client_config.clone();
        let (retired, deficit, client_config_changed) = {
            let mut state = self.inner.state.lock().expect("pool mutex poisoned");
            if state.closed {
                return Err(Error::PoolClosed);
            }

            let client_config_changed = state.config.client_config != config.client_config;
            state.config = config;

            let mut retired = Vec::new();
            while state.ready.len() > state.config.num_connections {
                // Callers still holding a handout keep their client alive;
                // retirement only removes it from circulation.
                if let Some(client) = state.ready.pop() {
                    retired.push(client);
                }
            }

            let deficit = state
                .config
                .num_connections
                .saturating_sub(state.ready.len() + state.building);

            (retired, deficit, client_config_changed)
        };

        for _ in 0..deficit {
            spawn_build(&self.inner);
        }

        for client in retired {
            debug!("retiring surplus pool client");
            let _ = client.close().await;
        }

        if client_config_changed {
            let clients = {
                let state = self.inner.state.lock().expect("pool mutex poisoned");
                state.ready.clone()
            };

            for client in clients {
                if let Err(e) = client.reconfigure(client_config.clone()).await {
                    warn!("client rejected new configuration, replacing it: {}", e);
                    {
                        let mut state = self.inner.state.lock().expect("pool mutex poisoned");
                        state.ready.retain(|c| !Arc::ptr_eq(c, &client));
                    }
                    let _ = client.close().await;
                    spawn_build(&self.inner);
                }
            }
        }

        Ok(())
    }

    /// Close the pool and all of its clients.
    ///
    /// Idempotent. Parked `get_client` callers receive
    /// [`Error::PoolClosed`].
    pub async fn close(&self) -> Result<()> {
        let (clients, waiters, build_tasks) = {
            let mut state = self.inner.state.lock().expect("pool mutex poisoned");
            if state.closed {
                return Ok(());
            }
            state.closed = true;

            (
                std::mem::take(&mut state.ready),
                state.waiters.drain(..).collect::<Vec<_>>(),
                std::mem::take(&mut state.build_tasks),
            )
        };

        for task in build_tasks {
            task.abort();
        }
        for waiter in waiters {
            let _ = waiter.send(Err(Error::PoolClosed));
        }
        for client in clients {
            let _ = client.close().await;
        }

        Ok(())
    }
}

fn spawn_build<C: ManagedClient>(inner: &Arc<PoolInner<C>>) {
    {
        let mut state = inner.state.lock().expect("pool mutex poisoned");
        if state.closed {
            return;
        }
        state.building += 1;
    }

    let task_inner = inner.clone();
    let handle = tokio::spawn(build_loop(task_inner));
    inner
        .state
        .lock()
        .expect("pool mutex poisoned")
        .build_tasks
        .push(handle);
}

async fn build_loop<C: ManagedClient>(inner: Arc<PoolInner<C>>) {
    let mut backoff: Option<Duration> = None;

    loop {
        let config = {
            let mut state = inner.state.lock().expect("pool mutex poisoned");
            if state.closed {
                state.building -= 1;
                return;
            }
            state.config.client_config.clone()
        };

        match (inner.factory)(config).await {
            Ok(client) => {
                let waiters = {
                    let mut state = inner.state.lock().expect("pool mutex poisoned");
                    state.building -= 1;

                    if state.closed || state.ready.len() >= state.config.num_connections {
                        drop(state);
                        tokio::spawn(async move {
                            let _ = client.close().await;
                        });
                        return;
                    }

                    state.ready.push(client.clone());
                    state.last_error = None;
                    state.waiters.drain(..).collect::<Vec<_>>()
                };

                debug!("pool client ready");
                for waiter in waiters {
                    // A send failure means the caller gave up waiting.
                    let _ = waiter.send(Ok(client.clone()));
                }
                return;
            }
            Err(e) => {
                let err = Arc::new(e);
                let waiters = {
                    let mut state = inner.state.lock().expect("pool mutex poisoned");
                    state.last_error = Some(err.clone());
                    if state.closed {
                        state.building -= 1;
                        return;
                    }
                    state.waiters.drain(..).collect::<Vec<_>>()
                };

                warn!("pool client build failed: {}", err);
                for waiter in waiters {
                    let _ = waiter.send(Err(Error::ConnectFailed(err.clone())));
                }

                match backoff {
                    None => backoff = Some(INITIAL_BUILD_BACKOFF),
                    Some(delay) => {
                        sleep(delay).await;
                        backoff = Some((delay * 2).min(MAX_BUILD_BACKOFF));
                    }
                }
            }
        }
    }
}
