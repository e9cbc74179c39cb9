//! Pool behavior against a mock client factory. No network involved.

use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use opalkv_client::{
    Error, KvClientConfig, KvClientPool, KvClientPoolConfig, KvClientPoolOptions, ManagedClient,
    NewKvClientFn, PasswordAuthenticator, Result,
};

#[derive(Default, Debug)]
struct MockKvClient {
    reconfigures: AtomicU32,
    closes: AtomicU32,
}

impl ManagedClient for MockKvClient {
    fn reconfigure(&self, _config: KvClientConfig) -> impl Future<Output = Result<()>> + Send {
        self.reconfigures.fetch_add(1, Ordering::SeqCst);
        async { Ok(()) }
    }

    fn close(&self) -> impl Future<Output = Result<()>> + Send {
        self.closes.fetch_add(1, Ordering::SeqCst);
        async { Ok(()) }
    }
}

fn client_config() -> KvClientConfig {
    KvClientConfig {
        address: "endpoint1".to_string(),
        tls_config: None,
        selected_bucket: Some("test".to_string()),
        authenticator: Some(PasswordAuthenticator {
            username: "username".to_string(),
            password: "password".to_string(),
        }),
    }
}

fn fixed_client_factory(mock: Arc<MockKvClient>) -> NewKvClientFn<MockKvClient> {
    let expected = client_config();
    Arc::new(move |config| {
        assert_eq!(config, expected);
        let mock = mock.clone();
        Box::pin(async move { Ok(mock) })
    })
}

async fn wait_for(mut condition: impl FnMut() -> bool, deadline: Duration) -> bool {
    let start = tokio::time::Instant::now();
    while start.elapsed() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    condition()
}

#[tokio::test]
async fn test_get_client() {
    let mock = Arc::new(MockKvClient::default());
    let pool = KvClientPool::new(
        KvClientPoolConfig {
            num_connections: 1,
            client_config: client_config(),
        },
        KvClientPoolOptions {
            new_kv_client: Some(fixed_client_factory(mock.clone())),
        },
    )
    .unwrap();

    // Done twice to exercise both the parked-waiter path and the
    // ready-client fast path.
    let cli = pool.get_client().await.unwrap();
    assert!(Arc::ptr_eq(&cli, &mock));

    let cli = pool.get_client().await.unwrap();
    assert!(Arc::ptr_eq(&cli, &mock));
}

#[tokio::test]
async fn test_get_client_concurrent() {
    let mock = Arc::new(MockKvClient::default());
    let pool = KvClientPool::new(
        KvClientPoolConfig {
            num_connections: 1,
            client_config: client_config(),
        },
        KvClientPoolOptions {
            new_kv_client: Some(fixed_client_factory(mock.clone())),
        },
    )
    .unwrap();

    let mut handles = Vec::new();
    for _ in 0..50 {
        let pool = pool.clone();
        let mock = mock.clone();
        handles.push(tokio::spawn(async move {
            let cli = pool.get_client().await.unwrap();
            assert!(Arc::ptr_eq(&cli, &mock));
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }
}

#[tokio::test]
async fn test_creates_configured_number_of_connections() {
    let called = Arc::new(AtomicU32::new(0));
    let factory_called = called.clone();
    let expected = client_config();
    let factory: NewKvClientFn<MockKvClient> = Arc::new(move |config| {
        assert_eq!(config, expected);
        factory_called.fetch_add(1, Ordering::SeqCst);
        Box::pin(async move { Ok(Arc::new(MockKvClient::default())) })
    });

    let pool = KvClientPool::new(
        KvClientPoolConfig {
            num_connections: 5,
            client_config: client_config(),
        },
        KvClientPoolOptions {
            new_kv_client: Some(factory),
        },
    )
    .unwrap();

    // This should basically be instant.
    assert!(
        wait_for(
            || called.load(Ordering::SeqCst) == 5,
            Duration::from_millis(50)
        )
        .await
    );

    pool.get_client().await.unwrap();

    // The factory is not invoked again once every slot is filled.
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(called.load(Ordering::SeqCst), 5);
}

#[tokio::test]
async fn test_factory_failure_surfaces_to_get_client() {
    let factory: NewKvClientFn<MockKvClient> =
        Arc::new(|_config| Box::pin(async { Err(Error::connection("connect failure")) }));

    let pool = KvClientPool::new(
        KvClientPoolConfig {
            num_connections: 1,
            client_config: client_config(),
        },
        KvClientPoolOptions {
            new_kv_client: Some(factory),
        },
    )
    .unwrap();

    let err = pool.get_client().await.unwrap_err();
    match err {
        Error::ConnectFailed(cause) => {
            assert_eq!(cause.to_string(), "connection error: connect failure");
        }
        other => panic!("unexpected error: {other:?}"),
    }

    // Repeated calls keep reporting the underlying error while the build
    // keeps failing.
    let err = pool.get_client().await.unwrap_err();
    assert!(matches!(err, Error::ConnectFailed(_)));
}

#[tokio::test]
async fn test_reconfigure_shrink() {
    let mock = Arc::new(MockKvClient::default());
    let pool = KvClientPool::new(
        KvClientPoolConfig {
            num_connections: 3,
            client_config: client_config(),
        },
        KvClientPoolOptions {
            new_kv_client: Some(fixed_client_factory(mock.clone())),
        },
    )
    .unwrap();

    let cli = pool.get_client().await.unwrap();
    assert!(Arc::ptr_eq(&cli, &mock));

    pool.reconfigure(KvClientPoolConfig {
        num_connections: 1,
        client_config: client_config(),
    })
    .await
    .unwrap();

    let cli = pool.get_client().await.unwrap();
    assert!(Arc::ptr_eq(&cli, &mock));
}

#[tokio::test]
async fn test_reconfigure_grow_spawns_new_builds() {
    let called = Arc::new(AtomicU32::new(0));
    let factory_called = called.clone();
    let factory: NewKvClientFn<MockKvClient> = Arc::new(move |_config| {
        factory_called.fetch_add(1, Ordering::SeqCst);
        Box::pin(async move { Ok(Arc::new(MockKvClient::default())) })
    });

    let pool = KvClientPool::new(
        KvClientPoolConfig {
            num_connections: 1,
            client_config: client_config(),
        },
        KvClientPoolOptions {
            new_kv_client: Some(factory),
        },
    )
    .unwrap();

    assert!(
        wait_for(
            || called.load(Ordering::SeqCst) == 1,
            Duration::from_millis(50)
        )
        .await
    );

    pool.reconfigure(KvClientPoolConfig {
        num_connections: 4,
        client_config: client_config(),
    })
    .await
    .unwrap();

    assert!(
        wait_for(
            || called.load(Ordering::SeqCst) == 4,
            Duration::from_millis(100)
        )
        .await
    );
}

#[tokio::test]
async fn test_reconfigure_pushes_client_config() {
    let mock = Arc::new(MockKvClient::default());
    let pool = KvClientPool::new(
        KvClientPoolConfig {
            num_connections: 1,
            client_config: client_config(),
        },
        KvClientPoolOptions {
            new_kv_client: Some(fixed_client_factory(mock.clone())),
        },
    )
    .unwrap();

    pool.get_client().await.unwrap();

    let mut new_client_config = client_config();
    new_client_config.selected_bucket = Some("other".to_string());
    pool.reconfigure(KvClientPoolConfig {
        num_connections: 1,
        client_config: new_client_config,
    })
    .await
    .unwrap();

    assert_eq!(mock.reconfigures.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_close_fails_parked_waiters() {
    // A factory that never completes keeps callers parked.
    let factory: NewKvClientFn<MockKvClient> = Arc::new(|_config| {
        Box::pin(async {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(Arc::new(MockKvClient::default()))
        })
    });

    let pool = KvClientPool::new(
        KvClientPoolConfig {
            num_connections: 1,
            client_config: client_config(),
        },
        KvClientPoolOptions {
            new_kv_client: Some(factory),
        },
    )
    .unwrap();

    let waiter_pool = pool.clone();
    let waiter = tokio::spawn(async move { waiter_pool.get_client().await });

    tokio::time::sleep(Duration::from_millis(20)).await;
    pool.close().await.unwrap();

    let err = waiter.await.unwrap().unwrap_err();
    assert!(matches!(err, Error::PoolClosed));

    let err = pool.get_client().await.unwrap_err();
    assert!(matches!(err, Error::PoolClosed));

    // Idempotent.
    pool.close().await.unwrap();
}

#[tokio::test]
async fn test_close_closes_ready_clients() {
    let mock = Arc::new(MockKvClient::default());
    let pool = KvClientPool::new(
        KvClientPoolConfig {
            num_connections: 1,
            client_config: client_config(),
        },
        KvClientPoolOptions {
            new_kv_client: Some(fixed_client_factory(mock.clone())),
        },
    )
    .unwrap();

    pool.get_client().await.unwrap();
    pool.close().await.unwrap();

    assert_eq!(mock.closes.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_zero_connections_rejected() {
    let factory: NewKvClientFn<MockKvClient> =
        Arc::new(|_config| Box::pin(async { Ok(Arc::new(MockKvClient::default())) }));

    let err = KvClientPool::new(
        KvClientPoolConfig {
            num_connections: 0,
            client_config: client_config(),
        },
        KvClientPoolOptions {
            new_kv_client: Some(factory),
        },
    )
    .unwrap_err();
    assert!(matches!(err, Error::InvalidArgument(_)));
}
