//! Transactional scope tests against the in-memory connector.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use std::time::Duration;

use lifespan::{
    AcquireOptions, Error, ResourceConfig, ResourceManager, build, with_transaction,
};
use lifespan_testing::{MockConnection, MockConnector, MockFactory, fixtures};
use tokio_util::sync::CancellationToken;

async fn ready_manager(
    factory: &MockFactory,
    config: ResourceConfig,
) -> ResourceManager<MockConnector> {
    let manager = ResourceManager::new("db", config.clone());
    let pool = build(factory, &config).await.expect("pool should build");
    manager.initialize(pool).await.expect("manager should initialize");
    manager
}

async fn settle() {
    for _ in 0..3 {
        tokio::task::yield_now().await;
    }
}

/// Commands after the startup health check.
fn session(conn: &MockConnection) -> Vec<&str> {
    conn.executed()
        .iter()
        .skip(1)
        .map(String::as_str)
        .collect()
}

#[derive(Debug)]
enum AppError {
    Lifespan(Error),
    OutOfStock,
}

impl From<Error> for AppError {
    fn from(e: Error) -> Self {
        Self::Lifespan(e)
    }
}

// =============================================================================
// Commit and Rollback
// =============================================================================

#[tokio::test]
async fn test_successful_body_commits() {
    let factory = MockFactory::new();
    let manager = ready_manager(&factory, fixtures::resource_config(2)).await;

    let rows = with_transaction(&manager, AcquireOptions::new(), |conn| {
        Box::pin(async move {
            conn.execute("INSERT INTO orders").await;
            Ok::<_, Error>(1)
        })
    })
    .await
    .unwrap();
    assert_eq!(rows, 1);
    assert_eq!(manager.in_flight(), 0);

    let handle = manager.acquire(AcquireOptions::new()).await.unwrap();
    assert_eq!(
        session(handle.connection().unwrap()),
        ["BEGIN", "INSERT INTO orders", "COMMIT"]
    );
    assert_eq!(factory.mock().opened(), 1, "the connection went back to the pool");
}

#[tokio::test]
async fn test_failing_body_rolls_back() {
    let factory = MockFactory::new();
    let manager = ready_manager(&factory, fixtures::resource_config(2)).await;

    let err = manager
        .with_transaction(AcquireOptions::new(), |conn| {
            Box::pin(async move {
                conn.execute("UPDATE stock").await;
                Err::<(), _>(AppError::OutOfStock)
            })
        })
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::OutOfStock));

    let handle = manager.acquire(AcquireOptions::new()).await.unwrap();
    assert_eq!(
        session(handle.connection().unwrap()),
        ["BEGIN", "UPDATE stock", "ROLLBACK"]
    );
    assert_eq!(factory.mock().closed(), 0);
}

#[tokio::test]
async fn test_failed_commit_closes_connection() {
    let factory = MockFactory::new();
    let manager = ready_manager(&factory, fixtures::resource_config(2)).await;

    let err = with_transaction(&manager, AcquireOptions::new(), |conn| {
        Box::pin(async move {
            conn.execute("INSERT INTO orders").await;
            conn.fail_next_commit();
            Ok::<_, AppError>(())
        })
    })
    .await
    .unwrap_err();
    let AppError::Lifespan(err) = err else {
        panic!("expected a transaction error, got {err:?}");
    };
    assert!(matches!(
        err,
        Error::Transaction { ref resource, ref message } if resource == "db" && message.starts_with("commit")
    ));

    settle().await;
    assert_eq!(factory.mock().closed(), 1);
    let handle = manager.acquire(AcquireOptions::new()).await.unwrap();
    assert_eq!(handle.connection().unwrap().id(), 2, "a fresh connection");
}

// =============================================================================
// Interruption
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_cancelled_transaction_is_not_reused() {
    let factory = MockFactory::new();
    let manager = ready_manager(&factory, fixtures::resource_config(2)).await;
    let token = CancellationToken::new();

    let canceller = tokio::spawn({
        let token = token.clone();
        async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            token.cancel();
        }
    });

    let err = with_transaction(
        &manager,
        AcquireOptions::new().cancel_token(token),
        |conn| {
            Box::pin(async move {
                conn.execute("UPDATE stock").await;
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok::<_, Error>(())
            })
        },
    )
    .await
    .unwrap_err();
    canceller.await.unwrap();

    assert!(matches!(err, Error::Cancelled));
    assert_eq!(manager.in_flight(), 0);
    settle().await;
    assert_eq!(factory.mock().closed(), 1, "half-done session is closed");

    let handle = manager.acquire(AcquireOptions::new()).await.unwrap();
    assert!(session(handle.connection().unwrap()).is_empty());
}

#[tokio::test]
async fn test_not_ready_manager_never_begins() {
    let factory = MockFactory::new();
    let config = fixtures::resource_config(2);
    let manager: ResourceManager<MockConnector> = ResourceManager::new("db", config);

    let err = with_transaction(&manager, AcquireOptions::new(), |_conn| {
        Box::pin(async move { Ok::<_, Error>(()) })
    })
    .await
    .unwrap_err();
    assert!(matches!(err, Error::NotReady { .. }));
    assert_eq!(factory.mock().opened(), 0);
}
