//! Scoped acquisition tests.
//!
//! Every test checks the one property that matters here: whatever way the
//! body ends, the handle goes back and the in-flight count returns to zero.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use lifespan::{
    AcquireOptions, Error, HandleProvider, LifecycleState, ResourceManager, build, with_handle,
};
use lifespan_testing::{MockConnector, MockFactory, fixtures};
use tokio_util::sync::CancellationToken;

async fn ready_manager(factory: &MockFactory, max: u32) -> ResourceManager<MockConnector> {
    let config = fixtures::resource_config(max);
    let manager = ResourceManager::new("cache", config.clone());
    manager
        .initialize(build(factory, &config).await.unwrap())
        .await
        .unwrap();
    manager
}

/// Error type of a request handler built on top of the lifecycle errors.
#[derive(Debug)]
enum HandlerError {
    Lifecycle(Error),
    NotFound(String),
}

impl From<Error> for HandlerError {
    fn from(e: Error) -> Self {
        Self::Lifecycle(e)
    }
}

// =============================================================================
// Exit Paths
// =============================================================================

#[tokio::test]
async fn test_body_result_is_returned() {
    let factory = MockFactory::new();
    let manager = ready_manager(&factory, 2).await;

    let echoed = with_handle(&manager, AcquireOptions::new(), |handle| {
        Box::pin(async move {
            let conn = handle.connection_mut()?;
            Ok::<_, Error>(conn.execute("GET user:1").await)
        })
    })
    .await
    .unwrap();

    assert_eq!(echoed, "GET user:1");
    assert_eq!(manager.in_flight(), 0);
    assert_eq!(manager.pool_status().unwrap().in_use, 0);
}

#[tokio::test]
async fn test_body_error_still_releases() {
    let factory = MockFactory::new();
    let manager = ready_manager(&factory, 2).await;

    let result: Result<(), HandlerError> = manager
        .with_handle(AcquireOptions::new(), |handle| {
            Box::pin(async move {
                handle.connection_mut()?.execute("GET user:404").await;
                Err(HandlerError::NotFound("user:404".into()))
            })
        })
        .await;

    assert!(matches!(result, Err(HandlerError::NotFound(ref key)) if key == "user:404"));
    assert_eq!(manager.in_flight(), 0);
}

#[tokio::test]
async fn test_body_not_invoked_when_acquisition_fails() {
    let manager: ResourceManager<MockConnector> =
        ResourceManager::new("cache", fixtures::resource_config(1));
    let invoked = Arc::new(AtomicBool::new(false));

    let result: Result<(), HandlerError> = with_handle(&manager, AcquireOptions::new(), {
        let invoked = Arc::clone(&invoked);
        move |_handle| {
            Box::pin(async move {
                invoked.store(true, Ordering::SeqCst);
                Ok(())
            })
        }
    })
    .await;

    assert!(matches!(
        result,
        Err(HandlerError::Lifecycle(Error::NotReady {
            state: LifecycleState::Uninitialized,
            ..
        }))
    ));
    assert!(!invoked.load(Ordering::SeqCst));
}

#[tokio::test]
async fn test_body_may_release_explicitly() {
    let factory = MockFactory::new();
    let manager = ready_manager(&factory, 1).await;

    with_handle(&manager, AcquireOptions::new(), |handle| {
        Box::pin(async move {
            handle.connection_mut()?.execute("PING").await;
            handle.release()
        })
    })
    .await
    .unwrap();

    assert_eq!(manager.in_flight(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_request_cancellation_aborts_body_and_releases() {
    let factory = MockFactory::new();
    let manager = ready_manager(&factory, 1).await;
    let token = CancellationToken::new();

    let request = tokio::spawn({
        let manager = manager.clone();
        let token = token.clone();
        async move {
            with_handle(
                &manager,
                AcquireOptions::new().cancel_token(token),
                |_handle| {
                    Box::pin(async move {
                        tokio::time::sleep(Duration::from_secs(3600)).await;
                        Ok::<_, Error>(())
                    })
                },
            )
            .await
        }
    });

    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(manager.in_flight(), 1);
    token.cancel();

    let err = request.await.unwrap().unwrap_err();
    assert!(matches!(err, Error::Cancelled));
    assert_eq!(manager.in_flight(), 0);
    assert_eq!(manager.pool_status().unwrap().available, 1);
}

#[tokio::test(start_paused = true)]
async fn test_aborted_task_releases_handle() {
    let factory = MockFactory::new();
    let manager = ready_manager(&factory, 1).await;

    let task = tokio::spawn({
        let manager = manager.clone();
        async move {
            manager
                .with_handle(AcquireOptions::new(), |_handle| {
                    Box::pin(async move {
                        tokio::time::sleep(Duration::from_secs(3600)).await;
                        Ok::<_, Error>(())
                    })
                })
                .await
        }
    });

    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(manager.in_flight(), 1);
    task.abort();
    assert!(task.await.unwrap_err().is_cancelled());

    assert_eq!(manager.in_flight(), 0);
    let handle = manager.acquire(AcquireOptions::new()).await.unwrap();
    assert!(handle.is_active());
}

// =============================================================================
// Handle Provider
// =============================================================================

#[tokio::test]
async fn test_provider_hands_out_request_handles() {
    let factory = MockFactory::new();
    let manager = ready_manager(&factory, 2).await;
    let provider = HandleProvider::new(manager.clone());

    let request = provider.for_request(CancellationToken::new());
    let mut handle = request.handle().await.unwrap();
    assert_eq!(handle.resource(), "cache");
    assert_eq!(manager.in_flight(), 1);
    handle.connection_mut().unwrap().execute("INCR hits").await;
    drop(handle);

    let value = request
        .with_handle(|handle| {
            Box::pin(async move { Ok::<_, Error>(handle.connection()?.executed().len()) })
        })
        .await
        .unwrap();
    assert!(value >= 1);
    assert_eq!(manager.in_flight(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_provider_timeout_applies() {
    let factory = MockFactory::new();
    let manager = ready_manager(&factory, 1).await;
    let provider = HandleProvider::new(manager.clone()).with_timeout(Duration::from_millis(20));

    let _held = provider.handle().await.unwrap();
    let err = provider.handle().await.unwrap_err();
    assert!(matches!(err, Error::Timeout(d) if d == Duration::from_millis(20)));
}

#[tokio::test]
async fn test_provider_after_shutdown_is_not_ready() {
    let factory = MockFactory::new();
    let manager = ready_manager(&factory, 1).await;
    let provider = HandleProvider::new(manager.clone());

    manager.close(Duration::from_secs(1)).await.unwrap();

    let err = provider.handle().await.unwrap_err();
    assert!(err.is_unavailable());
    assert_eq!(provider.manager().state(), LifecycleState::Stopped);
}
