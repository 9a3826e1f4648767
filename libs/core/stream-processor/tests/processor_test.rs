//! Integration tests for the stream processor

use serde_json::Value;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use stream_processor::{
    BoxError, CommitCoordinate, FnHandler, JsonConfig, MemorySource, MemorySourceProvider,
    ProcessorError, Record, Registry, Stage, fatal,
};
use tokio::sync::{Mutex, watch};
use tokio::time::{Instant, timeout};
use tokio_util::sync::CancellationToken;

const WAIT: Duration = Duration::from_secs(5);

type Batches = Arc<Mutex<Vec<Vec<u64>>>>;

/// Decode `{"id": N}` payloads
async fn parse_id(_cancel: CancellationToken, record: Record) -> Result<Option<u64>, BoxError> {
    let value: Value = record.json()?;
    Ok(value["id"].as_u64())
}

/// Like `parse_id`, but id 1 fails with a recoverable error
async fn parse_id_rejecting_one(
    cancel: CancellationToken,
    record: Record,
) -> Result<Option<u64>, BoxError> {
    match parse_id(cancel, record).await? {
        Some(1) => Err("id 1 is not accepted".into()),
        id => Ok(id),
    }
}

fn push_ids(source: &MemorySource, count: u64) -> Vec<CommitCoordinate> {
    (0..count)
        .map(|id| source.push_payload(format!(r#"{{"id":{id}}}"#)))
        .collect()
}

fn orders_source() -> Arc<MemorySource> {
    Arc::new(MemorySource::new("orders", "orders-group"))
}

fn registry_for(source: &Arc<MemorySource>, config: &str) -> Registry {
    let provider = MemorySourceProvider::new().with_source("orders", Arc::clone(source));
    Registry::new(provider).with_config(JsonConfig::parse(config).unwrap())
}

/// Handler recording every flushed batch
fn recording_handler(batches: &Batches) -> FnHandler<u64> {
    let batches = Arc::clone(batches);
    FnHandler::new("orders", parse_id).with_batch(
        move |_cancel: CancellationToken, items: Vec<u64>| {
            let batches = Arc::clone(&batches);
            async move {
                batches.lock().await.push(items);
                Ok(())
            }
        },
    )
}

async fn stop(shutdown: CancellationToken, run: tokio::task::JoinHandle<Result<(), ProcessorError>>) {
    shutdown.cancel();
    let result = timeout(WAIT, run).await.unwrap().unwrap();
    assert!(result.unwrap_err().is_cancelled());
}

mod batching {
    use super::*;

    #[tokio::test]
    async fn test_flush_by_size_then_interval() {
        let source = orders_source();
        let coordinates = push_ids(&source, 4);
        let batches = Batches::default();

        let mut registry = registry_for(
            &source,
            r#"{"processor": {"orders": {"batchSize": 3, "autoBatchInterval": "300ms"}}}"#,
        );
        registry.register_fn(recording_handler(&batches)).unwrap();

        let shutdown = CancellationToken::new();
        let run = tokio::spawn(registry.run(shutdown.clone()));

        timeout(WAIT, source.wait_for_commits(4)).await.unwrap();

        assert_eq!(*batches.lock().await, vec![vec![0, 1, 2], vec![3]]);
        assert_eq!(
            source.commit_calls().await,
            vec![coordinates[..3].to_vec(), coordinates[3..].to_vec()]
        );

        stop(shutdown, run).await;
    }

    #[tokio::test]
    async fn test_fatal_batch_error_skips_commit() {
        let source = orders_source();
        push_ids(&source, 4);

        let mut registry = registry_for(
            &source,
            r#"{"processor": {"orders": {"batchSize": 3, "autoBatchInterval": "300ms"}}}"#,
        );
        registry
            .register_fn(
                FnHandler::new("orders", parse_id)
                    .with_batch(|_cancel: CancellationToken, _items: Vec<u64>| async move {
                        Err(fatal("fatal error"))
                    }),
            )
            .unwrap();

        let err = timeout(WAIT, registry.run(CancellationToken::new()))
            .await
            .unwrap()
            .unwrap_err();

        assert_eq!(err.to_string(), "fatal error");
        assert!(err.is_fatal());
        assert_eq!(err.stage(), Some(Stage::Batch));
        assert_eq!(err.handler(), Some("orders"));
        assert!(source.committed().await.is_empty());
    }

    #[tokio::test]
    async fn test_recoverable_batch_error_still_commits() {
        let source = orders_source();
        let coordinates = push_ids(&source, 2);

        let mut registry = registry_for(&source, r#"{"processor": {"orders": {"batchSize": 2}}}"#);
        registry
            .register_fn(
                FnHandler::new("orders", parse_id).with_batch(
                    |_cancel: CancellationToken, _items: Vec<u64>| async move {
                        Err::<(), BoxError>("downstream unavailable".into())
                    },
                ),
            )
            .unwrap();

        let shutdown = CancellationToken::new();
        let run = tokio::spawn(registry.run(shutdown.clone()));

        timeout(WAIT, source.wait_for_commits(2)).await.unwrap();
        assert_eq!(source.commit_calls().await, vec![coordinates]);

        stop(shutdown, run).await;
    }

    #[tokio::test]
    async fn test_recoverable_handle_error_commits_record() {
        let source = orders_source();
        let coordinates = push_ids(&source, 4);
        let batches = Batches::default();

        let handler = {
            let batches = Arc::clone(&batches);
            FnHandler::new("orders", parse_id_rejecting_one).with_batch(
                move |_cancel: CancellationToken, items: Vec<u64>| {
                    let batches = Arc::clone(&batches);
                    async move {
                        batches.lock().await.push(items);
                        Ok(())
                    }
                },
            )
        };

        let mut registry = registry_for(&source, "{}");
        registry.register_fn(handler).unwrap();

        let shutdown = CancellationToken::new();
        let run = tokio::spawn(registry.run(shutdown.clone()));

        timeout(WAIT, source.wait_for_commits(4)).await.unwrap();

        let mut committed = source.committed().await;
        committed.sort_by_key(|c| c.offset);
        assert_eq!(committed, coordinates);
        assert_eq!(*batches.lock().await, vec![vec![0], vec![2], vec![3]]);

        stop(shutdown, run).await;
    }

    #[tokio::test]
    async fn test_auto_commit_flushes_on_shutdown() {
        let source = orders_source();
        let coordinates = push_ids(&source, 2);
        let batches = Batches::default();

        let mut registry = registry_for(
            &source,
            r#"{"processor": {"orders": {"batchSize": 10, "autoCommit": true}}}"#,
        );
        registry.register_fn(recording_handler(&batches)).unwrap();

        let shutdown = CancellationToken::new();
        let run = tokio::spawn(registry.run(shutdown.clone()));

        // Committed at hand-off, long before the batch is full
        timeout(WAIT, source.wait_for_commits(2)).await.unwrap();
        assert_eq!(source.committed().await, coordinates);
        assert!(batches.lock().await.is_empty());

        stop(shutdown, run).await;
        assert_eq!(*batches.lock().await, vec![vec![0, 1]]);
        assert_eq!(source.committed().await.len(), 2);
    }

    #[tokio::test]
    async fn test_timer_restarts_after_size_flush() {
        let source = orders_source();
        let flushes: Arc<Mutex<Vec<(Instant, Vec<u64>)>>> = Arc::default();

        let mut registry = registry_for(
            &source,
            r#"{"processor": {"orders": {"batchSize": 2, "autoBatchInterval": "400ms"}}}"#,
        );
        let recorded = Arc::clone(&flushes);
        registry
            .register_fn(FnHandler::new("orders", parse_id).with_batch(
                move |_cancel: CancellationToken, items: Vec<u64>| {
                    let recorded = Arc::clone(&recorded);
                    async move {
                        recorded.lock().await.push((Instant::now(), items));
                        Ok(())
                    }
                },
            ))
            .unwrap();

        let shutdown = CancellationToken::new();
        let run = tokio::spawn(registry.run(shutdown.clone()));

        // Idle for most of the first interval, then fill one batch and a bit
        tokio::time::sleep(Duration::from_millis(300)).await;
        push_ids(&source, 3);
        timeout(WAIT, source.wait_for_commits(3)).await.unwrap();

        {
            let flushes = flushes.lock().await;
            assert_eq!(flushes.len(), 2);
            assert_eq!(flushes[0].1, vec![0, 1]);
            assert_eq!(flushes[1].1, vec![2]);

            let gap = flushes[1].0 - flushes[0].0;
            assert!(
                gap >= Duration::from_millis(350),
                "remainder flushed {gap:?} after the size flush"
            );
        }

        stop(shutdown, run).await;
    }

    #[tokio::test]
    async fn test_shutdown_flush_sees_cancellation() {
        let source = orders_source();
        push_ids(&source, 2);
        let seen: Arc<Mutex<Vec<bool>>> = Arc::default();

        let mut registry = registry_for(
            &source,
            r#"{"processor": {"orders": {"batchSize": 10, "autoCommit": true}}}"#,
        );
        let observed = Arc::clone(&seen);
        registry
            .register_fn(FnHandler::new("orders", parse_id).with_batch(
                move |cancel: CancellationToken, _items: Vec<u64>| {
                    let observed = Arc::clone(&observed);
                    async move {
                        observed.lock().await.push(cancel.is_cancelled());
                        Ok(())
                    }
                },
            ))
            .unwrap();

        let shutdown = CancellationToken::new();
        let run = tokio::spawn(registry.run(shutdown.clone()));

        timeout(WAIT, source.wait_for_commits(2)).await.unwrap();
        stop(shutdown, run).await;

        assert_eq!(*seen.lock().await, vec![true]);
    }

    #[tokio::test]
    async fn test_pending_batch_dropped_without_auto_commit() {
        let source = orders_source();
        push_ids(&source, 2);
        let batches = Batches::default();

        let mut registry = registry_for(&source, r#"{"processor": {"orders": {"batchSize": 10}}}"#);
        registry.register_fn(recording_handler(&batches)).unwrap();

        let shutdown = CancellationToken::new();
        let run = tokio::spawn(registry.run(shutdown.clone()));

        tokio::time::sleep(Duration::from_millis(100)).await;
        stop(shutdown, run).await;

        assert!(batches.lock().await.is_empty());
        assert!(source.committed().await.is_empty());
    }

    #[tokio::test]
    async fn test_many_workers_commit_each_record_once() {
        let source = orders_source();
        let coordinates = push_ids(&source, 50);
        let batches = Batches::default();

        let mut registry = registry_for(
            &source,
            r#"{"processor": {"orders": {
                "batchSize": 4,
                "autoBatchInterval": "50ms",
                "readWorkerCount": 2,
                "handleWorkerCount": 4,
                "batchWorkerCount": 3,
                "channelCapacity": 8
            }}}"#,
        );
        registry.register_fn(recording_handler(&batches)).unwrap();

        let shutdown = CancellationToken::new();
        let run = tokio::spawn(registry.run(shutdown.clone()));

        timeout(WAIT, source.wait_for_commits(50)).await.unwrap();

        let mut committed = source.committed().await;
        committed.sort_by_key(|c| c.offset);
        assert_eq!(committed, coordinates);

        let mut ids: Vec<u64> = batches.lock().await.iter().flatten().copied().collect();
        ids.sort_unstable();
        assert_eq!(ids, (0..50).collect::<Vec<_>>());
        assert!(batches.lock().await.iter().all(|batch| batch.len() <= 4));

        stop(shutdown, run).await;
    }
}

mod handle_only {
    use super::*;

    #[tokio::test]
    async fn test_commits_each_record() {
        let source = orders_source();
        let coordinates = push_ids(&source, 4);

        let mut registry = registry_for(&source, r#"{"processor": {"orders": {"batchSize": 3}}}"#);
        registry
            .register_fn(FnHandler::new("orders", parse_id))
            .unwrap();

        let shutdown = CancellationToken::new();
        let run = tokio::spawn(registry.run(shutdown.clone()));

        timeout(WAIT, source.wait_for_commits(4)).await.unwrap();

        let calls = source.commit_calls().await;
        assert_eq!(calls.len(), 4);
        assert_eq!(
            calls,
            coordinates.into_iter().map(|c| vec![c]).collect::<Vec<_>>()
        );

        stop(shutdown, run).await;
    }

    #[tokio::test]
    async fn test_fatal_handle_error() {
        let source = orders_source();
        push_ids(&source, 1);

        let mut registry = registry_for(&source, "{}");
        registry
            .register_fn(FnHandler::new(
                "orders",
                |_cancel: CancellationToken, _record: Record| async move {
                    Err::<Option<u64>, _>(fatal("schema mismatch"))
                },
            ))
            .unwrap();

        let err = timeout(WAIT, registry.run(CancellationToken::new()))
            .await
            .unwrap()
            .unwrap_err();

        assert_eq!(err.to_string(), "schema mismatch");
        assert_eq!(err.stage(), Some(Stage::Handle));
        assert!(source.committed().await.is_empty());
    }

    #[tokio::test]
    async fn test_panicking_handler() {
        let source = orders_source();
        push_ids(&source, 1);

        let mut registry = registry_for(&source, "{}");
        registry
            .register_fn(FnHandler::new(
                "orders",
                |_cancel: CancellationToken, _record: Record| async move {
                    if true {
                        panic!("handler bug");
                    }
                    Ok::<Option<u64>, BoxError>(None)
                },
            ))
            .unwrap();

        let err = timeout(WAIT, registry.run(CancellationToken::new()))
            .await
            .unwrap()
            .unwrap_err();

        assert!(matches!(err, ProcessorError::Worker(_)));
        assert!(source.committed().await.is_empty());
    }
}

mod source_failures {
    use super::*;

    #[tokio::test]
    async fn test_fetch_error_stops_processor() {
        let source = orders_source();
        let coordinates = push_ids(&source, 1);
        source.push_fetch_error("broker unreachable");

        let mut registry = registry_for(&source, "{}");
        registry
            .register_fn(FnHandler::new("orders", parse_id))
            .unwrap();

        let err = timeout(WAIT, registry.run(CancellationToken::new()))
            .await
            .unwrap()
            .unwrap_err();

        assert!(matches!(err, ProcessorError::Fetch { .. }));
        assert_eq!(err.to_string(), "fetch from source orders failed: broker unreachable");
        assert_eq!(err.stage(), Some(Stage::Fetch));

        // The record fetched before the failure may or may not have been handled
        let committed = source.committed().await;
        assert!(committed.is_empty() || committed == coordinates);
    }

    #[tokio::test]
    async fn test_commit_error_stops_processor() {
        let source = Arc::new(
            MemorySource::new("orders", "orders-group").with_commit_failure("offsets rejected"),
        );
        push_ids(&source, 1);

        let mut registry = registry_for(&source, "{}");
        registry
            .register_fn(FnHandler::new("orders", parse_id))
            .unwrap();

        let err = timeout(WAIT, registry.run(CancellationToken::new()))
            .await
            .unwrap()
            .unwrap_err();

        assert!(matches!(err, ProcessorError::Commit { .. }));
        assert_eq!(err.to_string(), "commit for orders failed: offsets rejected");
    }

    #[test]
    fn test_registration_errors() {
        let provider = MemorySourceProvider::new()
            .with_source("orders", orders_source())
            .with_source("audit", Arc::new(MemorySource::without_group("audit")));
        let mut registry = Registry::new(provider);

        registry
            .register_fn(FnHandler::new("orders", parse_id))
            .unwrap();

        let duplicate = registry
            .register_fn(FnHandler::new("orders", parse_id))
            .unwrap_err();
        assert_eq!(duplicate.to_string(), "duplicate processor name: orders");

        let no_group = registry
            .register_fn(FnHandler::new("audit", parse_id))
            .unwrap_err();
        assert_eq!(no_group.to_string(), "source audit did not set consumer group id");

        assert_eq!(registry.handler_names(), vec!["orders"]);
    }
}

mod lifecycle {
    use super::*;

    #[tokio::test]
    async fn test_run_until_watch_signal() {
        let source = orders_source();
        push_ids(&source, 2);

        let mut registry = registry_for(&source, "{}");
        registry
            .register_fn(FnHandler::new("orders", parse_id))
            .unwrap();

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let run = tokio::spawn(registry.run_until(shutdown_rx));

        timeout(WAIT, source.wait_for_commits(2)).await.unwrap();
        shutdown_tx.send(true).unwrap();

        let result = timeout(WAIT, run).await.unwrap().unwrap();
        assert!(result.unwrap_err().is_cancelled());
    }

    #[tokio::test]
    async fn test_run_until_sender_dropped() {
        let source = orders_source();
        let mut registry = registry_for(&source, "{}");
        registry
            .register_fn(FnHandler::new("orders", parse_id))
            .unwrap();

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let run = tokio::spawn(registry.run_until(shutdown_rx));
        drop(shutdown_tx);

        let result = timeout(WAIT, run).await.unwrap().unwrap();
        assert!(result.unwrap_err().is_cancelled());
    }

    #[tokio::test]
    async fn test_empty_registry_waits_for_cancellation() {
        let registry = Registry::new(MemorySourceProvider::new());
        assert!(registry.is_empty());

        let shutdown = CancellationToken::new();
        let run = tokio::spawn(registry.run(shutdown.clone()));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!run.is_finished());

        stop(shutdown, run).await;
    }

    #[tokio::test]
    async fn test_fatal_error_stops_sibling_pipelines() {
        const SUPPLY: usize = 1000;

        let busy = orders_source();
        push_ids(&busy, SUPPLY as u64);
        let failing = Arc::new(MemorySource::new("payments", "payments-group"));
        push_ids(&failing, 1);

        let provider = MemorySourceProvider::new()
            .with_source("orders", Arc::clone(&busy))
            .with_source("payments", failing);
        let mut registry = Registry::new(provider);

        let handled = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&handled);
        registry
            .register_fn(FnHandler::new(
                "orders",
                move |_cancel: CancellationToken, _record: Record| {
                    let counter = Arc::clone(&counter);
                    async move {
                        tokio::time::sleep(Duration::from_millis(1)).await;
                        counter.fetch_add(1, Ordering::SeqCst);
                        Ok::<Option<u64>, BoxError>(None)
                    }
                },
            ))
            .unwrap();
        registry
            .register_fn(FnHandler::new(
                "payments",
                |_cancel: CancellationToken, _record: Record| async move {
                    Err::<Option<u64>, _>(fatal("boom"))
                },
            ))
            .unwrap();

        let err = timeout(WAIT, registry.run(CancellationToken::new()))
            .await
            .unwrap()
            .unwrap_err();

        assert_eq!(err.to_string(), "boom");
        assert_eq!(err.handler(), Some("payments"));

        let handled_at_stop = handled.load(Ordering::SeqCst);
        assert!(handled_at_stop < SUPPLY);
        assert!(busy.committed().await.len() <= handled_at_stop);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(handled.load(Ordering::SeqCst), handled_at_stop);
    }
}
