use std::sync::Arc;
use std::time::Duration;

use crate::support::{
    helpers::{assert_update_sequence, init_tracing, RecordingSink},
    mock_backend::{BackendScript, MockBackend, MockBackendServer},
};
use anyhow::Result;
use bulkrun::{
    unclaimed, HttpActionWorker, Outcome, RemoteAction, RemoteOptions, RunStatus, RunnerConfig,
    TaskRunner, WorkItem,
};
use tokio::time::timeout;

fn products(ids: &[&str]) -> Vec<WorkItem<()>> {
    ids.iter()
        .map(|id| WorkItem::new(format!("gid://shopify/Product/{id}"), ()))
        .collect()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn bulk_populate_against_backend() -> Result<()> {
    init_tracing();
    let backend = MockBackend::new(BackendScript {
        rejected: ["102".to_owned()].into(),
        broken: ["104".to_owned()].into(),
        unmatched: ["103".to_owned()].into(),
        latency: Duration::from_millis(20),
    });
    let server = MockBackendServer::start(backend.clone()).await?;

    let items = products(&["100", "101", "102", "103", "104", "105", "106"]);
    // One product was already handled from the single-item button.
    assert!(items[1].claim());
    let admissible = unclaimed(items.clone());
    assert_eq!(admissible.len(), 6);

    let worker = HttpActionWorker::new(RemoteOptions::new(server.url()), RemoteAction::Populate)?;
    let sink = Arc::new(RecordingSink::default());
    let runner = TaskRunner::with_concurrency(3, admissible, worker, sink.clone())?;
    let summary = timeout(Duration::from_secs(10), runner.run()).await??;

    assert_eq!(summary.status, RunStatus::Completed);
    assert_eq!(summary.total, 6);
    assert_eq!(summary.completed, 6);
    assert_eq!(summary.errors, 2);
    assert_update_sequence(&sink.updates(), 3);

    match &summary.outcomes[1] {
        Some(Outcome::Failure { reason }) => {
            assert!(reason.contains("Could not fetch product"), "reason: {reason}")
        }
        other => panic!("unexpected outcome for rejected product: {other:?}"),
    }

    // Successful products stay claimed; failed ones are re-triable.
    let claimed: Vec<bool> = items.iter().map(WorkItem::is_claimed).collect();
    assert_eq!(claimed, vec![true, true, false, true, false, true, true]);

    let received = backend.received();
    assert_eq!(received.len(), 6);
    assert!(received
        .iter()
        .all(|(path, _)| path == RemoteAction::Populate.path()));
    let mut ids: Vec<_> = received.into_iter().map(|(_, id)| id).collect();
    ids.sort();
    assert_eq!(ids, vec!["100", "102", "103", "104", "105", "106"]);
    assert!(backend.peak_in_flight() <= 3);

    server.shutdown().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn bulk_delete_uses_delete_endpoint() -> Result<()> {
    let backend = MockBackend::new(BackendScript::default());
    let server = MockBackendServer::start(backend.clone()).await?;

    let worker = HttpActionWorker::new(RemoteOptions::new(server.url()), RemoteAction::Delete)?;
    assert!(worker.endpoint().ends_with("/api/delete-populated-single-product"));

    let runner = TaskRunner::with_concurrency(
        2,
        products(&["7", "8"]),
        worker,
        Arc::new(RecordingSink::default()),
    )?;
    let summary = runner.run().await?;

    assert_eq!(summary.errors, 0);
    assert!(backend
        .received()
        .iter()
        .all(|(path, _)| path == RemoteAction::Delete.path()));

    server.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn unreachable_backend_fails_items_and_releases_claims() -> Result<()> {
    let server = MockBackendServer::start(MockBackend::new(BackendScript::default())).await?;
    let url = server.url().to_owned();
    server.shutdown().await;

    let options = RemoteOptions::new(url).with_request_timeout(Duration::from_secs(2));
    let worker = HttpActionWorker::new(options, RemoteAction::Populate)?;
    let items = products(&["1", "2"]);

    let runner =
        TaskRunner::with_concurrency(2, items.clone(), worker, Arc::new(RecordingSink::default()))?;
    let summary = timeout(Duration::from_secs(10), runner.run()).await??;

    assert_eq!(summary.completed, 2);
    assert_eq!(summary.errors, 2);
    assert!(items.iter().all(|item| !item.is_claimed()));
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn timed_out_requests_leave_products_retriable() -> Result<()> {
    init_tracing();
    let backend = MockBackend::new(BackendScript {
        latency: Duration::from_millis(500),
        ..BackendScript::default()
    });
    let server = MockBackendServer::start(backend.clone()).await?;

    let worker = HttpActionWorker::new(RemoteOptions::new(server.url()), RemoteAction::Populate)?;
    let items = products(&["31", "32"]);
    let config = RunnerConfig::builder()
        .concurrency_limit(2)
        .item_timeout(Duration::from_millis(50))
        .build()?;

    let runner = TaskRunner::new(config, items.clone(), worker, Arc::new(RecordingSink::default()))?;
    let summary = timeout(Duration::from_secs(10), runner.run()).await??;

    assert_eq!(summary.completed, 2);
    assert_eq!(summary.errors, 2);
    assert_eq!(summary.timed_out, 2);
    assert!(items.iter().all(|item| !item.is_claimed()));

    server.shutdown().await;
    Ok(())
}
