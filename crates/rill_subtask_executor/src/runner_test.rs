use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use assert_matches::assert_matches;
use pretty_assertions::assert_eq;
use rill_subtask_types::communication::{PutInfo, SharedClientProvider};
use rill_subtask_types::errors::SubtaskExecutionError;
use rill_subtask_types::graph::ChunkGraph;
use rill_subtask_types::subtask::{Band, SessionId, Subtask, SubtaskId, SubtaskStatus};

use crate::config::SubtaskProcessorConfig;
use crate::processor::IdentityOptimizer;
use crate::runner::SlotProcessorHost;
use crate::test_utils::{
    compute_chunk,
    test_subtask,
    FakeSubtaskRunner,
    FixedSizeKernel,
    GateKernel,
    MockClients,
    TEST_BAND,
    TEST_SESSION,
    TEST_SUPERVISOR,
    TEST_WORKER,
};

fn make_host(clients: MockClients) -> Arc<SlotProcessorHost> {
    let provider: SharedClientProvider = clients.into_provider(FakeSubtaskRunner::hanging(false));
    Arc::new(SlotProcessorHost::new(
        SessionId::from(TEST_SESSION),
        Band::new(TEST_WORKER, TEST_BAND),
        TEST_SUPERVISOR.to_owned(),
        &provider,
        SubtaskProcessorConfig::default(),
        Arc::new(IdentityOptimizer),
    ))
}

fn compute_only_subtask(id: &str) -> Subtask {
    let mut graph = ChunkGraph::new();
    let b = graph.add_chunk(compute_chunk(
        "b",
        "op-b",
        &[],
        true,
        Arc::new(FixedSizeKernel::new(10, 20)),
    ));
    graph.mark_result(b);
    test_subtask(id, graph)
}

#[tokio::test]
async fn run_returns_the_result_and_clears_the_active_slot() {
    let mut clients = MockClients::default();
    clients.storage.expect_put().times(1).returning(|_| {
        Ok(vec![PutInfo { store_size: 10, memory_size: 20, object_id: "obj-b".to_owned() }])
    });
    clients.meta.expect_set_chunk_meta().times(1).returning(|_| Ok(()));
    clients.worker_meta.expect_set_chunk_meta().times(1).returning(|_| Ok(()));

    let host = make_host(clients);
    let result = host.run(compute_only_subtask("subtask-1")).await.unwrap();

    assert_eq!(result.status, SubtaskStatus::Succeeded);
    assert_eq!(host.running_subtask_id(), None);
    // The last result stays readable after the run.
    assert_eq!(host.result().unwrap().status, SubtaskStatus::Succeeded);
}

#[tokio::test]
async fn a_second_concurrent_run_is_rejected() {
    let clients = MockClients::default();
    let host = make_host(clients);

    let (kernel, gate, started) = GateKernel::new();
    let mut graph = ChunkGraph::new();
    let c = graph.add_chunk(compute_chunk("c", "op-c", &[], true, Arc::new(kernel)));
    graph.mark_result(c);
    let gated = test_subtask("subtask-1", graph);

    let first = tokio::spawn({
        let host = host.clone();
        async move { host.run(gated).await }
    });
    while !started.load(Ordering::SeqCst) {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(host.running_subtask_id(), Some(SubtaskId::from("subtask-1")));

    let second = host.run(compute_only_subtask("subtask-2")).await;
    assert_matches!(second, Err(SubtaskExecutionError::AlreadyRunning(_)));

    let cancel = tokio::spawn({
        let host = host.clone();
        async move { host.cancel().await }
    });
    tokio::time::sleep(Duration::from_millis(10)).await;
    gate.send(()).unwrap();
    cancel.await.unwrap();
    let first = first.await.unwrap();
    assert_matches!(first, Err(SubtaskExecutionError::Cancelled));
}

#[tokio::test]
async fn cancel_drives_the_live_run_to_cancelled() {
    let clients = MockClients::default();
    let host = make_host(clients);

    let (kernel, gate, started) = GateKernel::new();
    let mut graph = ChunkGraph::new();
    let c = graph.add_chunk(compute_chunk("c", "op-c", &[], true, Arc::new(kernel)));
    graph.mark_result(c);
    let subtask = test_subtask("subtask-1", graph);

    let run = tokio::spawn({
        let host = host.clone();
        async move { host.run(subtask).await }
    });
    while !started.load(Ordering::SeqCst) {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    let cancel = tokio::spawn({
        let host = host.clone();
        async move { host.cancel().await }
    });
    tokio::time::sleep(Duration::from_millis(10)).await;
    // The gated computation must finish before the cancel can complete.
    gate.send(()).unwrap();
    cancel.await.unwrap();

    let result = run.await.unwrap();
    assert_matches!(result, Err(SubtaskExecutionError::Cancelled));
    assert_eq!(host.result().unwrap().status, SubtaskStatus::Cancelled);
}
