use std::sync::Arc;
use std::time::Duration;

use assert_matches::assert_matches;
use metrics_exporter_prometheus::PrometheusBuilder;
use mockall::Sequence;
use pretty_assertions::assert_eq;
use rill_subtask_types::communication::{
    ChunkMeta,
    ChunkMetaField,
    FetchRequest,
    MissingDataPolicy,
    SharedClientProvider,
    SharedSubtaskRunnerClient,
    StorageInfo,
    StorageLevel,
};
use rill_subtask_types::errors::{ClientError, SubtaskExecutionError};
use rill_subtask_types::graph::ChunkGraph;
use rill_subtask_types::operand::ChunkKey;
use rill_subtask_types::subtask::{
    BandName,
    SlotId,
    Subtask,
    SubtaskExtraConfig,
    SubtaskId,
    SubtaskStatus,
};

use crate::config::SubtaskExecutorConfig;
use crate::executor::SubtaskExecutor;
use crate::metrics::{FINISHED_SUBTASK_COUNT, SUBMITTED_SUBTASK_COUNT};
use crate::test_utils::{
    compute_chunk,
    fetch_chunk,
    parse_numeric_metric,
    succeeded_result,
    test_subtask,
    FakeSubtaskRunner,
    FixedSizeKernel,
    HangingStorage,
    MockClients,
    TEST_BAND,
    TEST_SUPERVISOR,
};

const SLOT: SlotId = SlotId(7);

fn compute_only_subtask(id: &str) -> Subtask {
    let mut graph = ChunkGraph::new();
    let b = graph.add_chunk(compute_chunk(
        "b",
        "op-b",
        &[],
        true,
        Arc::new(FixedSizeKernel::new(150, 250)),
    ));
    graph.mark_result(b);
    test_subtask(id, graph)
}

fn make_executor(
    clients: MockClients,
    runner: SharedSubtaskRunnerClient,
    config: SubtaskExecutorConfig,
) -> Arc<SubtaskExecutor> {
    let provider: SharedClientProvider = clients.into_provider(runner);
    Arc::new(SubtaskExecutor::new(config, provider))
}

/// Installs the quota/slot lifecycle expected of `attempts` run attempts.
fn expect_resource_lifecycle(clients: &mut MockClients, attempts: usize) {
    clients.quota.expect_request_batch_quota().times(attempts).returning(|_| Ok(()));
    clients
        .slot_manager
        .expect_acquire_free_slot()
        .times(attempts)
        .returning(|_| Ok(SLOT));
    clients
        .slot_manager
        .expect_release_free_slot()
        .times(attempts)
        .returning(|_, _| Ok(()));
    clients.quota.expect_release_quotas().times(attempts).returning(|_| Ok(()));
    clients.slot_manager.expect_upload_slot_usages().times(1).returning(|_| Ok(()));
}

fn expect_slot_pool_recovery(clients: &mut MockClients, times: usize) {
    clients
        .slot_manager
        .expect_get_slot_address()
        .times(times)
        .returning(|_| Ok("sub-pool-0".to_owned()));
    clients
        .cluster
        .expect_wait_actor_pool_recovered()
        .times(times)
        .withf(|address| address == "sub-pool-0")
        .returning(|_| Ok(()));
}

async fn wait_until(predicate: impl Fn() -> bool) {
    while !predicate() {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

#[tokio::test]
async fn happy_path_acquires_and_releases_in_order() {
    let recorder = PrometheusBuilder::new().build_recorder();
    let _recorder_guard = metrics::set_default_local_recorder(&recorder);

    let mut clients = MockClients::default();
    let mut seq = Sequence::new();

    // Prepare and size collection for the fetched input.
    clients
        .storage
        .expect_fetch()
        .times(1)
        .withf(|requests| {
            requests.as_slice()
                == [FetchRequest {
                    key: rill_subtask_types::store::DataKey::Chunk(ChunkKey::from("a")),
                    band: BandName::from("numa-0"),
                    on_missing: MissingDataPolicy::Raise,
                }]
        })
        .returning(|_| Ok(vec![]));
    clients
        .meta
        .expect_get_chunk_meta()
        .times(1)
        .withf(|keys, fields| {
            keys.as_slice() == [ChunkKey::from("a")]
                && fields.as_slice()
                    == [ChunkMetaField::MemorySize, ChunkMetaField::StoreSize]
        })
        .returning(|_, _| {
            Ok(vec![ChunkMeta { memory_size: 200, store_size: 100, ..Default::default() }])
        });
    clients
        .storage
        .expect_get_infos()
        .times(1)
        .returning(|_| Ok(vec![vec![StorageInfo { level: StorageLevel::DISK }]]));

    // Quota -> slot -> run; release slot, then quota, then usage upload.
    clients
        .quota
        .expect_request_batch_quota()
        .times(1)
        .in_sequence(&mut seq)
        .withf(|request| {
            request.len() == 1
                && request.values().copied().collect::<Vec<_>>() == vec![450]
                && request.keys().all(|key| key.subtask_id == SubtaskId::from("subtask-1"))
        })
        .returning(|_| Ok(()));
    clients
        .slot_manager
        .expect_acquire_free_slot()
        .times(1)
        .in_sequence(&mut seq)
        .returning(|_| Ok(SLOT));
    clients
        .slot_manager
        .expect_release_free_slot()
        .times(1)
        .in_sequence(&mut seq)
        .withf(|slot, _| *slot == SLOT)
        .returning(|_, _| Ok(()));
    clients
        .quota
        .expect_release_quotas()
        .times(1)
        .in_sequence(&mut seq)
        .returning(|_| Ok(()));
    clients
        .slot_manager
        .expect_upload_slot_usages()
        .times(1)
        .in_sequence(&mut seq)
        .withf(|periodical| !periodical)
        .returning(|_| Ok(()));

    let mut graph = ChunkGraph::new();
    let a = graph.add_chunk(fetch_chunk("a"));
    let b = graph.add_chunk(compute_chunk(
        "b",
        "op-b",
        &["a"],
        true,
        Arc::new(FixedSizeKernel::new(150, 250)),
    ));
    graph.add_dependency(a, b);
    graph.mark_result(b);
    let subtask = test_subtask("subtask-1", graph);
    let inner_result = succeeded_result(&subtask, 250);

    let runner = FakeSubtaskRunner::scripted(vec![Ok(inner_result.clone())]);
    let executor =
        make_executor(clients, runner.clone(), SubtaskExecutorConfig::default());

    let result = executor
        .run_subtask(subtask, BandName::from(TEST_BAND), TEST_SUPERVISOR.to_owned())
        .await
        .unwrap();

    assert_eq!(result.status, SubtaskStatus::Succeeded);
    assert_eq!(result.data_size, Some(250));
    assert_eq!(runner.run_call_count(), 1);
    assert!(!executor.is_tracked(&SubtaskId::from("subtask-1")));

    let metrics = recorder.handle().render();
    let labels = [("band", TEST_BAND)];
    assert_eq!(
        parse_numeric_metric::<u64>(&metrics, SUBMITTED_SUBTASK_COUNT.get_name(), Some(&labels)),
        Some(1)
    );
    assert_eq!(
        parse_numeric_metric::<u64>(&metrics, FINISHED_SUBTASK_COUNT.get_name(), Some(&labels)),
        Some(1)
    );
}

#[tokio::test]
async fn resubmitting_a_tracked_subtask_is_rejected() {
    let mut clients = MockClients::default();
    expect_resource_lifecycle(&mut clients, 1);

    let runner = FakeSubtaskRunner::hanging(false);
    let executor = make_executor(clients, runner.clone(), SubtaskExecutorConfig::default());

    let first = tokio::spawn({
        let executor = executor.clone();
        async move {
            executor
                .run_subtask(
                    compute_only_subtask("subtask-1"),
                    BandName::from(TEST_BAND),
                    TEST_SUPERVISOR.to_owned(),
                )
                .await
        }
    });
    wait_until(|| runner.run_call_count() == 1).await;

    let second = executor
        .run_subtask(
            compute_only_subtask("subtask-1"),
            BandName::from(TEST_BAND),
            TEST_SUPERVISOR.to_owned(),
        )
        .await;
    assert_matches!(second, Err(SubtaskExecutionError::AlreadyRunning(_)));

    executor.cancel_subtask(&SubtaskId::from("subtask-1"), Duration::from_secs(1)).await;
    let result = first.await.unwrap().unwrap();
    assert_eq!(result.status, SubtaskStatus::Cancelled);
}

#[tokio::test]
async fn transient_error_is_retried_then_succeeds() {
    let mut clients = MockClients::default();
    expect_resource_lifecycle(&mut clients, 2);
    expect_slot_pool_recovery(&mut clients, 1);

    let mut subtask = compute_only_subtask("subtask-1");
    subtask.extra_config = Some(SubtaskExtraConfig { subtask_max_retries: Some(2) });
    let inner_result = succeeded_result(&subtask, 250);

    let runner = FakeSubtaskRunner::scripted(vec![
        Err(ClientError::Io("conn reset".to_owned()).into()),
        Ok(inner_result),
    ]);
    let executor = make_executor(clients, runner.clone(), SubtaskExecutorConfig::default());

    let result = executor
        .run_subtask(subtask, BandName::from(TEST_BAND), TEST_SUPERVISOR.to_owned())
        .await
        .unwrap();

    assert_eq!(result.status, SubtaskStatus::Succeeded);
    assert_eq!(runner.run_call_count(), 2);
}

#[tokio::test]
async fn exhausted_retries_surface_exceed_max_rerun() {
    let mut clients = MockClients::default();
    expect_resource_lifecycle(&mut clients, 2);
    expect_slot_pool_recovery(&mut clients, 2);

    let mut subtask = compute_only_subtask("subtask-1");
    subtask.extra_config = Some(SubtaskExtraConfig { subtask_max_retries: Some(1) });

    let runner = FakeSubtaskRunner::scripted(vec![
        Err(ClientError::Io("conn reset".to_owned()).into()),
        Err(ClientError::Io("conn reset".to_owned()).into()),
    ]);
    let executor = make_executor(clients, runner.clone(), SubtaskExecutorConfig::default());

    let result = executor
        .run_subtask(subtask, BandName::from(TEST_BAND), TEST_SUPERVISOR.to_owned())
        .await
        .unwrap();

    assert_eq!(result.status, SubtaskStatus::Errored);
    assert_eq!(result.progress, 1.0);
    assert_eq!(runner.run_call_count(), 2);
    let error = result.error.unwrap();
    assert!(error.contains("exceeded max rerun [1/1]"), "unexpected error: {error}");
    assert!(result.traceback.unwrap().contains("conn reset"));
}

#[tokio::test]
async fn unretryable_subtask_reports_offending_ops() {
    let mut clients = MockClients::default();
    expect_resource_lifecycle(&mut clients, 1);
    expect_slot_pool_recovery(&mut clients, 1);

    let mut graph = ChunkGraph::new();
    let b = graph.add_chunk(compute_chunk(
        "b",
        "op-b",
        &[],
        false,
        Arc::new(FixedSizeKernel::new(150, 250)),
    ));
    graph.mark_result(b);
    let mut subtask = test_subtask("subtask-1", graph);
    subtask.retryable = false;

    let runner = FakeSubtaskRunner::scripted(vec![Err(ClientError::Io(
        "conn reset".to_owned(),
    )
    .into())]);
    let executor = make_executor(clients, runner.clone(), SubtaskExecutorConfig::default());

    let result = executor
        .run_subtask(subtask, BandName::from(TEST_BAND), TEST_SUPERVISOR.to_owned())
        .await
        .unwrap();

    assert_eq!(result.status, SubtaskStatus::Errored);
    assert_eq!(runner.run_call_count(), 1);
    let error = result.error.unwrap();
    assert!(error.contains("not retryable"), "unexpected error: {error}");
    assert!(error.contains("op-b"), "unexpected error: {error}");
}

#[tokio::test]
async fn graceful_cancel_releases_resources_and_is_idempotent() {
    let mut clients = MockClients::default();
    expect_resource_lifecycle(&mut clients, 1);
    // kill_slot must not be called: no expectation installed.

    let runner = FakeSubtaskRunner::hanging(false);
    let executor = make_executor(clients, runner.clone(), SubtaskExecutorConfig::default());

    let run = tokio::spawn({
        let executor = executor.clone();
        async move {
            executor
                .run_subtask(
                    compute_only_subtask("subtask-1"),
                    BandName::from(TEST_BAND),
                    TEST_SUPERVISOR.to_owned(),
                )
                .await
        }
    });
    wait_until(|| runner.run_call_count() == 1).await;

    let subtask_id = SubtaskId::from("subtask-1");
    executor.cancel_subtask(&subtask_id, Duration::from_secs(1)).await;
    // Converged: cancelled, removed, and safe to cancel again.
    executor.cancel_subtask(&subtask_id, Duration::from_secs(1)).await;

    let result = run.await.unwrap().unwrap();
    assert_eq!(result.status, SubtaskStatus::Cancelled);
    assert_eq!(result.progress, 1.0);
    assert_eq!(runner.cancel_call_count(), 1);
    assert!(!executor.is_tracked(&subtask_id));
}

#[tokio::test]
async fn stuck_cancel_escalates_to_slot_kill() {
    let mut clients = MockClients::default();
    expect_resource_lifecycle(&mut clients, 1);
    clients.slot_manager.expect_kill_slot().times(1).withf(|slot| *slot == SLOT).returning(
        |_| Ok(()),
    );
    expect_slot_pool_recovery(&mut clients, 1);

    let runner = FakeSubtaskRunner::hanging(true);
    let executor = make_executor(clients, runner.clone(), SubtaskExecutorConfig::default());

    let run = tokio::spawn({
        let executor = executor.clone();
        async move {
            executor
                .run_subtask(
                    compute_only_subtask("subtask-1"),
                    BandName::from(TEST_BAND),
                    TEST_SUPERVISOR.to_owned(),
                )
                .await
        }
    });
    wait_until(|| runner.run_call_count() == 1).await;

    let subtask_id = SubtaskId::from("subtask-1");
    executor.cancel_subtask(&subtask_id, Duration::from_millis(50)).await;

    let result = run.await.unwrap().unwrap();
    assert_eq!(result.status, SubtaskStatus::Cancelled);
    assert_eq!(runner.cancel_call_count(), 1);
    assert!(!executor.is_tracked(&subtask_id));
}

#[tokio::test]
async fn disabled_slot_kill_clamps_the_kill_timeout() {
    // With slot killing disabled a stuck graceful cancel must never
    // escalate; the runner eventually acknowledges here so the wait ends.
    let mut clients = MockClients::default();
    expect_resource_lifecycle(&mut clients, 1);

    let runner = FakeSubtaskRunner::hanging(false);
    let config = SubtaskExecutorConfig { enable_kill_slot: false, ..Default::default() };
    let executor = make_executor(clients, runner.clone(), config);

    let run = tokio::spawn({
        let executor = executor.clone();
        async move {
            executor
                .run_subtask(
                    compute_only_subtask("subtask-1"),
                    BandName::from(TEST_BAND),
                    TEST_SUPERVISOR.to_owned(),
                )
                .await
        }
    });
    wait_until(|| runner.run_call_count() == 1).await;

    executor
        .cancel_subtask(&SubtaskId::from("subtask-1"), Duration::from_millis(1))
        .await;
    let result = run.await.unwrap().unwrap();
    assert_eq!(result.status, SubtaskStatus::Cancelled);
}

#[tokio::test(start_paused = true)]
async fn data_prepare_deadline_fails_the_subtask() {
    let clients = MockClients::default();
    let mut provider = clients.into_provider(FakeSubtaskRunner::hanging(false));
    Arc::get_mut(&mut provider).unwrap().storage = Arc::new(HangingStorage);
    // Only the usage upload runs after the deadline.
    let mut slot_manager =
        rill_subtask_types::communication::MockSlotManagerClient::new();
    slot_manager.expect_upload_slot_usages().times(1).returning(|_| Ok(()));
    Arc::get_mut(&mut provider).unwrap().slot_manager = Arc::new(slot_manager);

    let mut graph = ChunkGraph::new();
    let a = graph.add_chunk(fetch_chunk("a"));
    graph.mark_result(a);
    let subtask = test_subtask("subtask-1", graph);

    let config = SubtaskExecutorConfig { data_prepare_timeout_secs: 1, ..Default::default() };
    let executor = Arc::new(SubtaskExecutor::new(config, provider));

    let result = executor
        .run_subtask(subtask, BandName::from(TEST_BAND), TEST_SUPERVISOR.to_owned())
        .await
        .unwrap();

    assert_eq!(result.status, SubtaskStatus::Errored);
    assert_eq!(result.progress, 1.0);
    assert!(result.error.unwrap().contains("timed out"));
}

#[tokio::test]
async fn failed_usage_upload_overwrites_the_result() {
    let mut clients = MockClients::default();
    clients.quota.expect_request_batch_quota().times(1).returning(|_| Ok(()));
    clients.slot_manager.expect_acquire_free_slot().times(1).returning(|_| Ok(SLOT));
    clients.slot_manager.expect_release_free_slot().times(1).returning(|_, _| Ok(()));
    clients.quota.expect_release_quotas().times(1).returning(|_| Ok(()));
    clients
        .slot_manager
        .expect_upload_slot_usages()
        .times(1)
        .returning(|_| Err(ClientError::Peer("upload failed".to_owned())));

    let subtask = compute_only_subtask("subtask-1");
    let inner_result = succeeded_result(&subtask, 250);
    let runner = FakeSubtaskRunner::scripted(vec![Ok(inner_result)]);
    let executor = make_executor(clients, runner, SubtaskExecutorConfig::default());

    let result = executor
        .run_subtask(subtask, BandName::from(TEST_BAND), TEST_SUPERVISOR.to_owned())
        .await
        .unwrap();

    // The usage upload failure replaces the successful result.
    assert_eq!(result.status, SubtaskStatus::Errored);
    assert!(result.error.unwrap().contains("upload failed"));
}

#[tokio::test]
async fn cancelling_an_unknown_subtask_is_a_noop() {
    let clients = MockClients::default();
    let executor =
        make_executor(clients, FakeSubtaskRunner::hanging(false), Default::default());
    executor.cancel_subtask(&SubtaskId::from("missing"), Duration::from_secs(1)).await;
}
