mod common;

use std::time::Duration;

use common::{DETECTED_CROP, FakeEncoder, Harness, PROBE_FAIL_MARKER, states_in, states_of};
use transcode_factory::domain::{Job, JobDefinition, JobState, Stage};
use transcode_factory::pipeline::StageLimits;

#[tokio::test]
async fn test_autocrop_job_walks_every_state_and_leaves_one_audit_row() {
    let harness = Harness::with_defaults().await;
    let mut events = harness.events();

    let definition = harness
        .definition("feature")
        .with_autocrop(true)
        .with_codec("libx265")
        .with_crf(18);
    let id = harness.ctx.submit(definition).await.unwrap();
    let pipeline = harness.start().await;

    let seen = states_of(&mut events, id).await;
    assert_eq!(
        states_in(&seen, Stage::Crop),
        vec![
            JobState::Submitted,
            JobState::ProbingMetadata,
            JobState::BuildingVideoFilter,
            JobState::PendingTranscode,
        ]
    );
    assert_eq!(
        states_in(&seen, Stage::Transcode),
        vec![
            JobState::Submitted,
            JobState::ProbingMetadata,
            JobState::PendingTranscode,
            JobState::Transcoding,
            JobState::Success,
        ]
    );
    assert!(states_in(&seen, Stage::Copy).is_empty());

    let completed = harness.wait_for_completed(1).await;
    assert_eq!(completed.len(), 1);
    assert_eq!(completed[0].id, id);
    assert_eq!(completed[0].status, "success");
    assert!(completed[0].autocrop);

    let command = completed[0].command_args().unwrap();
    let vf = command.iter().position(|a| a == "-vf").unwrap();
    assert_eq!(command[vf + 1], DETECTED_CROP);

    assert!(harness.repo.get_metadata(id).await.unwrap().is_none());
    let status = harness.repo.status().await.unwrap();
    assert!(status.active.is_empty());
    assert!(status.queued.is_empty());
    assert!(harness.repo.active_log_files().await.unwrap().is_empty());

    // Cached once by the crop stage and reused by the transcode stage.
    assert_eq!(harness.encoder.probes(), 1);

    harness.shutdown(pipeline).await;
}

#[tokio::test]
async fn test_copy_job_skips_crop_and_runs_on_the_copy_stage_only() {
    let harness = Harness::with_defaults().await;
    let mut events = harness.events();

    let definition = harness
        .definition("remux")
        .with_autocrop(true)
        .with_codec("copy");
    let id = harness.ctx.submit(definition).await.unwrap();
    let pipeline = harness.start().await;

    let seen = states_of(&mut events, id).await;
    assert!(seen.iter().all(|e| e.stage == Stage::Copy), "{seen:?}");
    assert_eq!(
        states_in(&seen, Stage::Copy),
        vec![
            JobState::Submitted,
            JobState::ProbingMetadata,
            JobState::PendingTranscode,
            JobState::Transcoding,
            JobState::Success,
        ]
    );

    let completed = harness.wait_for_completed(1).await;
    assert_eq!(completed[0].status, "success");
    assert!(!completed[0].command_args().unwrap().contains(&"-vf".to_string()));

    harness.shutdown(pipeline).await;
}

#[tokio::test]
async fn test_unreadable_source_fails_the_job_without_retry() {
    let harness = Harness::with_defaults().await;
    let mut events = harness.events();

    let definition = harness.definition(&format!("broken-{PROBE_FAIL_MARKER}"));
    let id = harness.ctx.submit(definition).await.unwrap();
    let pipeline = harness.start().await;

    let seen = states_of(&mut events, id).await;
    assert_eq!(
        states_in(&seen, Stage::Transcode),
        vec![
            JobState::Submitted,
            JobState::ProbingMetadata,
            JobState::Failed
        ]
    );

    let completed = harness.wait_for_completed(1).await;
    assert_eq!(completed[0].status, "failed");
    assert!(completed[0].command_args().unwrap().is_empty());

    // Several poll intervals later the job has not come back.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(harness.repo.list_completed(10).await.unwrap().len(), 1);
    assert_eq!(harness.encoder.probes(), 1);
    assert_eq!(harness.encoder.encodes.total(), 0);
    assert!(harness.repo.status().await.unwrap().queued.is_empty());

    harness.shutdown(pipeline).await;
}

#[tokio::test]
async fn test_unreadable_source_in_crop_stage_only_skips_the_crop_size_check() {
    let harness = Harness::with_defaults().await;
    let mut events = harness.events();

    let definition = harness
        .definition(&format!("cropped-{PROBE_FAIL_MARKER}"))
        .with_autocrop(true);
    let id = harness.ctx.submit(definition).await.unwrap();
    let pipeline = harness.start().await;

    // The crop stage degrades, the transcode stage probes again and fails.
    let seen = states_of(&mut events, id).await;
    assert_eq!(
        states_in(&seen, Stage::Crop),
        vec![
            JobState::Submitted,
            JobState::ProbingMetadata,
            JobState::BuildingVideoFilter,
            JobState::PendingTranscode,
        ]
    );
    assert_eq!(
        states_in(&seen, Stage::Transcode),
        vec![
            JobState::Submitted,
            JobState::ProbingMetadata,
            JobState::Failed
        ]
    );

    let completed = harness.wait_for_completed(1).await;
    assert_eq!(completed[0].status, "failed");

    harness.shutdown(pipeline).await;
}

/// Submit `count` jobs built by `make` and wait for all of them to succeed.
async fn run_to_completion(
    harness: &Harness,
    count: usize,
    make: impl Fn(JobDefinition) -> JobDefinition,
) {
    let definitions = (0..count)
        .map(|i| make(harness.definition(&format!("episode-{i:02}"))))
        .collect();
    let ids = harness.ctx.submit_many(definitions).await.unwrap();
    assert_eq!(ids.len(), count);

    let pipeline = harness.start().await;
    let completed = harness.wait_for_completed(count).await;
    assert!(completed.iter().all(|row| row.status == "success"));

    harness.cancel.cancel();
    pipeline.join().await;
}

#[tokio::test]
async fn test_transcode_concurrency_never_exceeds_its_limit() {
    for limit in [1, 3] {
        let limits = StageLimits {
            transcode: limit,
            ..StageLimits::default()
        };
        let harness = Harness::new(FakeEncoder::new(Duration::from_millis(30)), limits).await;

        run_to_completion(&harness, 10 * limit, |definition| definition).await;

        let peak = harness.encoder.encodes.peak();
        assert!((1..=limit).contains(&peak), "limit {limit}, peak {peak}");
        assert_eq!(harness.encoder.encodes.total(), 10 * limit);
        assert_eq!(harness.encoder.crops.total(), 0);
    }
}

#[tokio::test]
async fn test_copy_concurrency_never_exceeds_its_limit() {
    for limit in [1, 3] {
        let limits = StageLimits {
            copy: limit,
            transcode: 1,
            ..StageLimits::default()
        };
        let harness = Harness::new(FakeEncoder::new(Duration::from_millis(30)), limits).await;

        run_to_completion(&harness, 10 * limit, |definition| {
            definition.with_codec("copy")
        })
        .await;

        let peak = harness.encoder.encodes.peak();
        assert!((1..=limit).contains(&peak), "limit {limit}, peak {peak}");
        assert_eq!(harness.encoder.encodes.total(), 10 * limit);
    }
}

#[tokio::test]
async fn test_crop_concurrency_never_exceeds_its_limit() {
    for limit in [1, 3] {
        let limits = StageLimits {
            crop: limit,
            transcode: 2,
            ..StageLimits::default()
        };
        let encoder = FakeEncoder::new(Duration::from_millis(5))
            .with_crop_time(Duration::from_millis(30));
        let harness = Harness::new(encoder, limits).await;

        run_to_completion(&harness, 10 * limit, |definition| {
            definition.with_autocrop(true)
        })
        .await;

        let crop_peak = harness.encoder.crops.peak();
        assert!(
            (1..=limit).contains(&crop_peak),
            "limit {limit}, crop peak {crop_peak}"
        );
        assert!(harness.encoder.encodes.peak() <= 2);
        assert_eq!(harness.encoder.crops.total(), 10 * limit);
        assert_eq!(harness.encoder.encodes.total(), 10 * limit);
    }
}

#[tokio::test]
async fn test_cancelled_job_is_abandoned_and_resumed_after_restart() {
    let encoder = FakeEncoder::new(Duration::from_secs(20));
    let harness = Harness::new(encoder, StageLimits::default()).await;
    let mut events = harness.events();

    let id = harness.ctx.submit(harness.definition("long")).await.unwrap();
    let pipeline = harness.start().await;
    harness
        .wait_until("the encode to start", |encoder| encoder.encodes.running() == 1)
        .await;

    harness.cancel.cancel();
    pipeline.join().await;

    let seen = states_of(&mut events, id).await;
    assert_eq!(seen.last().map(|e| e.state), Some(JobState::Cancelled));
    assert!(harness.repo.list_completed(10).await.unwrap().is_empty());
    assert!(harness.repo.get_queued(id).await.is_ok());
    let status = harness.repo.status().await.unwrap();
    assert_eq!(status.active.len(), 1);
    assert_eq!(status.active[0].state, Some(JobState::Cancelled));

    let harness = harness
        .restart(FakeEncoder::new(Duration::from_millis(10)))
        .await;
    let pipeline = harness.start().await;

    let completed = harness.wait_for_completed(1).await;
    assert_eq!(completed[0].id, id);
    assert_eq!(completed[0].status, "success");
    assert_eq!(harness.encoder.encodes.total(), 1);

    harness.shutdown(pipeline).await;
}

#[tokio::test]
async fn test_startup_clears_stale_leases() {
    let harness = Harness::with_defaults().await;
    let id = harness.ctx.submit(harness.definition("interrupted")).await.unwrap();

    // A previous run died mid-encode.
    let claimed = harness
        .repo
        .claim_next(Stage::Transcode, JobState::Transcoding)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(claimed.id, id);
    harness
        .repo
        .register_log_file(id, "/var/log/stale.log")
        .await
        .unwrap();
    assert!(
        harness
            .repo
            .claim_next(Stage::Transcode, JobState::Submitted)
            .await
            .unwrap()
            .is_none()
    );

    let pipeline = harness.start().await;
    let completed = harness.wait_for_completed(1).await;
    assert_eq!(completed[0].id, id);
    assert_eq!(completed[0].status, "success");

    harness.shutdown(pipeline).await;
}

#[tokio::test]
async fn test_failed_finish_leaves_job_queued_without_audit_row() {
    let harness = Harness::with_defaults().await;

    sqlx::query(
        r#"
        CREATE TRIGGER block_queue_delete BEFORE DELETE ON transcode_queue
        BEGIN
            SELECT RAISE(ABORT, 'queue delete blocked');
        END
        "#,
    )
    .execute(&harness.write_pool)
    .await
    .unwrap();

    let id = harness.ctx.submit(harness.definition("stuck")).await.unwrap();
    let pipeline = harness.start().await;

    let deadline = tokio::time::Instant::now() + Duration::from_secs(30);
    while harness.encoder.encodes.total() < 1 {
        assert!(tokio::time::Instant::now() < deadline, "encode never ran");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert!(harness.repo.list_completed(10).await.unwrap().is_empty());
    let queued = harness.repo.get_queued(id).await.unwrap();
    assert!(harness.repo.get_metadata(id).await.unwrap().is_some());

    // Still leased, so no stage picks it up again.
    let status = harness.repo.status().await.unwrap();
    assert_eq!(status.active.len(), 1);
    assert_eq!(status.active[0].state, Some(JobState::Success));
    assert_eq!(harness.encoder.encodes.total(), 1);

    sqlx::query("DROP TRIGGER block_queue_delete")
        .execute(&harness.write_pool)
        .await
        .unwrap();

    let job = Job::new(id, queued.definition(), queued.crop_complete);
    let trace = vec!["-i".to_string(), job.definition.source.clone()];
    harness
        .ctx
        .finisher
        .finish(&job, Some(trace.clone()), JobState::Success)
        .await
        .unwrap();
    // Replaying is harmless.
    harness
        .ctx
        .finisher
        .finish(&job, Some(trace), JobState::Success)
        .await
        .unwrap();

    let completed = harness.repo.list_completed(10).await.unwrap();
    assert_eq!(completed.len(), 1);
    assert!(harness.repo.status().await.unwrap().active.is_empty());

    harness.shutdown(pipeline).await;
}
