use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;

use wipd::config::AppConfig;
use wipd::context::AppContext;
use wipd::core::assets::AssetCatalog;
use wipd::core::devices::DeviceRegistry;
use wipd::core::guard::MountGuard;
use wipd::core::models::{BuildOptions, BuildRequest, Job, JobStatus, LogCategory, LogEntry, LogLevel};
use wipd::core::pipeline::PipelineExecutor;
use wipd::core::scheduler::{Scheduler, SubmitError};
use wipd::db;
use wipd::imaging::{SimulatedTool, ToolJournal};

const DEVICE: &str = "ws-100";
const OS_ID: u32 = 10;

struct Harness {
    _root: TempDir,
    ctx: AppContext,
    scheduler: Scheduler,
    journal: ToolJournal,
    export_dir: std::path::PathBuf,
    temp_dir: std::path::PathBuf,
}

async fn harness(mount_slots: usize) -> Harness {
    harness_with_timeout(mount_slots, 30).await
}

async fn harness_with_timeout(mount_slots: usize, stage_timeout_secs: u64) -> Harness {
    let root = tempfile::tempdir().expect("tempdir");
    let base = root.path();

    let config = AppConfig {
        assets_root: base.join("assets"),
        devices_dir: base.join("devices"),
        temp_dir: base.join("runtime/temp"),
        mount_dir: base.join("runtime/mount"),
        export_dir: base.join("runtime/export"),
        database_path: base.join("runtime/data/wipd.db"),
        min_image_bytes: 8,
        mount_slots,
        queue_capacity: 8,
        stage_timeout_secs,
        ..AppConfig::default()
    };
    config.ensure_runtime_dirs().expect("runtime dirs");

    std::fs::create_dir_all(config.devices_dir.as_path()).unwrap();
    std::fs::write(
        config.devices_dir.join("ws-100.json"),
        r#"{"deviceId":"ws-100","osSupport":[{"osId":10}]}"#,
    )
    .unwrap();

    seed_assets(&config.assets_root);

    let db_conn = db::init(&config.database_path).await.expect("db init");
    let ctx = AppContext::new(config, db_conn);

    let registry = Arc::new(DeviceRegistry::load(&ctx.config.devices_dir).unwrap());
    let catalog = Arc::new(AssetCatalog::new(
        &ctx.config.assets_root,
        ctx.config.min_image_bytes,
    ));
    let (tool, journal) = SimulatedTool::new();
    let guard = MountGuard::new(mount_slots);
    let executor = PipelineExecutor::new(
        ctx.clone(),
        Arc::new(tool),
        guard,
        catalog,
        registry.clone(),
    );
    let (scheduler, _dispatcher) = Scheduler::start(ctx.clone(), executor, registry, 8);

    Harness {
        export_dir: ctx.config.export_dir.clone(),
        temp_dir: ctx.config.temp_dir.clone(),
        _root: root,
        ctx,
        scheduler,
        journal,
    }
}

fn seed_assets(assets_root: &std::path::Path) {
    let sbi = assets_root.join("sbi");
    std::fs::create_dir_all(&sbi).unwrap();
    std::fs::write(sbi.join("install_10.wim"), b"simulated base image").unwrap();

    let driver = assets_root.join("drivers/net-driver");
    std::fs::create_dir_all(&driver).unwrap();
    std::fs::write(
        driver.join("driver.json"),
        r#"{"driverName":"net-driver","supportedOperatingSystems":[10],"order":1}"#,
    )
    .unwrap();
    std::fs::write(driver.join("netdrv.inf"), b"[Version]").unwrap();

    let update = assets_root.join("updates/kb500");
    std::fs::create_dir_all(&update).unwrap();
    std::fs::write(
        update.join("update.json"),
        r#"{"updateName":"kb500","updateType":"msu","supportedOperatingSystems":[10],"downloadFileName":"kb500.msu","order":1}"#,
    )
    .unwrap();
    std::fs::write(update.join("kb500.msu"), b"update payload").unwrap();

    let scripts = assets_root.join("postdeploy");
    std::fs::create_dir_all(&scripts).unwrap();
    std::fs::write(scripts.join("setup.ps1"), b"Write-Host 'first boot'").unwrap();
}

fn request() -> BuildRequest {
    BuildRequest {
        device: DEVICE.to_string(),
        os_id: OS_ID,
        options: BuildOptions::default(),
    }
}

async fn wait_terminal(ctx: &AppContext, job_id: &str) -> Job {
    for _ in 0..500 {
        if let Some(job) = db::jobs::get(&ctx.db, job_id.to_string()).await.unwrap()
            && job.status.is_terminal()
        {
            return job;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("job {job_id} never reached a terminal state");
}

#[tokio::test]
async fn test_successful_build_end_to_end() {
    let h = harness(1).await;

    let job_id = h.scheduler.submit(request()).await.expect("submit");

    // The job is queryable the moment submit returns.
    let snapshot = db::jobs::get(&h.ctx.db, job_id.clone())
        .await
        .unwrap()
        .expect("job visible immediately after submit");
    assert!(matches!(
        snapshot.status,
        JobStatus::Created | JobStatus::Running
    ));

    let job = wait_terminal(&h.ctx, &job_id).await;

    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.progress, 100);
    assert_eq!(job.step_number, 9);
    assert!(job.started_at.is_some());
    assert!(job.completed_at.is_some());
    assert!(job.error.is_none());

    let results = job.results.expect("completed job carries results");
    assert_eq!(results.drivers_integrated, 1);
    assert_eq!(results.updates_integrated, 1);
    assert!(results.payloads_staged >= 1);
    assert!(results.export_name.starts_with("10_ws-100_"));
    assert!(results.export_name.ends_with(".wim"));
    assert!(h.export_dir.join(&results.export_name).is_file());

    // Working copy is removed during cleanup.
    let leftovers: Vec<_> = std::fs::read_dir(&h.temp_dir)
        .unwrap()
        .flatten()
        .collect();
    assert!(leftovers.is_empty(), "temp dir not cleaned: {leftovers:?}");

    let ops = h.journal.operations();
    let position = |op: &str| {
        ops.iter()
            .position(|o| o.starts_with(op))
            .unwrap_or_else(|| panic!("operation '{op}' never invoked: {ops:?}"))
    };
    assert!(position("mount") < position("add_driver"));
    assert!(position("add_driver") < position("add_package"));
    assert!(position("add_package") < position("cleanup_image"));
    assert!(position("cleanup_image") < position("unmount_commit"));
    assert!(position("unmount_commit") < position("export"));
    assert!(!h.journal.invoked("unmount_discard"));
}

#[tokio::test]
async fn test_builds_never_overlap_in_mount_section() {
    let h = harness(1).await;
    h.journal.set_latency(Duration::from_millis(5));

    let first = h.scheduler.submit(request()).await.expect("submit first");
    let second = h.scheduler.submit(request()).await.expect("submit second");

    let first = wait_terminal(&h.ctx, &first).await;
    let second = wait_terminal(&h.ctx, &second).await;

    assert_eq!(first.status, JobStatus::Completed);
    assert_eq!(second.status, JobStatus::Completed);
    assert_eq!(h.journal.peak_concurrent_mounts(), 1);
}

#[tokio::test]
async fn test_invalid_request_leaves_no_trace() {
    let h = harness(1).await;

    let unsupported = BuildRequest {
        device: DEVICE.to_string(),
        os_id: 99,
        options: BuildOptions::default(),
    };
    let err = h.scheduler.submit(unsupported).await.unwrap_err();
    assert!(matches!(err, SubmitError::UnsupportedOs { os_id: 99, .. }));

    let unknown = BuildRequest {
        device: "no-such-device".to_string(),
        os_id: OS_ID,
        options: BuildOptions::default(),
    };
    let err = h.scheduler.submit(unknown).await.unwrap_err();
    assert!(matches!(err, SubmitError::UnknownDevice(_)));

    let jobs = db::jobs::list(&h.ctx.db, db::jobs::JobFilter::default())
        .await
        .unwrap();
    assert!(jobs.is_empty());
    assert_eq!(h.journal.invocation_count(), 0);
}

#[tokio::test]
async fn test_missing_base_image_fails_without_mounting() {
    let h = harness(1).await;
    std::fs::remove_dir_all(h.ctx.config.assets_root.join("sbi")).unwrap();

    let job_id = h.scheduler.submit(request()).await.expect("submit");
    let job = wait_terminal(&h.ctx, &job_id).await;

    assert_eq!(job.status, JobStatus::Failed);
    let error = job.error.expect("failed job carries error");
    assert!(error.contains("no base image"), "unexpected error: {error}");
    assert!(!h.journal.invoked("mount"));
}

#[tokio::test]
async fn test_stage_failure_discards_mount_and_frees_slot() {
    let h = harness(1).await;
    h.journal.fail_on("add_package");

    let failed_id = h.scheduler.submit(request()).await.expect("submit");
    let failed = wait_terminal(&h.ctx, &failed_id).await;

    assert_eq!(failed.status, JobStatus::Failed);
    assert!(failed.error.unwrap().contains("Integrating updates"));
    assert!(h.journal.invoked("unmount_discard"));
    assert!(!h.journal.invoked("export"));

    // The slot must be free again: the next build runs to completion.
    h.journal.clear_failures();
    let ok_id = h.scheduler.submit(request()).await.expect("submit");
    let ok = wait_terminal(&h.ctx, &ok_id).await;
    assert_eq!(ok.status, JobStatus::Completed);
}

#[tokio::test]
async fn test_cancel_while_waiting_for_slot_never_mounts() {
    let h = harness(1).await;
    h.journal.set_latency(Duration::from_millis(50));

    let running = h.scheduler.submit(request()).await.expect("submit");
    // Let the first job take the only slot.
    for _ in 0..200 {
        if h.journal.invoked("mount") {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert!(h.journal.invoked("mount"), "first job never mounted");

    let queued = h.scheduler.submit(request()).await.expect("submit");
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(h.scheduler.cancel(&queued).await);

    let queued = wait_terminal(&h.ctx, &queued).await;
    assert_eq!(queued.status, JobStatus::Cancelled);
    assert!(queued.error.is_none());
    assert!(queued.results.is_none());

    let running = wait_terminal(&h.ctx, &running).await;
    assert_eq!(running.status, JobStatus::Completed);

    // Exactly one mount: the cancelled job never entered the mount section.
    let mounts = h
        .journal
        .operations()
        .iter()
        .filter(|o| o.starts_with("mount"))
        .count();
    assert_eq!(mounts, 1);
}

#[tokio::test]
async fn test_cancel_running_job_takes_effect_at_stage_boundary() {
    let h = harness(1).await;
    h.journal.set_latency(Duration::from_millis(50));

    let job_id = h.scheduler.submit(request()).await.expect("submit");
    for _ in 0..200 {
        if h.journal.invoked("mount") {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert!(h.scheduler.cancel(&job_id).await);

    let job = wait_terminal(&h.ctx, &job_id).await;
    assert_eq!(job.status, JobStatus::Cancelled);
    assert!(h.journal.invoked("unmount_discard"));
    assert!(!h.journal.invoked("export"));
}

#[tokio::test]
async fn test_cancel_unknown_or_finished_job_returns_false() {
    let h = harness(1).await;

    assert!(!h.scheduler.cancel("no-such-job").await);

    let job_id = h.scheduler.submit(request()).await.expect("submit");
    wait_terminal(&h.ctx, &job_id).await;
    assert!(!h.scheduler.cancel(&job_id).await);
}

#[tokio::test]
async fn test_skip_flags_bypass_integration_stages() {
    let h = harness(1).await;

    let req = BuildRequest {
        device: DEVICE.to_string(),
        os_id: OS_ID,
        options: BuildOptions {
            skip_drivers: true,
            skip_updates: true,
            skip_validation: false,
        },
    };
    let job_id = h.scheduler.submit(req).await.expect("submit");
    let job = wait_terminal(&h.ctx, &job_id).await;

    assert_eq!(job.status, JobStatus::Completed);
    let results = job.results.unwrap();
    assert_eq!(results.drivers_integrated, 0);
    assert_eq!(results.updates_integrated, 0);
    assert!(!h.journal.invoked("add_driver"));
    assert!(!h.journal.invoked("add_package"));
}

#[tokio::test]
async fn test_invalid_update_fails_build_unless_validation_skipped() {
    let h = harness(1).await;
    // Zero-byte package fails validation.
    std::fs::write(h.ctx.config.assets_root.join("updates/kb500/kb500.msu"), b"").unwrap();

    let job_id = h.scheduler.submit(request()).await.expect("submit");
    let job = wait_terminal(&h.ctx, &job_id).await;
    assert_eq!(job.status, JobStatus::Failed);
    assert!(job.error.unwrap().contains("kb500"));
    assert!(!h.journal.invoked("mount"));

    let req = BuildRequest {
        device: DEVICE.to_string(),
        os_id: OS_ID,
        options: BuildOptions {
            skip_validation: true,
            ..BuildOptions::default()
        },
    };
    let job_id = h.scheduler.submit(req).await.expect("submit");
    let job = wait_terminal(&h.ctx, &job_id).await;
    assert_eq!(job.status, JobStatus::Completed);
    // The invalid package was excluded, not integrated.
    assert_eq!(job.results.unwrap().updates_integrated, 0);
}

#[tokio::test]
async fn test_broadcast_observers_see_job_lifecycle() {
    let h = harness(1).await;
    let mut events = h.ctx.broadcaster.subscribe();

    let job_id = h.scheduler.submit(request()).await.expect("submit");
    wait_terminal(&h.ctx, &job_id).await;

    let mut updates: Vec<Job> = Vec::new();
    let mut saw_log = false;
    loop {
        let event = tokio::time::timeout(Duration::from_secs(2), events.recv())
            .await
            .expect("timeout waiting for event")
            .expect("channel closed");
        match event {
            wipd::core::Event::JobUpdate { job } if job.id == job_id => {
                let terminal = job.status.is_terminal();
                updates.push(job);
                if terminal {
                    break;
                }
            }
            wipd::core::Event::JobLog { job_id: id, .. } if id == job_id => saw_log = true,
            _ => {}
        }
    }

    assert!(saw_log, "no jobLog events observed");
    assert_eq!(updates.first().unwrap().status, JobStatus::Created);
    assert_eq!(updates.last().unwrap().status, JobStatus::Completed);
    assert!(updates.iter().any(|j| j.status == JobStatus::Running));
    // Progress never moves backwards across published snapshots.
    for pair in updates.windows(2) {
        assert!(pair[1].progress >= pair[0].progress);
    }
}

#[tokio::test]
async fn test_slow_stage_times_out_and_cleans_up() {
    let h = harness_with_timeout(1, 1).await;
    // Every tool call takes longer than the stage budget, so the mount
    // stage trips the timeout.
    h.journal.set_latency(Duration::from_secs(2));

    let job_id = h.scheduler.submit(request()).await.expect("submit");
    let job = wait_terminal(&h.ctx, &job_id).await;

    assert_eq!(job.status, JobStatus::Failed);
    let error = job.error.expect("failed job carries error");
    assert!(error.contains("timed out"), "unexpected error: {error}");
    assert!(
        error.contains("Mounting base image"),
        "unexpected error: {error}"
    );
    assert!(!h.journal.invoked("unmount_commit"));
    assert!(!h.journal.invoked("export"));

    // The working copy does not outlive the failed job.
    let leftovers: Vec<_> = std::fs::read_dir(&h.temp_dir)
        .unwrap()
        .flatten()
        .collect();
    assert!(leftovers.is_empty(), "temp dir not cleaned: {leftovers:?}");
}

#[tokio::test]
async fn test_startup_recovery_fails_interrupted_jobs() {
    let h = harness(1).await;

    // Rows left behind by a previous daemon process: one picked up by a
    // worker, one still queued, one already finished.
    let mut stale_running = Job::new(&request());
    stale_running.transition(JobStatus::Running).unwrap();
    db::jobs::create(&h.ctx.db, stale_running.clone()).await.unwrap();

    let stale_queued = Job::new(&request());
    db::jobs::create(&h.ctx.db, stale_queued.clone()).await.unwrap();

    let mut done = Job::new(&request());
    done.transition(JobStatus::Running).unwrap();
    done.transition(JobStatus::Completed).unwrap();
    db::jobs::create(&h.ctx.db, done.clone()).await.unwrap();

    h.scheduler.recover_interrupted().await.unwrap();

    for id in [&stale_running.id, &stale_queued.id] {
        let job = db::jobs::get(&h.ctx.db, id.clone()).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert!(job.error.unwrap().contains("interrupted"));
        assert!(job.completed_at.is_some());
    }

    // Terminal jobs are left alone.
    let done = db::jobs::get(&h.ctx.db, done.id).await.unwrap().unwrap();
    assert_eq!(done.status, JobStatus::Completed);
    assert!(done.error.is_none());
}

#[tokio::test]
async fn test_purge_removes_old_terminal_jobs_and_their_logs() {
    let h = harness(1).await;

    let mut old = Job::new(&request());
    old.transition(JobStatus::Running).unwrap();
    old.transition(JobStatus::Failed).unwrap();
    old.created_at = chrono::Utc::now() - chrono::Duration::days(10);
    db::jobs::create(&h.ctx.db, old.clone()).await.unwrap();
    db::logs::append(
        &h.ctx.db,
        LogEntry::new(&old.id, LogLevel::Error, LogCategory::Job, "test", "old failure"),
    )
    .await
    .unwrap();

    let recent_id = h.scheduler.submit(request()).await.expect("submit");
    wait_terminal(&h.ctx, &recent_id).await;

    let purged = db::jobs::purge_older_than(&h.ctx.db, 7).await.unwrap();
    assert_eq!(purged, 1);

    assert!(db::jobs::get(&h.ctx.db, old.id.clone()).await.unwrap().is_none());
    // The purged job's log stream goes with it.
    let logs = db::logs::for_job(&h.ctx.db, old.id, None, 0).await.unwrap();
    assert!(logs.is_empty());

    // The recent job and its logs survive.
    assert!(db::jobs::get(&h.ctx.db, recent_id.clone()).await.unwrap().is_some());
    let logs = db::logs::for_job(&h.ctx.db, recent_id, None, 0).await.unwrap();
    assert!(!logs.is_empty());
}

#[tokio::test]
async fn test_job_logs_are_persisted_in_order() {
    let h = harness(1).await;

    let job_id = h.scheduler.submit(request()).await.expect("submit");
    wait_terminal(&h.ctx, &job_id).await;

    let logs = db::logs::for_job(&h.ctx.db, job_id, None, 0).await.unwrap();
    assert!(!logs.is_empty());
    assert!(logs[0].message.contains("queued"));
    assert!(logs.last().unwrap().message.contains("completed"));
}
