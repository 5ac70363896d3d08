//! End-to-end runs: config text -> tasks -> scheduler -> state files.

use fs2::FileExt;
use std::path::{Path, PathBuf};
use sweep_core::types::{CommandStatus, Task};
use sweep_core::{build_tasks, RunContext, SweepConfig};
use sweep_exec::state::{PARAM_FILE, RESOURCE_KEY, SCRIPTS_KEY, STAT_FILE};
use sweep_exec::{RunSummary, Scheduler, SchedulerEvent, SchedulerOptions, StateStore};
use tempfile::TempDir;
use tokio::sync::mpsc;

const MARKERS: &str = r"
template:
  check: test {x} -ne 2
  train: touch {_output}/trained.{x}
resource: [0, 1]
---
x: [1, 2, 3]
";

fn tasks(root: &Path, yaml: &str) -> Vec<Task> {
    let config = SweepConfig::parse(yaml).unwrap();
    let ctx = RunContext::new(root, "20240102.030405");
    build_tasks(&config, &ctx).unwrap().tasks
}

async fn run(
    root: &Path,
    yaml: &str,
    options: SchedulerOptions,
) -> (RunSummary, Vec<SchedulerEvent>) {
    let config = SweepConfig::parse(yaml).unwrap();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let scheduler = Scheduler::new(config.resources.clone(), options).with_events(tx);
    let summary = scheduler.run(tasks(root, yaml)).await.unwrap();

    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    (summary, events)
}

fn count(events: &[SchedulerEvent], kind: &str) -> usize {
    events.iter().filter(|e| e.as_str() == kind).count()
}

#[tokio::test]
async fn failing_task_does_not_affect_others() {
    let dir = TempDir::new().unwrap();
    let root = dir.path();
    let (summary, events) = run(root, MARKERS, SchedulerOptions::default()).await;

    assert_eq!(summary.total, 3);
    assert_eq!(summary.dispatched, 3);
    assert_eq!(summary.failed, vec![root.join("X_2")]);
    assert!(summary.skipped.is_empty());

    assert!(root.join("X_1/trained.1").exists());
    assert!(root.join("X_3/trained.3").exists());
    assert!(!root.join("X_2/trained.2").exists());
    assert_eq!(count(&events, "COMMAND_FAILED"), 1);
    assert_eq!(count(&events, "COMMAND_FINISHED"), 4);

    let store = StateStore::default();
    let failed = root.join("X_2");
    assert_eq!(
        store.status_of(&failed, "check").await.unwrap(),
        Some(CommandStatus::Failed)
    );
    assert_eq!(
        store.status_of(&failed, "train").await.unwrap(),
        Some(CommandStatus::Scheduled)
    );
}

#[tokio::test]
async fn second_invocation_skips_finished_commands() {
    let dir = TempDir::new().unwrap();
    let root = dir.path();
    run(root, MARKERS, SchedulerOptions::default()).await;
    std::fs::remove_file(root.join("X_1/trained.1")).unwrap();

    let (summary, events) = run(root, MARKERS, SchedulerOptions::default()).await;
    // Finished tasks are skipped; the failed one is retried and fails again.
    assert_eq!(summary.skipped, vec![root.join("X_1"), root.join("X_3")]);
    assert_eq!(summary.failed, vec![root.join("X_2")]);
    assert_eq!(count(&events, "COMMAND_SKIPPED"), 4);
    assert_eq!(count(&events, "COMMAND_STARTED"), 1);
    assert!(!root.join("X_1/trained.1").exists());
}

#[tokio::test]
async fn force_reruns_finished_commands() {
    let dir = TempDir::new().unwrap();
    let root = dir.path();
    run(root, MARKERS, SchedulerOptions::default()).await;
    std::fs::remove_file(root.join("X_1/trained.1")).unwrap();

    let options = SchedulerOptions {
        force: true,
        ..SchedulerOptions::default()
    };
    let (summary, events) = run(root, MARKERS, options).await;
    assert!(summary.skipped.is_empty());
    assert_eq!(count(&events, "COMMAND_SKIPPED"), 0);
    assert!(root.join("X_1/trained.1").exists());
}

#[tokio::test]
async fn state_files_record_params_scripts_and_slot() {
    let dir = TempDir::new().unwrap();
    let root = dir.path();
    run(root, MARKERS, SchedulerOptions::default()).await;

    let store = StateStore::default();
    let task_dir = root.join("X_1");
    let param = store.read(&task_dir.join(PARAM_FILE)).await.unwrap();
    assert_eq!(param.get("x").and_then(serde_yaml::Value::as_i64), Some(1));
    assert_eq!(param.get("_name").and_then(serde_yaml::Value::as_str), Some("X_1"));
    assert_eq!(
        param.get("_time").and_then(serde_yaml::Value::as_str),
        Some("20240102.030405")
    );
    let scripts = param
        .get(SCRIPTS_KEY)
        .and_then(serde_yaml::Value::as_mapping)
        .unwrap();
    assert_eq!(scripts.len(), 2);

    let stat = store.read(&task_dir.join(STAT_FILE)).await.unwrap();
    assert_eq!(stat.get("check").and_then(serde_yaml::Value::as_str), Some("finished"));
    assert_eq!(stat.get("train").and_then(serde_yaml::Value::as_str), Some("finished"));
    let slot = stat.get(RESOURCE_KEY).and_then(serde_yaml::Value::as_str).unwrap();
    assert!(slot == "0" || slot == "1");

    let check = scripts.get("check").and_then(serde_yaml::Value::as_str).unwrap();
    assert!(
        check.starts_with(&format!("CUDA_VISIBLE_DEVICES={slot} test 1 -ne 2")),
        "unexpected script: {check}"
    );

    assert!(task_dir.join("log.check.20240102.030405").exists());
    // No writer still holds the state lock.
    let lock = std::fs::File::open(task_dir.join("stat.lock")).unwrap();
    lock.try_lock_exclusive().unwrap();
}

#[tokio::test]
async fn running_commands_never_exceed_slot_count() {
    let yaml = r"
template:
  work: sleep 0.3
resource: [a, b]
---
i: [1, 2, 3, 4, 5]
";
    let dir = TempDir::new().unwrap();
    let (summary, events) = run(dir.path(), yaml, SchedulerOptions::default()).await;
    assert!(summary.failed.is_empty());

    let mut running = 0usize;
    let mut peak = 0usize;
    for event in &events {
        match event {
            SchedulerEvent::CommandStarted { target, .. } => {
                assert!(target.resource == "a" || target.resource == "b");
                running += 1;
                peak = peak.max(running);
            }
            SchedulerEvent::CommandFinished { .. } | SchedulerEvent::CommandFailed { .. } => {
                running -= 1;
            }
            _ => {}
        }
    }
    assert_eq!(count(&events, "COMMAND_STARTED"), 5);
    assert_eq!(peak, 2);
}

#[tokio::test]
async fn dry_run_writes_no_state() {
    let dir = TempDir::new().unwrap();
    let root = dir.path();
    let options = SchedulerOptions {
        dry_run: true,
        ..SchedulerOptions::default()
    };
    let (summary, events) = run(root, MARKERS, options).await;

    assert_eq!(summary.dispatched, 3);
    assert!(summary.failed.is_empty());
    assert_eq!(count(&events, "COMMAND_PLANNED"), 6);
    assert_eq!(count(&events, "COMMAND_STARTED"), 0);
    let entries: Vec<PathBuf> = std::fs::read_dir(root)
        .unwrap()
        .map(|entry| entry.unwrap().path())
        .collect();
    assert!(entries.is_empty(), "unexpected files: {entries:?}");
}

#[tokio::test]
async fn slot_variable_is_configurable() {
    let yaml = r"
template:
  check_slot: test $SLOT = gpu3
resource: [gpu3]
resource_env: SLOT
---
x: [1]
";
    let dir = TempDir::new().unwrap();
    let config = SweepConfig::parse(yaml).unwrap();
    let options = SchedulerOptions {
        resource_env: config.resource_env.clone(),
        ..SchedulerOptions::default()
    };
    let (summary, _) = run(dir.path(), yaml, options).await;
    assert!(summary.failed.is_empty());
}

#[tokio::test]
async fn tasks_with_colliding_names_run_in_separate_directories() {
    let yaml = r"
template:
  train: touch {_output}/m.{x}
resource: [0]
---
x: [1, 1.0]
";
    let dir = TempDir::new().unwrap();
    let (summary, events) = run(dir.path(), yaml, SchedulerOptions::default()).await;
    assert!(summary.skipped.is_empty());
    assert!(summary.failed.is_empty());
    assert_eq!(count(&events, "COMMAND_FINISHED"), 2);

    let outputs: Vec<PathBuf> = tasks(dir.path(), yaml)
        .into_iter()
        .map(|task| task.meta.output)
        .collect();
    assert!(outputs[0].join("m.1").exists());
    assert!(outputs[1].join("m.1.0").exists());
}
