//! Watch coordinator behaviour: debouncing, superseding, failure recovery.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use weave_core::{
    BuildConfig, BuildContext, Bundler, Chain, FileMetadata, Mode, Predicate, Registry, StepError,
    Transform, TransformContext, TransformOutput, WatchCoordinator, WatchSession, WatchState,
    WatchSummary,
};

fn project(main: &str) -> (tempfile::TempDir, PathBuf) {
    let dir = tempfile::tempdir().unwrap();
    let root = dunce::canonicalize(dir.path()).unwrap();
    std::fs::write(root.join("main.js"), main).unwrap();
    (dir, root)
}

fn config(root: &PathBuf) -> BuildConfig {
    BuildConfig::new(root, Mode::Development).without_persistent_cache()
}

fn record_generations(ctx: &BuildContext) -> Arc<Mutex<Vec<u64>>> {
    let published = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&published);
    ctx.on_artifacts_ready(move |outcome| sink.lock().unwrap().push(outcome.generation));
    published
}

struct Slow;

impl Transform for Slow {
    fn name(&self) -> &str {
        "slow"
    }

    fn transform(
        &self,
        input: &[u8],
        _meta: &FileMetadata,
        _ctx: &TransformContext,
    ) -> Result<TransformOutput, StepError> {
        std::thread::sleep(Duration::from_millis(400));
        Ok(TransformOutput::bytes(input))
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_change_during_build_supersedes_it() {
    let (_dir, root) = project("export default 1;\n");
    let mut registry = Registry::new(&root, Mode::Development);
    registry
        .register(Predicate::Extension("js".into()), Chain::new(vec![Arc::new(Slow)]))
        .unwrap();
    let ctx = BuildContext::builder(config(&root))
        .registry(registry)
        .init()
        .unwrap();
    let published = record_generations(&ctx);

    let coordinator =
        WatchCoordinator::new(Bundler::new(ctx)).with_debounce(Duration::from_millis(10));
    let (tx, rx) = mpsc::channel(8);
    let task = tokio::spawn(coordinator.run(rx));

    // The initial build is still transforming main.js.
    tokio::time::sleep(Duration::from_millis(100)).await;
    std::fs::write(root.join("main.js"), "export default 2;\n").unwrap();
    tx.send(vec![root.join("main.js")]).await.unwrap();
    drop(tx);

    let summary = task.await.unwrap();
    assert_eq!(
        summary,
        WatchSummary {
            builds: 2,
            published: 1,
            superseded: 1,
            failed: 0,
        }
    );
    assert_eq!(*published.lock().unwrap(), vec![2]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_failed_build_keeps_watching() {
    let (_dir, root) = project("export default 1;\n");
    let ctx = BuildContext::init(config(&root)).unwrap();
    let published = record_generations(&ctx);

    let coordinator =
        WatchCoordinator::new(Bundler::new(ctx)).with_debounce(Duration::from_millis(10));
    let mut state = coordinator.subscribe();
    let (tx, rx) = mpsc::channel(8);
    let task = tokio::spawn(coordinator.run(rx));

    state
        .wait_for(|s| matches!(s, WatchState::Succeeded { generation: 1 }))
        .await
        .unwrap();

    std::fs::write(root.join("main.js"), "import './missing';\n").unwrap();
    tx.send(vec![root.join("main.js")]).await.unwrap();
    state
        .wait_for(|s| matches!(s, WatchState::Failed { generation: 2, errors: 1 }))
        .await
        .unwrap();

    std::fs::write(root.join("main.js"), "export default 3;\n").unwrap();
    tx.send(vec![root.join("main.js")]).await.unwrap();
    state
        .wait_for(|s| matches!(s, WatchState::Succeeded { generation: 3 }))
        .await
        .unwrap();

    drop(tx);
    let summary = task.await.unwrap();
    assert_eq!(summary.builds, 3);
    assert_eq!(summary.failed, 1);
    assert_eq!(*published.lock().unwrap(), vec![1, 3]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_output_directory_changes_are_ignored() {
    let (_dir, root) = project("export default 1;\n");
    let ctx = BuildContext::init(config(&root)).unwrap();
    let coordinator =
        WatchCoordinator::new(Bundler::new(ctx)).with_debounce(Duration::from_millis(10));
    let (tx, rx) = mpsc::channel(8);
    let task = tokio::spawn(coordinator.run(rx));

    tx.send(vec![root.join("dist/js/main.js")]).await.unwrap();
    drop(tx);
    let summary = task.await.unwrap();
    assert_eq!(summary.builds, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_session_rebuilds_on_file_change() {
    let (_dir, root) = project("export default 1;\n");
    let ctx = BuildContext::init(config(&root)).unwrap();
    let session = WatchSession::start(Bundler::new(ctx)).unwrap();
    let mut state = session.state();

    tokio::time::timeout(
        Duration::from_secs(20),
        state.wait_for(|s| matches!(s, WatchState::Succeeded { generation: 1 })),
    )
    .await
    .expect("initial build")
    .unwrap();

    std::fs::write(root.join("main.js"), "export default 2;\n").unwrap();
    tokio::time::timeout(
        Duration::from_secs(20),
        state.wait_for(|s| matches!(s, WatchState::Succeeded { generation } if *generation >= 2)),
    )
    .await
    .expect("rebuild after change")
    .unwrap();

    let summary = session.stop().await;
    assert!(summary.published >= 2);
}
