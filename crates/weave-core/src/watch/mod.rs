//! Watch coordinator.
//!
//! File-system events flow from the `notify` watcher through a bounded
//! channel into a single coordinator task. Events are coalesced over the
//! configured debounce window, then one rebuild runs on the blocking pool.
//!
//! State machine: `Idle -> Building -> (Succeeded | Failed) -> Idle`. A
//! finished build keeps its terminal state until the next change arrives.
//!
//! A change that arrives while a build runs makes that build stale: it runs
//! to completion but its result is discarded, and the next build covers the
//! new change. Only the result of the most recent request is published.

use crate::bundler::{BuildOutcome, Bundler};
use crate::codes;
use crate::context::BuildContext;
use notify::{
    event::{CreateKind, ModifyKind, RemoveKind, RenameMode},
    Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher as NotifyWatcher,
};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::{JoinError, JoinHandle};
use tokio::time::{sleep_until, Instant};
use tracing::{debug, error, info, warn};

/// Capacity of the event channel between the watcher and the coordinator.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Where the coordinator is in its cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchState {
    Idle,
    Building,
    Succeeded { generation: u64 },
    Failed { generation: u64, errors: usize },
}

/// Counters for a finished watch session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WatchSummary {
    /// Builds started, including the initial one.
    pub builds: u64,
    /// Successful builds handed to the artifact listeners.
    pub published: u64,
    /// Builds whose result was discarded because a newer change arrived.
    pub superseded: u64,
    pub failed: u64,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WatchError {
    #[error("invalid watch root {}", .0.display())]
    InvalidRoot(PathBuf),

    #[error("file watcher failed: {0}")]
    WatcherFailed(String),
}

impl WatchError {
    #[must_use]
    pub fn code(&self) -> &'static str {
        codes::WATCH_FAILED
    }
}

/// Paths under these directories never trigger a rebuild.
#[derive(Debug, Clone, Default)]
pub struct ChangeFilter {
    ignored: Vec<PathBuf>,
}

impl ChangeFilter {
    /// Ignore the output directory and the persisted cache.
    #[must_use]
    pub fn for_context(ctx: &BuildContext) -> Self {
        let mut ignored = vec![ctx.config().out_dir.clone()];
        ignored.extend(ctx.cache().disk_dir().map(Path::to_path_buf));
        Self { ignored }
    }

    #[must_use]
    pub fn accepts(&self, path: &Path) -> bool {
        !self.ignored.iter().any(|dir| path.starts_with(dir))
            && !path.components().any(|c| c.as_os_str() == ".git")
    }
}

/// Check if we should process this event.
fn should_process_event(event: &Event) -> bool {
    matches!(
        &event.kind,
        EventKind::Create(CreateKind::File | CreateKind::Any)
            | EventKind::Modify(
                ModifyKind::Data(_)
                    | ModifyKind::Any
                    | ModifyKind::Name(RenameMode::To | RenameMode::From | RenameMode::Both)
            )
            | EventKind::Remove(RemoveKind::File | RemoveKind::Any)
    )
}

/// Watch `root` recursively. Every relevant event's paths are sent as one
/// batch; the channel closes when the returned watcher is dropped.
pub fn watch_root(
    root: &Path,
) -> Result<(RecommendedWatcher, mpsc::Receiver<Vec<PathBuf>>), WatchError> {
    if !root.is_dir() {
        return Err(WatchError::InvalidRoot(root.to_path_buf()));
    }
    let (tx, rx) = mpsc::channel::<Vec<PathBuf>>(EVENT_CHANNEL_CAPACITY);

    let mut watcher = RecommendedWatcher::new(
        move |res: Result<Event, notify::Error>| match res {
            Ok(event) => {
                if should_process_event(&event) && tx.blocking_send(event.paths).is_err() {
                    debug!("watch event channel closed");
                }
            }
            Err(e) => {
                error!(error = %e, "watch error");
            }
        },
        Config::default().with_poll_interval(Duration::from_secs(2)),
    )
    .map_err(|e| WatchError::WatcherFailed(e.to_string()))?;

    watcher
        .watch(root, RecursiveMode::Recursive)
        .map_err(|e| WatchError::WatcherFailed(e.to_string()))?;
    info!(root = %root.display(), "watching directory");
    Ok((watcher, rx))
}

struct InFlight {
    request: u64,
    handle: JoinHandle<BuildOutcome>,
}

async fn join(in_flight: &mut Option<InFlight>) -> (u64, Result<BuildOutcome, JoinError>) {
    match in_flight {
        Some(build) => {
            let result = (&mut build.handle).await;
            (build.request, result)
        }
        None => std::future::pending().await,
    }
}

/// Drives rebuilds from batches of changed paths.
pub struct WatchCoordinator {
    ctx: Arc<BuildContext>,
    bundler: Arc<Mutex<Bundler>>,
    debounce: Duration,
    filter: ChangeFilter,
    state: watch::Sender<WatchState>,
    summary: WatchSummary,
}

impl WatchCoordinator {
    /// Debounce window and filter come from the bundler's context.
    #[must_use]
    pub fn new(bundler: Bundler) -> Self {
        let ctx = Arc::clone(bundler.context());
        let (state, _) = watch::channel(WatchState::Idle);
        Self {
            debounce: ctx.config().debounce,
            filter: ChangeFilter::for_context(&ctx),
            bundler: Arc::new(Mutex::new(bundler)),
            ctx,
            state,
            summary: WatchSummary::default(),
        }
    }

    #[must_use]
    pub fn with_debounce(mut self, debounce: Duration) -> Self {
        self.debounce = debounce;
        self
    }

    /// Observe state transitions.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<WatchState> {
        self.state.subscribe()
    }

    fn set_state(&self, state: WatchState) {
        self.state.send_replace(state);
    }

    fn spawn_build(&mut self, request: u64, changed: Option<Vec<PathBuf>>) -> InFlight {
        self.summary.builds += 1;
        self.set_state(WatchState::Building);
        let bundler = Arc::clone(&self.bundler);
        let handle = tokio::task::spawn_blocking(move || {
            let mut bundler = bundler.lock().unwrap_or_else(PoisonError::into_inner);
            match changed {
                Some(changed) => bundler.rebuild(&changed),
                None => bundler.build(),
            }
        });
        InFlight { request, handle }
    }

    /// Publish or discard a finished build. Returns `true` when the next
    /// build must start from scratch.
    fn complete(&mut self, stale: bool, result: Result<BuildOutcome, JoinError>) -> bool {
        let outcome = match result {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(error = %e, "build task failed");
                self.summary.failed += 1;
                self.set_state(WatchState::Failed {
                    generation: 0,
                    errors: 1,
                });
                return true;
            }
        };

        if stale {
            debug!(generation = outcome.generation, "discarding superseded build");
            self.summary.superseded += 1;
            self.set_state(WatchState::Idle);
        } else if outcome.is_success() {
            self.summary.published += 1;
            self.set_state(WatchState::Succeeded {
                generation: outcome.generation,
            });
            self.ctx.notify(&outcome);
        } else {
            self.summary.failed += 1;
            for e in &outcome.errors {
                warn!(code = e.code(), "{e}");
            }
            self.set_state(WatchState::Failed {
                generation: outcome.generation,
                errors: outcome.errors.len(),
            });
        }
        false
    }

    /// Run an initial build, then rebuild on every batch from `events` until
    /// the channel closes. A pending change and a running build are finished
    /// before returning.
    pub async fn run(mut self, mut events: mpsc::Receiver<Vec<PathBuf>>) -> WatchSummary {
        let mut requested: u64 = 1;
        let mut in_flight = Some(self.spawn_build(requested, None));
        let mut pending: BTreeSet<PathBuf> = BTreeSet::new();
        let mut deadline: Option<Instant> = None;
        let mut open = true;
        let mut full = false;

        loop {
            if !open && in_flight.is_none() && deadline.is_none() {
                break;
            }
            tokio::select! {
                event = events.recv(), if open => match event {
                    Some(paths) => {
                        let before = pending.len();
                        pending.extend(paths.into_iter().filter(|p| self.filter.accepts(p)));
                        if pending.len() > before {
                            requested += 1;
                            deadline = Some(Instant::now() + self.debounce);
                            if in_flight.is_none() {
                                self.set_state(WatchState::Idle);
                            }
                        }
                    }
                    None => open = false,
                },
                () = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() && in_flight.is_none() => {
                    deadline = None;
                    let changed: Vec<PathBuf> = std::mem::take(&mut pending).into_iter().collect();
                    debug!(count = changed.len(), "processing coalesced file events");
                    let changed = if std::mem::take(&mut full) { None } else { Some(changed) };
                    in_flight = Some(self.spawn_build(requested, changed));
                }
                (request, result) = join(&mut in_flight) => {
                    in_flight = None;
                    full = self.complete(request < requested, result) || full;
                    if full && deadline.is_none() && open {
                        // Keep the graphs consistent even without new events.
                        requested += 1;
                        deadline = Some(Instant::now());
                    }
                }
            }
        }

        info!(
            builds = self.summary.builds,
            published = self.summary.published,
            superseded = self.summary.superseded,
            failed = self.summary.failed,
            "watch stopped"
        );
        self.summary
    }
}

/// A running watch: file watcher plus coordinator task.
pub struct WatchSession {
    watcher: RecommendedWatcher,
    task: JoinHandle<WatchSummary>,
    state: watch::Receiver<WatchState>,
}

impl WatchSession {
    /// Watch the project root of `bundler` and rebuild on changes.
    ///
    /// Must be called inside a tokio runtime.
    pub fn start(bundler: Bundler) -> Result<Self, WatchError> {
        let root = bundler.context().config().root.clone();
        let (watcher, events) = watch_root(&root)?;
        let coordinator = WatchCoordinator::new(bundler);
        let state = coordinator.subscribe();
        let task = tokio::spawn(coordinator.run(events));
        Ok(Self {
            watcher,
            task,
            state,
        })
    }

    #[must_use]
    pub fn state(&self) -> watch::Receiver<WatchState> {
        self.state.clone()
    }

    /// Stop watching and wait for the coordinator to finish its last build.
    pub async fn stop(self) -> WatchSummary {
        drop(self.watcher);
        match self.task.await {
            Ok(summary) => summary,
            Err(e) => {
                error!(error = %e, "watch coordinator failed");
                WatchSummary::default()
            }
        }
    }
}
