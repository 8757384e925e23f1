//! Stage-sequenced tick execution.
//!
//! A tick is a fixed sequence of [`Stage`]s. Within a stage, every
//! registered [`Manager`] that participates runs its task in parallel on
//! the rayon pool; a hard barrier separates stages. One manager panicking
//! does not abort its siblings -- the panic is caught, logged, and reported
//! in the [`TickSummary`], and the tick carries on degraded.
//!
//! The coordinator publishes the (stage, sequence) pair it is currently
//! executing; [`TickCoordinator::check_sequence`] lets work that escaped
//! its stage (a task handed to the wrong thread, a callback that outlived
//! its tick) detect the protocol violation instead of corrupting state.

mod stage;

pub use stage::{Stage, StageSet};

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use parking_lot::Mutex;
use slotmap::{SlotMap, new_key_type};

use crate::snapshot::SnapshotRegistry;

new_key_type! {
    /// Handle for a registered manager.
    pub struct ManagerKey;
}

/// A unit of per-tick work. Each (manager, stage) pair becomes one task,
/// bound to a single thread for its duration.
pub trait Manager: Send + Sync {
    /// Human-readable name, used in logs and failure reports.
    fn name(&self) -> &str;

    /// Which stages this manager wants a task in.
    fn stages(&self) -> StageSet;

    /// One stage's worth of work. Runs in parallel with every other
    /// manager's task for the same stage, never in parallel with another
    /// stage.
    fn run_stage(&self, stage: Stage, ctx: &TickContext);
}

/// Per-task context handed to [`Manager::run_stage`].
#[derive(Debug, Clone, Copy)]
pub struct TickContext {
    /// The tick-global counter supplied by the surrounding scheduler.
    pub sequence: u64,
    /// The stage this task was authorized for.
    pub stage: Stage,
}

/// A manager task that panicked during a stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageFailure {
    pub stage: Stage,
    pub manager: String,
}

/// What happened during one [`TickCoordinator::run_tick`].
#[derive(Debug, Clone)]
pub struct TickSummary {
    pub sequence: u64,
    /// Manager tasks that ran (including failed ones).
    pub tasks_run: usize,
    /// Values published by the snapshot sweep at the copy stage.
    pub snapshots_published: usize,
    pub failures: Vec<StageFailure>,
}

impl TickSummary {
    /// True if any manager task failed this tick.
    pub fn degraded(&self) -> bool {
        !self.failures.is_empty()
    }
}

// The published (stage, sequence) pair, packed into one word so a reader
// can never observe a torn combination. Low byte: stage index + 1
// (0 = between ticks). High bits: sequence.
const STAGE_BITS: u32 = 8;

const fn pack(sequence: u64, stage: Stage) -> u64 {
    (sequence << STAGE_BITS) | (stage.index() as u64 + 1)
}

const IDLE: u64 = 0;

/// Gates per-manager work into a safe, globally agreed stage order while
/// keeping everything inside a stage parallel.
pub struct TickCoordinator {
    managers: Mutex<SlotMap<ManagerKey, Arc<dyn Manager>>>,
    registry: Arc<SnapshotRegistry>,
    current: AtomicU64,
}

impl TickCoordinator {
    /// The predecessor table is validated here, once, so a bad table is a
    /// startup panic instead of a mid-tick surprise.
    pub fn new(registry: Arc<SnapshotRegistry>) -> Self {
        stage::validate_stage_table();
        Self {
            managers: Mutex::new(SlotMap::with_key()),
            registry,
            current: AtomicU64::new(IDLE),
        }
    }

    /// The registry whose values are published at the copy stage.
    pub fn registry(&self) -> &Arc<SnapshotRegistry> {
        &self.registry
    }

    pub fn register(&self, manager: Arc<dyn Manager>) -> ManagerKey {
        self.managers.lock().insert(manager)
    }

    pub fn unregister(&self, key: ManagerKey) -> Option<Arc<dyn Manager>> {
        self.managers.lock().remove(key)
    }

    pub fn manager_count(&self) -> usize {
        self.managers.lock().len()
    }

    /// Whether work invoked for `stage` with tick counter `sequence` is
    /// currently authorized to run. A `false` return means the caller was
    /// scheduled outside its stage -- a protocol bug upstream. Callers
    /// must treat it as fatal, not retry.
    pub fn check_sequence(&self, stage: Stage, sequence: u64) -> bool {
        self.current.load(Ordering::SeqCst) == pack(sequence, stage)
    }

    /// Run one full tick: every stage in order, each stage's participating
    /// managers in parallel, a barrier between stages, and the snapshot
    /// sweep at the copy stage.
    pub fn run_tick(&self, sequence: u64) -> TickSummary {
        let tick_start = Instant::now();
        let mut completed = StageSet::EMPTY;
        let mut tasks_run = 0usize;
        let mut snapshots_published = 0usize;
        let failures = Mutex::new(Vec::new());

        for stage in Stage::ALL {
            // The run order is Stage::ALL, so this can only fire if the
            // predecessor table and the order disagree -- a bug here, not
            // an environmental condition.
            assert!(
                stage.predecessors().is_subset_of(completed),
                "stage {stage:?} started before its predecessors completed"
            );

            // Collect participants, then release the lock: a task must be
            // able to register or unregister managers without deadlocking
            // against the tick (changes take effect next stage).
            let participants: Vec<Arc<dyn Manager>> = self
                .managers
                .lock()
                .values()
                .filter(|m| m.stages().contains(stage))
                .map(Arc::clone)
                .collect();

            self.current.store(pack(sequence, stage), Ordering::SeqCst);
            let stage_start = Instant::now();
            let ctx = TickContext { sequence, stage };

            rayon::scope(|scope| {
                for manager in &participants {
                    let failures = &failures;
                    scope.spawn(move |_| {
                        let result = panic::catch_unwind(AssertUnwindSafe(|| {
                            manager.run_stage(stage, &ctx);
                        }));
                        if let Err(payload) = result {
                            tracing::error!(
                                "manager '{}' failed in stage {:?} (tick {}): {}",
                                manager.name(),
                                stage,
                                sequence,
                                panic_message(&*payload),
                            );
                            failures.lock().push(StageFailure {
                                stage,
                                manager: manager.name().to_string(),
                            });
                        }
                    });
                }
            });
            // rayon::scope returns only after every spawned task has
            // finished: this is the inter-stage barrier.

            tasks_run += participants.len();

            if stage == Stage::Snapshot {
                // All Snapshot-stage tasks have returned, so no live
                // writer can overlap the copy.
                snapshots_published = self.registry.publish_all();
            }

            completed = completed.with(stage);
            tracing::trace!(
                "tick {} stage {:?}: {} tasks in {:.1?}",
                sequence,
                stage,
                participants.len(),
                stage_start.elapsed(),
            );
        }

        self.current.store(IDLE, Ordering::SeqCst);

        let failures = failures.into_inner();
        if !failures.is_empty() {
            tracing::warn!(
                "tick {} degraded: {} of {} tasks failed",
                sequence,
                failures.len(),
                tasks_run,
            );
        }
        tracing::debug!(
            "tick {} complete: {} tasks, {} snapshots, {:.1?}",
            sequence,
            tasks_run,
            snapshots_published,
            tick_start.elapsed(),
        );

        TickSummary {
            sequence,
            tasks_run,
            snapshots_published,
            failures,
        }
    }
}

/// Best-effort extraction of a panic payload's message.
fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s
    } else {
        "<non-string panic payload>"
    }
}
