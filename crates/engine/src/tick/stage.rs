/// An ordered phase within one tick. Stages are separated by a full
/// barrier: no task of a later stage starts until every task of the
/// current stage has finished.
///
/// The set is fixed at compile time; what varies per deployment is which
/// managers participate in which stages (see [`Manager::stages`]).
///
/// [`Manager::stages`]: super::Manager::stages
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Stage {
    /// Managers pick up external input queued since the last tick.
    TickStart,
    /// Deferred updates that have come due are drained and applied.
    DynamicUpdates,
    /// The main per-manager mutation work of the tick.
    Update,
    /// Cross-manager reconciliation after the main work.
    Finalize,
    /// Last-moment live writes before publication.
    PreSnapshot,
    /// Live state is published: the snapshot registry copies every
    /// registered value under the stage barrier.
    Snapshot,
}

impl Stage {
    /// Every stage, in execution order.
    pub const ALL: [Stage; 6] = [
        Stage::TickStart,
        Stage::DynamicUpdates,
        Stage::Update,
        Stage::Finalize,
        Stage::PreSnapshot,
        Stage::Snapshot,
    ];

    /// Position in execution order.
    #[inline]
    pub const fn index(self) -> usize {
        self as usize
    }

    /// The stages that must have fully completed before this one may
    /// start. Consulted (and validated) by the coordinator; the running
    /// order itself is [`Stage::ALL`].
    pub const fn predecessors(self) -> StageSet {
        PREDECESSORS[self.index()]
    }

    /// This stage as a one-element set.
    #[inline]
    pub const fn bit(self) -> StageSet {
        StageSet::EMPTY.with(self)
    }
}

/// Required-predecessor table. `Update` deliberately does not list
/// `TickStart` directly -- it is implied through `DynamicUpdates` -- so the
/// table documents the actual data dependencies rather than "everything
/// before me".
const PREDECESSORS: [StageSet; 6] = [
    // TickStart
    StageSet::EMPTY,
    // DynamicUpdates: input must be in before due work is applied.
    StageSet::EMPTY.with(Stage::TickStart),
    // Update
    StageSet::EMPTY.with(Stage::DynamicUpdates),
    // Finalize
    StageSet::EMPTY.with(Stage::Update),
    // PreSnapshot
    StageSet::EMPTY.with(Stage::Finalize),
    // Snapshot: all mutation stages must be over before publication.
    StageSet::EMPTY
        .with(Stage::Update)
        .with(Stage::Finalize)
        .with(Stage::PreSnapshot),
];

/// A small set of [`Stage`]s, used both for predecessor declarations and
/// for a manager's stage participation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StageSet(u32);

impl StageSet {
    pub const EMPTY: StageSet = StageSet(0);

    /// The set with `stage` added.
    #[inline]
    pub const fn with(self, stage: Stage) -> Self {
        Self(self.0 | 1 << stage.index())
    }

    #[inline]
    pub const fn contains(self, stage: Stage) -> bool {
        self.0 & (1 << stage.index()) != 0
    }

    #[inline]
    pub const fn union(self, other: StageSet) -> Self {
        Self(self.0 | other.0)
    }

    #[inline]
    pub const fn is_subset_of(self, other: StageSet) -> bool {
        self.0 & !other.0 == 0
    }

    #[inline]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Stages in this set, in execution order.
    pub fn iter(self) -> impl Iterator<Item = Stage> {
        Stage::ALL.into_iter().filter(move |s| self.contains(*s))
    }
}

/// Check that the predecessor table is consistent with the execution
/// order: a stage may only require stages that run before it. Called once
/// at coordinator startup; a violation is a bug in this file, so it
/// panics rather than returning an error.
pub(crate) fn validate_stage_table() {
    let mut earlier = StageSet::EMPTY;
    for stage in Stage::ALL {
        assert!(
            stage.predecessors().is_subset_of(earlier),
            "stage {stage:?} requires a stage that runs after it"
        );
        earlier = earlier.with(stage);
    }
}
