//! Property-based state machine test for the live mirror.
//!
//! Drives a real `LiveMirror` over a `MemoryStore` through random sequences
//! of lifecycle calls (start, pause, stop), server-side mutations and cache
//! replays, and checks it against a simple reference model after every
//! step.

use std::collections::BTreeMap;
use std::sync::Arc;

use hokkaido_sync::{
    Document, EventBus, LiveMirror, MemoryStore, MirrorState, MirrorStatus, RemoteStore,
    ReplayPolicy, Snapshot, normalize_key,
};
use proptest::prelude::*;
use proptest::test_runner::Config as ProptestConfig;
use proptest_state_machine::{ReferenceStateMachine, StateMachineTest, prop_state_machine};
use serde_json::json;
use tokio::runtime::Runtime;

const COLLECTION: &str = "active_downtimes";

// ============================================================================
// Reference State Machine
// ============================================================================

/// Model of the server collection and what the mirror should hold.
#[derive(Clone, Debug)]
pub struct MirrorModel {
    /// Machine number → document version on the server.
    server: BTreeMap<u8, u32>,
    /// Machine number → version as last seen by the mirror.
    mirrored: BTreeMap<u8, u32>,
    status: MirrorStatus,
    snapshot_count: u64,
    delta_count: u64,
}

/// Operations applied to the mirror and its backing store.
#[derive(Clone, Debug)]
pub enum MirrorOperation {
    Start,
    Pause,
    Stop,
    /// Create or overwrite a machine's downtime on the server.
    Upsert { machine: u8, version: u32 },
    /// Remove a machine's downtime on the server.
    Remove { machine: u8 },
    /// The client replays its last result set from the local cache.
    Replay,
}

impl MirrorModel {
    fn deltas_to_server(&self) -> u64 {
        let changed = self
            .server
            .iter()
            .filter(|(machine, version)| self.mirrored.get(machine) != Some(version))
            .count();
        let removed = self
            .mirrored
            .keys()
            .filter(|machine| !self.server.contains_key(machine))
            .count();
        (changed + removed) as u64
    }

    /// A snapshot of the current server contents reaches the mirror.
    fn catch_up(&mut self) {
        self.snapshot_count += 1;
        self.delta_count += self.deltas_to_server();
        self.mirrored = self.server.clone();
    }

    fn is_active(&self) -> bool {
        self.status == MirrorStatus::Active
    }
}

pub struct MirrorReference;

impl ReferenceStateMachine for MirrorReference {
    type State = MirrorModel;
    type Transition = MirrorOperation;

    fn init_state() -> BoxedStrategy<Self::State> {
        Just(MirrorModel {
            server: BTreeMap::new(),
            mirrored: BTreeMap::new(),
            status: MirrorStatus::Stopped,
            snapshot_count: 0,
            delta_count: 0,
        })
        .boxed()
    }

    fn transitions(state: &Self::State) -> BoxedStrategy<Self::Transition> {
        let machines: Vec<u8> = state.server.keys().copied().collect();

        let upsert = (1u8..8, 0u32..4)
            .prop_map(|(machine, version)| MirrorOperation::Upsert { machine, version });

        if machines.is_empty() {
            prop_oneof![
                3 => upsert,
                2 => Just(MirrorOperation::Start),
                1 => Just(MirrorOperation::Pause),
                1 => Just(MirrorOperation::Stop),
                1 => Just(MirrorOperation::Replay),
            ]
            .boxed()
        } else {
            let remove = proptest::sample::select(machines)
                .prop_map(|machine| MirrorOperation::Remove { machine });
            prop_oneof![
                3 => upsert,
                2 => remove,
                2 => Just(MirrorOperation::Start),
                1 => Just(MirrorOperation::Pause),
                1 => Just(MirrorOperation::Stop),
                2 => Just(MirrorOperation::Replay),
            ]
            .boxed()
        }
    }

    fn apply(mut state: Self::State, transition: &Self::Transition) -> Self::State {
        match transition {
            MirrorOperation::Start => {
                if !state.is_active() {
                    state.status = MirrorStatus::Active;
                    state.catch_up();
                }
            }
            MirrorOperation::Pause => {
                state.status = MirrorStatus::Paused;
            }
            MirrorOperation::Stop => {
                state.status = MirrorStatus::Stopped;
            }
            MirrorOperation::Upsert { machine, version } => {
                let changed = state.server.insert(*machine, *version) != Some(*version);
                if changed && state.is_active() {
                    state.catch_up();
                }
            }
            MirrorOperation::Remove { machine } => {
                if state.server.remove(machine).is_some() && state.is_active() {
                    state.catch_up();
                }
            }
            // Replays after the first snapshot of a session are discarded
            MirrorOperation::Replay => {}
        }
        state
    }

    fn preconditions(state: &Self::State, transition: &Self::Transition) -> bool {
        match transition {
            MirrorOperation::Remove { machine } => state.server.contains_key(machine),
            _ => true,
        }
    }
}

// ============================================================================
// System Under Test
// ============================================================================

fn machine_id(machine: u8) -> String {
    format!("H-{machine}")
}

fn downtime(machine: u8, version: u32) -> Document {
    let fields = json!({"machine": machine_id(machine), "version": version});
    Document::new(
        machine_id(machine),
        fields.as_object().cloned().unwrap_or_default(),
    )
}

pub struct MirrorHarness {
    runtime: Runtime,
    store: Arc<MemoryStore>,
    mirror: Arc<LiveMirror>,
    last_snapshot_count: u64,
}

impl MirrorHarness {
    fn new() -> Self {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .expect("failed to build runtime");
        let store = Arc::new(MemoryStore::new());
        let mirror = LiveMirror::builder(
            COLLECTION,
            Arc::clone(&store) as Arc<dyn RemoteStore>,
            EventBus::new(),
        )
        .build();
        Self {
            runtime,
            store,
            mirror,
            last_snapshot_count: 0,
        }
    }

    /// Let the pump task drain every snapshot already pushed.
    fn settle(&self) {
        self.runtime.block_on(async {
            for _ in 0..16 {
                tokio::task::yield_now().await;
            }
        });
    }

    fn apply_operation(&mut self, op: &MirrorOperation) {
        match op {
            MirrorOperation::Start => self.runtime.block_on(self.mirror.start()),
            MirrorOperation::Pause => self.mirror.pause(),
            MirrorOperation::Stop => self.mirror.stop(),
            MirrorOperation::Upsert { machine, version } => {
                self.store.seed(COLLECTION, [downtime(*machine, *version)]);
            }
            MirrorOperation::Remove { machine } => {
                self.store.remove(COLLECTION, &machine_id(*machine));
            }
            MirrorOperation::Replay => self.store.replay_to_listeners(COLLECTION),
        }
        self.settle();
    }

    fn verify_invariants(&mut self, model: &MirrorModel) {
        let state = self.mirror.state();

        assert_eq!(state.status(), model.status, "status diverged");
        assert_eq!(
            state.snapshot_count(),
            model.snapshot_count,
            "snapshot count diverged"
        );
        assert_eq!(state.delta_count(), model.delta_count, "delta count diverged");
        assert!(
            state.snapshot_count() >= self.last_snapshot_count,
            "snapshot count went backwards"
        );
        self.last_snapshot_count = state.snapshot_count();

        let expected: Vec<Document> = model
            .mirrored
            .iter()
            .map(|(&machine, &version)| downtime(machine, version))
            .collect();
        assert_eq!(state.documents(), &expected[..], "documents diverged");
        assert!(state.index_is_consistent(), "index out of sync with documents");

        for (&machine, &version) in &model.mirrored {
            let found = self.mirror.get_for_machine(&format!("h{machine}"));
            assert_eq!(found, Some(downtime(machine, version)));
        }

        let open = if model.is_active() { 1 } else { 0 };
        assert_eq!(self.store.listener_count(COLLECTION), open, "listener leaked");
    }
}

impl StateMachineTest for MirrorHarness {
    type SystemUnderTest = Self;
    type Reference = MirrorReference;

    fn init_test(
        _ref_state: &<Self::Reference as ReferenceStateMachine>::State,
    ) -> Self::SystemUnderTest {
        MirrorHarness::new()
    }

    fn apply(
        mut state: Self::SystemUnderTest,
        ref_state: &<Self::Reference as ReferenceStateMachine>::State,
        transition: <Self::Reference as ReferenceStateMachine>::Transition,
    ) -> Self::SystemUnderTest {
        state.apply_operation(&transition);
        state.verify_invariants(ref_state);
        state
    }

    fn check_invariants(
        state: &Self::SystemUnderTest,
        _ref_state: &<Self::Reference as ReferenceStateMachine>::State,
    ) {
        assert!(state.mirror.state().index_is_consistent());
    }
}

prop_state_machine! {
    #![proptest_config(ProptestConfig {
        cases: 100,
        max_shrink_iters: 10000,
        ..ProptestConfig::default()
    })]

    #[test]
    fn mirror_lifecycle_state_machine(sequential 1..50 => MirrorHarness);
}

// ============================================================================
// Targeted tests
// ============================================================================

#[test]
fn test_stop_then_start_counts_only_real_changes() {
    let mut harness = MirrorHarness::new();
    harness.apply_operation(&MirrorOperation::Upsert {
        machine: 1,
        version: 0,
    });
    harness.apply_operation(&MirrorOperation::Start);
    harness.apply_operation(&MirrorOperation::Stop);
    harness.apply_operation(&MirrorOperation::Start);

    let state = harness.mirror.state();
    assert_eq!(state.snapshot_count(), 2);
    assert_eq!(state.delta_count(), 1);
}

#[test]
fn test_paused_mirror_keeps_serving_stale_data() {
    let mut harness = MirrorHarness::new();
    harness.apply_operation(&MirrorOperation::Upsert {
        machine: 3,
        version: 0,
    });
    harness.apply_operation(&MirrorOperation::Start);
    harness.apply_operation(&MirrorOperation::Pause);
    harness.apply_operation(&MirrorOperation::Remove { machine: 3 });

    assert!(harness.mirror.is_paused());
    assert_eq!(harness.mirror.get_for_machine("H03"), Some(downtime(3, 0)));

    harness.apply_operation(&MirrorOperation::Start);
    assert_eq!(harness.mirror.get_for_machine("H03"), None);
}

// ============================================================================
// Pure state properties
// ============================================================================

fn key_variant() -> impl Strategy<Value = (String, String)> {
    ("[A-Z]{1,3}", 0u8..100, 0usize..5).prop_map(|(prefix, n, style)| {
        let canonical = format!("{prefix}{n:02}");
        let lower = prefix.to_lowercase();
        let variant = match style {
            0 => format!("{prefix}{n}"),
            1 => format!("{lower}{n}"),
            2 => format!("{prefix}-{n:02}"),
            3 => format!(" {lower} {n} "),
            _ => format!("{lower}_{n:02}"),
        };
        (canonical, variant)
    })
}

fn arb_snapshot() -> impl Strategy<Value = Snapshot> {
    (
        proptest::collection::vec((key_variant(), 0u32..3), 0..6),
        any::<bool>(),
    )
        .prop_map(|(entries, from_cache)| Snapshot {
            documents: entries
                .into_iter()
                .map(|((_, id), version)| {
                    let fields = json!({"version": version});
                    Document::new(id, fields.as_object().cloned().unwrap_or_default())
                })
                .collect(),
            changes: Vec::new(),
            from_cache,
        })
}

proptest! {
    #[test]
    fn prop_normalize_key_is_idempotent(raw in "[ a-zA-Z0-9_-]{0,8}") {
        let once = normalize_key(&raw);
        prop_assert_eq!(normalize_key(&once), once);
    }

    #[test]
    fn prop_spelling_variants_share_a_key((canonical, variant) in key_variant()) {
        prop_assert_eq!(normalize_key(&variant), canonical);
    }

    #[test]
    fn prop_index_tracks_every_applied_snapshot(
        snapshots in proptest::collection::vec(arb_snapshot(), 1..12),
        diff_replays in any::<bool>(),
    ) {
        let policy = if diff_replays {
            ReplayPolicy::DiffAndApply
        } else {
            ReplayPolicy::Discard
        };
        let mut state = MirrorState::new();
        state.begin_session();
        state.activate();

        let mut applied = 0u64;
        for snapshot in &snapshots {
            let before = state.documents().to_vec();
            let outcome = state.apply_snapshot(snapshot, policy);
            match outcome {
                hokkaido_sync::SnapshotOutcome::Applied(_) => {
                    applied += 1;
                    prop_assert_eq!(state.documents(), &snapshot.documents[..]);
                }
                hokkaido_sync::SnapshotOutcome::IgnoredReplay => {
                    prop_assert!(snapshot.from_cache);
                    prop_assert_eq!(state.documents(), &before[..]);
                }
            }
            prop_assert!(state.index_is_consistent());
            prop_assert_eq!(state.snapshot_count(), applied);

            // With colliding spellings the last document wins
            for doc in state.documents() {
                let last = state
                    .documents()
                    .iter()
                    .rev()
                    .find(|d| normalize_key(&d.id) == normalize_key(&doc.id));
                prop_assert_eq!(state.get(&doc.id), last);
            }
        }
    }
}
