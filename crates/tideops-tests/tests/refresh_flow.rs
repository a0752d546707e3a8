//! Instance-refresh flows composed the way the real caller runs them: load
//! the record from the blob store, advance the machine, write it back when it
//! changed, apply the returned desired size to a simulated scale set.

use chrono::{DateTime, Duration, Utc};
use tide_persist::BlobStore;
use tide_proto::{ClusterHostCounts, ClusterStatus, CountPair, RefreshPhase, RefreshState};
use tide_refresh::{
    advance_state_machine, calculate_progress, can_trigger, config_fingerprint, initialize_state,
    mark_cancelled,
};
use tideops_tests::t0;

const CONTAINERS_PER_VM: usize = 3;
const DRIVES_PER_VM: usize = 1;

fn ids(names: &[&str]) -> Vec<String> {
    names.iter().map(|s| s.to_string()).collect()
}

/// Cluster status once every machine of a fleet of `size` is absorbed.
fn healthy_at(size: usize) -> ClusterStatus {
    ClusterStatus {
        io_status: "STARTED".to_string(),
        status: "OK".to_string(),
        hosts: ClusterHostCounts {
            backends: CountPair {
                active: size * CONTAINERS_PER_VM,
                total: size * CONTAINERS_PER_VM,
            },
            clients: CountPair::default(),
        },
        drives: CountPair {
            active: size * DRIVES_PER_VM,
            total: size * DRIVES_PER_VM,
        },
        ..Default::default()
    }
}

fn settling() -> ClusterStatus {
    ClusterStatus {
        io_status: "STARTED".to_string(),
        status: "REBUILDING".to_string(),
        ..Default::default()
    }
}

/// One caller tick: load, advance, persist on change. Returns the desired
/// size the caller would apply to the scale set.
fn tick(
    store: &BlobStore,
    status: &ClusterStatus,
    current: &[String],
    now: DateTime<Utc>,
) -> Option<usize> {
    let mut state: RefreshState = store.load().expect("state blob present");
    let advance =
        advance_state_machine(&mut state, status, current, DRIVES_PER_VM, CONTAINERS_PER_VM, 0, now)
            .expect("advance");
    if advance.state_changed {
        store.save(&state).expect("persist state");
    }
    advance.desired_size
}

#[test]
fn test_refresh_round_trip_with_persistence() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = BlobStore::new(dir.path(), "refresh");

    let fingerprint = config_fingerprint(b"image-2026.03");
    let state = initialize_state(&fingerprint, 4, 2, ids(&["a", "b", "c", "d"]), t0());
    assert_eq!(state.total_iterations, 2);
    store.save(&state).expect("save initial");

    let mut clock = t0();
    let mut step = |status: &ClusterStatus, current: &[&str]| {
        clock += Duration::minutes(5);
        tick(&store, status, &ids(current), clock)
    };

    // Iteration 1: grow to 6, absorb, shrink to 4.
    assert_eq!(step(&settling(), &["a", "b", "c", "d"]), Some(6));
    assert_eq!(step(&settling(), &["a", "b", "c", "d", "e", "f"]), Some(6));
    assert_eq!(step(&healthy_at(6), &["a", "b", "c", "d", "e", "f"]), Some(4));
    // Iteration 2 starts as soon as the first two originals are gone.
    assert_eq!(step(&healthy_at(4), &["c", "d", "e", "f"]), Some(6));
    assert_eq!(step(&settling(), &["c", "d", "e", "f", "g", "h"]), Some(6));
    assert_eq!(step(&healthy_at(6), &["c", "d", "e", "f", "g", "h"]), Some(4));
    assert_eq!(step(&healthy_at(4), &["e", "f", "g", "h"]), None);

    let done: RefreshState = store.load().expect("final state");
    assert_eq!(done.phase, RefreshPhase::Completed);
    assert_eq!(done.current_iteration, 2);
    assert_eq!(done.iteration_durations.len(), 2);
    assert_eq!(done.target_config_hash, fingerprint);
    assert!(done.completed_at.is_some());

    // A tick after completion changes nothing.
    let mut final_state: RefreshState = store.load().expect("state");
    let advance = advance_state_machine(
        &mut final_state,
        &healthy_at(4),
        &ids(&["e", "f", "g", "h"]),
        DRIVES_PER_VM,
        CONTAINERS_PER_VM,
        0,
        clock + Duration::minutes(5),
    )
    .expect("advance after completion");
    assert!(!advance.state_changed);
    assert_eq!(advance.desired_size, None);
}

#[test]
fn test_over_replacement_surfaces_and_persists_error() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = BlobStore::new(dir.path(), "refresh");

    let mut state = initialize_state("fp", 4, 2, ids(&["a", "b", "c", "d"]), t0());
    state.phase = RefreshPhase::WaitingHealthyAfterScaleDown;
    store.save(&state).expect("save");

    // Three originals vanished in iteration 1, which may replace only two.
    let mut loaded: RefreshState = store.load().expect("load");
    let err = advance_state_machine(
        &mut loaded,
        &healthy_at(4),
        &ids(&["d", "w", "x", "y"]),
        DRIVES_PER_VM,
        CONTAINERS_PER_VM,
        0,
        t0() + Duration::minutes(10),
    )
    .unwrap_err();
    assert!(err.to_string().contains("expected at most 2"));
    store.save(&loaded).expect("persist errored state");

    let after: RefreshState = store.load().expect("reload");
    assert_eq!(after.phase, RefreshPhase::WaitingHealthyAfterScaleDown);
    assert!(after.last_error.as_deref().unwrap().contains("3 original instances"));

    // The operator sees the error in the progress report.
    let progress = calculate_progress(&after, None, t0() + Duration::minutes(15));
    assert!(progress.last_error.is_some());
}

#[test]
fn test_cancel_mid_refresh_unblocks_next_trigger() {
    let mut state = initialize_state("fp", 4, 2, ids(&["a", "b", "c", "d"]), t0());
    assert!(can_trigger(Some(&state)).is_err());

    mark_cancelled(&mut state, t0() + Duration::minutes(20));
    assert_eq!(state.phase, RefreshPhase::Cancelled);
    assert!(can_trigger(Some(&state)).is_ok());

    // Cancelled refreshes stop steering the scale set.
    let advance = advance_state_machine(
        &mut state,
        &healthy_at(4),
        &ids(&["a", "b", "c", "d"]),
        DRIVES_PER_VM,
        CONTAINERS_PER_VM,
        0,
        t0() + Duration::minutes(25),
    )
    .expect("advance");
    assert_eq!(advance.desired_size, None);

    // Progress is frozen at the cancellation time.
    let progress = calculate_progress(&state, None, t0() + Duration::hours(6));
    assert_eq!(progress.duration, "20m");
    assert_eq!(progress.phase, RefreshPhase::Cancelled);
}
