//! Rolling instance-refresh state machine for tidefs storage fleets.
//!
//! Replaces every machine in a fleet of size `N` with a freshly provisioned
//! one by repeatedly growing the fleet by `K`, waiting for the cluster to
//! absorb the newcomers, shrinking back to `N`, and waiting for the displaced
//! machines to terminate. The machine is purely functional over the persisted
//! [`RefreshState`]: the caller fetches cluster status and instance lists,
//! calls [`advance_state_machine`], writes the state back if it changed, and
//! applies the returned desired size to the scale set. Crash-safety falls out
//! of that split: every tick re-derives its decision from the record alone.

#![forbid(unsafe_code)]

use std::collections::HashSet;
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use sha2::{Digest, Sha256};
use tide_proto::{ClusterStatus, RefreshPhase, RefreshProgress, RefreshState};
use tracing::{debug, info};

// ─── Errors ──────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum RefreshError {
    #[error("{replaced} original instances replaced, expected at most {expected} by iteration {iteration}")]
    OverReplaced {
        replaced: usize,
        expected: usize,
        iteration: usize,
    },

    #[error("instance refresh already in progress (phase: {phase}, iteration: {current_iteration}/{total_iterations})")]
    AlreadyInProgress {
        phase: RefreshPhase,
        current_iteration: usize,
        total_iterations: usize,
    },
}

/// Why the cluster does not yet count as healthy at an expected size.
/// Diagnostic only: the state machine waits, it never surfaces this.
#[derive(Debug, thiserror::Error)]
pub enum UnhealthyReason {
    #[error("io_status is {actual}, expected STARTED")]
    IoStatus { actual: String },

    #[error("cluster status is {actual}, expected OK")]
    ClusterStatus { actual: String },

    #[error("active backend containers {actual} != expected {expected}")]
    BackendsActive { actual: usize, expected: usize },

    #[error("total backend containers {actual} != expected {expected}")]
    BackendsTotal { actual: usize, expected: usize },

    #[error("active drives {actual} != expected {expected}")]
    DrivesActive { actual: usize, expected: usize },

    #[error("total drives {actual} != expected {expected}")]
    DrivesTotal { actual: usize, expected: usize },
}

// ─── Derived quantities ──────────────────────────────────────────────────────

/// Iterations needed to replace `cluster_size` machines in batches of
/// `scale_up_interval`.
pub fn calculate_total_iterations(cluster_size: usize, scale_up_interval: usize) -> usize {
    if scale_up_interval == 0 {
        return 0;
    }
    cluster_size.div_ceil(scale_up_interval)
}

/// Target fleet size while scaled up in `current_iteration`. The last
/// iteration only grows by what is left to replace.
pub fn scaled_up_size(
    original_size: usize,
    scale_up_interval: usize,
    current_iteration: usize,
    total_iterations: usize,
) -> usize {
    let mut scaled = original_size + scale_up_interval;
    if current_iteration == total_iterations && current_iteration > 0 {
        let remaining = original_size.saturating_sub((current_iteration - 1) * scale_up_interval);
        if remaining < scale_up_interval {
            scaled = original_size + remaining;
        }
    }
    scaled
}

/// How many originals must be gone once `iteration` has fully drained.
pub fn expected_replaced(iteration: usize, scale_up_interval: usize, original_count: usize) -> usize {
    (iteration * scale_up_interval).min(original_count)
}

/// Originals no longer present in the current instance list.
pub fn replaced_count(original_ids: &[String], current_ids: &[String]) -> usize {
    let current: HashSet<&str> = current_ids.iter().map(String::as_str).collect();
    original_ids
        .iter()
        .filter(|id| !current.contains(id.as_str()))
        .count()
}

/// Fingerprint of the launch configuration a refresh rolls the fleet to.
pub fn config_fingerprint(config: &[u8]) -> String {
    hex::encode(Sha256::digest(config))
}

// ─── Health predicate ────────────────────────────────────────────────────────

/// Whether the cluster has fully absorbed a fleet of `expected_size` machines.
/// Used both after scale up and after scale down; only the size differs.
pub fn check_cluster_healthy(
    status: &ClusterStatus,
    expected_size: usize,
    containers_per_vm: usize,
    drives_per_vm: usize,
    protocol_gateway_containers: usize,
) -> Result<(), UnhealthyReason> {
    let expected_containers = expected_size * containers_per_vm + protocol_gateway_containers;
    let expected_drives = expected_size * drives_per_vm;

    if status.io_status != "STARTED" {
        return Err(UnhealthyReason::IoStatus {
            actual: status.io_status.clone(),
        });
    }
    if status.status != "OK" {
        return Err(UnhealthyReason::ClusterStatus {
            actual: status.status.clone(),
        });
    }
    if status.hosts.backends.active != expected_containers {
        return Err(UnhealthyReason::BackendsActive {
            actual: status.hosts.backends.active,
            expected: expected_containers,
        });
    }
    if status.hosts.backends.total != expected_containers {
        return Err(UnhealthyReason::BackendsTotal {
            actual: status.hosts.backends.total,
            expected: expected_containers,
        });
    }
    if status.drives.active != expected_drives {
        return Err(UnhealthyReason::DrivesActive {
            actual: status.drives.active,
            expected: expected_drives,
        });
    }
    if status.drives.total != expected_drives {
        return Err(UnhealthyReason::DrivesTotal {
            actual: status.drives.total,
            expected: expected_drives,
        });
    }
    Ok(())
}

// ─── Lifecycle ───────────────────────────────────────────────────────────────

/// Fresh state for a refresh starting now, beginning in the provisioning
/// phase of iteration 1.
pub fn initialize_state(
    target_config_hash: impl Into<String>,
    original_size: usize,
    scale_up_interval: usize,
    original_instance_ids: Vec<String>,
    now: DateTime<Utc>,
) -> RefreshState {
    RefreshState {
        target_config_hash: target_config_hash.into(),
        original_size,
        scale_up_interval,
        phase: RefreshPhase::Provisioning,
        current_iteration: 1,
        total_iterations: calculate_total_iterations(original_size, scale_up_interval),
        original_instance_ids,
        started_at: now,
        updated_at: now,
        completed_at: None,
        iteration_started_at: Some(now),
        iteration_durations: Vec::new(),
        last_error: None,
    }
}

pub fn is_in_progress(state: Option<&RefreshState>) -> bool {
    matches!(
        state.map(|s| s.phase),
        Some(
            RefreshPhase::Provisioning
                | RefreshPhase::WaitingHealthyAfterScaleUp
                | RefreshPhase::WaitingHealthyAfterScaleDown
                | RefreshPhase::Terminating
        )
    )
}

/// Whether a new refresh may start.
pub fn can_trigger(state: Option<&RefreshState>) -> Result<(), RefreshError> {
    match state {
        Some(s) if is_in_progress(state) => Err(RefreshError::AlreadyInProgress {
            phase: s.phase,
            current_iteration: s.current_iteration,
            total_iterations: s.total_iterations,
        }),
        _ => Ok(()),
    }
}

pub fn mark_completed(state: &mut RefreshState, now: DateTime<Utc>) {
    state.phase = RefreshPhase::Completed;
    state.completed_at = Some(now);
    state.updated_at = now;
}

/// Operator-requested cancellation: the machine stops returning size changes
/// on subsequent advances.
pub fn mark_cancelled(state: &mut RefreshState, now: DateTime<Utc>) {
    state.phase = RefreshPhase::Cancelled;
    state.completed_at = Some(now);
    state.updated_at = now;
}

// ─── Advancing ───────────────────────────────────────────────────────────────

/// Outcome of one advance: whether the record changed (and must be written
/// back) and the fleet size the scale set should be at for the current phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Advance {
    pub state_changed: bool,
    pub desired_size: Option<usize>,
}

impl Advance {
    fn stay(desired_size: usize) -> Self {
        Self {
            state_changed: false,
            desired_size: Some(desired_size),
        }
    }

    fn moved(desired_size: usize) -> Self {
        Self {
            state_changed: true,
            desired_size: Some(desired_size),
        }
    }
}

fn transition(state: &mut RefreshState, to: RefreshPhase, now: DateTime<Utc>) {
    info!(from = %state.phase, %to, iteration = state.current_iteration, "refresh phase transition");
    state.phase = to;
    state.updated_at = now;
}

fn elapsed(now: DateTime<Utc>, then: DateTime<Utc>) -> Duration {
    now.signed_duration_since(then).to_std().unwrap_or_default()
}

/// Close out the current iteration: record its duration, then either start
/// the next iteration or finish the refresh.
fn complete_iteration(state: &mut RefreshState, now: DateTime<Utc>) -> Advance {
    if let Some(started) = state.iteration_started_at {
        state.iteration_durations.push(elapsed(now, started));
    }

    if state.current_iteration < state.total_iterations {
        state.current_iteration += 1;
        state.phase = RefreshPhase::Provisioning;
        state.iteration_started_at = Some(now);
        state.updated_at = now;
        let next = scaled_up_size(
            state.original_size,
            state.scale_up_interval,
            state.current_iteration,
            state.total_iterations,
        );
        info!(
            iteration = state.current_iteration,
            total = state.total_iterations,
            desired = next,
            "starting next refresh iteration"
        );
        Advance::moved(next)
    } else {
        info!(iterations = state.total_iterations, "instance refresh completed");
        mark_completed(state, now);
        Advance {
            state_changed: true,
            desired_size: None,
        }
    }
}

fn over_replaced(
    state: &mut RefreshState,
    replaced: usize,
    expected: usize,
    now: DateTime<Utc>,
) -> RefreshError {
    let err = RefreshError::OverReplaced {
        replaced,
        expected,
        iteration: state.current_iteration,
    };
    state.last_error = Some(err.to_string());
    state.updated_at = now;
    err
}

/// Advance the refresh one step.
///
/// Idempotent: calling twice with identical inputs reports
/// `state_changed == false` on the second call and the same desired size. The
/// desired size is always returned for active phases so a partially applied
/// previous tick self-corrects; the caller writes it only when it differs
/// from the observed value. The only error is the over-replacement guard:
/// more originals disappeared than this iteration may replace, which means
/// the scale set shrank machines the cluster still needs.
pub fn advance_state_machine(
    state: &mut RefreshState,
    status: &ClusterStatus,
    current_instance_ids: &[String],
    drives_per_vm: usize,
    containers_per_vm: usize,
    protocol_gateway_containers: usize,
    now: DateTime<Utc>,
) -> Result<Advance, RefreshError> {
    if matches!(
        state.phase,
        RefreshPhase::Idle | RefreshPhase::Completed | RefreshPhase::Cancelled
    ) {
        return Ok(Advance {
            state_changed: false,
            desired_size: None,
        });
    }

    if state.total_iterations == 0 {
        mark_completed(state, now);
        return Ok(Advance {
            state_changed: true,
            desired_size: None,
        });
    }

    let scaled_up = scaled_up_size(
        state.original_size,
        state.scale_up_interval,
        state.current_iteration,
        state.total_iterations,
    );
    let current = current_instance_ids.len();
    let replaced = replaced_count(&state.original_instance_ids, current_instance_ids);
    let expected = expected_replaced(
        state.current_iteration,
        state.scale_up_interval,
        state.original_instance_ids.len(),
    );
    let healthy_at = |size: usize| {
        check_cluster_healthy(
            status,
            size,
            containers_per_vm,
            drives_per_vm,
            protocol_gateway_containers,
        )
    };

    match state.phase {
        RefreshPhase::Provisioning => {
            if current >= scaled_up {
                transition(state, RefreshPhase::WaitingHealthyAfterScaleUp, now);
                Ok(Advance::moved(scaled_up))
            } else {
                debug!(current, scaled_up, "waiting for instances to provision");
                Ok(Advance::stay(scaled_up))
            }
        }

        RefreshPhase::WaitingHealthyAfterScaleUp => {
            if current < scaled_up {
                // An instance disappeared under us; go back to provisioning.
                transition(state, RefreshPhase::Provisioning, now);
                return Ok(Advance::moved(scaled_up));
            }
            match healthy_at(scaled_up) {
                Ok(()) => {
                    transition(state, RefreshPhase::WaitingHealthyAfterScaleDown, now);
                    Ok(Advance::moved(state.original_size))
                }
                Err(reason) => {
                    debug!(%reason, scaled_up, "cluster not yet healthy after scale up");
                    Ok(Advance::stay(scaled_up))
                }
            }
        }

        RefreshPhase::WaitingHealthyAfterScaleDown => {
            if replaced > expected {
                return Err(over_replaced(state, replaced, expected, now));
            }
            match healthy_at(state.original_size) {
                Ok(()) if replaced == expected && current == state.original_size => {
                    Ok(complete_iteration(state, now))
                }
                Ok(()) => {
                    // Healthy at target size but an old instance is still
                    // being torn down.
                    transition(state, RefreshPhase::Terminating, now);
                    Ok(Advance::moved(state.original_size))
                }
                Err(reason) => {
                    debug!(%reason, original = state.original_size, "cluster not yet healthy after scale down");
                    Ok(Advance::stay(state.original_size))
                }
            }
        }

        RefreshPhase::Terminating => {
            if replaced > expected {
                return Err(over_replaced(state, replaced, expected, now));
            }
            if replaced == expected && current == state.original_size {
                Ok(complete_iteration(state, now))
            } else {
                debug!(replaced, expected, current, "waiting for old instances to terminate");
                Ok(Advance::stay(state.original_size))
            }
        }

        RefreshPhase::Idle | RefreshPhase::Completed | RefreshPhase::Cancelled => unreachable!(),
    }
}

// ─── Progress reporting ──────────────────────────────────────────────────────

/// Human-readable duration: "1h 30m", "45m 20s", "30s".
pub fn format_duration(duration: Duration) -> String {
    let total_secs = duration.as_secs() + u64::from(duration.subsec_nanos() >= 500_000_000);
    let hours = total_secs / 3600;
    let minutes = (total_secs % 3600) / 60;
    let seconds = total_secs % 60;

    if hours > 0 {
        if minutes > 0 {
            format!("{hours}h {minutes}m")
        } else {
            format!("{hours}h")
        }
    } else if minutes > 0 {
        if seconds > 0 {
            format!("{minutes}m {seconds}s")
        } else {
            format!("{minutes}m")
        }
    } else {
        format!("{seconds}s")
    }
}

fn average_duration(durations: &[Duration]) -> Duration {
    if durations.is_empty() {
        return Duration::ZERO;
    }
    durations.iter().sum::<Duration>() / durations.len() as u32
}

/// Progress report for the operator. Live instance counts are included only
/// when a current instance list is supplied; the duration freezes at
/// `completed_at` for terminal phases.
pub fn calculate_progress(
    state: &RefreshState,
    current_instance_ids: Option<&[String]>,
    now: DateTime<Utc>,
) -> RefreshProgress {
    let end = state.completed_at.unwrap_or(now);
    let duration = elapsed(end, state.started_at);

    let avg_iteration_duration = if state.iteration_durations.is_empty() {
        String::new()
    } else {
        format_duration(average_duration(&state.iteration_durations))
    };

    RefreshProgress {
        phase: state.phase,
        instances_initial: state.original_instance_ids.len(),
        instances_current: current_instance_ids.map(<[String]>::len),
        instances_replaced: current_instance_ids
            .map(|ids| replaced_count(&state.original_instance_ids, ids)),
        current_iteration: state.current_iteration,
        total_iterations: state.total_iterations,
        started_at: state.started_at.to_rfc3339_opts(SecondsFormat::Secs, true),
        duration: format_duration(duration),
        avg_iteration_duration,
        last_error: state.last_error.clone(),
    }
}
