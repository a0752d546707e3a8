//! Per-tick scale-down decision engine for tidefs storage fleets.
//!
//! Each control tick fetches the full cluster inventory, classifies every
//! member container, aggregates containers to machines, and decides which
//! machines to deactivate or remove so the live member count tracks the
//! desired capacity. All side effects are RPCs through the injected pool and
//! the returned [`ScaleResponse`]; the engine re-derives everything from
//! scratch on every invocation.

#![forbid(unsafe_code)]

use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::json;
use tide_proto::{
    ClusterStatus, Drive, DriveListResponse, HgInstance, Host, HostGroupInfo, HostId,
    HostListResponse, InterfaceGroup, InterfaceGroupListResponse, Node, NodeListResponse,
    PROTOCOL_VERSION, ScaleResponse, ScaleResponseHost,
};
use tide_rpc::{RpcError, RpcMethod, RpcPool, call_typed};
use tracing::{info, warn};

/// How long a DOWN/DEGRADED container's management must stay fenced before the
/// machine counts as unhealthy.
pub const UNHEALTHY_DEACTIVATE_TIMEOUT: Duration = Duration::from_secs(120 * 60);

/// Grace period after a container joins before its inactive drives count
/// against it.
pub const DRIVE_SETTLE_GRACE: Duration = Duration::from_secs(5 * 60);

const MAX_BACKEND_CONTAINERS_PER_MACHINE: usize = 3;

// ─── Errors ──────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ScaleError {
    #[error("invalid host group info: {0}")]
    InvalidInput(String),

    #[error("io status:{0}, aborting scale")]
    IoNotStarted(String),

    #[error("upgrade is running, aborting scale")]
    UpgradeRunning,

    #[error("this control plane supports only multi-container backend clusters")]
    NotMultiContainer,

    #[error("inventory fetch failed: {method}: {source}")]
    Inventory {
        method: &'static str,
        source: RpcError,
    },

    #[error("more than three backend containers on machine {ip}: {count}")]
    TooManyContainers { ip: String, count: usize },

    #[error("conflicting machine identifiers on machine {ip}")]
    ConflictingMachineIdentifiers { ip: String },

    #[error("more than one drive container on machine {ip}")]
    DuplicateDriveContainer { ip: String },

    #[error("no drive container found for machine {ip}")]
    NoDriveContainer { ip: String },

    #[error("termination candidate {ip} still has container {host_id} in state {state}")]
    ActiveContainerAtTerminationTarget {
        ip: String,
        host_id: HostId,
        state: String,
    },
}

impl ScaleError {
    /// Structural inconsistencies the caller should alert on instead of
    /// retrying: the inventory contradicts itself.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::TooManyContainers { .. }
                | Self::ConflictingMachineIdentifiers { .. }
                | Self::DuplicateDriveContainer { .. }
                | Self::NoDriveContainer { .. }
                | Self::ActiveContainerAtTerminationTarget { .. }
        )
    }
}

// ─── Classification ──────────────────────────────────────────────────────────

/// Removal priority of a container/machine. Variant order matters: machines
/// already deactivating are picked before unhealthy ones, healthy last.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ScaleState {
    Deactivating,
    Unhealthy,
    Healthy,
}

impl std::fmt::Display for ScaleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Deactivating => write!(f, "DEACTIVATING"),
            Self::Unhealthy => write!(f, "UNHEALTHY"),
            Self::Healthy => write!(f, "HEALTHY"),
        }
    }
}

/// Why a machine was deactivated, carried on the emitted cluster event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScaleReason {
    ScaleDown,
    InactiveMachine,
    DownMachine,
}

impl std::fmt::Display for ScaleReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ScaleDown => write!(f, "ScaleDown"),
            Self::InactiveMachine => write!(f, "InactiveMachine"),
            Self::DownMachine => write!(f, "DownMachine"),
        }
    }
}

/// One cluster container with its attached drives and nodes.
#[derive(Debug, Clone)]
pub struct ContainerInfo {
    pub id: HostId,
    pub host: Host,
    pub drives: Vec<Drive>,
    pub nodes: Vec<Node>,
    pub scale_state: ScaleState,
}

fn elapsed_since(now: DateTime<Utc>, then: DateTime<Utc>) -> Duration {
    // Cluster-reported wall clocks only; a timestamp ahead of `now` reads as
    // zero elapsed rather than panicking on skew.
    now.signed_duration_since(then).to_std().unwrap_or_default()
}

impl ContainerInfo {
    /// Drives that went INACTIVE after the container had time to settle.
    pub fn num_not_healthy_drives(&self, now: DateTime<Utc>) -> usize {
        self.drives
            .iter()
            .filter(|d| {
                d.status == "INACTIVE" && elapsed_since(now, self.host.added_time) > DRIVE_SETTLE_GRACE
            })
            .count()
    }

    pub fn all_drives_being_removed(&self) -> bool {
        !self.drives.is_empty() && self.drives.iter().all(|d| !d.should_be_active)
    }

    pub fn any_drive_being_removed(&self) -> bool {
        self.drives.iter().any(|d| !d.should_be_active)
    }

    /// True when every management node of this container is DOWN and has been
    /// for longer than `timeout`, judged against `max(last_fencing_time,
    /// state_changed_time)`.
    pub fn management_timed_out(&self, timeout: Duration, now: DateTime<Utc>) -> bool {
        let mut seen_management = false;
        for node in self.nodes.iter().filter(|n| n.is_management()) {
            seen_management = true;
            if node.status != "DOWN" {
                return false;
            }
            let reference = match node.last_fencing_time {
                Some(fenced) => fenced.max(self.host.state_changed_time),
                None => self.host.state_changed_time,
            };
            if elapsed_since(now, reference) <= timeout {
                return false;
            }
        }
        seen_management
    }
}

/// Classify one container for removal priority.
pub fn derive_container_state(container: &ContainerInfo, now: DateTime<Utc>) -> ScaleState {
    let host = &container.host;
    if host.is_client() {
        return ScaleState::Healthy;
    }
    if host.is_drive_container() && container.all_drives_being_removed() {
        info!(host_id = %container.id, ip = %host.host_ip, "marking container as deactivating, all drives being removed");
        return ScaleState::Deactivating;
    }
    if matches!(host.state.as_str(), "DEACTIVATING" | "REMOVING" | "INACTIVE") {
        return ScaleState::Deactivating;
    }
    if matches!(host.status.as_str(), "DOWN" | "DEGRADED")
        && container.management_timed_out(UNHEALTHY_DEACTIVATE_TIMEOUT, now)
    {
        info!(host_id = %container.id, ip = %host.host_ip, "marking container as unhealthy, management down too long");
        return ScaleState::Unhealthy;
    }
    if container.num_not_healthy_drives(now) > 0 || container.any_drive_being_removed() {
        info!(host_id = %container.id, ip = %host.host_ip, "marking container as unhealthy, unhealthy drives");
        return ScaleState::Unhealthy;
    }
    ScaleState::Healthy
}

// ─── Machines ────────────────────────────────────────────────────────────────

/// All containers sharing one host IP: one physical machine.
#[derive(Debug, Clone)]
pub struct Machine {
    pub ip: String,
    pub containers: Vec<ContainerInfo>,
}

impl Machine {
    pub fn backend_containers(&self) -> impl Iterator<Item = &ContainerInfo> {
        self.containers.iter().filter(|c| c.host.is_backend())
    }

    pub fn has_backend_containers(&self) -> bool {
        self.backend_containers().next().is_some()
    }

    pub fn drive_container(&self) -> Option<&ContainerInfo> {
        self.backend_containers().find(|c| c.host.is_drive_container())
    }

    pub fn host_ids(&self) -> Vec<HostId> {
        self.backend_containers().map(|c| c.id).collect()
    }

    pub fn drives(&self) -> impl Iterator<Item = &Drive> {
        self.backend_containers().flat_map(|c| c.drives.iter())
    }

    /// Sort anchor: the drive container's join time where one exists, else the
    /// earliest backend container.
    pub fn added_time(&self) -> DateTime<Utc> {
        self.drive_container()
            .map(|c| c.host.added_time)
            .or_else(|| self.backend_containers().map(|c| c.host.added_time).min())
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    }

    pub fn num_not_healthy_drives(&self, now: DateTime<Utc>) -> usize {
        self.backend_containers()
            .map(|c| c.num_not_healthy_drives(now))
            .sum()
    }

    /// Machine-level aggregation: one unhealthy container poisons the machine,
    /// otherwise one deactivating container marks it deactivating.
    pub fn scale_state(&self) -> ScaleState {
        let mut state = ScaleState::Healthy;
        for container in self.backend_containers() {
            match container.scale_state {
                ScaleState::Unhealthy => return ScaleState::Unhealthy,
                ScaleState::Deactivating => state = ScaleState::Deactivating,
                ScaleState::Healthy => {}
            }
        }
        state
    }

    pub fn all_backend_inactive(&self) -> bool {
        self.has_backend_containers()
            && self.backend_containers().all(|c| c.host.state == "INACTIVE")
    }

    pub fn all_backend_down_or_inactive(&self) -> bool {
        self.backend_containers()
            .all(|c| c.host.state == "INACTIVE" || c.host.status == "DOWN")
    }

    pub fn management_down_timed_out(&self, timeout: Duration, now: DateTime<Utc>) -> bool {
        self.backend_containers()
            .any(|c| c.host.state != "INACTIVE" && c.management_timed_out(timeout, now))
    }

    pub fn serves_nfs(&self, groups: &[InterfaceGroup]) -> bool {
        self.backend_containers()
            .any(|c| groups.iter().any(|g| g.serves_host(c.id)))
    }

}

/// Group classified containers into machines and check the structural
/// invariants the rest of the engine relies on.
pub fn group_machines(containers: Vec<ContainerInfo>) -> Result<Vec<Machine>, ScaleError> {
    let mut by_ip: BTreeMap<String, Vec<ContainerInfo>> = BTreeMap::new();
    for container in containers {
        by_ip
            .entry(container.host.host_ip.clone())
            .or_default()
            .push(container);
    }

    let mut machines = Vec::with_capacity(by_ip.len());
    for (ip, mut containers) in by_ip {
        containers.sort_by_key(|c| c.id);
        let machine = Machine { ip, containers };

        let backends = machine.backend_containers().count();
        if backends > MAX_BACKEND_CONTAINERS_PER_MACHINE {
            return Err(ScaleError::TooManyContainers {
                ip: machine.ip,
                count: backends,
            });
        }

        let identifiers: HashSet<&str> = machine
            .backend_containers()
            .map(|c| c.host.machine_identifier.as_str())
            .filter(|m| !m.is_empty())
            .collect();
        if identifiers.len() > 1 {
            return Err(ScaleError::ConflictingMachineIdentifiers { ip: machine.ip });
        }

        let drive_containers = machine
            .backend_containers()
            .filter(|c| c.host.is_drive_container())
            .count();
        if drive_containers > 1 {
            return Err(ScaleError::DuplicateDriveContainer { ip: machine.ip });
        }
        if drive_containers == 1 && machine.drive_container().is_some_and(|c| c.drives.is_empty()) {
            warn!(ip = %machine.ip, "no drives found for drive container");
        }

        machines.push(machine);
    }
    Ok(machines)
}

// ─── Deactivation target ─────────────────────────────────────────────────────

/// How many machines to have deactivating this tick, given machine-level
/// (healthy, unhealthy, deactivating) counts and the desired capacity.
///
/// Unhealthy machines shed at most two at a time while there is no capacity
/// pressure, as many as needed when over target; machines already deactivating
/// stay counted.
pub fn deactivate_target(
    healthy: usize,
    unhealthy: usize,
    deactivating: usize,
    desired: usize,
) -> usize {
    let (a, u, d, t) = (
        healthy as i64,
        unhealthy as i64,
        deactivating as i64,
        desired as i64,
    );
    let over_capacity = a + u + d - t;
    let sick_allowance = (2 - d).min(u);
    d.max(over_capacity.max(sick_allowance)).max(0) as usize
}

fn machine_state_counts(machines: &[&Machine]) -> (usize, usize, usize) {
    let mut healthy = 0;
    let mut unhealthy = 0;
    let mut deactivating = 0;
    for machine in machines {
        match machine.scale_state() {
            ScaleState::Healthy => healthy += 1,
            ScaleState::Unhealthy => unhealthy += 1,
            ScaleState::Deactivating => deactivating += 1,
        }
    }
    (healthy, unhealthy, deactivating)
}

/// Removal priority: deactivating machines first, then machines with the most
/// unhealthy drives, oldest machines before newer ones.
fn sort_for_removal(machines: &mut [&Machine], now: DateTime<Utc>) {
    machines.sort_by_key(|m| {
        (
            m.scale_state(),
            std::cmp::Reverse(m.num_not_healthy_drives(now)),
            m.added_time(),
        )
    });
}

// ─── Preconditions & inventory ───────────────────────────────────────────────

fn ensure_allowed_to_scale(status: &ClusterStatus) -> Result<(), ScaleError> {
    if status.io_status != "STARTED" {
        return Err(ScaleError::IoNotStarted(status.io_status.clone()));
    }
    if !status.upgrade.is_empty() {
        return Err(ScaleError::UpgradeRunning);
    }
    Ok(())
}

fn is_multi_container(hosts: &HostListResponse) -> bool {
    hosts
        .values()
        .any(|h| h.is_backend() && h.is_drive_container())
}

struct Inventory {
    hosts: HostListResponse,
    drives: DriveListResponse,
    nodes: NodeListResponse,
    interface_groups: InterfaceGroupListResponse,
}

async fn fetch_inventory(pool: &(impl RpcPool + ?Sized)) -> Result<Inventory, ScaleError> {
    let hosts: HostListResponse = call_typed(pool, RpcMethod::HostsList, json!({}))
        .await
        .map_err(|source| ScaleError::Inventory {
            method: "hosts_list",
            source,
        })?;
    if !is_multi_container(&hosts) {
        return Err(ScaleError::NotMultiContainer);
    }
    let drives: DriveListResponse = call_typed(pool, RpcMethod::DrivesList, json!({}))
        .await
        .map_err(|source| ScaleError::Inventory {
            method: "disks_list",
            source,
        })?;
    let nodes: NodeListResponse = call_typed(pool, RpcMethod::NodesList, json!({}))
        .await
        .map_err(|source| ScaleError::Inventory {
            method: "nodes_list",
            source,
        })?;
    let interface_groups: InterfaceGroupListResponse =
        call_typed(pool, RpcMethod::InterfaceGroupList, json!({}))
            .await
            .map_err(|source| ScaleError::Inventory {
                method: "interface_group_list",
                source,
            })?;
    Ok(Inventory {
        hosts,
        drives,
        nodes,
        interface_groups,
    })
}

/// Attach drives and nodes to their containers and classify each one.
fn build_containers(inventory: &Inventory, now: DateTime<Utc>) -> Vec<ContainerInfo> {
    let mut drives_by_host: HashMap<HostId, Vec<Drive>> = HashMap::new();
    for drive in inventory.drives.values() {
        drives_by_host
            .entry(drive.host_id)
            .or_default()
            .push(drive.clone());
    }
    let mut nodes_by_host: HashMap<HostId, Vec<Node>> = HashMap::new();
    for node in inventory.nodes.values() {
        nodes_by_host
            .entry(node.host_id)
            .or_default()
            .push(node.clone());
    }

    let mut containers: Vec<ContainerInfo> = inventory
        .hosts
        .iter()
        .map(|(&id, host)| ContainerInfo {
            id,
            host: host.clone(),
            drives: drives_by_host.remove(&id).unwrap_or_default(),
            nodes: nodes_by_host.remove(&id).unwrap_or_default(),
            scale_state: ScaleState::Healthy,
        })
        .collect();
    for container in &mut containers {
        container.scale_state = derive_container_state(container, now);
    }
    containers
}

// ─── RPC actions ─────────────────────────────────────────────────────────────

async fn emit_scale_event(
    pool: &(impl RpcPool + ?Sized),
    response: &mut ScaleResponse,
    reason: ScaleReason,
    desired: i64,
    current: usize,
    ip: &str,
) {
    let message = format!("scale event: reason={reason} desired={desired} current={current} machine={ip}");
    if let Err(err) = pool
        .call(RpcMethod::TriggerCustomEvent, json!({ "message": message }))
        .await
    {
        warn!(error = %err, "failed to emit scale event");
        response.add_transient_error(err, "emitEvent");
    }
}

async fn remove_drive(pool: &(impl RpcPool + ?Sized), drive: &Drive, response: &mut ScaleResponse) {
    if let Err(err) = pool
        .call(
            RpcMethod::RemoveDrives,
            json!({ "drive_uuids": [drive.uuid] }),
        )
        .await
    {
        warn!(uuid = %drive.uuid, error = %err, "failed to remove drive");
        response.add_transient_error(err, "removeDrive");
    }
}

/// Deactivate every drive and container of one machine, drop its IP from the
/// pool on success, and emit the audit event. Failures are transient: the
/// machine is retried on the next tick.
async fn deactivate_machine(
    pool: &(impl RpcPool + ?Sized),
    machine: &Machine,
    response: &mut ScaleResponse,
    reason: ScaleReason,
    desired: i64,
    current: usize,
) {
    info!(ip = %machine.ip, %reason, "deactivating machine");
    for container in machine.backend_containers() {
        for drive in container.drives.iter().filter(|d| d.should_be_active) {
            info!(uuid = %drive.uuid, "deactivating drive");
            if let Err(err) = pool
                .call(
                    RpcMethod::DeactivateDrives,
                    json!({ "drive_uuids": [drive.uuid] }),
                )
                .await
            {
                warn!(uuid = %drive.uuid, error = %err, "failed to deactivate drive");
                response.add_transient_error(err, "deactivateDrive");
            }
        }
    }

    let host_ids = machine.host_ids();
    info!(ip = %machine.ip, ?host_ids, "deactivating machine containers");
    match pool
        .call(
            RpcMethod::DeactivateHosts,
            json!({ "host_ids": host_ids, "skip_resource_validation": false }),
        )
        .await
    {
        Ok(_) => pool.drop_ip(&machine.ip),
        Err(err) => {
            warn!(ip = %machine.ip, error = %err, "failed to deactivate machine containers");
            response.add_transient_error(err, "deactivateHost");
        }
    }

    emit_scale_event(pool, response, reason, desired, current, &machine.ip).await;
}

/// Remove a machine whose containers are all INACTIVE: remove every container
/// from cluster membership and, only once all removes succeed, queue the
/// matching cloud instance for termination and drop its drives. No partial
/// termination is ever emitted.
async fn remove_inactive_machine(
    pool: &(impl RpcPool + ?Sized),
    machine: &Machine,
    instances: &[HgInstance],
    response: &mut ScaleResponse,
    desired: i64,
    current: usize,
) {
    info!(ip = %machine.ip, "removing machine with inactive containers");
    pool.drop_ip(&machine.ip);

    let mut all_removed = true;
    for container in machine.backend_containers() {
        if container.host.state != "INACTIVE" {
            all_removed = false;
            continue;
        }
        if let Err(err) = pool
            .call(
                RpcMethod::RemoveHost,
                json!({ "host_id": container.id.0, "no_wait": true }),
            )
            .await
        {
            warn!(host_id = %container.id, error = %err, "failed to remove container");
            response.add_transient_error(err, "removeInactive");
            all_removed = false;
        }
    }
    if !all_removed {
        return;
    }

    if let Some(instance) = instances.iter().find(|i| i.private_ip == machine.ip) {
        response.to_terminate.push(instance.clone());
    }
    for drive in machine.drives() {
        remove_drive(pool, drive, response).await;
    }

    emit_scale_event(
        pool,
        response,
        ScaleReason::InactiveMachine,
        desired,
        current,
        &machine.ip,
    )
    .await;
}

/// Kick out a machine whose management has been DOWN past the caller's
/// removal timeout: detach its NFS ports first, then run the regular
/// deactivation.
async fn remove_down_machine(
    pool: &(impl RpcPool + ?Sized),
    machine: &Machine,
    groups: &[InterfaceGroup],
    response: &mut ScaleResponse,
    current: usize,
) {
    for container in machine.backend_containers() {
        for group in groups {
            for port in group.ports.iter().filter(|p| p.host_id == container.id) {
                info!(group = %group.name, host_id = %container.id, port = %port.port, "removing interface group port");
                if let Err(err) = pool
                    .call(
                        RpcMethod::InterfaceGroupDeletePort,
                        json!({ "name": group.name, "host_id": container.id.0, "port": port.port }),
                    )
                    .await
                {
                    warn!(group = %group.name, error = %err, "failed to remove interface group port");
                    response.add_transient_error(err, "deletePort");
                }
            }
        }
    }
    deactivate_machine(pool, machine, response, ScaleReason::DownMachine, -1, current).await;
}

/// Drives the cluster still lists but that no longer belong to any host.
async fn remove_stale_drives(
    pool: &(impl RpcPool + ?Sized),
    drives: &DriveListResponse,
    response: &mut ScaleResponse,
) {
    for drive in drives.values() {
        if drive.host_id.is_detached() && drive.status == "INACTIVE" {
            info!(uuid = %drive.uuid, "removing stale detached drive");
            remove_drive(pool, drive, response).await;
        }
    }
}

// ─── Group passes ────────────────────────────────────────────────────────────

fn append_response_hosts(response: &mut ScaleResponse, machine: &Machine) {
    for container in machine.backend_containers() {
        response.hosts.push(ScaleResponseHost {
            instance_id: container.host.instance_id.clone(),
            private_ip: container.host.host_ip.clone(),
            state: container.host.state.clone(),
            added_time: container.host.added_time,
            host_id: container.id,
        });
    }
}

/// One capacity-tracking pass over a host group: divert fully-INACTIVE
/// machines to removal, pick the deactivation set for the rest, report
/// every surviving candidate.
async fn run_group_pass(
    pool: &(impl RpcPool + ?Sized),
    response: &mut ScaleResponse,
    group_name: &'static str,
    machines: Vec<&Machine>,
    desired: usize,
    instances: &[HgInstance],
    require_drive_container: bool,
    now: DateTime<Utc>,
) -> Result<(), ScaleError> {
    let (inactive, candidates): (Vec<&Machine>, Vec<&Machine>) = machines
        .into_iter()
        .partition(|m| m.all_backend_inactive());

    if require_drive_container
        && let Some(machine) = candidates.iter().find(|m| m.drive_container().is_none())
    {
        return Err(ScaleError::NoDriveContainer {
            ip: machine.ip.clone(),
        });
    }

    for &machine in &inactive {
        remove_inactive_machine(pool, machine, instances, response, desired as i64, candidates.len())
            .await;
    }

    let (healthy, unhealthy, deactivating) = machine_state_counts(&candidates);
    let target = deactivate_target(healthy, unhealthy, deactivating, desired);
    info!(
        group = group_name,
        healthy,
        unhealthy,
        deactivating,
        desired,
        target,
        "machines set to deactivate"
    );

    let mut ordered = candidates.clone();
    sort_for_removal(&mut ordered, now);
    for &machine in ordered.iter().take(target) {
        deactivate_machine(
            pool,
            machine,
            response,
            ScaleReason::ScaleDown,
            desired as i64,
            candidates.len(),
        )
        .await;
    }

    for &machine in &candidates {
        append_response_hosts(response, machine);
    }
    Ok(())
}

/// Machines outside every managed host group (plus NFS instances that no
/// longer serve any interface group). No capacity target applies: fully
/// inactive machines are removed, long-DOWN machines are kicked out, the rest
/// are reported untouched.
async fn run_leftover_pass(
    pool: &(impl RpcPool + ?Sized),
    response: &mut ScaleResponse,
    machines: Vec<(&Machine, bool)>,
    info: &HostGroupInfo,
    groups: &[InterfaceGroup],
    instances: &[HgInstance],
    now: DateTime<Utc>,
) {
    let current = machines.len();
    for (machine, in_cloud_list) in machines {
        if machine.all_backend_inactive() {
            // Machines outside every cloud list are only reclaimed when this
            // control plane owns the backend role.
            if in_cloud_list || info.role == "backend" {
                remove_inactive_machine(pool, machine, instances, response, -1, current).await;
            } else {
                append_response_hosts(response, machine);
            }
            continue;
        }

        if info.role == "backend"
            && machine.management_down_timed_out(info.down_backends_removal_timeout, now)
        {
            if machine.all_backend_down_or_inactive() {
                info!(ip = %machine.ip, "machine down past removal timeout, kicking out");
                remove_down_machine(pool, machine, groups, response, current).await;
            } else {
                warn!(ip = %machine.ip, "machine down past removal timeout but has active sibling containers");
                response.add_transient_error(
                    format!(
                        "machine {} is down past removal timeout but has active sibling containers",
                        machine.ip
                    ),
                    "downMachine",
                );
            }
            append_response_hosts(response, machine);
            continue;
        }

        append_response_hosts(response, machine);
    }
}

// ─── Termination delta validation ────────────────────────────────────────────

/// Every cloud instance the response neither keeps (`hosts`) nor explicitly
/// terminates (`to_terminate`) is fair game for the caller to reclaim. Refuse
/// the whole tick if any such machine still shows a live container, except
/// for the benign collision of a DOWN client with an auto-remove timeout.
async fn validate_termination_delta(
    pool: &(impl RpcPool + ?Sized),
    info: &HostGroupInfo,
    response: &ScaleResponse,
) -> Result<(), ScaleError> {
    let fresh: HostListResponse = call_typed(pool, RpcMethod::HostsList, json!({}))
        .await
        .map_err(|source| ScaleError::Inventory {
            method: "hosts_list",
            source,
        })?;

    let cloud_ips: HashSet<&str> = info
        .storage_backend_instances
        .iter()
        .chain(info.nfs_backend_instances.iter())
        .map(|i| i.private_ip.as_str())
        .collect();
    let kept_ips: HashSet<&str> = response.hosts.iter().map(|h| h.private_ip.as_str()).collect();
    let terminate_ips: HashSet<&str> = response
        .to_terminate
        .iter()
        .map(|i| i.private_ip.as_str())
        .collect();

    for ip in cloud_ips {
        if kept_ips.contains(ip) || terminate_ips.contains(ip) {
            continue;
        }
        for (&host_id, host) in fresh.iter().filter(|(_, h)| h.host_ip == ip) {
            let benign_collision =
                host.is_client() && host.status == "DOWN" && host.auto_remove_timeout > 0;
            if benign_collision {
                info!(%host_id, ip, "ignoring DOWN client with auto-remove timeout at termination candidate");
                continue;
            }
            if host.state != "INACTIVE" && host.state != "REMOVING" {
                return Err(ScaleError::ActiveContainerAtTerminationTarget {
                    ip: ip.to_string(),
                    host_id,
                    state: host.state.clone(),
                });
            }
        }
    }
    Ok(())
}

// ─── Entry point ─────────────────────────────────────────────────────────────

/// Run one scale-down tick.
///
/// Fetches the cluster inventory through `pool`, processes the storage
/// backend group, the NFS gateway group, and the leftovers in that order, and
/// returns the per-host snapshot plus the machines safe to terminate.
/// Individual mutation failures surface in `transient_errors`; a returned
/// error means no decision could be made this tick.
pub async fn scale_down(
    pool: &(impl RpcPool + ?Sized),
    info: &HostGroupInfo,
    now: DateTime<Utc>,
) -> Result<ScaleResponse, ScaleError> {
    info.validate().map_err(ScaleError::InvalidInput)?;
    info!("running scale down");

    let mut response = ScaleResponse {
        version: PROTOCOL_VERSION,
        ..Default::default()
    };

    let status: ClusterStatus = call_typed(pool, RpcMethod::Status, json!({}))
        .await
        .map_err(|source| ScaleError::Inventory {
            method: "status",
            source,
        })?;
    ensure_allowed_to_scale(&status)?;

    let inventory = fetch_inventory(pool).await?;
    let containers = build_containers(&inventory, now);
    let machines = group_machines(containers)?;

    let storage_ips: HashSet<&str> = info
        .storage_backend_instances
        .iter()
        .map(|i| i.private_ip.as_str())
        .collect();
    let nfs_ips: HashSet<&str> = info
        .nfs_backend_instances
        .iter()
        .map(|i| i.private_ip.as_str())
        .collect();

    let mut storage_machines: Vec<&Machine> = Vec::new();
    let mut nfs_machines: Vec<&Machine> = Vec::new();
    let mut leftovers: Vec<(&Machine, bool)> = Vec::new();
    for machine in machines.iter().filter(|m| m.has_backend_containers()) {
        if storage_ips.contains(machine.ip.as_str()) {
            storage_machines.push(machine);
        } else if nfs_ips.contains(machine.ip.as_str()) {
            if machine.serves_nfs(&inventory.interface_groups) {
                nfs_machines.push(machine);
            } else {
                leftovers.push((machine, true));
            }
        } else {
            leftovers.push((machine, false));
        }
    }

    let all_instances: Vec<HgInstance> = info
        .storage_backend_instances
        .iter()
        .chain(info.nfs_backend_instances.iter())
        .cloned()
        .collect();

    run_group_pass(
        pool,
        &mut response,
        "storage-backends",
        storage_machines,
        info.storage_backends_desired_capacity,
        &all_instances,
        true,
        now,
    )
    .await?;

    run_group_pass(
        pool,
        &mut response,
        "nfs-gateways",
        nfs_machines,
        info.nfs_backends_desired_capacity,
        &all_instances,
        false,
        now,
    )
    .await?;

    run_leftover_pass(
        pool,
        &mut response,
        leftovers,
        info,
        &inventory.interface_groups,
        &all_instances,
        now,
    )
    .await;

    remove_stale_drives(pool, &inventory.drives, &mut response).await;

    validate_termination_delta(pool, info, &response).await?;

    Ok(response)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tide_proto::HostMode;
    use uuid::Uuid;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 10, 12, 0, 0).unwrap()
    }

    fn mk_host(ip: &str, name: &str, mode: HostMode, status: &str, state: &str) -> Host {
        Host {
            host_ip: ip.to_string(),
            mode,
            container_name: name.to_string(),
            status: status.to_string(),
            state: state.to_string(),
            added_time: t0() - chrono::Duration::hours(10),
            state_changed_time: t0() - chrono::Duration::hours(10),
            machine_identifier: format!("machine-{ip}"),
            auto_remove_timeout: 0,
            instance_id: format!("i-{ip}"),
        }
    }

    fn mk_container(id: i64, host: Host) -> ContainerInfo {
        let mut container = ContainerInfo {
            id: HostId(id),
            host,
            drives: vec![],
            nodes: vec![],
            scale_state: ScaleState::Healthy,
        };
        container.scale_state = derive_container_state(&container, t0());
        container
    }

    fn mk_drive(host_id: i64, status: &str, should_be_active: bool) -> Drive {
        Drive {
            uuid: Uuid::new_v4(),
            host_id: HostId(host_id),
            status: status.to_string(),
            should_be_active,
        }
    }

    fn mgmt_node(host_id: i64, status: &str, fenced_hours_ago: Option<i64>) -> Node {
        Node {
            host_id: HostId(host_id),
            status: status.to_string(),
            roles: vec!["MANAGEMENT".to_string()],
            last_fencing_time: fenced_hours_ago.map(|h| t0() - chrono::Duration::hours(h)),
            up_since: None,
        }
    }

    // ─── deactivate_target ────────────────────────────────────────────────

    #[test]
    fn test_deactivate_target_anchors() {
        assert_eq!(deactivate_target(0, 0, 0, 0), 0);
        assert_eq!(deactivate_target(5, 0, 0, 3), 2);
        assert_eq!(deactivate_target(3, 0, 2, 3), 2);
        assert_eq!(deactivate_target(3, 2, 0, 3), 2);
        assert_eq!(deactivate_target(3, 5, 0, 3), 5);
    }

    #[test]
    fn test_deactivate_target_never_below_deactivating_or_zero() {
        for a in 0..4usize {
            for u in 0..4usize {
                for d in 0..4usize {
                    for t in 0..6usize {
                        let target = deactivate_target(a, u, d, t);
                        assert!(target >= d, "target {target} < deactivating {d}");
                    }
                }
            }
        }
    }

    // ─── classification ───────────────────────────────────────────────────

    #[test]
    fn test_client_container_is_healthy() {
        let mut c = mk_container(0, mk_host("10.0.0.9", "client0", HostMode::Client, "DOWN", "ACTIVE"));
        c.scale_state = derive_container_state(&c, t0());
        assert_eq!(c.scale_state, ScaleState::Healthy);
    }

    #[test]
    fn test_drive_container_all_drives_removed_is_deactivating() {
        let mut c = mk_container(0, mk_host("10.0.0.1", "drives0", HostMode::Backend, "UP", "ACTIVE"));
        c.drives = vec![mk_drive(0, "ACTIVE", false), mk_drive(0, "ACTIVE", false)];
        assert_eq!(derive_container_state(&c, t0()), ScaleState::Deactivating);
    }

    #[test]
    fn test_deactivating_states() {
        for state in ["DEACTIVATING", "REMOVING", "INACTIVE"] {
            let c = mk_container(0, mk_host("10.0.0.1", "compute0", HostMode::Backend, "UP", state));
            assert_eq!(derive_container_state(&c, t0()), ScaleState::Deactivating);
        }
    }

    #[test]
    fn test_down_with_timed_out_management_is_unhealthy() {
        let mut c = mk_container(0, mk_host("10.0.0.1", "compute0", HostMode::Backend, "DOWN", "ACTIVE"));
        c.nodes = vec![mgmt_node(0, "DOWN", Some(3))];
        assert_eq!(derive_container_state(&c, t0()), ScaleState::Unhealthy);
    }

    #[test]
    fn test_down_with_recent_fencing_stays_healthy() {
        let mut c = mk_container(0, mk_host("10.0.0.1", "compute0", HostMode::Backend, "DOWN", "ACTIVE"));
        c.nodes = vec![mgmt_node(0, "DOWN", Some(1))];
        assert_eq!(derive_container_state(&c, t0()), ScaleState::Healthy);
    }

    #[test]
    fn test_management_timeout_requires_every_node_down() {
        let mut c = mk_container(0, mk_host("10.0.0.1", "compute0", HostMode::Backend, "DOWN", "ACTIVE"));
        c.nodes = vec![mgmt_node(0, "DOWN", Some(5)), mgmt_node(0, "UP", None)];
        assert!(!c.management_timed_out(UNHEALTHY_DEACTIVATE_TIMEOUT, t0()));
        assert_eq!(derive_container_state(&c, t0()), ScaleState::Healthy);
    }

    #[test]
    fn test_management_timeout_without_management_nodes_is_false() {
        let c = mk_container(0, mk_host("10.0.0.1", "compute0", HostMode::Backend, "DOWN", "ACTIVE"));
        assert!(!c.management_timed_out(UNHEALTHY_DEACTIVATE_TIMEOUT, t0()));
    }

    #[test]
    fn test_management_timeout_falls_back_to_state_change_time() {
        let mut host = mk_host("10.0.0.1", "compute0", HostMode::Backend, "DOWN", "ACTIVE");
        host.state_changed_time = t0() - chrono::Duration::minutes(30);
        let mut c = mk_container(0, host);
        c.nodes = vec![mgmt_node(0, "DOWN", None)];
        assert!(!c.management_timed_out(UNHEALTHY_DEACTIVATE_TIMEOUT, t0()));
        assert!(c.management_timed_out(Duration::from_secs(10 * 60), t0()));
    }

    #[test]
    fn test_inactive_drive_after_grace_is_unhealthy() {
        let mut c = mk_container(0, mk_host("10.0.0.1", "drives0", HostMode::Backend, "UP", "ACTIVE"));
        c.drives = vec![mk_drive(0, "INACTIVE", true), mk_drive(0, "ACTIVE", true)];
        assert_eq!(derive_container_state(&c, t0()), ScaleState::Unhealthy);
    }

    #[test]
    fn test_inactive_drive_on_fresh_container_is_tolerated() {
        let mut host = mk_host("10.0.0.1", "drives0", HostMode::Backend, "UP", "ACTIVE");
        host.added_time = t0() - chrono::Duration::minutes(2);
        let mut c = mk_container(0, host);
        c.drives = vec![mk_drive(0, "INACTIVE", true)];
        assert_eq!(derive_container_state(&c, t0()), ScaleState::Healthy);
    }

    #[test]
    fn test_partial_drive_removal_is_unhealthy() {
        let mut c = mk_container(0, mk_host("10.0.0.1", "drives0", HostMode::Backend, "UP", "ACTIVE"));
        c.drives = vec![mk_drive(0, "ACTIVE", false), mk_drive(0, "ACTIVE", true)];
        assert_eq!(derive_container_state(&c, t0()), ScaleState::Unhealthy);
    }

    // ─── machines ─────────────────────────────────────────────────────────

    fn machine_of(containers: Vec<ContainerInfo>) -> Machine {
        group_machines(containers).unwrap().remove(0)
    }

    #[test]
    fn test_machine_aggregation_prefers_unhealthy() {
        let mut sick = mk_container(1, mk_host("10.0.0.1", "compute0", HostMode::Backend, "DOWN", "ACTIVE"));
        sick.nodes = vec![mgmt_node(1, "DOWN", Some(4))];
        sick.scale_state = derive_container_state(&sick, t0());
        let drained = mk_container(0, mk_host("10.0.0.1", "drives0", HostMode::Backend, "UP", "DEACTIVATING"));
        let machine = machine_of(vec![sick, drained]);
        assert_eq!(machine.scale_state(), ScaleState::Unhealthy);
    }

    #[test]
    fn test_machine_aggregation_deactivating_over_healthy() {
        let drained = mk_container(0, mk_host("10.0.0.1", "drives0", HostMode::Backend, "UP", "DEACTIVATING"));
        let fine = mk_container(1, mk_host("10.0.0.1", "compute0", HostMode::Backend, "UP", "ACTIVE"));
        let machine = machine_of(vec![drained, fine]);
        assert_eq!(machine.scale_state(), ScaleState::Deactivating);
    }

    #[test]
    fn test_too_many_backend_containers_is_fatal() {
        let containers = (0..4)
            .map(|i| mk_container(i, mk_host("10.0.0.1", &format!("compute{i}"), HostMode::Backend, "UP", "ACTIVE")))
            .collect();
        let err = group_machines(containers).unwrap_err();
        assert!(matches!(err, ScaleError::TooManyContainers { .. }));
        assert!(err.is_fatal());
    }

    #[test]
    fn test_conflicting_machine_identifiers_is_fatal() {
        let a = mk_container(0, mk_host("10.0.0.1", "drives0", HostMode::Backend, "UP", "ACTIVE"));
        let mut host_b = mk_host("10.0.0.1", "compute0", HostMode::Backend, "UP", "ACTIVE");
        host_b.machine_identifier = "machine-other".to_string();
        let b = mk_container(1, host_b);
        let err = group_machines(vec![a, b]).unwrap_err();
        assert!(matches!(err, ScaleError::ConflictingMachineIdentifiers { .. }));
    }

    #[test]
    fn test_duplicate_drive_container_is_fatal() {
        let a = mk_container(0, mk_host("10.0.0.1", "drives0", HostMode::Backend, "UP", "ACTIVE"));
        let b = mk_container(1, mk_host("10.0.0.1", "drives1", HostMode::Backend, "UP", "ACTIVE"));
        let err = group_machines(vec![a, b]).unwrap_err();
        assert!(matches!(err, ScaleError::DuplicateDriveContainer { .. }));
    }

    #[test]
    fn test_client_containers_do_not_count_against_limits() {
        let mut containers: Vec<ContainerInfo> = (0..3)
            .map(|i| mk_container(i, mk_host("10.0.0.1", &format!("c{i}"), HostMode::Backend, "UP", "ACTIVE")))
            .collect();
        containers.push(mk_container(9, mk_host("10.0.0.1", "client0", HostMode::Client, "UP", "ACTIVE")));
        assert!(group_machines(containers).is_ok());
    }

    #[test]
    fn test_all_backend_inactive_ignores_clients() {
        let a = mk_container(0, mk_host("10.0.0.1", "drives0", HostMode::Backend, "DOWN", "INACTIVE"));
        let client = mk_container(1, mk_host("10.0.0.1", "client0", HostMode::Client, "UP", "ACTIVE"));
        let machine = machine_of(vec![a, client]);
        assert!(machine.all_backend_inactive());
    }

    // ─── removal ordering ─────────────────────────────────────────────────

    #[test]
    fn test_sort_for_removal_priority() {
        let deactivating = machine_of(vec![mk_container(
            0,
            mk_host("10.0.0.3", "drives0", HostMode::Backend, "UP", "DEACTIVATING"),
        )]);

        let mut sick_container =
            mk_container(1, mk_host("10.0.0.2", "drives0", HostMode::Backend, "UP", "ACTIVE"));
        sick_container.drives = vec![mk_drive(1, "INACTIVE", true)];
        sick_container.scale_state = derive_container_state(&sick_container, t0());
        let unhealthy = machine_of(vec![sick_container]);

        let mut old_host = mk_host("10.0.0.1", "drives0", HostMode::Backend, "UP", "ACTIVE");
        old_host.added_time = t0() - chrono::Duration::days(30);
        let old_healthy = machine_of(vec![mk_container(2, old_host)]);

        let young_healthy = machine_of(vec![mk_container(
            3,
            mk_host("10.0.0.4", "drives0", HostMode::Backend, "UP", "ACTIVE"),
        )]);

        let mut order: Vec<&Machine> = vec![&young_healthy, &old_healthy, &unhealthy, &deactivating];
        sort_for_removal(&mut order, t0());
        let ips: Vec<&str> = order.iter().map(|m| m.ip.as_str()).collect();
        assert_eq!(ips, vec!["10.0.0.3", "10.0.0.2", "10.0.0.1", "10.0.0.4"]);
    }

    // ─── preconditions ────────────────────────────────────────────────────

    #[test]
    fn test_allowed_to_scale() {
        let mut status = ClusterStatus {
            io_status: "STARTED".to_string(),
            ..Default::default()
        };
        assert!(ensure_allowed_to_scale(&status).is_ok());

        status.upgrade = "12.3.4".to_string();
        assert!(matches!(
            ensure_allowed_to_scale(&status),
            Err(ScaleError::UpgradeRunning)
        ));

        status.upgrade = String::new();
        status.io_status = "STOPPED".to_string();
        assert!(matches!(
            ensure_allowed_to_scale(&status),
            Err(ScaleError::IoNotStarted(_))
        ));
    }

    #[test]
    fn test_multi_container_detection() {
        let mut hosts = HostListResponse::new();
        hosts.insert(HostId(0), mk_host("10.0.0.1", "default", HostMode::Backend, "UP", "ACTIVE"));
        assert!(!is_multi_container(&hosts));

        hosts.insert(HostId(1), mk_host("10.0.0.1", "drives0", HostMode::Backend, "UP", "ACTIVE"));
        assert!(is_multi_container(&hosts));
    }
}
