//! Test harness for TideOps integration tests: a scripted RPC pool and a
//! cluster fixture builder shared by the end-to-end scenarios.

#![forbid(unsafe_code)]

use std::collections::{HashMap, HashSet, VecDeque};

use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use parking_lot::Mutex;
use serde_json::{Map, Value, json};
use tide_rpc::{RpcError, RpcMethod, RpcPool};
use uuid::Uuid;

/// Fixed reference instant every scenario runs at.
pub fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap()
}

// ─── Scripted pool ───────────────────────────────────────────────────────────

/// An [`RpcPool`] that replays scripted responses and records every call.
///
/// Methods with more than one scripted response pop them in order; the last
/// response repeats, so a re-fetch sees the same inventory. Unscripted
/// methods answer `null`, which reads as success for mutation RPCs.
#[derive(Default)]
pub struct ScriptedPool {
    responses: Mutex<HashMap<&'static str, VecDeque<Value>>>,
    failing: Mutex<HashSet<&'static str>>,
    calls: Mutex<Vec<(RpcMethod, Value)>>,
    dropped: Mutex<Vec<String>>,
}

impl ScriptedPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script(&self, method: RpcMethod, response: Value) -> &Self {
        self.responses
            .lock()
            .entry(method.as_str())
            .or_default()
            .push_back(response);
        self
    }

    /// Make every call to `method` fail with a transport-style error.
    pub fn fail(&self, method: RpcMethod) -> &Self {
        self.failing.lock().insert(method.as_str());
        self
    }

    pub fn calls(&self) -> Vec<(RpcMethod, Value)> {
        self.calls.lock().clone()
    }

    pub fn calls_for(&self, method: RpcMethod) -> Vec<Value> {
        self.calls
            .lock()
            .iter()
            .filter(|(m, _)| *m == method)
            .map(|(_, params)| params.clone())
            .collect()
    }

    pub fn call_count(&self, method: RpcMethod) -> usize {
        self.calls_for(method).len()
    }

    pub fn dropped_ips(&self) -> Vec<String> {
        self.dropped.lock().clone()
    }
}

#[async_trait]
impl RpcPool for ScriptedPool {
    async fn call(&self, method: RpcMethod, params: Value) -> Result<Value, RpcError> {
        self.calls.lock().push((method, params));
        if self.failing.lock().contains(method.as_str()) {
            return Err(RpcError::Protocol(format!("scripted failure for {method}")));
        }
        let mut responses = self.responses.lock();
        match responses.get_mut(method.as_str()) {
            Some(queue) if queue.len() > 1 => Ok(queue.pop_front().unwrap()),
            Some(queue) => Ok(queue.front().cloned().unwrap_or(Value::Null)),
            None => Ok(Value::Null),
        }
    }

    fn drop_ip(&self, ip: &str) {
        self.dropped.lock().push(ip.to_string());
    }
}

// ─── Fleet fixture builder ───────────────────────────────────────────────────

/// Ids minted for one fixture machine.
#[derive(Debug, Clone)]
pub struct MachineIds {
    pub ip: String,
    pub instance_id: String,
    pub host_ids: Vec<i64>,
    pub drive_uuids: Vec<Uuid>,
}

/// Builds the `hosts_list` / `disks_list` / `nodes_list` fixtures for a
/// scripted cluster, container by container.
pub struct FleetBuilder {
    hosts: Map<String, Value>,
    drives: Map<String, Value>,
    nodes: Map<String, Value>,
    groups: Vec<Value>,
    next_host_id: i64,
    next_node_id: i64,
    next_drive_id: i64,
}

impl Default for FleetBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl FleetBuilder {
    pub fn new() -> Self {
        Self {
            hosts: Map::new(),
            drives: Map::new(),
            nodes: Map::new(),
            groups: Vec::new(),
            next_host_id: 0,
            next_node_id: 0,
            next_drive_id: 0,
        }
    }

    fn add_container(
        &mut self,
        ip: &str,
        container_name: &str,
        mode: &str,
        status: &str,
        state: &str,
        age: Duration,
        auto_remove_timeout: u64,
    ) -> i64 {
        let id = self.next_host_id;
        self.next_host_id += 1;
        let added = t0() - age;
        self.hosts.insert(
            format!("HostId<{id}>"),
            json!({
                "host_ip": ip,
                "mode": mode,
                "container_name": container_name,
                "status": status,
                "state": state,
                "added_time": added.to_rfc3339(),
                "state_changed_time": added.to_rfc3339(),
                "machine_identifier": format!("m-{ip}"),
                "auto_remove_timeout": auto_remove_timeout,
                "instance_id": format!("i-{ip}"),
            }),
        );
        id
    }

    fn add_node(&mut self, host_id: i64, status: &str, fenced: Option<DateTime<Utc>>) {
        let id = self.next_node_id;
        self.next_node_id += 1;
        self.nodes.insert(
            format!("NodeId<{id}>"),
            json!({
                "host_id": host_id,
                "status": status,
                "roles": ["MANAGEMENT"],
                "last_fencing_time": fenced.map(|t| t.to_rfc3339()),
            }),
        );
    }

    pub fn add_drive(&mut self, host_id: i64, status: &str, should_be_active: bool) -> Uuid {
        let uuid = Uuid::new_v4();
        let id = self.next_drive_id;
        self.next_drive_id += 1;
        self.drives.insert(
            format!("DiskId<{id}>"),
            json!({
                "uuid": uuid,
                "host_id": host_id,
                "status": status,
                "should_be_active": should_be_active,
            }),
        );
        uuid
    }

    /// A healthy three-container storage machine with one active drive.
    pub fn storage_machine(&mut self, ip: &str, age: Duration) -> MachineIds {
        self.storage_machine_with(ip, age, "UP", "ACTIVE", "UP")
    }

    /// A storage machine with explicit container status/state and management
    /// node status.
    pub fn storage_machine_with(
        &mut self,
        ip: &str,
        age: Duration,
        status: &str,
        state: &str,
        node_status: &str,
    ) -> MachineIds {
        let mut host_ids = Vec::new();
        for role in ["drives0", "compute0", "frontend0"] {
            let id = self.add_container(ip, role, "backend", status, state, age, 0);
            self.add_node(id, node_status, None);
            host_ids.push(id);
        }
        let drive_status = if state == "INACTIVE" { "INACTIVE" } else { "ACTIVE" };
        let drive_uuids = vec![self.add_drive(host_ids[0], drive_status, state != "INACTIVE")];
        MachineIds {
            ip: ip.to_string(),
            instance_id: format!("i-{ip}"),
            host_ids,
            drive_uuids,
        }
    }

    /// A single-container NFS gateway machine (frontend only, no drives).
    pub fn nfs_machine(&mut self, ip: &str, age: Duration) -> MachineIds {
        let id = self.add_container(ip, "frontend0", "backend", "UP", "ACTIVE", age, 0);
        self.add_node(id, "UP", None);
        MachineIds {
            ip: ip.to_string(),
            instance_id: format!("i-{ip}"),
            host_ids: vec![id],
            drive_uuids: vec![],
        }
    }

    /// A client-mode container sharing (or squatting on) an IP.
    pub fn client(&mut self, ip: &str, status: &str, auto_remove_timeout: u64) -> i64 {
        self.add_container(ip, "client0", "client", status, "ACTIVE", Duration::hours(1), auto_remove_timeout)
    }

    /// Mark every management node of `machine` DOWN, fenced `fenced_ago` before t0.
    pub fn fence_management(&mut self, machine: &MachineIds, fenced_ago: Duration) {
        let fenced = t0() - fenced_ago;
        let host_ids: HashSet<i64> = machine.host_ids.iter().copied().collect();
        for node in self.nodes.values_mut() {
            let host_id = node["host_id"].as_i64().unwrap_or(-1);
            if host_ids.contains(&host_id) {
                node["status"] = json!("DOWN");
                node["last_fencing_time"] = json!(fenced.to_rfc3339());
            }
        }
    }

    /// Put `host_id` behind a port of an NFS interface group.
    pub fn interface_group(&mut self, name: &str, host_ids: &[i64]) {
        let ports: Vec<Value> = host_ids
            .iter()
            .map(|id| json!({ "host_id": id, "port": "eth1", "status": "OK" }))
            .collect();
        self.groups.push(json!({
            "name": name,
            "uid": format!("ig-{name}"),
            "type": "NFS",
            "status": "OK",
            "ips": ["172.16.0.10"],
            "gateway": "172.16.0.1",
            "subnet_mask": "255.255.255.0",
            "ports": ports,
        }));
    }

    pub fn hosts_value(&self) -> Value {
        Value::Object(self.hosts.clone())
    }

    pub fn drives_value(&self) -> Value {
        Value::Object(self.drives.clone())
    }

    pub fn nodes_value(&self) -> Value {
        Value::Object(self.nodes.clone())
    }

    pub fn groups_value(&self) -> Value {
        Value::Array(self.groups.clone())
    }

    /// Script the full inventory onto `pool` with a STARTED/OK status.
    pub fn script_inventory(&self, pool: &ScriptedPool) {
        pool.script(RpcMethod::Status, json!({ "io_status": "STARTED", "status": "OK" }));
        pool.script(RpcMethod::HostsList, self.hosts_value());
        pool.script(RpcMethod::DrivesList, self.drives_value());
        pool.script(RpcMethod::NodesList, self.nodes_value());
        pool.script(RpcMethod::InterfaceGroupList, self.groups_value());
    }
}

// ─── Host group info helpers ─────────────────────────────────────────────────

pub fn hg_instances(machines: &[&MachineIds]) -> Vec<tide_proto::HgInstance> {
    machines
        .iter()
        .map(|m| tide_proto::HgInstance {
            id: m.instance_id.clone(),
            private_ip: m.ip.clone(),
        })
        .collect()
}

pub fn host_group_info(
    storage: Vec<tide_proto::HgInstance>,
    nfs: Vec<tide_proto::HgInstance>,
    storage_desired: usize,
    nfs_desired: usize,
) -> tide_proto::HostGroupInfo {
    let backend_ips = storage.iter().map(|i| i.private_ip.clone()).collect();
    tide_proto::HostGroupInfo {
        username: "admin".to_string(),
        password: "secret".to_string(),
        backend_ips,
        storage_backend_instances: storage,
        nfs_backend_instances: nfs,
        storage_backends_desired_capacity: storage_desired,
        nfs_backends_desired_capacity: nfs_desired,
        down_backends_removal_timeout: std::time::Duration::from_secs(3 * 3600),
        role: "backend".to_string(),
        version: 1,
    }
}
