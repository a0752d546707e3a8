//! Wire and persisted data model for the TideOps control plane.
//!
//! Defines the cluster inventory types returned by the tidefs management API
//! (containers, drives, nodes, interface groups), the host-group scaling
//! request/response pair exchanged with the cloud functions, and the
//! persisted instance-refresh record.

#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use uuid::Uuid;

/// Protocol version stamped on every scale response.
pub const PROTOCOL_VERSION: i64 = 1;

// ─── Identifiers ─────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
#[error("invalid {kind}: {raw:?}")]
pub struct IdParseError {
    kind: &'static str,
    raw: String,
}

/// Generates a numeric id newtype that tolerates the three wire shapes the
/// management API produces: `7`, `"7"`, and `"HostId<7>"`.
macro_rules! numeric_id {
    ($name:ident, $wrapper:literal) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(pub i64);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($wrapper, "<{}>"), self.0)
            }
        }

        impl FromStr for $name {
            type Err = IdParseError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                let inner = s
                    .strip_prefix(concat!($wrapper, "<"))
                    .and_then(|rest| rest.strip_suffix('>'))
                    .unwrap_or(s);
                inner.parse::<i64>().map($name).map_err(|_| IdParseError {
                    kind: $wrapper,
                    raw: s.to_string(),
                })
            }
        }

        impl Serialize for $name {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.serialize_i64(self.0)
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                struct IdVisitor;

                impl Visitor<'_> for IdVisitor {
                    type Value = $name;

                    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                        write!(f, concat!("an integer or ", $wrapper, "<n> string"))
                    }

                    fn visit_i64<E: de::Error>(self, v: i64) -> Result<Self::Value, E> {
                        Ok($name(v))
                    }

                    fn visit_u64<E: de::Error>(self, v: u64) -> Result<Self::Value, E> {
                        Ok($name(v as i64))
                    }

                    fn visit_str<E: de::Error>(self, v: &str) -> Result<Self::Value, E> {
                        v.parse().map_err(de::Error::custom)
                    }
                }

                deserializer.deserialize_any(IdVisitor)
            }
        }
    };
}

numeric_id!(HostId, "HostId");
numeric_id!(NodeId, "NodeId");

impl HostId {
    /// Sentinel the drive list uses for drives no longer attached to a host.
    pub const DETACHED: HostId = HostId(-1);

    pub fn is_detached(&self) -> bool {
        *self == Self::DETACHED
    }
}

/// Opaque drive identifier as the management API mints it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DriveId(pub String);

impl fmt::Display for DriveId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ─── Cluster inventory ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HostMode {
    Backend,
    Client,
}

/// One container on a machine, as reported by `hosts_list`.
///
/// A machine runs up to three role-specialized backend containers; the role
/// (`drive`, `compute`, `frontend`) is embedded in `container_name`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Host {
    pub host_ip: String,
    pub mode: HostMode,
    pub container_name: String,
    pub status: String,
    pub state: String,
    pub added_time: DateTime<Utc>,
    pub state_changed_time: DateTime<Utc>,
    #[serde(default)]
    pub machine_identifier: String,
    /// Seconds before the cluster auto-removes a DOWN client; 0 means unset.
    #[serde(default)]
    pub auto_remove_timeout: u64,
    /// Cloud instance id of the machine this container runs on.
    #[serde(default)]
    pub instance_id: String,
}

impl Host {
    pub fn is_backend(&self) -> bool {
        self.mode == HostMode::Backend
    }

    pub fn is_client(&self) -> bool {
        self.mode == HostMode::Client
    }

    pub fn is_drive_container(&self) -> bool {
        self.container_name.contains("drive")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Drive {
    pub uuid: Uuid,
    pub host_id: HostId,
    pub status: String,
    pub should_be_active: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub host_id: HostId,
    pub status: String,
    #[serde(default)]
    pub roles: Vec<String>,
    #[serde(default)]
    pub last_fencing_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub up_since: Option<DateTime<Utc>>,
}

impl Node {
    pub fn is_management(&self) -> bool {
        self.roles.iter().any(|r| r == "MANAGEMENT")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InterfaceGroupPort {
    pub host_id: HostId,
    pub port: String,
    pub status: String,
}

/// Named grouping of NFS-serving ports across machines.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InterfaceGroup {
    pub name: String,
    #[serde(default)]
    pub uid: String,
    #[serde(rename = "type")]
    pub group_type: String,
    pub status: String,
    #[serde(default)]
    pub ips: Vec<String>,
    #[serde(default)]
    pub gateway: String,
    #[serde(default)]
    pub subnet_mask: String,
    #[serde(default)]
    pub ports: Vec<InterfaceGroupPort>,
}

impl InterfaceGroup {
    pub fn serves_host(&self, host_id: HostId) -> bool {
        self.ports.iter().any(|p| p.host_id == host_id)
    }
}

pub type HostListResponse = HashMap<HostId, Host>;
pub type DriveListResponse = HashMap<DriveId, Drive>;
pub type NodeListResponse = HashMap<NodeId, Node>;
pub type InterfaceGroupListResponse = Vec<InterfaceGroup>;

// ─── Cluster status ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CountPair {
    pub active: usize,
    pub total: usize,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterHostCounts {
    pub backends: CountPair,
    pub clients: CountPair,
}

/// Snapshot returned by the `status` RPC.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterStatus {
    pub name: String,
    pub io_status: String,
    /// Non-empty while a version upgrade is in flight.
    pub upgrade: String,
    pub status: String,
    pub release: String,
    pub hosts: ClusterHostCounts,
    pub drives: CountPair,
    pub active_alerts_count: usize,
}

// ─── Host group scaling request / response ───────────────────────────────────

/// Cloud view of one running machine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HgInstance {
    pub id: String,
    pub private_ip: String,
}

/// Everything the scale-down engine needs for one tick, assembled by the
/// caller from cloud inventory and stored credentials.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostGroupInfo {
    pub username: String,
    pub password: String,
    pub backend_ips: Vec<String>,
    pub storage_backend_instances: Vec<HgInstance>,
    #[serde(default)]
    pub nfs_backend_instances: Vec<HgInstance>,
    pub storage_backends_desired_capacity: usize,
    #[serde(default)]
    pub nfs_backends_desired_capacity: usize,
    #[serde(with = "duration_ns")]
    pub down_backends_removal_timeout: Duration,
    pub role: String,
    #[serde(default)]
    pub version: i64,
}

impl HostGroupInfo {
    /// Copy safe to log.
    pub fn with_hidden_password(&self) -> HostGroupInfo {
        let mut copy = self.clone();
        copy.password = "********".to_string();
        copy
    }

    pub fn validate(&self) -> Result<(), String> {
        let mut problems = Vec::new();
        if self.username.is_empty() {
            problems.push("username is empty");
        }
        if self.password.is_empty() {
            problems.push("password is empty");
        }
        if self.role.is_empty() {
            problems.push("role is empty");
        }
        if self.storage_backends_desired_capacity == 0 {
            problems.push("storage_backends_desired_capacity should be greater than 0");
        }
        if self.down_backends_removal_timeout.is_zero() {
            problems.push("down_backends_removal_timeout should be greater than 0");
        }
        if problems.is_empty() {
            Ok(())
        } else {
            Err(format!("validation failed: {}", problems.join(", ")))
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScaleResponseHost {
    pub instance_id: String,
    pub private_ip: String,
    pub state: String,
    pub added_time: DateTime<Utc>,
    pub host_id: HostId,
}

/// Per-tick status snapshot plus the machines safe to terminate.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScaleResponse {
    pub hosts: Vec<ScaleResponseHost>,
    pub to_terminate: Vec<HgInstance>,
    #[serde(default)]
    pub transient_errors: Vec<String>,
    pub version: i64,
}

impl ScaleResponse {
    pub fn add_transient_error(&mut self, err: impl fmt::Display, caller: &str) {
        self.transient_errors.push(format!("{caller}:{err}"));
    }
}

// ─── Instance refresh record ─────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RefreshPhase {
    Idle,
    Provisioning,
    WaitingHealthyAfterScaleUp,
    WaitingHealthyAfterScaleDown,
    Terminating,
    Completed,
    Cancelled,
}

impl fmt::Display for RefreshPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Provisioning => "provisioning",
            Self::WaitingHealthyAfterScaleUp => "waiting_healthy_after_scale_up",
            Self::WaitingHealthyAfterScaleDown => "waiting_healthy_after_scale_down",
            Self::Terminating => "terminating",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Persisted state of one rolling instance refresh.
///
/// Stored by the caller as a single JSON blob; mutated only by the refresh
/// state machine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefreshState {
    /// Fingerprint of the launch configuration being rolled to.
    pub target_config_hash: String,
    pub original_size: usize,
    pub scale_up_interval: usize,
    pub phase: RefreshPhase,
    pub current_iteration: usize,
    pub total_iterations: usize,
    pub original_instance_ids: Vec<String>,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iteration_started_at: Option<DateTime<Utc>>,
    #[serde(with = "duration_ns_vec", default, skip_serializing_if = "Vec::is_empty")]
    pub iteration_durations: Vec<Duration>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

/// User-visible progress report derived from a [`RefreshState`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefreshProgress {
    pub phase: RefreshPhase,
    pub instances_initial: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instances_current: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instances_replaced: Option<usize>,
    pub current_iteration: usize,
    pub total_iterations: usize,
    pub started_at: String,
    pub duration: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub avg_iteration_duration: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

// ─── Duration serialization ──────────────────────────────────────────────────

/// Durations travel as nanosecond integers, matching the management API and
/// the persisted refresh record.
pub mod duration_ns {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_i64(d.as_nanos().min(i64::MAX as u128) as i64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let ns = i64::deserialize(deserializer)?;
        Ok(Duration::from_nanos(ns.max(0) as u64))
    }
}

pub mod duration_ns_vec {
    use std::time::Duration;

    use serde::ser::SerializeSeq;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(ds: &[Duration], serializer: S) -> Result<S::Ok, S::Error> {
        let mut seq = serializer.serialize_seq(Some(ds.len()))?;
        for d in ds {
            seq.serialize_element(&(d.as_nanos().min(i64::MAX as u128) as i64))?;
        }
        seq.end()
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Vec<Duration>, D::Error> {
        let raw = Vec::<i64>::deserialize(deserializer)?;
        Ok(raw
            .into_iter()
            .map(|ns| Duration::from_nanos(ns.max(0) as u64))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_host_id_parse_shapes() {
        assert_eq!("7".parse::<HostId>().unwrap(), HostId(7));
        assert_eq!("HostId<7>".parse::<HostId>().unwrap(), HostId(7));
        assert_eq!("-1".parse::<HostId>().unwrap(), HostId::DETACHED);
        assert!("HostId<x>".parse::<HostId>().is_err());
    }

    #[test]
    fn test_host_id_deserialize_from_number_and_string() {
        let a: HostId = serde_json::from_value(json!(5)).unwrap();
        let b: HostId = serde_json::from_value(json!("5")).unwrap();
        let c: HostId = serde_json::from_value(json!("HostId<5>")).unwrap();
        assert_eq!(a, b);
        assert_eq!(b, c);
    }

    #[test]
    fn test_host_list_response_string_keys() {
        let raw = json!({
            "HostId<0>": {
                "host_ip": "10.0.0.1",
                "mode": "backend",
                "container_name": "drives0",
                "status": "UP",
                "state": "ACTIVE",
                "added_time": "2026-01-10T08:00:00Z",
                "state_changed_time": "2026-01-10T08:00:00Z"
            }
        });
        let hosts: HostListResponse = serde_json::from_value(raw).unwrap();
        let host = hosts.get(&HostId(0)).unwrap();
        assert!(host.is_drive_container());
        assert!(host.is_backend());
        assert_eq!(host.auto_remove_timeout, 0);
    }

    #[test]
    fn test_node_management_role() {
        let node = Node {
            host_id: HostId(1),
            status: "UP".to_string(),
            roles: vec!["MANAGEMENT".to_string()],
            last_fencing_time: None,
            up_since: None,
        };
        assert!(node.is_management());
    }

    #[test]
    fn test_host_group_info_validate() {
        let info = HostGroupInfo {
            username: "admin".to_string(),
            password: "secret".to_string(),
            backend_ips: vec!["10.0.0.1".to_string()],
            storage_backend_instances: vec![],
            nfs_backend_instances: vec![],
            storage_backends_desired_capacity: 3,
            nfs_backends_desired_capacity: 0,
            down_backends_removal_timeout: Duration::from_secs(3 * 3600),
            role: "backend".to_string(),
            version: 1,
        };
        assert!(info.validate().is_ok());

        let mut bad = info.clone();
        bad.password = String::new();
        bad.storage_backends_desired_capacity = 0;
        let err = bad.validate().unwrap_err();
        assert!(err.contains("password is empty"));
        assert!(err.contains("storage_backends_desired_capacity"));
    }

    #[test]
    fn test_hidden_password() {
        let info = HostGroupInfo {
            username: "admin".to_string(),
            password: "secret".to_string(),
            backend_ips: vec![],
            storage_backend_instances: vec![],
            nfs_backend_instances: vec![],
            storage_backends_desired_capacity: 1,
            nfs_backends_desired_capacity: 0,
            down_backends_removal_timeout: Duration::from_secs(60),
            role: "backend".to_string(),
            version: 1,
        };
        assert_eq!(info.with_hidden_password().password, "********");
        assert_eq!(info.password, "secret");
    }

    #[test]
    fn test_scale_response_transient_error_tag() {
        let mut resp = ScaleResponse::default();
        resp.add_transient_error("connection refused", "deactivateHost");
        assert_eq!(resp.transient_errors, vec!["deactivateHost:connection refused"]);
    }

    #[test]
    fn test_refresh_state_duration_roundtrip() {
        let now = Utc::now();
        let state = RefreshState {
            target_config_hash: "abc".to_string(),
            original_size: 4,
            scale_up_interval: 2,
            phase: RefreshPhase::Provisioning,
            current_iteration: 1,
            total_iterations: 2,
            original_instance_ids: vec!["i-1".to_string()],
            started_at: now,
            updated_at: now,
            completed_at: None,
            iteration_started_at: Some(now),
            iteration_durations: vec![Duration::from_secs(90)],
            last_error: None,
        };

        let raw = serde_json::to_value(&state).unwrap();
        assert_eq!(raw["phase"], "provisioning");
        assert_eq!(raw["iteration_durations"][0], 90_000_000_000i64);
        assert!(raw.get("completed_at").is_none());

        let back: RefreshState = serde_json::from_value(raw).unwrap();
        assert_eq!(back.iteration_durations, vec![Duration::from_secs(90)]);
    }

    #[test]
    fn test_cluster_status_partial_deserialize() {
        let raw = json!({
            "io_status": "STARTED",
            "status": "OK",
            "hosts": { "backends": { "active": 12, "total": 12 } },
            "drives": { "active": 4, "total": 4 }
        });
        let status: ClusterStatus = serde_json::from_value(raw).unwrap();
        assert_eq!(status.io_status, "STARTED");
        assert_eq!(status.hosts.backends.active, 12);
        assert_eq!(status.upgrade, "");
    }

    #[test]
    fn test_interface_group_serves_host() {
        let group = InterfaceGroup {
            name: "nfs0".to_string(),
            uid: String::new(),
            group_type: "NFS".to_string(),
            status: "OK".to_string(),
            ips: vec![],
            gateway: String::new(),
            subnet_mask: String::new(),
            ports: vec![InterfaceGroupPort {
                host_id: HostId(3),
                port: "eth1".to_string(),
                status: "OK".to_string(),
            }],
        };
        assert!(group.serves_host(HostId(3)));
        assert!(!group.serves_host(HostId(4)));
    }
}
