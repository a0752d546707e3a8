//! JSON-RPC client and IP-failover pool for the tidefs management API.
//!
//! Every backend machine serves the same management API, so the pool keeps a
//! set of candidate IPs, remembers the last one that answered, and transparently
//! fails over to the next candidate when a call cannot be delivered. Callers
//! that are about to deactivate a machine drop its IP so later calls never
//! land on it.

#![forbid(unsafe_code)]

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

// ─── Methods ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RpcMethod {
    Status,
    HostsList,
    DrivesList,
    NodesList,
    InterfaceGroupList,
    RemoveHost,
    RemoveDrives,
    DeactivateDrives,
    DeactivateHosts,
    InterfaceGroupDeletePort,
    TriggerCustomEvent,
}

impl RpcMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Status => "status",
            Self::HostsList => "hosts_list",
            Self::DrivesList => "disks_list",
            Self::NodesList => "nodes_list",
            Self::InterfaceGroupList => "interface_group_list",
            Self::RemoveHost => "cluster_remove_host",
            Self::RemoveDrives => "cluster_remove_drives",
            Self::DeactivateDrives => "cluster_deactivate_drives",
            Self::DeactivateHosts => "cluster_deactivate_hosts",
            Self::InterfaceGroupDeletePort => "interface_group_delete_port",
            Self::TriggerCustomEvent => "events_trigger_custom",
        }
    }
}

impl std::fmt::Display for RpcMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ─── Errors ──────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum RpcError {
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("rpc error {code}: {message}")]
    Rpc { code: i64, message: String },

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("no reachable backends")]
    NoBackends,
}

// ─── Pool seam ───────────────────────────────────────────────────────────────

/// The engine-facing surface of the pool. Kept as a trait so decision logic
/// can run against a scripted pool in tests.
#[async_trait]
pub trait RpcPool: Send + Sync {
    async fn call(&self, method: RpcMethod, params: Value) -> Result<Value, RpcError>;

    /// Never select this IP again for the life of the pool.
    fn drop_ip(&self, ip: &str);
}

/// Call an RPC and deserialize the result.
pub async fn call_typed<T: DeserializeOwned>(
    pool: &(impl RpcPool + ?Sized),
    method: RpcMethod,
    params: Value,
) -> Result<T, RpcError> {
    let raw = pool.call(method, params).await?;
    serde_json::from_value(raw)
        .map_err(|e| RpcError::Protocol(format!("decoding {method} result: {e}")))
}

// ─── Wire frames ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
struct RequestFrame<'a> {
    jsonrpc: &'static str,
    id: u64,
    method: &'a str,
    params: Value,
}

#[derive(Debug, Clone, Deserialize)]
struct ResponseFrame {
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<ErrorShape>,
}

#[derive(Debug, Clone, Deserialize)]
struct ErrorShape {
    code: i64,
    message: String,
}

// ─── Pool configuration ──────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub port: u16,
    pub username: String,
    pub password: String,
    pub request_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            port: 14000,
            username: String::new(),
            password: String::new(),
            request_timeout: Duration::from_secs(3),
        }
    }
}

// ─── Failover pool ───────────────────────────────────────────────────────────

/// JSON-RPC pool over the backend IPs of one cluster.
pub struct JrpcPool {
    ips: Vec<String>,
    config: PoolConfig,
    client: reqwest::Client,
    active: Mutex<Option<String>>,
    dropped: Mutex<HashSet<String>>,
    next_id: AtomicU64,
}

impl JrpcPool {
    /// Build a pool over `ips`, shuffled once so independent control ticks do
    /// not all hammer the same backend. Pass a seeded RNG to fix the order.
    pub fn new(mut ips: Vec<String>, config: PoolConfig, rng: &mut impl rand::Rng) -> Self {
        use rand::seq::SliceRandom;
        ips.shuffle(rng);

        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .unwrap_or_default();

        Self {
            ips,
            config,
            client,
            active: Mutex::new(None),
            dropped: Mutex::new(HashSet::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Candidate IPs for the next call: the active one first, then the rest,
    /// with dropped IPs filtered out.
    fn candidates(&self) -> Vec<String> {
        let dropped = self.dropped.lock();
        let active = self.active.lock().clone();

        let mut order = Vec::with_capacity(self.ips.len());
        if let Some(ip) = active
            && !dropped.contains(&ip)
        {
            order.push(ip);
        }
        for ip in &self.ips {
            if !dropped.contains(ip) && !order.contains(ip) {
                order.push(ip.clone());
            }
        }
        order
    }

    fn endpoint(&self, ip: &str) -> String {
        format!("http://{}:{}/api/v1", ip, self.config.port)
    }

    async fn call_one(&self, ip: &str, method: RpcMethod, params: Value) -> Result<Value, RpcError> {
        let frame = RequestFrame {
            jsonrpc: "2.0",
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            method: method.as_str(),
            params,
        };

        let response: ResponseFrame = self
            .client
            .post(self.endpoint(ip))
            .basic_auth(&self.config.username, Some(&self.config.password))
            .json(&frame)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        if let Some(err) = response.error {
            return Err(RpcError::Rpc {
                code: err.code,
                message: err.message,
            });
        }
        Ok(response.result.unwrap_or(Value::Null))
    }
}

#[async_trait]
impl RpcPool for JrpcPool {
    async fn call(&self, method: RpcMethod, params: Value) -> Result<Value, RpcError> {
        let candidates = self.candidates();
        if candidates.is_empty() {
            return Err(RpcError::NoBackends);
        }

        let mut last_err = RpcError::NoBackends;
        for ip in candidates {
            match self.call_one(&ip, method, params.clone()).await {
                Ok(result) => {
                    debug!(%method, %ip, "rpc ok");
                    *self.active.lock() = Some(ip);
                    return Ok(result);
                }
                // The backend answered; its verdict will not change elsewhere.
                Err(err @ RpcError::Rpc { .. }) => return Err(err),
                Err(err) => {
                    warn!(%method, %ip, error = %err, "rpc failed, trying next backend");
                    last_err = err;
                }
            }
        }
        Err(last_err)
    }

    fn drop_ip(&self, ip: &str) {
        debug!(%ip, "dropping ip from pool");
        self.dropped.lock().insert(ip.to_string());
        let mut active = self.active.lock();
        if active.as_deref() == Some(ip) {
            *active = None;
        }
    }
}
