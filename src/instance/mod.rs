use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};
use thiserror::Error;

use crate::supervisor::state_machine::{State, StateMachine, TransitionError};

/// Proxy parameters for one listener inside the external server process.
///
/// `auth` is the user-facing name; it goes over the wire as `one_time_auth`
/// (see [`crate::protocol::Command::Add`]). Keys this struct does not know
/// about are kept in `extra` and forwarded untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProxyConfig {
    pub server_port: u16,
    #[serde(default)]
    pub password: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(default)]
    pub auth: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fast_open: Option<bool>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ProxyConfig {
    pub fn new(server_port: u16, password: &str) -> Self {
        Self {
            server_port,
            password: password.to_string(),
            method: None,
            auth: false,
            timeout: None,
            fast_open: None,
            extra: Map::new(),
        }
    }
}

/// 프록시 인스턴스 - 외부 프로세스가 실행하는 리스너 하나
///
/// Identity (`host`, `port`, `config`) is fixed at construction. The traffic
/// counter and running flag are atomics because the receiver task updates
/// them while callers read them.
#[derive(Debug)]
pub struct Instance {
    host: String,
    port: u16,
    config: ProxyConfig,
    traffic: AtomicU64,
    running: AtomicBool,
    lifecycle: Mutex<StateMachine>,
}

impl Instance {
    /// `config.server_port` is overwritten with `port` so the two never disagree.
    pub fn new(host: &str, port: u16, mut config: ProxyConfig) -> Self {
        config.server_port = port;
        Self {
            host: host.to_string(),
            port,
            config,
            traffic: AtomicU64::new(0),
            running: AtomicBool::new(false),
            lifecycle: Mutex::new(StateMachine::new()),
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn config(&self) -> &ProxyConfig {
        &self.config
    }

    /// Cumulative bytes reported by the external process.
    pub fn traffic(&self) -> u64 {
        self.traffic.load(Ordering::Relaxed)
    }

    /// Add a reported delta and return the new total. Saturates at `u64::MAX`.
    pub fn add_traffic(&self, delta: u64) -> u64 {
        let prev = match self.traffic.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |total| {
            Some(total.saturating_add(delta))
        }) {
            Ok(prev) | Err(prev) => prev,
        };
        match prev.checked_add(delta) {
            Some(total) => total,
            None => {
                tracing::warn!(
                    "Traffic counter for port {} saturated ({} + {})",
                    self.port,
                    prev,
                    delta
                );
                u64::MAX
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub(crate) fn set_running(&self, running: bool) {
        self.running.store(running, Ordering::SeqCst);
    }

    pub fn state(&self) -> Result<State, RegistryError> {
        Ok(self.lifecycle()?.state.clone())
    }

    /// Move the lifecycle state machine, failing on an illegal edge.
    pub(crate) fn transition(&self, to: State) -> Result<(), TransitionError> {
        let mut sm = self.lifecycle().map_err(|_| TransitionError::LockPoisoned)?;
        sm.transition(to)
    }

    /// Force the instance back to NotRunning (used when the whole manager stops).
    pub(crate) fn reset(&self) {
        self.set_running(false);
        if let Ok(mut sm) = self.lifecycle() {
            sm.reset();
        }
    }

    fn lifecycle(&self) -> Result<MutexGuard<'_, StateMachine>, RegistryError> {
        self.lifecycle.lock().map_err(|e| {
            tracing::error!("Instance {} lifecycle lock poisoned: {}", self.port, e);
            RegistryError::LockPoisoned
        })
    }
}

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("instance on port {0} already exists")]
    AlreadyExists(u16),
    #[error("lock poisoned")]
    LockPoisoned,
}

/// Port-keyed set of instances shared between the manager and the receiver task.
#[derive(Debug, Clone, Default)]
pub struct InstanceRegistry {
    instances: Arc<RwLock<HashMap<u16, Arc<Instance>>>>,
}

impl InstanceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, HashMap<u16, Arc<Instance>>>, RegistryError> {
        self.instances.read().map_err(|e| {
            tracing::error!("InstanceRegistry lock poisoned: {}", e);
            RegistryError::LockPoisoned
        })
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, HashMap<u16, Arc<Instance>>>, RegistryError> {
        self.instances.write().map_err(|e| {
            tracing::error!("InstanceRegistry lock poisoned: {}", e);
            RegistryError::LockPoisoned
        })
    }

    /// Register an instance. Ports are unique; a second insert for the same
    /// port is rejected and leaves the existing entry alone.
    pub fn insert(&self, instance: Instance) -> Result<Arc<Instance>, RegistryError> {
        let mut map = self.write()?;
        let port = instance.port();
        if map.contains_key(&port) {
            return Err(RegistryError::AlreadyExists(port));
        }
        let instance = Arc::new(instance);
        map.insert(port, instance.clone());
        tracing::info!("Registered instance {}:{}", instance.host(), port);
        Ok(instance)
    }

    pub fn remove(&self, port: u16) -> Result<Option<Arc<Instance>>, RegistryError> {
        Ok(self.write()?.remove(&port))
    }

    pub fn get(&self, port: u16) -> Result<Option<Arc<Instance>>, RegistryError> {
        Ok(self.read()?.get(&port).cloned())
    }

    pub fn contains(&self, port: u16) -> Result<bool, RegistryError> {
        Ok(self.read()?.contains_key(&port))
    }

    pub fn len(&self) -> Result<usize, RegistryError> {
        Ok(self.read()?.len())
    }

    pub fn is_empty(&self) -> Result<bool, RegistryError> {
        Ok(self.read()?.is_empty())
    }

    /// All instances, ordered by port.
    pub fn list(&self) -> Result<Vec<Arc<Instance>>, RegistryError> {
        let mut all: Vec<_> = self.read()?.values().cloned().collect();
        all.sort_by_key(|i| i.port());
        Ok(all)
    }
}
