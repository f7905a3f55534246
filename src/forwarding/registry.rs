//! Daemon-resident name -> tunnel map (§3, §4.G). The registry's lock is
//! only ever held during insert/remove; tunnel I/O runs entirely inside each
//! `TunnelSupervisor`'s own tasks.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::Mutex;

use crate::error::ManagerError;
use crate::forwarding::pump::ForwardStats;
use crate::forwarding::supervisor::TunnelSupervisor;
use crate::model::TunnelState;

/// One entry per named tunnel. Reported to `List` callers.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct TunnelSummary {
    pub name: String,
    pub mode: crate::model::TunnelMode,
    pub bound_addr: String,
    pub state: TunnelState,
    pub stats: ForwardStats,
}

/// A running tunnel wrapped so `close` can take it by value while other
/// readers only ever see `&TunnelSupervisor` through the map.
pub struct TunnelRegistry {
    tunnels: DashMap<String, Arc<Mutex<Option<TunnelSupervisor>>>>,
}

impl Default for TunnelRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl TunnelRegistry {
    pub fn new() -> Self {
        Self { tunnels: DashMap::new() }
    }

    /// Register `name` -> `supervisor`. Fails if the name is already taken
    /// by a live tunnel (`Open`), handing the supervisor back so the caller
    /// can close it instead of leaking its sockets.
    pub fn insert(
        &self,
        name: String,
        supervisor: TunnelSupervisor,
    ) -> Result<(), (ManagerError, TunnelSupervisor)> {
        if let Some(existing) = self.tunnels.get(&name) {
            if let Some(existing) = existing.try_lock().ok().and_then(|g| g.as_ref().map(|s| s.state())) {
                if existing != TunnelState::Closed && existing != TunnelState::Failed {
                    return Err((ManagerError::Config(format!("tunnel {name} is already open")), supervisor));
                }
            }
        }
        self.tunnels.insert(name, Arc::new(Mutex::new(Some(supervisor))));
        Ok(())
    }

    /// Remove and close `name`'s tunnel. No-op if it doesn't exist.
    pub async fn close(&self, name: &str) -> Result<(), ManagerError> {
        let Some((_, slot)) = self.tunnels.remove(name) else {
            return Err(ManagerError::Config(format!("no tunnel named {name}")));
        };
        if let Some(supervisor) = slot.lock().await.take() {
            supervisor.close().await;
        }
        Ok(())
    }

    /// Snapshot every tunnel's current status.
    pub async fn list(&self) -> Vec<TunnelSummary> {
        let mut out = Vec::with_capacity(self.tunnels.len());
        for entry in self.tunnels.iter() {
            let guard = entry.value().lock().await;
            if let Some(supervisor) = guard.as_ref() {
                out.push(TunnelSummary {
                    name: supervisor.desc.name.clone(),
                    mode: supervisor.desc.mode,
                    bound_addr: supervisor.bound_addr.clone(),
                    state: supervisor.state(),
                    stats: supervisor.stats(),
                });
            }
        }
        out
    }

    pub async fn close_all(&self) {
        let names: Vec<String> = self.tunnels.iter().map(|e| e.key().clone()).collect();
        for name in names {
            let _ = self.close(&name).await;
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tunnels.contains_key(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn empty_registry_lists_nothing() {
        let registry = TunnelRegistry::new();
        assert!(registry.list().await.is_empty());
    }

    #[tokio::test]
    async fn closing_unknown_tunnel_errors() {
        let registry = TunnelRegistry::new();
        assert!(registry.close("missing").await.is_err());
    }

    #[test]
    fn contains_reflects_presence() {
        let registry = TunnelRegistry::new();
        assert!(!registry.contains("anything"));
    }
}
