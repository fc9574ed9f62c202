//! Hosts and heartbeat-based liveness.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::pool::{loop_body, pause, LoopBody};
use crate::store::{blocking, FleetStore};

/// A machine that runs instances.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Host {
    pub id: String,
    pub name: String,
    pub address: String,
    pub base_dir: PathBuf,
    /// Set by the host's own check-in, cleared by [`Host::mark_dead`].
    pub alive: bool,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub heartbeat_interval_secs: u64,
}

impl Host {
    pub fn new(
        name: impl Into<String>,
        address: impl Into<String>,
        base_dir: impl Into<PathBuf>,
        heartbeat_interval: Duration,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.into(),
            address: address.into(),
            base_dir: base_dir.into(),
            alive: false,
            last_heartbeat: None,
            heartbeat_interval_secs: heartbeat_interval.as_secs(),
        }
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn record_heartbeat(&mut self, now: DateTime<Utc>) {
        self.last_heartbeat = Some(now);
        self.alive = true;
    }

    pub fn mark_dead(&mut self) {
        self.alive = false;
    }

    /// First instant at which the host counts as unreachable: two heartbeat
    /// intervals after the last beat. `None` if it never beat, or if the
    /// window does not fit in a timestamp.
    pub fn liveness_deadline(&self) -> Option<DateTime<Utc>> {
        let last = self.last_heartbeat?;
        let window = i64::try_from(self.heartbeat_interval_secs)
            .ok()
            .and_then(|secs| secs.checked_mul(2))
            .and_then(TimeDelta::try_seconds)?;
        last.checked_add_signed(window)
    }

    pub fn is_alive(&self, now: DateTime<Utc>) -> bool {
        if !self.alive {
            return false;
        }
        match (self.last_heartbeat, self.liveness_deadline()) {
            (None, _) => false,
            (Some(_), Some(deadline)) => now < deadline,
            // Window overflows the calendar; it never closes.
            (Some(_), None) => true,
        }
    }
}

/// Host plus its derived liveness, for display.
#[derive(Debug, Clone, Serialize)]
pub struct HostStatus {
    pub host: Host,
    pub alive: bool,
}

/// Create and persist a new host.
pub fn register_host(
    store: &dyn FleetStore,
    name: &str,
    address: &str,
    base_dir: PathBuf,
    heartbeat_interval: Duration,
) -> Result<Host> {
    let host = Host::new(name, address, base_dir, heartbeat_interval);
    std::fs::create_dir_all(&host.base_dir)?;
    store.upsert_host(host.clone())?;
    log::info!("Registered host {} ({})", host.name, host.id);
    Ok(host)
}

pub fn record_heartbeat(store: &dyn FleetStore, host_id: &str) -> Result<Host> {
    store.update_host(host_id, &mut |host| {
        host.record_heartbeat(Utc::now());
        Ok(())
    })
}

pub fn mark_dead(store: &dyn FleetStore, host_id: &str) -> Result<Host> {
    store.update_host(host_id, &mut |host| {
        host.mark_dead();
        Ok(())
    })
}

pub fn list_hosts(store: &dyn FleetStore) -> Result<Vec<HostStatus>> {
    let now = Utc::now();
    Ok(store
        .hosts()?
        .into_iter()
        .map(|host| {
            let alive = host.is_alive(now);
            HostStatus { host, alive }
        })
        .collect())
}

/// Worker loop that checks the local host in once per heartbeat interval.
pub fn heartbeat_loop(store: Arc<dyn FleetStore>, host_id: String) -> LoopBody {
    loop_body(move |cancel| {
        let store = Arc::clone(&store);
        let host_id = host_id.clone();
        async move {
            let host = blocking(&store, move |store| record_heartbeat(store, &host_id)).await?;
            log::debug!("Heartbeat recorded for host {}", host.name);
            pause(&cancel, host.heartbeat_interval()).await
        }
    })
}
