//! Per-host orchestration loop.
//!
//! One [`HostOrchestrator`] runs as a worker-pool loop for each host. Every
//! tick walks the host's instances: run the queued action, feed new console
//! output into the state machine, notice sessions that went away, and type
//! answered prompts into the server.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use chrono::Utc;
use tokio_util::sync::CancellationToken;

use crate::config::AppConfig;
use crate::error::{AppError, Result};
use crate::host::Host;
use crate::instance::{
    boot_instance, kill_instance, latest_archive, parse_menu_option, send_command,
    shutdown_instance, Instance, InstanceAction, InstanceState, OutputCursor,
};
use crate::paths::{get_output_file, get_worlds_dir};
use crate::pool::{loop_body, pause, LoopBody};
use crate::process::SessionController;
use crate::store::{blocking, FleetStore};
use crate::world::discover_worlds;

pub struct HostOrchestrator {
    host_id: String,
    store: Arc<dyn FleetStore>,
    sessions: SessionController,
    config: Arc<AppConfig>,
    cursors: HashMap<String, OutputCursor>,
    /// Prompt indices whose current answer has been typed, per instance.
    sent: HashMap<String, BTreeSet<u32>>,
}

impl HostOrchestrator {
    pub fn new(host_id: impl Into<String>, store: Arc<dyn FleetStore>, config: Arc<AppConfig>) -> Self {
        Self {
            host_id: host_id.into(),
            store,
            sessions: SessionController::from_config(&config),
            config,
            cursors: HashMap::new(),
            sent: HashMap::new(),
        }
    }

    /// Wrap the orchestrator into a worker-pool loop body.
    pub fn into_loop_body(self) -> LoopBody {
        let this = Arc::new(tokio::sync::Mutex::new(self));
        loop_body(move |cancel| {
            let this = Arc::clone(&this);
            async move { this.lock().await.tick(&cancel).await }
        })
    }

    /// One pass over the host's instances, followed by the poll pause.
    pub async fn tick(&mut self, cancel: &CancellationToken) -> Result<()> {
        let host_id = self.host_id.clone();
        let host = blocking(&self.store, move |store| store.host(&host_id)).await?;
        if !host.is_alive(Utc::now()) {
            log::debug!("Host {} is not alive, skipping", host.name);
            return pause(cancel, self.config.poll_interval()).await;
        }

        let host_id = host.id.clone();
        let instances = blocking(&self.store, move |store| store.instances_for_host(&host_id)).await?;
        let ids: HashSet<String> = instances.iter().map(|i| i.id.clone()).collect();
        self.cursors.retain(|id, _| ids.contains(id));
        self.sent.retain(|id, _| ids.contains(id));

        for instance in instances {
            if cancel.is_cancelled() {
                return Err(AppError::interrupted());
            }
            let name = instance.name.clone();
            if let Err(e) = self.service(&host, instance).await {
                log::error!("Instance {} on host {}: {}", name, host.name, e);
            }
        }

        pause(cancel, self.config.poll_interval()).await
    }

    async fn service(&mut self, host: &Host, mut instance: Instance) -> Result<()> {
        if instance.runtime.pending_action().is_some() {
            instance = self.run_pending_action(host, &instance).await?;
        }
        instance = self.feed_output(instance).await?;
        instance = self.check_session(instance).await?;
        self.send_answers(&instance).await
    }

    async fn run_pending_action(&mut self, host: &Host, instance: &Instance) -> Result<Instance> {
        let id = instance.id.clone();
        let started = blocking(&self.store, move |store| {
            store.update_instance(&id, &mut |current| {
                let mut next = current.clone();
                next.runtime = current.runtime.start_action(Utc::now())?;
                Ok(next)
            })
        })
        .await?;
        let Some(action) = started.runtime.current_action().cloned() else {
            return Ok(started);
        };
        log::info!("Running {} on instance {}", action, started.name);

        let outcome = self.execute(host, &started, &action).await;
        let state = match outcome {
            Ok(state) => state,
            Err(e) => {
                log::error!("Action {} on instance {} failed: {}", action, started.name, e);
                None
            }
        };
        if matches!(action, InstanceAction::Boot) && state.is_some() {
            self.forget_run(&started.id);
        }

        let config = Arc::clone(&self.config);
        let id = started.id.clone();
        blocking(&self.store, move |store| {
            store.update_instance(&id, &mut |current| {
                let mut next = current.clone();
                if let Some(state) = &state {
                    next.runtime = next.runtime.with_state(state.clone(), &config.state_table)?;
                }
                next.runtime = next.runtime.complete_action();
                Ok(next)
            })
        })
        .await
    }

    async fn execute(
        &self,
        host: &Host,
        instance: &Instance,
        action: &InstanceAction,
    ) -> Result<Option<InstanceState>> {
        match action {
            InstanceAction::Boot => boot_instance(&self.sessions, &self.config, instance)
                .await
                .map(Some),
            InstanceAction::Shutdown => shutdown_instance(&self.sessions, instance).await.map(Some),
            InstanceAction::Kill => kill_instance(&self.sessions, instance).await.map(Some),
            InstanceAction::SendCommand(text) => {
                send_command(&self.sessions, instance, text).await?;
                Ok(None)
            }
            InstanceAction::ScanWorlds => {
                self.scan_worlds(host).await?;
                Ok(None)
            }
        }
    }

    async fn scan_worlds(&self, host: &Host) -> Result<()> {
        let dir = get_worlds_dir(&host.base_dir);
        let live = tokio::task::spawn_blocking(move || discover_worlds(&dir))
            .await
            .map_err(|e| AppError::other(format!("World scan task failed: {}", e)))??;
        let host_id = host.id.clone();
        let worlds =
            blocking(&self.store, move |store| store.reconcile_worlds(&host_id, live)).await?;
        log::info!("Host {} has {} world(s)", host.name, worlds.len());
        Ok(())
    }

    async fn feed_output(&mut self, instance: Instance) -> Result<Instance> {
        let path = get_output_file(&instance.location);
        let lines = self
            .cursors
            .entry(instance.id.clone())
            .or_default()
            .read_new_lines(&path)
            .await?;
        self.apply_output(instance, lines).await
    }

    /// Read what the run wrote after the last poll. Once the exit trap has
    /// archived the output file, the rest of it is in the newest archive.
    async fn drain_output(&mut self, instance: Instance) -> Result<Instance> {
        let live = get_output_file(&instance.location);
        let cursor = self.cursors.entry(instance.id.clone()).or_default();
        let source = if cursor.offset() > 0 && !tokio::fs::try_exists(&live).await? {
            latest_archive(&live)
        } else {
            Some(live)
        };
        let lines = match source {
            Some(path) => cursor.read_new_lines(&path).await?,
            None => Vec::new(),
        };
        self.apply_output(instance, lines).await
    }

    /// Record menu prompts and detect boot completion.
    async fn apply_output(&mut self, instance: Instance, lines: Vec<String>) -> Result<Instance> {
        if lines.is_empty() {
            return Ok(instance);
        }
        let prompted: Vec<u32> = lines
            .iter()
            .filter_map(|line| parse_menu_option(line))
            .map(|(index, _)| index)
            .collect();

        let config = Arc::clone(&self.config);
        let id = instance.id.clone();
        let updated = blocking(&self.store, move |store| {
            store.update_instance(&id, &mut |current| {
                let mut runtime = current.runtime.clone();
                for line in &lines {
                    if let Some((index, text)) = parse_menu_option(line) {
                        runtime = runtime.acknowledge_menu_option(index, text);
                    } else if line.contains(config.boot_marker.as_str())
                        && runtime.state().as_str() == InstanceState::BOOTING_UP
                    {
                        runtime = runtime.with_state(
                            InstanceState::known(InstanceState::RUNNING),
                            &config.state_table,
                        )?;
                        log::info!("Instance {} is running", current.name);
                    }
                }
                let mut next = current.clone();
                next.runtime = runtime;
                Ok(next)
            })
        })
        .await?;

        // A prompt shown again waits for a fresh answer.
        if let Some(sent) = self.sent.get_mut(&updated.id) {
            for index in &prompted {
                sent.remove(index);
            }
        }
        Ok(updated)
    }

    /// Settle an active instance whose session has gone away.
    async fn check_session(&mut self, instance: Instance) -> Result<Instance> {
        if !self.config.state_table.is_active(instance.runtime.state())? {
            return Ok(instance);
        }
        if self.sessions.has_session(&instance.session_name()).await? {
            return Ok(instance);
        }

        let instance = self.drain_output(instance).await?;
        let target = if instance.runtime.state().as_str() == InstanceState::SHUTTING_DOWN {
            log::info!("Instance {} exited", instance.name);
            InstanceState::idle()
        } else {
            log::warn!(
                "Session of instance {} ended while {}",
                instance.name,
                instance.runtime.state()
            );
            InstanceState::known(InstanceState::CRASHED)
        };
        self.forget_run(&instance.id);

        let config = Arc::clone(&self.config);
        let id = instance.id.clone();
        blocking(&self.store, move |store| {
            store.update_instance(&id, &mut |current| {
                let mut next = current.clone();
                next.runtime = current
                    .runtime
                    .with_state(target.clone(), &config.state_table)?;
                Ok(next)
            })
        })
        .await
    }

    /// Type every answer not yet sent for the prompt it answers.
    async fn send_answers(&mut self, instance: &Instance) -> Result<()> {
        let session = instance.session_name();
        let pending = instance.runtime.pending_options();
        for (index, text) in instance.runtime.options() {
            // A pending prompt under the same index makes the stored answer stale.
            let typed = self
                .sent
                .get(&instance.id)
                .is_some_and(|sent| sent.contains(index));
            if typed || pending.contains_key(index) {
                continue;
            }
            self.sessions
                .send_input(&session, &format!("{index}\n"))
                .await?;
            log::info!("Answered prompt {} ({}) on instance {}", index, text, instance.name);
            self.sent.entry(instance.id.clone()).or_default().insert(*index);
        }
        Ok(())
    }

    fn forget_run(&mut self, instance_id: &str) {
        self.sent.remove(instance_id);
        if let Some(cursor) = self.cursors.get_mut(instance_id) {
            cursor.reset();
        }
    }
}
