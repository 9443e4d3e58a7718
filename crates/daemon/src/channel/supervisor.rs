//! Encoder process supervision for live channels.
//!
//! The supervisor keeps one handle per channel id. Lifecycle operations
//! (`ensure_running`, `update`, `stop`, `delete`) hold that channel's handle
//! lock for their whole duration, so two callers can never both decide a
//! channel is down and spawn twice on the same port. Listener admission and
//! accounting go through the current run's relay feed and never touch the
//! handle lock.

use super::probe;
use super::relay::{self, Listener, Relay, RelayFeed};
use super::{
    Channel, ChannelDraft, ChannelError, ChannelStartFailure, ChannelState, ChannelStatus,
    ListenerCount, DEFAULT_PORT,
};
use crate::catalog::{media_of, CatalogError, ObjectCatalog};
use crate::config::Config;
use crate::encode::{write_source_list, EncodeParams, EncoderLauncher};
use crate::store::ChannelStore;
use crate::unix_now;
use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::process::Child;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// How often a starting encoder is polled for readiness.
const READY_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// How long a terminated encoder gets before it is killed.
const STOP_GRACE: Duration = Duration::from_secs(3);

/// Interface assigned to channels without a fixed endpoint.
const FALLBACK_INTERFACE: &str = "127.0.0.1";

/// Tunables for the supervisor.
#[derive(Debug, Clone, PartialEq)]
pub struct SupervisorSettings {
    /// Where per-run source lists are written
    pub work_dir: PathBuf,
    /// Bound on how long a spawned encoder may take to produce output
    pub startup_timeout: Duration,
    /// Bound on a single port probe
    pub probe_timeout: Duration,
    /// First port tried for channels without a fixed endpoint; 0 skips it
    pub default_port: u16,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            work_dir: std::env::temp_dir().join("relaycast"),
            startup_timeout: Duration::from_secs(10),
            probe_timeout: Duration::from_millis(500),
            default_port: DEFAULT_PORT,
        }
    }
}

impl SupervisorSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            work_dir: config.encoder.work_dir.clone(),
            startup_timeout: Duration::from_millis(config.encoder.startup_timeout_ms),
            probe_timeout: Duration::from_millis(config.encoder.probe_timeout_ms),
            default_port: config.channel.default_port,
        }
    }
}

fn remove_source_list(channel_id: i64, path: &Path) {
    if let Err(e) = std::fs::remove_file(path) {
        debug!(channel_id, error = %e, "failed to remove source list");
    }
}

/// An encoder this supervisor spawned, with the relay fed by its stdout.
struct RunningEncoder {
    child: Child,
    source_list: PathBuf,
    relay: Relay,
}

impl RunningEncoder {
    /// End the relay, terminate the encoder (escalating to a kill after the
    /// grace period) and remove its source list.
    async fn shutdown(mut self, channel_id: i64) {
        self.relay.shutdown().await;
        if let Some(pid) = self.child.id() {
            probe::terminate(pid);
        }
        if tokio::time::timeout(STOP_GRACE, self.child.wait())
            .await
            .is_err()
        {
            warn!(channel_id, "encoder ignored SIGTERM, killing");
            if let Err(e) = self.child.kill().await {
                warn!(channel_id, error = %e, "failed to kill encoder");
            }
        }
        if let Err(e) = tokio::fs::remove_file(&self.source_list).await {
            debug!(channel_id, error = %e, "source list already gone");
        }
    }
}

/// Per-channel lifecycle handle.
#[derive(Default)]
struct ChannelHandle {
    encoder: tokio::sync::Mutex<Option<RunningEncoder>>,
    /// Feed of the current run, readable without the lifecycle lock.
    feed: Mutex<Option<Arc<RelayFeed>>>,
}

impl ChannelHandle {
    fn feed(&self) -> Option<Arc<RelayFeed>> {
        self.feed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn set_feed(&self, feed: Option<Arc<RelayFeed>>) {
        *self.feed.lock().unwrap_or_else(PoisonError::into_inner) = feed;
    }
}

/// Whether applying `draft` changes how the running encoder was started.
fn needs_restart(channel: &Channel, draft: &ChannelDraft) -> bool {
    let endpoint_changed = if draft.fixed_endpoint() {
        !channel.fixed_endpoint()
            || draft.interface.trim() != channel.interface
            || draft.port != channel.port
    } else {
        channel.fixed_endpoint()
    };
    endpoint_changed
        || draft.target != channel.target
        || draft.random != channel.random
        || draft.looping != channel.looping
        || draft.stream_type != channel.stream_type
        || draft.bitrate != channel.bitrate
}

/// Owns the encoder processes behind channels.
pub struct ChannelSupervisor {
    store: Arc<dyn ChannelStore>,
    catalog: Arc<dyn ObjectCatalog>,
    launcher: Arc<dyn EncoderLauncher>,
    settings: SupervisorSettings,
    handles: Mutex<HashMap<i64, Arc<ChannelHandle>>>,
}

impl ChannelSupervisor {
    pub fn new(
        store: Arc<dyn ChannelStore>,
        catalog: Arc<dyn ObjectCatalog>,
        launcher: Arc<dyn EncoderLauncher>,
        settings: SupervisorSettings,
    ) -> Self {
        Self {
            store,
            catalog,
            launcher,
            settings,
            handles: Mutex::new(HashMap::new()),
        }
    }

    pub fn settings(&self) -> &SupervisorSettings {
        &self.settings
    }

    /// Store the supervisor writes runtime fields through.
    pub fn store(&self) -> &Arc<dyn ChannelStore> {
        &self.store
    }

    fn handle(&self, id: i64) -> Arc<ChannelHandle> {
        // The map only hands out Arcs, so a poisoned guard is still consistent.
        let mut handles = self.handles.lock().unwrap_or_else(PoisonError::into_inner);
        handles.entry(id).or_default().clone()
    }

    fn forget_handle(&self, id: i64) {
        let mut handles = self.handles.lock().unwrap_or_else(PoisonError::into_inner);
        handles.remove(&id);
    }

    fn load(&self, id: i64) -> Result<Channel, ChannelError> {
        self.store.channel(id)?.ok_or(ChannelError::NotFound(id))
    }

    /// Whether the channel's encoder is alive and its endpoint accepting
    /// connections.
    ///
    /// Any failed check reads as "not running". The endpoint serves any
    /// number of clients, so connecting to it costs the encoder nothing.
    pub async fn check_running(&self, channel: &Channel) -> bool {
        if channel.runtime.pid == 0 || channel.port == 0 {
            return false;
        }
        probe::pid_alive(channel.runtime.pid)
            && probe::port_accepting(&channel.interface, channel.port, self.settings.probe_timeout)
                .await
    }

    /// Start the channel's encoder unless it is already running.
    ///
    /// Returns the channel record as persisted after the call.
    pub async fn ensure_running(&self, id: i64) -> Result<Channel, ChannelError> {
        let handle = self.handle(id);
        let mut encoder = handle.encoder.lock().await;

        let channel = self.load(id)?;
        if encoder.is_some() && self.check_running(&channel).await {
            debug!(channel_id = id, pid = channel.runtime.pid, "channel already running");
            return Ok(channel);
        }

        if channel.runtime.pid != 0 {
            warn!(
                channel_id = id,
                pid = channel.runtime.pid,
                "encoder process lost, restarting"
            );
        }
        self.discard_run(&channel, &handle, &mut encoder).await?;

        let channel = self.resolve_endpoint(channel)?;
        let addr = probe::connect_addr(&channel.interface, channel.port);
        let listener = match relay::bind(&channel.interface, channel.port).await {
            Ok(listener) => listener,
            Err(e) => {
                warn!(channel_id = id, addr = %addr, error = %e, "channel port unavailable");
                return Err(ChannelStartFailure::PortInUse { addr }.into());
            }
        };

        let media = match media_of(self.catalog.as_ref(), &channel.target) {
            Ok(media) => media,
            Err(CatalogError::NotFound(_)) => {
                return Err(ChannelStartFailure::NoMedia(channel.target).into())
            }
            Err(e) => return Err(e.into()),
        };
        if !media.iter().any(|m| m.path.is_some()) {
            return Err(ChannelStartFailure::NoMedia(channel.target).into());
        }

        let source_list =
            write_source_list(&self.settings.work_dir, id, &media, channel.random)
                .map_err(ChannelStartFailure::Spawn)?;
        let params = EncodeParams::for_channel(&channel, source_list.clone());

        info!(
            channel_id = id,
            addr = %addr,
            stream_type = %channel.stream_type,
            bitrate = channel.bitrate,
            tracks = media.len(),
            "spawning encoder"
        );
        let mut child = match self.launcher.launch(&params) {
            Ok(child) => child,
            Err(e) => {
                remove_source_list(id, &source_list);
                warn!(channel_id = id, error = %e, "encoder spawn failed");
                return Err(ChannelStartFailure::Spawn(e).into());
            }
        };
        let Some(stdout) = child.stdout.take() else {
            if let Err(e) = child.start_kill() {
                debug!(channel_id = id, error = %e, "failed to kill encoder");
            }
            remove_source_list(id, &source_list);
            return Err(ChannelStartFailure::Spawn(io::Error::other(
                "encoder stdout is not piped",
            ))
            .into());
        };
        let pid = child.id().unwrap_or(0);

        let feed = RelayFeed::new(id, channel.stream_type, self.store.clone());
        let mut running = RunningEncoder {
            child,
            source_list,
            relay: Relay::start(feed, listener, stdout),
        };

        let started = match self.wait_until_ready(&channel, &mut running).await {
            Ok(()) => self
                .store
                .set_process(id, pid, unix_now())
                .map_err(ChannelError::from),
            Err(failure) => {
                warn!(channel_id = id, pid, error = %failure, "encoder failed to start");
                Err(failure.into())
            }
        };
        if let Err(e) = started {
            running.shutdown(id).await;
            // Direct clients may have been counted while the run was starting.
            self.store.clear_process(id)?;
            return Err(e);
        }

        handle.set_feed(Some(running.relay.feed().clone()));
        *encoder = Some(running);
        info!(channel_id = id, pid, addr = %addr, "channel running");

        self.load(id)
    }

    /// Fill in an endpoint for channels without a fixed one and persist it.
    fn resolve_endpoint(&self, mut channel: Channel) -> Result<Channel, ChannelError> {
        if channel.fixed_endpoint() {
            return Ok(channel);
        }

        let interface = match channel.interface.trim() {
            "" => FALLBACK_INTERFACE.to_string(),
            other => other.to_string(),
        };
        let port = match [channel.port, self.settings.default_port]
            .into_iter()
            .filter(|p| *p != 0)
            .find(|p| probe::port_available(&interface, *p).is_ok())
        {
            Some(port) => port,
            None => probe::free_loopback_port().map_err(ChannelStartFailure::Spawn)?,
        };

        if interface != channel.interface || port != channel.port {
            debug!(channel_id = channel.id, interface = %interface, port, "assigned channel endpoint");
            self.store.set_endpoint(channel.id, &interface, port)?;
            channel.interface = interface;
            channel.port = port;
        }
        Ok(channel)
    }

    /// Ready once the encoder has produced output and the endpoint accepts
    /// connections.
    async fn wait_until_ready(
        &self,
        channel: &Channel,
        running: &mut RunningEncoder,
    ) -> Result<(), ChannelStartFailure> {
        let deadline = Instant::now() + self.settings.startup_timeout;
        loop {
            match running.child.try_wait() {
                Ok(Some(status)) => return Err(ChannelStartFailure::EncoderExited(status.code())),
                Ok(None) => {}
                Err(e) => return Err(ChannelStartFailure::Spawn(e)),
            }

            if running.relay.feed().has_output()
                && probe::port_accepting(
                    &channel.interface,
                    channel.port,
                    self.settings.probe_timeout,
                )
                .await
            {
                return Ok(());
            }

            if Instant::now() >= deadline {
                return Err(ChannelStartFailure::StartupTimeout(
                    self.settings.startup_timeout,
                ));
            }
            tokio::time::sleep(READY_POLL_INTERVAL).await;
        }
    }

    /// End whatever run the channel has and mark it stopped.
    ///
    /// An encoder recorded by an earlier daemon is terminated through its
    /// pid; nothing else could ever read its output.
    async fn discard_run(
        &self,
        channel: &Channel,
        handle: &ChannelHandle,
        encoder: &mut Option<RunningEncoder>,
    ) -> Result<(), ChannelError> {
        handle.set_feed(None);
        if let Some(running) = encoder.take() {
            info!(channel_id = channel.id, pid = channel.runtime.pid, "stopping encoder");
            running.shutdown(channel.id).await;
        } else if probe::terminate_stale(channel.runtime.pid, channel.runtime.start_date) {
            info!(channel_id = channel.id, pid = channel.runtime.pid, "terminated leftover encoder");
        }

        if channel.runtime.pid != 0 || channel.runtime.listeners != 0 {
            self.store.clear_process(channel.id)?;
        }
        Ok(())
    }

    /// Admit a listener to the channel's current run.
    ///
    /// Capacity is taken from `channel`; the count itself is checked again
    /// after the increment.
    pub fn admit_listener(&self, channel: &Channel) -> Result<Listener, ChannelError> {
        let feed = self
            .handle(channel.id)
            .feed()
            .ok_or(ChannelError::NotRunning(channel.id))?;
        feed.admit(channel.max_listeners)
    }

    /// Apply an admin edit.
    ///
    /// A running channel whose endpoint or encoding changes is stopped first
    /// and picks up the new settings on its next start. Other edits leave
    /// the encoder alone, and a floating channel keeps its assigned endpoint.
    pub async fn update(&self, id: i64, draft: &ChannelDraft) -> Result<Channel, ChannelError> {
        draft.validate()?;
        let handle = self.handle(id);
        let mut encoder = handle.encoder.lock().await;

        let channel = self.load(id)?;
        let running = encoder.is_some() || channel.runtime.pid != 0;
        if running && needs_restart(&channel, draft) {
            info!(channel_id = id, "encoder settings changed, stopping channel");
            self.discard_run(&channel, &handle, &mut encoder).await?;
        }

        if !self.store.update_channel(id, draft)? {
            return Err(ChannelError::NotFound(id));
        }
        if !draft.fixed_endpoint() && !channel.fixed_endpoint() && channel.port != 0 {
            self.store
                .set_endpoint(id, &channel.interface, channel.port)?;
        }
        info!(channel_id = id, "channel updated");
        self.load(id)
    }

    /// Stop the channel's encoder. Stopping a stopped channel succeeds.
    pub async fn stop(&self, id: i64) -> Result<(), ChannelError> {
        let handle = self.handle(id);
        let mut encoder = handle.encoder.lock().await;
        let channel = self.load(id)?;
        self.discard_run(&channel, &handle, &mut encoder).await
    }

    /// Stop the channel and remove its record.
    pub async fn delete(&self, id: i64) -> Result<(), ChannelError> {
        let handle = self.handle(id);
        {
            let mut encoder = handle.encoder.lock().await;
            let channel = self.load(id)?;
            self.discard_run(&channel, &handle, &mut encoder).await?;
            if !self.store.delete_channel(id)? {
                return Err(ChannelError::NotFound(id));
            }
        }
        self.forget_handle(id);
        info!(channel_id = id, "channel deleted");
        Ok(())
    }

    /// Stop every encoder this supervisor started.
    pub async fn shutdown_all(&self) {
        let handles: Vec<(i64, Arc<ChannelHandle>)> = self
            .handles
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(id, handle)| (*id, handle.clone()))
            .collect();

        for (id, handle) in handles {
            let mut encoder = handle.encoder.lock().await;
            let Some(running) = encoder.take() else {
                continue;
            };
            handle.set_feed(None);
            running.shutdown(id).await;
            if let Err(e) = self.store.clear_process(id) {
                warn!(channel_id = id, error = %e, "failed to mark channel stopped");
            }
            info!(channel_id = id, "channel stopped for shutdown");
        }
    }

    /// Apply a listener connect (+1) or disconnect (-1).
    pub fn record_listener_delta(&self, id: i64, delta: i32) -> Result<ListenerCount, ChannelError> {
        let count = self
            .store
            .apply_listener_delta(id, delta)?
            .ok_or(ChannelError::NotFound(id))?;
        debug!(
            channel_id = id,
            delta,
            listeners = count.listeners,
            peak = count.peak_listeners,
            "listener count changed"
        );
        Ok(count)
    }

    /// Monitoring tick: stop runs whose encoder is gone and clear persisted
    /// pids nothing here owns.
    ///
    /// Channels with a lifecycle operation in flight are skipped. Returns the
    /// number of channels healed.
    pub async fn reconcile(&self) -> Result<usize, ChannelError> {
        let mut healed = 0;
        for channel in self.store.channels()? {
            if channel.runtime.pid == 0 {
                continue;
            }
            let handle = self.handle(channel.id);
            let Ok(mut encoder) = handle.encoder.try_lock() else {
                continue;
            };
            if encoder.is_some() && self.check_running(&channel).await {
                continue;
            }

            warn!(
                channel_id = channel.id,
                pid = channel.runtime.pid,
                "encoder process lost, marking channel stopped"
            );
            self.discard_run(&channel, &handle, &mut encoder).await?;
            healed += 1;
        }
        Ok(healed)
    }

    /// Monitoring view of one channel.
    pub async fn status(&self, channel: &Channel, web_path: &str) -> ChannelStatus {
        let state = if self.check_running(channel).await {
            ChannelState::Running
        } else {
            ChannelState::Stopped
        };
        ChannelStatus::new(channel, state, web_path, unix_now())
    }

    /// Status of every channel, optionally hiding private ones.
    pub async fn statuses(
        &self,
        web_path: &str,
        include_private: bool,
    ) -> Result<Vec<ChannelStatus>, ChannelError> {
        let mut out = Vec::new();
        for channel in self.store.channels()? {
            if channel.is_private && !include_private {
                continue;
            }
            out.push(self.status(&channel, web_path).await);
        }
        Ok(out)
    }
}
