//! CommandRouter: validates client commands, resolves target devices, and
//! dispatches them.
//!
//! This is the heart of the daemon.  Every session hands its parsed requests
//! to one shared router, which owns all mutable state behind a single lock:
//!
//! ```text
//!  session ─► handle(request) ─► validate ─► lock state ─► resolve target
//!                                                 │
//!                          ┌──────────────────────┤
//!                          ▼                      ▼
//!                 registry / mapping        DeviceHandle::submit (try_send)
//!                     mutation                    │
//!                          │                      ▼
//!                          └──► EventSink::publish (broadcast to all sessions)
//! ```
//!
//! # Lock discipline
//!
//! The state lock is never held across a device open or a write.  Jobs are
//! enqueued with a non-blocking `try_send` while the lock is held, so the
//! order jobs reach a device equals the order the router dispatched them.
//! Events for state changes are published while the lock is still held, so
//! observers see them in the same order the changes happened.
//!
//! # Testability
//!
//! The router depends only on the [`VestBackend`] and [`EventSink`] traits;
//! tests inject [`MockBackend`](crate::infrastructure::device::mock::MockBackend)
//! and a recording sink.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::sync::{mpsc, Mutex, MutexGuard};
use tracing::{debug, info, warn};
use vest_core::{CellCommand, EffectCategory, EFFECTS};

use crate::application::device_registry::{ConnectPlan, DeviceKind, DeviceRegistry, DeviceSummary};
use crate::application::effect_playback::{self, PlaybackTable};
use crate::application::player_mapping::{GameMappingTable, PlayerTable};
use crate::application::resolve::resolve_target;
use crate::domain::{
    Command, CommandError, ConnectionState, DeviceDescriptor, DeviceId, DeviceSelector,
    DisconnectReason, Event, EventPayload, Request, Response, TargetSelector,
};
use crate::infrastructure::device::mock::MockTransport;
use crate::infrastructure::device::{
    Completion, DeviceHandle, DeviceLost, TransportError, VestBackend, VestTransport,
    WriterSettings,
};

/// Receives every event the router produces.
///
/// The network layer implements this by broadcasting to all sessions.
pub trait EventSink: Send + Sync {
    /// Delivers one event.  Must not block.
    fn publish(&self, event: Event);

    /// Number of connected clients, reported by `ping`.
    fn session_count(&self) -> usize;
}

/// Router tuning, usually derived from the config file.
#[derive(Debug, Clone, Copy)]
pub struct RouterSettings {
    pub open_timeout: Duration,
    pub writer: WriterSettings,
    pub max_mock_devices: usize,
}

impl Default for RouterSettings {
    fn default() -> Self {
        Self {
            open_timeout: Duration::from_secs(2),
            writer: WriterSettings::default(),
            max_mock_devices: 20,
        }
    }
}

/// Everything guarded by the router's lock.
struct ControlState {
    registry: DeviceRegistry,
    players: PlayerTable,
    games: GameMappingTable,
    playback: PlaybackTable,
    /// Hardware seen by the last bus scan.
    known_hardware: Vec<DeviceDescriptor>,
}

/// Dispatches commands and owns daemon state.
pub struct CommandRouter {
    state: Mutex<ControlState>,
    backend: Arc<dyn VestBackend>,
    events: Arc<dyn EventSink>,
    settings: RouterSettings,
    lost_tx: mpsc::UnboundedSender<DeviceLost>,
}

impl CommandRouter {
    /// Creates a router and the receiver its writers report device loss on.
    ///
    /// Feed the receiver to [`CommandRouter::run_loss_monitor`].
    pub fn new(
        backend: Arc<dyn VestBackend>,
        events: Arc<dyn EventSink>,
        settings: RouterSettings,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<DeviceLost>) {
        let (lost_tx, lost_rx) = mpsc::unbounded_channel();
        let router = Arc::new(Self {
            state: Mutex::new(ControlState {
                registry: DeviceRegistry::new(settings.max_mock_devices),
                players: PlayerTable::new(),
                games: GameMappingTable::new(),
                playback: PlaybackTable::new(),
                known_hardware: Vec::new(),
            }),
            backend,
            events,
            settings,
            lost_tx,
        });
        (router, lost_rx)
    }

    // ── Public API ────────────────────────────────────────────────────────────

    /// Handles one request and returns the response for its session.
    ///
    /// Never fails: every error becomes an `error` response that echoes the
    /// request's `req_id`.
    pub async fn handle(self: &Arc<Self>, request: Request) -> Response {
        let req_id = request.req_id.clone();
        let name = request.cmd.clone().unwrap_or_default();

        let result = match request.command() {
            Ok(command) => self.dispatch(command).await,
            Err(e) => Err(e),
        };

        match result {
            Ok(response) => response.with_req_id(req_id),
            Err(e) => {
                debug!("command {name:?} failed: {e}");
                Response::error(e.to_string()).with_req_id(req_id)
            }
        }
    }

    /// Creates and connects a mock device, returning its summary.
    ///
    /// # Errors
    ///
    /// [`CommandError::Conflict`] when the mock limit is reached.
    pub async fn create_mock_device(&self) -> Result<DeviceSummary, CommandError> {
        let mut st = self.state.lock().await;
        let device_id = st.registry.register_mock()?;

        if let ConnectPlan::Open {
            kind: DeviceKind::Mock(probe),
            ..
        } = st.registry.begin_connect(&device_id)?
        {
            let handle = self.spawn_writer(&device_id, Box::new(MockTransport::new(probe)));
            st.registry.finish_connect(&device_id, handle);
        }

        let summary = st
            .registry
            .summary(&device_id)
            .ok_or_else(|| CommandError::NotFound(format!("device not found: {device_id}")))?;
        info!("device {device_id}: mock device created");
        self.emit(EventPayload::MockDeviceCreated {
            device_id: device_id.clone(),
            device: summary.device.clone(),
            is_main: summary.is_main,
        });
        Ok(summary)
    }

    /// Consumes write-failure reports until the channel closes.
    pub async fn run_loss_monitor(self: Arc<Self>, mut lost_rx: mpsc::UnboundedReceiver<DeviceLost>) {
        while let Some(lost) = lost_rx.recv().await {
            self.on_device_lost(lost).await;
        }
    }

    /// Applies the result of a bus scan.
    ///
    /// Publishes `devices_changed` when the set of attached vests changed,
    /// and disconnects any connected vest that is no longer attached.
    pub async fn reconcile_hardware(&self, mut attached: Vec<DeviceDescriptor>) {
        attached.sort_by_key(|d| (d.bus, d.address, d.serial_number.clone()));

        let mut st = self.state.lock().await;
        if attached != st.known_hardware {
            debug!("hotplug: {} vest(s) attached", attached.len());
            st.known_hardware = attached.clone();
            self.emit(EventPayload::DevicesChanged {
                devices: attached.clone(),
            });
        }

        for (device_id, descriptor) in st.registry.connected_hardware() {
            if attached.iter().any(|d| d.same_device(&descriptor)) {
                continue;
            }
            st.playback.cancel(&device_id);
            if let Ok(true) = st.registry.disconnect(&device_id) {
                warn!("device {device_id}: unplugged");
                self.emit(EventPayload::Disconnected {
                    device_id,
                    reason: DisconnectReason::Unplugged,
                    message: None,
                });
            }
        }
    }

    /// Stops all playback and closes every device.
    pub async fn shutdown(&self) {
        let mut st = self.state.lock().await;
        st.playback.cancel_all();
        let ids: Vec<DeviceId> = st.registry.list().into_iter().map(|d| d.device_id).collect();
        for id in ids {
            let _ = st.registry.disconnect(&id);
        }
        info!("router: all devices closed");
    }

    // ── Dispatch ──────────────────────────────────────────────────────────────

    async fn dispatch(self: &Arc<Self>, command: Command) -> Result<Response, CommandError> {
        match command {
            Command::Ping => self.ping().await,
            Command::Status { device_id } => self.status(device_id).await,
            Command::List => self.list().await,
            Command::SelectDevice(selector) => self.select_device(selector).await,
            Command::GetSelectedDevice => self.get_selected_device().await,
            Command::ClearDevice => self.clear_device().await,
            Command::Connect { device_id } => self.connect(device_id).await,
            Command::Disconnect { device_id } => self.disconnect(device_id).await,
            Command::Trigger { target, command } => self.trigger(target, command).await,
            Command::Stop { target } => self.stop(target).await,
            Command::ListConnectedDevices => self.list_connected_devices().await,
            Command::SetMainDevice { device_id } => self.set_main_device(device_id).await,
            Command::DisconnectDevice { device_id } => self.disconnect_device(device_id).await,
            Command::CreateMockDevice => {
                let summary = self.create_mock_device().await?;
                Ok(Response::ok("create_mock_device")
                    .with("device_id", &summary.device_id)
                    .with("device", &summary.device)
                    .with("is_main", summary.is_main))
            }
            Command::RemoveMockDevice { device_id } => self.remove_mock_device(device_id).await,
            Command::CreatePlayer { player_id, name } => self.create_player(player_id, name).await,
            Command::RemovePlayer { player_id } => self.remove_player(player_id).await,
            Command::AssignPlayer {
                player_id,
                device_id,
            } => self.assign_player(player_id, device_id).await,
            Command::UnassignPlayer { player_id } => self.unassign_player(player_id).await,
            Command::ListPlayers => {
                let st = self.state.lock().await;
                Ok(Response::ok("list_players").with("players", st.players.list()))
            }
            Command::GetPlayerDevice { player_id } => self.get_player_device(player_id).await,
            Command::SetGamePlayerMapping {
                game_id,
                player_num,
                device_id,
            } => self.set_game_player_mapping(game_id, player_num, device_id).await,
            Command::ClearGamePlayerMapping {
                game_id,
                player_num,
            } => self.clear_game_player_mapping(game_id, player_num).await,
            Command::ListGamePlayerMappings { game_id } => {
                let st = self.state.lock().await;
                Ok(Response::ok("list_game_player_mappings")
                    .with("mappings", st.games.list(game_id.as_deref())))
            }
            Command::PlayEffect { target, effect } => self.play_effect(target, effect).await,
            Command::ListEffects => Ok(list_effects()),
            Command::StopEffect { target } => self.stop_effect(target).await,
        }
    }

    // ── Daemon and discovery ──────────────────────────────────────────────────

    async fn ping(&self) -> Result<Response, CommandError> {
        let st = self.state.lock().await;
        Ok(Response::ok("ping")
            .with("alive", true)
            .with("connected", st.registry.any_connected())
            .with("has_device_selected", st.registry.main().is_some())
            .with("client_count", self.events.session_count())
            .with("device_count", st.registry.len()))
    }

    async fn status(&self, device_id: Option<DeviceId>) -> Result<Response, CommandError> {
        let st = self.state.lock().await;
        let target = device_id.or_else(|| st.registry.main().cloned());
        let Some(device_id) = target else {
            return Ok(Response::ok("status")
                .with("connected", false)
                .with("device_id", None::<DeviceId>)
                .with("device", None::<DeviceDescriptor>));
        };

        let summary = st
            .registry
            .summary(&device_id)
            .ok_or_else(|| CommandError::NotFound(format!("device not found: {device_id}")))?;
        Ok(Response::ok("status")
            .with("connected", summary.state == ConnectionState::Connected)
            .with("device_id", &summary.device_id)
            .with("state", summary.state)
            .with("is_main", summary.is_main)
            .with("device", &summary.device))
    }

    async fn enumerate(&self) -> Result<Vec<DeviceDescriptor>, CommandError> {
        let backend = Arc::clone(&self.backend);
        tokio::task::spawn_blocking(move || backend.enumerate())
            .await
            .map_err(|e| CommandError::Discovery(e.to_string()))?
            .map_err(|e| CommandError::Discovery(e.to_string()))
    }

    async fn list(&self) -> Result<Response, CommandError> {
        let devices = self.enumerate().await?;
        Ok(Response::ok("list").with("devices", devices))
    }

    async fn select_device(&self, selector: DeviceSelector) -> Result<Response, CommandError> {
        let devices = self.enumerate().await?;
        let descriptor = devices
            .into_iter()
            .find(|d| selector.matches(d))
            .ok_or_else(|| CommandError::NotFound("device not found".to_owned()))?;

        let mut st = self.state.lock().await;
        let (device_id, _) = st.registry.register_hardware(descriptor.clone());
        st.registry.set_main(&device_id)?;
        info!("device {device_id}: selected as main");
        self.emit(EventPayload::DeviceSelected {
            device_id: device_id.clone(),
            device: descriptor.clone(),
        });
        Ok(Response::ok("select_device")
            .with("device_id", &device_id)
            .with("device", &descriptor))
    }

    async fn get_selected_device(&self) -> Result<Response, CommandError> {
        let st = self.state.lock().await;
        let summary = st.registry.main().and_then(|id| st.registry.summary(id));
        Ok(Response::ok("get_selected_device")
            .with("device_id", summary.as_ref().map(|s| &s.device_id))
            .with("device", summary.as_ref().map(|s| &s.device)))
    }

    async fn clear_device(&self) -> Result<Response, CommandError> {
        let mut st = self.state.lock().await;
        let previous = st.registry.clear_main();
        if previous.is_some() {
            self.emit(EventPayload::DeviceCleared {
                previous: previous.clone(),
            });
        }
        Ok(Response::ok("clear_device").with("previous", previous))
    }

    // ── Connection ────────────────────────────────────────────────────────────

    fn require_main(registry: &DeviceRegistry) -> Result<DeviceId, CommandError> {
        registry
            .main()
            .cloned()
            .ok_or_else(|| CommandError::DeviceNotResolved("no device selected".to_owned()))
    }

    async fn connect(&self, device_id: Option<DeviceId>) -> Result<Response, CommandError> {
        let device_id = match device_id {
            Some(id) => id,
            None => Self::require_main(&self.state.lock().await.registry)?,
        };
        let (_, opened) = self.ensure_connected(&device_id).await?;
        Ok(Response::ok("connect")
            .with("device_id", &device_id)
            .with("already_connected", !opened))
    }

    /// Opens `device_id` unless it is already connected.
    ///
    /// Returns the state lock together with whether a new connection was
    /// made.  The lock is released while the transport opens.  A caller that
    /// finds another open in progress waits for it instead of failing; the
    /// opener keeps the lock until its own frames are queued, so writes still
    /// reach the device in dispatch order.
    async fn ensure_connected(
        &self,
        device_id: &DeviceId,
    ) -> Result<(MutexGuard<'_, ControlState>, bool), CommandError> {
        let (descriptor, kind) = loop {
            let mut st = self.state.lock().await;
            let plan = st.registry.begin_connect(device_id)?;
            match plan {
                ConnectPlan::AlreadyConnected => return Ok((st, false)),
                ConnectPlan::Open { descriptor, kind } => break (descriptor, kind),
                ConnectPlan::InProgress(mut settled) => {
                    drop(st);
                    debug!("device {device_id}: waiting for open in progress");
                    // Errors once the opener drops its side.
                    let _ = settled.changed().await;
                }
            }
        };

        let opened: Result<Box<dyn VestTransport>, TransportError> = match kind {
            DeviceKind::Mock(probe) => Ok(Box::new(MockTransport::new(probe))),
            DeviceKind::Hardware => {
                match tokio::time::timeout(self.settings.open_timeout, self.backend.open(&descriptor))
                    .await
                {
                    Ok(result) => result,
                    Err(_) => Err(TransportError::Timeout),
                }
            }
        };

        let mut st = self.state.lock().await;
        match opened {
            Ok(transport) => {
                let handle = self.spawn_writer(device_id, transport);
                if !st.registry.finish_connect(device_id, handle) {
                    return Err(CommandError::DeviceOpen {
                        device_id: device_id.clone(),
                        reason: "device was removed or disconnected while opening".to_owned(),
                    });
                }
                info!("device {device_id}: connected");
                self.emit(EventPayload::Connected {
                    device_id: device_id.clone(),
                    device: descriptor,
                });
                Ok((st, true))
            }
            Err(e) => {
                st.registry.abort_connect(device_id);
                warn!("device {device_id}: open failed: {e}");
                Err(CommandError::DeviceOpen {
                    device_id: device_id.clone(),
                    reason: e.to_string(),
                })
            }
        }
    }

    async fn disconnect(&self, device_id: Option<DeviceId>) -> Result<Response, CommandError> {
        let mut st = self.state.lock().await;
        let device_id = match device_id {
            Some(id) => id,
            None => Self::require_main(&st.registry)?,
        };
        st.playback.cancel(&device_id);
        let was_connected = st.registry.disconnect(&device_id)?;
        if was_connected {
            info!("device {device_id}: disconnected by request");
            self.emit(EventPayload::Disconnected {
                device_id: device_id.clone(),
                reason: DisconnectReason::Requested,
                message: None,
            });
        }
        Ok(Response::ok("disconnect")
            .with("device_id", &device_id)
            .with("was_connected", was_connected))
    }

    // ── Effects ───────────────────────────────────────────────────────────────

    async fn resolve(&self, target: &TargetSelector) -> Result<DeviceId, CommandError> {
        let st = self.state.lock().await;
        resolve_target(target, &st.registry, &st.players, &st.games)
    }

    async fn trigger(&self, target: TargetSelector, command: CellCommand) -> Result<Response, CommandError> {
        let device_id = self.resolve(&target).await?;
        let done = {
            let (st, _) = self.ensure_connected(&device_id).await?;
            submit(&st, &device_id, vec![command])?
        };
        wait_written(&device_id, done).await?;

        self.emit(EventPayload::EffectTriggered {
            device_id: device_id.clone(),
            cell: command.cell,
            speed: command.speed,
        });
        Ok(Response::ok("trigger").with("device_id", &device_id))
    }

    async fn stop(&self, target: TargetSelector) -> Result<Response, CommandError> {
        let mut st = self.state.lock().await;
        let device_id = resolve_target(&target, &st.registry, &st.players, &st.games)?;

        st.playback.cancel(&device_id);
        let connected = st
            .registry
            .get(&device_id)
            .is_some_and(|e| e.handle().is_some());
        if connected {
            // Queued behind whatever is already pending for this device.
            submit(&st, &device_id, effect_playback::all_off())?;
        }

        self.emit(EventPayload::AllStopped {
            device_id: device_id.clone(),
        });
        Ok(Response::ok("stop").with("device_id", &device_id))
    }

    async fn play_effect(
        self: &Arc<Self>,
        target: TargetSelector,
        effect: &'static vest_core::Effect,
    ) -> Result<Response, CommandError> {
        let device_id = self.resolve(&target).await?;
        let (mut st, _) = self.ensure_connected(&device_id).await?;
        let jobs = st
            .registry
            .get(&device_id)
            .and_then(|e| e.handle())
            .map(DeviceHandle::sender)
            .ok_or_else(|| not_connected(&device_id))?;

        // Switch off whatever the replaced preset left running before the new
        // preset's first frame can be queued.
        if let Some(replaced) = st.playback.cancel(&device_id) {
            submit(&st, &device_id, effect_playback::all_off())?;
            debug!("device {device_id}: {replaced} replaced by {}", effect.name);
        }

        let playback_id = st.playback.next_id();
        let router = Arc::clone(self);
        let task_device = device_id.clone();
        let task = tokio::spawn(async move {
            let result = effect_playback::play(effect, jobs).await;
            router.finish_playback(task_device, playback_id, effect.name, result).await;
        });
        st.playback
            .insert(device_id.clone(), playback_id, effect.name, task.abort_handle());

        let duration_ms = effect.total_duration_ms();
        self.emit(EventPayload::EffectStarted {
            device_id: device_id.clone(),
            effect_name: effect.name.to_owned(),
            duration_ms,
        });
        Ok(Response::ok("play_effect")
            .with("device_id", &device_id)
            .with("effect_name", effect.name)
            .with("duration_ms", duration_ms))
    }

    async fn finish_playback(
        &self,
        device_id: DeviceId,
        playback_id: u64,
        effect_name: &'static str,
        result: Result<(), effect_playback::PlaybackError>,
    ) {
        let mut st = self.state.lock().await;
        if !st.playback.finish(&device_id, playback_id) {
            return;
        }
        match result {
            Ok(()) => self.emit(EventPayload::EffectCompleted {
                device_id,
                effect_name: effect_name.to_owned(),
            }),
            // The writer reports the loss itself; no completion to announce.
            Err(e) => warn!("device {device_id}: effect {effect_name} aborted: {e}"),
        }
    }

    async fn stop_effect(&self, target: TargetSelector) -> Result<Response, CommandError> {
        let mut st = self.state.lock().await;
        let device_id = resolve_target(&target, &st.registry, &st.players, &st.games)?;

        let Some(effect_name) = st.playback.cancel(&device_id) else {
            return Ok(Response::ok("stop_effect")
                .with("device_id", &device_id)
                .with("was_playing", false));
        };

        if st.registry.get(&device_id).is_some_and(|e| e.handle().is_some()) {
            submit(&st, &device_id, effect_playback::all_off())?;
        }
        self.emit(EventPayload::EffectStopped {
            device_id: device_id.clone(),
            effect_name: effect_name.to_owned(),
        });
        Ok(Response::ok("stop_effect")
            .with("device_id", &device_id)
            .with("was_playing", true)
            .with("effect_name", effect_name))
    }

    // ── Multi-device management ───────────────────────────────────────────────

    async fn list_connected_devices(&self) -> Result<Response, CommandError> {
        let st = self.state.lock().await;
        Ok(Response::ok("list_connected_devices").with("devices", st.registry.list()))
    }

    async fn set_main_device(&self, device_id: DeviceId) -> Result<Response, CommandError> {
        let mut st = self.state.lock().await;
        st.registry.set_main(&device_id)?;
        info!("device {device_id}: set as main");
        self.emit(EventPayload::MainDeviceChanged {
            device_id: Some(device_id.clone()),
        });
        Ok(Response::ok("set_main_device").with("device_id", &device_id))
    }

    async fn disconnect_device(&self, device_id: DeviceId) -> Result<Response, CommandError> {
        let mut st = self.state.lock().await;
        st.playback.cancel(&device_id);
        // Dropping the removed entry stops its writer.
        st.registry.remove(&device_id)?;
        let main_device_id = st.registry.main().cloned();
        info!("device {device_id}: removed");
        self.emit(EventPayload::DeviceRemoved {
            device_id: device_id.clone(),
            main_device_id: main_device_id.clone(),
        });
        Ok(Response::ok("disconnect_device")
            .with("device_id", &device_id)
            .with("main_device_id", main_device_id))
    }

    async fn remove_mock_device(&self, device_id: DeviceId) -> Result<Response, CommandError> {
        let mut st = self.state.lock().await;
        match st.registry.get(&device_id) {
            None => {
                return Err(CommandError::NotFound(format!("device not found: {device_id}")));
            }
            Some(entry) if !entry.is_mock() => {
                return Err(CommandError::Parameter(format!("not a mock device: {device_id}")));
            }
            Some(_) => {}
        }
        st.playback.cancel(&device_id);
        st.registry.remove(&device_id)?;
        let main_device_id = st.registry.main().cloned();
        info!("device {device_id}: mock device removed");
        self.emit(EventPayload::MockDeviceRemoved {
            device_id: device_id.clone(),
            main_device_id: main_device_id.clone(),
        });
        Ok(Response::ok("remove_mock_device")
            .with("device_id", &device_id)
            .with("main_device_id", main_device_id))
    }

    // ── Players and game slots ────────────────────────────────────────────────

    fn require_device(registry: &DeviceRegistry, device_id: &DeviceId) -> Result<(), CommandError> {
        if registry.contains(device_id) {
            Ok(())
        } else {
            Err(CommandError::Parameter(format!("unknown device_id: {device_id}")))
        }
    }

    async fn create_player(&self, player_id: String, name: Option<String>) -> Result<Response, CommandError> {
        let mut st = self.state.lock().await;
        let player = st.players.create(&player_id, name);
        self.emit(EventPayload::PlayerCreated {
            player: player.clone(),
        });
        Ok(Response::ok("create_player").with("player", player))
    }

    async fn remove_player(&self, player_id: String) -> Result<Response, CommandError> {
        let mut st = self.state.lock().await;
        st.players
            .remove(&player_id)
            .ok_or_else(|| CommandError::NotFound(format!("player not found: {player_id}")))?;
        self.emit(EventPayload::PlayerRemoved {
            player_id: player_id.clone(),
        });
        Ok(Response::ok("remove_player").with("player_id", player_id))
    }

    async fn assign_player(&self, player_id: String, device_id: DeviceId) -> Result<Response, CommandError> {
        let mut st = self.state.lock().await;
        Self::require_device(&st.registry, &device_id)?;
        let player = st.players.assign(&player_id, device_id.clone());
        self.emit(EventPayload::PlayerAssigned {
            player_id,
            device_id,
        });
        Ok(Response::ok("assign_player").with("player", player))
    }

    async fn unassign_player(&self, player_id: String) -> Result<Response, CommandError> {
        let mut st = self.state.lock().await;
        st.players
            .unassign(&player_id)
            .ok_or_else(|| CommandError::NotFound(format!("player not found: {player_id}")))?;
        self.emit(EventPayload::PlayerUnassigned {
            player_id: player_id.clone(),
        });
        Ok(Response::ok("unassign_player").with("player_id", player_id))
    }

    async fn get_player_device(&self, player_id: String) -> Result<Response, CommandError> {
        let st = self.state.lock().await;
        let player = st
            .players
            .get(&player_id)
            .ok_or_else(|| CommandError::NotFound(format!("player not found: {player_id}")))?;
        Ok(Response::ok("get_player_device")
            .with("player_id", &player.player_id)
            .with("device_id", &player.device_id))
    }

    async fn set_game_player_mapping(
        &self,
        game_id: String,
        player_num: u32,
        device_id: DeviceId,
    ) -> Result<Response, CommandError> {
        let mut st = self.state.lock().await;
        Self::require_device(&st.registry, &device_id)?;
        let mapping = st.games.set(&game_id, player_num, device_id);
        self.emit(mapping.clone().into());
        Ok(Response::ok("set_game_player_mapping").with("mapping", mapping))
    }

    async fn clear_game_player_mapping(
        &self,
        game_id: String,
        player_num: Option<u32>,
    ) -> Result<Response, CommandError> {
        let mut st = self.state.lock().await;
        if !st.games.clear(&game_id, player_num) {
            return Err(CommandError::NotFound(match player_num {
                Some(num) => format!("no mapping for game {game_id} player {num}"),
                None => format!("no mappings for game {game_id}"),
            }));
        }
        self.emit(EventPayload::GamePlayerMappingChanged {
            game_id: game_id.clone(),
            player_num,
            device_id: None,
        });
        let mut response = Response::ok("clear_game_player_mapping").with("game_id", game_id);
        if let Some(num) = player_num {
            response = response.with("player_num", num);
        }
        Ok(response)
    }

    // ── Internals ─────────────────────────────────────────────────────────────

    fn emit(&self, payload: EventPayload) {
        self.events.publish(Event::new(payload));
    }

    fn spawn_writer(&self, device_id: &DeviceId, transport: Box<dyn VestTransport>) -> DeviceHandle {
        DeviceHandle::spawn(
            device_id.clone(),
            transport,
            self.settings.writer,
            self.lost_tx.clone(),
        )
    }

    async fn on_device_lost(&self, lost: DeviceLost) {
        let mut st = self.state.lock().await;
        if !st.registry.mark_lost(&lost.device_id, lost.connection_id) {
            debug!("device {}: ignoring loss of a stale connection", lost.device_id);
            return;
        }
        st.playback.cancel(&lost.device_id);
        warn!("device {}: lost ({})", lost.device_id, lost.reason);
        self.emit(EventPayload::Disconnected {
            device_id: lost.device_id,
            reason: DisconnectReason::WriteFailed,
            message: Some(lost.reason),
        });
    }
}

fn not_connected(device_id: &DeviceId) -> CommandError {
    CommandError::DeviceWrite {
        device_id: device_id.clone(),
        reason: "device is not connected".to_owned(),
    }
}

/// Enqueues frames on a connected device while the state lock is held.
fn submit(
    st: &ControlState,
    device_id: &DeviceId,
    frames: Vec<CellCommand>,
) -> Result<Completion, CommandError> {
    let handle = st
        .registry
        .get(device_id)
        .and_then(|e| e.handle())
        .ok_or_else(|| not_connected(device_id))?;
    handle.submit(frames).map_err(|e| CommandError::DeviceWrite {
        device_id: device_id.clone(),
        reason: e.to_string(),
    })
}

async fn wait_written(device_id: &DeviceId, done: Completion) -> Result<(), CommandError> {
    match done.await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(CommandError::DeviceWrite {
            device_id: device_id.clone(),
            reason: e.to_string(),
        }),
        Err(_) => Err(CommandError::DeviceWrite {
            device_id: device_id.clone(),
            reason: "device writer stopped".to_owned(),
        }),
    }
}

fn list_effects() -> Response {
    let effects: Vec<serde_json::Value> = EFFECTS
        .iter()
        .map(|e| {
            json!({
                "name": e.name,
                "display_name": e.display_name,
                "category": e.category,
                "description": e.description,
                "duration_ms": e.total_duration_ms(),
                "cells": e.cells(),
                "steps": e.steps,
            })
        })
        .collect();
    let categories: Vec<&str> = EffectCategory::ALL.iter().map(|c| c.as_str()).collect();
    Response::ok("list_effects")
        .with("effects", effects)
        .with("categories", categories)
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::sync::Mutex as StdMutex;

    use serde_json::Value;

    use super::*;
    use crate::domain::parse_request;
    use crate::infrastructure::device::mock::MockBackend;

    // ── Test doubles ──────────────────────────────────────────────────────────

    #[derive(Default)]
    struct RecordingSink {
        events: StdMutex<Vec<Value>>,
    }

    impl RecordingSink {
        fn names(&self) -> Vec<String> {
            self.events
                .lock()
                .unwrap()
                .iter()
                .map(|e| e["event"].as_str().unwrap_or_default().to_owned())
                .collect()
        }

        fn last(&self) -> Value {
            self.events.lock().unwrap().last().cloned().unwrap_or(Value::Null)
        }

        fn clear(&self) {
            self.events.lock().unwrap().clear();
        }
    }

    impl EventSink for RecordingSink {
        fn publish(&self, event: Event) {
            let value = serde_json::to_value(&event).unwrap();
            self.events.lock().unwrap().push(value);
        }

        fn session_count(&self) -> usize {
            3
        }
    }

    fn vest(bus: u8, address: u8) -> DeviceDescriptor {
        DeviceDescriptor {
            bus: Some(bus),
            address: Some(address),
            serial_number: Some(format!("SN-{bus}-{address}")),
            vendor_id: 0x1BD7,
            product_id: 0x5000,
        }
    }

    fn router() -> (Arc<CommandRouter>, Arc<MockBackend>, Arc<RecordingSink>) {
        let backend = Arc::new(MockBackend::new());
        let sink = Arc::new(RecordingSink::default());
        let (router, lost_rx) =
            CommandRouter::new(backend.clone(), sink.clone(), RouterSettings::default());
        tokio::spawn(Arc::clone(&router).run_loss_monitor(lost_rx));
        (router, backend, sink)
    }

    async fn send(router: &Arc<CommandRouter>, line: &str) -> Value {
        let request = parse_request(line).expect("test request is valid JSON");
        let response = router.handle(request).await;
        serde_json::from_str(&response.to_line()).unwrap()
    }

    /// A bus whose opens take a while, so requests can overlap them.
    struct SlowBackend {
        inner: MockBackend,
        delay: Duration,
    }

    #[async_trait::async_trait]
    impl VestBackend for SlowBackend {
        fn enumerate(&self) -> Result<Vec<DeviceDescriptor>, TransportError> {
            self.inner.enumerate()
        }

        async fn open(
            &self,
            descriptor: &DeviceDescriptor,
        ) -> Result<Box<dyn VestTransport>, TransportError> {
            tokio::time::sleep(self.delay).await;
            self.inner.open(descriptor).await
        }
    }

    async fn mock_id(router: &Arc<CommandRouter>) -> String {
        let resp = send(router, r#"{"cmd":"create_mock_device"}"#).await;
        resp["device_id"].as_str().unwrap().to_owned()
    }

    // ── Tests ─────────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn test_ping_reports_daemon_summary() {
        // Arrange
        let (router, _backend, _sink) = router();

        // Act
        let resp = send(&router, r#"{"cmd":"ping","req_id":7}"#).await;

        // Assert
        assert_eq!(resp["response"], "ping");
        assert_eq!(resp["req_id"], 7);
        assert_eq!(resp["alive"], true);
        assert_eq!(resp["connected"], false);
        assert_eq!(resp["has_device_selected"], false);
        assert_eq!(resp["client_count"], 3);
    }

    #[tokio::test]
    async fn test_unknown_command_echoes_req_id() {
        let (router, _backend, sink) = router();

        let resp = send(&router, r#"{"cmd":"fly","req_id":"x"}"#).await;

        assert_eq!(resp["response"], "error");
        assert_eq!(resp["req_id"], "x");
        assert_eq!(resp["message"], "unknown command: fly");
        assert!(sink.names().is_empty());
    }

    #[tokio::test]
    async fn test_select_device_registers_and_broadcasts() {
        // Arrange
        let (router, backend, sink) = router();
        backend.plug(vest(1, 5));

        // Act
        let resp = send(&router, r#"{"cmd":"select_device","bus":1,"address":5,"req_id":"r1"}"#).await;

        // Assert
        assert_eq!(resp["response"], "select_device");
        assert_eq!(resp["req_id"], "r1");
        assert_eq!(sink.names(), vec!["device_selected"]);
        let event = sink.last();
        assert_eq!(event["device"]["bus"], 1);
        assert_eq!(event["device"]["address"], 5);
        assert_eq!(event["device_id"], resp["device_id"]);
        assert!(event["ts"].as_f64().is_some());
    }

    #[tokio::test]
    async fn test_select_missing_device_is_not_found() {
        let (router, _backend, sink) = router();

        let resp = send(&router, r#"{"cmd":"select_device","serial":"NOPE"}"#).await;

        assert_eq!(resp["message"], "device not found");
        assert!(sink.names().is_empty());
    }

    #[tokio::test]
    async fn test_trigger_without_any_device_is_not_resolved() {
        let (router, _backend, sink) = router();

        let resp = send(&router, r#"{"cmd":"trigger","cell":1,"speed":5}"#).await;

        assert_eq!(resp["response"], "error");
        assert_eq!(resp["message"], "no device resolved");
        assert!(sink.names().is_empty());
    }

    #[tokio::test]
    async fn test_trigger_auto_connects_selected_hardware() {
        // Arrange
        let (router, backend, sink) = router();
        let probe = backend.plug(vest(1, 5));
        send(&router, r#"{"cmd":"select_device","bus":1,"address":5}"#).await;
        sink.clear();

        // Act
        let resp = send(&router, r#"{"cmd":"trigger","cell":2,"speed":7}"#).await;

        // Assert
        assert_eq!(resp["response"], "trigger");
        assert_eq!(sink.names(), vec!["connected", "effect_triggered"]);
        assert_eq!(probe.cells_written(), vec![(2, 7)]);
    }

    #[tokio::test]
    async fn test_invalid_cell_causes_no_io_and_no_event() {
        let (router, _backend, sink) = router();
        let id = mock_id(&router).await;
        sink.clear();

        let line = format!(r#"{{"cmd":"trigger","cell":9,"speed":5,"device_id":"{id}","req_id":"r2"}}"#);
        let resp = send(&router, &line).await;

        assert_eq!(resp["message"], "invalid cell");
        assert_eq!(resp["req_id"], "r2");
        assert!(sink.names().is_empty());
    }

    #[tokio::test]
    async fn test_device_id_outranks_main() {
        // Arrange
        let (router, _backend, sink) = router();
        let main = mock_id(&router).await;
        let other = mock_id(&router).await;
        sink.clear();

        // Act
        let line = format!(r#"{{"cmd":"trigger","cell":0,"speed":3,"device_id":"{other}"}}"#);
        let resp = send(&router, &line).await;

        // Assert
        assert_eq!(resp["device_id"], other.as_str());
        assert_ne!(resp["device_id"], main.as_str());
        assert_eq!(sink.last()["device_id"], other.as_str());
    }

    #[tokio::test]
    async fn test_player_and_game_slot_resolution() {
        // Arrange
        let (router, _backend, _sink) = router();
        let _main = mock_id(&router).await;
        let p1 = mock_id(&router).await;
        let slot = mock_id(&router).await;
        send(&router, &format!(r#"{{"cmd":"assign_player","player_id":"p1","device_id":"{p1}"}}"#)).await;
        send(
            &router,
            &format!(r#"{{"cmd":"set_game_player_mapping","game_id":"cs2","player_num":2,"device_id":"{slot}"}}"#),
        )
        .await;

        // Act
        let by_player = send(
            &router,
            r#"{"cmd":"trigger","cell":1,"speed":1,"player_id":"p1","game_id":"cs2","player_num":2}"#,
        )
        .await;
        let by_slot = send(&router, r#"{"cmd":"trigger","cell":1,"speed":1,"game_id":"cs2","player_num":2}"#).await;

        // Assert
        assert_eq!(by_player["device_id"], p1.as_str());
        assert_eq!(by_slot["device_id"], slot.as_str());
    }

    #[tokio::test]
    async fn test_assign_player_to_unknown_device_is_rejected() {
        let (router, _backend, sink) = router();

        let resp = send(&router, r#"{"cmd":"assign_player","player_id":"p1","device_id":"mock_x"}"#).await;

        assert_eq!(resp["response"], "error");
        assert_eq!(resp["message"], "unknown device_id: mock_x");
        assert!(sink.names().is_empty());
    }

    #[tokio::test]
    async fn test_write_failure_disconnects_and_broadcasts() {
        // Arrange
        let (router, backend, sink) = router();
        let probe = backend.plug(vest(1, 5));
        send(&router, r#"{"cmd":"select_device","bus":1,"address":5}"#).await;
        send(&router, r#"{"cmd":"connect"}"#).await;
        sink.clear();

        // Act
        probe.unplug();
        let resp = send(&router, r#"{"cmd":"trigger","cell":1,"speed":5}"#).await;
        for _ in 0..50 {
            if sink.names().contains(&"disconnected".to_owned()) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        // Assert
        assert_eq!(resp["response"], "error");
        assert_eq!(sink.names(), vec!["disconnected"]);
        assert_eq!(sink.last()["reason"], "write_failed");
        let status = send(&router, r#"{"cmd":"status"}"#).await;
        assert_eq!(status["connected"], false);
    }

    #[tokio::test]
    async fn test_open_failure_returns_error_without_event() {
        // Arrange
        let (router, backend, sink) = router();
        backend.plug(vest(1, 5));
        send(&router, r#"{"cmd":"select_device","bus":1,"address":5}"#).await;
        backend.unplug(&vest(1, 5));
        sink.clear();

        // Act
        let resp = send(&router, r#"{"cmd":"connect"}"#).await;

        // Assert
        assert_eq!(resp["response"], "error");
        assert!(resp["message"].as_str().unwrap().starts_with("failed to open device"));
        assert!(sink.names().is_empty());
        let status = send(&router, r#"{"cmd":"status"}"#).await;
        assert_eq!(status["state"], "disconnected");
    }

    #[tokio::test]
    async fn test_hotplug_unplug_of_connected_device_broadcasts_disconnected() {
        let (router, backend, sink) = router();
        backend.plug(vest(1, 5));
        send(&router, r#"{"cmd":"select_device","bus":1,"address":5}"#).await;
        send(&router, r#"{"cmd":"connect"}"#).await;
        router.reconcile_hardware(vec![vest(1, 5)]).await;
        sink.clear();

        router.reconcile_hardware(Vec::new()).await;

        assert_eq!(sink.names(), vec!["devices_changed", "disconnected"]);
        assert_eq!(sink.last()["reason"], "unplugged");
    }

    #[tokio::test]
    async fn test_removing_main_mock_promotes_next() {
        let (router, _backend, sink) = router();
        let first = mock_id(&router).await;
        let second = mock_id(&router).await;
        sink.clear();

        let resp = send(&router, &format!(r#"{{"cmd":"remove_mock_device","device_id":"{first}"}}"#)).await;

        assert_eq!(resp["main_device_id"], second.as_str());
        assert_eq!(sink.names(), vec!["mock_device_removed"]);
    }

    #[tokio::test]
    async fn test_clear_missing_game_mapping_is_not_found() {
        let (router, _backend, _sink) = router();

        let resp = send(&router, r#"{"cmd":"clear_game_player_mapping","game_id":"cs2"}"#).await;

        assert_eq!(resp["message"], "no mappings for game cs2");
    }

    #[tokio::test(start_paused = true)]
    async fn test_play_effect_runs_to_completion() {
        // Arrange
        let (router, _backend, sink) = router();
        let id = mock_id(&router).await;
        sink.clear();

        // Act
        let resp = send(&router, r#"{"cmd":"play_effect","effect_name":"pistol_front"}"#).await;
        tokio::time::sleep(Duration::from_secs(1)).await;

        // Assert
        assert_eq!(resp["device_id"], id.as_str());
        assert_eq!(resp["duration_ms"], 80);
        assert_eq!(sink.names(), vec!["effect_started", "effect_completed"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_effect_cancels_playback() {
        let (router, _backend, sink) = router();
        mock_id(&router).await;
        send(&router, r#"{"cmd":"play_effect","effect_name":"machinegun_front"}"#).await;
        sink.clear();

        let resp = send(&router, r#"{"cmd":"stop_effect"}"#).await;
        tokio::time::sleep(Duration::from_secs(2)).await;

        assert_eq!(resp["was_playing"], true);
        assert_eq!(sink.names(), vec!["effect_stopped"]);
    }

    #[tokio::test]
    async fn test_list_effects_includes_categories() {
        let (router, _backend, _sink) = router();

        let resp = send(&router, r#"{"cmd":"list_effects"}"#).await;

        assert!(resp["effects"].as_array().unwrap().len() >= 26);
        assert_eq!(resp["categories"].as_array().unwrap().len(), 5);
        let machinegun = resp["effects"]
            .as_array()
            .unwrap()
            .iter()
            .find(|e| e["name"] == "machinegun_front")
            .unwrap();
        assert_eq!(machinegun["duration_ms"], 450);
    }

    #[tokio::test]
    async fn test_stop_queues_all_off_behind_pending_writes() {
        // Arrange
        let (router, backend, sink) = router();
        let probe = backend.plug(vest(1, 5));
        send(&router, r#"{"cmd":"select_device","bus":1,"address":5}"#).await;
        send(&router, r#"{"cmd":"trigger","cell":3,"speed":9}"#).await;
        sink.clear();

        // Act
        let resp = send(&router, r#"{"cmd":"stop"}"#).await;
        tokio::time::sleep(Duration::from_millis(100)).await;

        // Assert
        assert_eq!(resp["response"], "stop");
        assert_eq!(sink.names(), vec!["all_stopped"]);
        let written = probe.cells_written();
        assert_eq!(written[0], (3, 9));
        assert_eq!(written.len(), 1 + usize::from(vest_core::CELL_COUNT));
        assert!(written[1..].iter().all(|&(_, speed)| speed == 0));
    }

    #[tokio::test]
    async fn test_disconnect_reports_previous_state() {
        // Arrange
        let (router, _backend, sink) = router();
        let id = mock_id(&router).await;
        sink.clear();

        // Act
        let first = send(&router, r#"{"cmd":"disconnect"}"#).await;
        let second = send(&router, r#"{"cmd":"disconnect"}"#).await;

        // Assert
        assert_eq!(first["device_id"], id.as_str());
        assert_eq!(first["was_connected"], true);
        assert_eq!(second["was_connected"], false);
        assert_eq!(sink.names(), vec!["disconnected"]);
        assert_eq!(sink.last()["reason"], "requested");
        let status = send(&router, r#"{"cmd":"status"}"#).await;
        assert_eq!(status["connected"], false);
    }

    #[tokio::test]
    async fn test_clear_device_forgets_main_selection() {
        // Arrange
        let (router, _backend, sink) = router();
        let id = mock_id(&router).await;
        sink.clear();

        // Act
        let cleared = send(&router, r#"{"cmd":"clear_device"}"#).await;
        let again = send(&router, r#"{"cmd":"clear_device"}"#).await;
        let selected = send(&router, r#"{"cmd":"get_selected_device"}"#).await;
        let trigger = send(&router, r#"{"cmd":"trigger","cell":1,"speed":1}"#).await;

        // Assert
        assert_eq!(cleared["previous"], id.as_str());
        assert_eq!(again["previous"], Value::Null);
        assert_eq!(sink.names(), vec!["device_cleared"]);
        assert_eq!(selected["device_id"], Value::Null);
        assert_eq!(trigger["message"], "no device resolved");
    }

    #[tokio::test]
    async fn test_triggers_during_open_wait_and_keep_dispatch_order() {
        // Arrange
        let inner = MockBackend::new();
        let probe = inner.plug(vest(1, 5));
        let backend = Arc::new(SlowBackend {
            inner,
            delay: Duration::from_millis(50),
        });
        let sink = Arc::new(RecordingSink::default());
        let (router, lost_rx) = CommandRouter::new(backend, sink.clone(), RouterSettings::default());
        tokio::spawn(Arc::clone(&router).run_loss_monitor(lost_rx));
        send(&router, r#"{"cmd":"select_device","bus":1,"address":5}"#).await;
        sink.clear();

        // Act: the second trigger arrives while the first is still opening.
        let first = tokio::spawn({
            let router = Arc::clone(&router);
            async move { send(&router, r#"{"cmd":"trigger","cell":1,"speed":5}"#).await }
        });
        tokio::time::sleep(Duration::from_millis(5)).await;
        let second = send(&router, r#"{"cmd":"trigger","cell":2,"speed":5}"#).await;
        let first = first.await.unwrap();

        // Assert
        assert_eq!(first["response"], "trigger");
        assert_eq!(second["response"], "trigger");
        assert_eq!(probe.cells_written(), vec![(1, 5), (2, 5)]);
        assert_eq!(
            sink.names(),
            vec!["connected", "effect_triggered", "effect_triggered"]
        );
    }

    #[tokio::test]
    async fn test_waiting_connect_reports_already_connected() {
        let inner = MockBackend::new();
        inner.plug(vest(1, 5));
        let backend = Arc::new(SlowBackend {
            inner,
            delay: Duration::from_millis(50),
        });
        let sink = Arc::new(RecordingSink::default());
        let (router, _lost_rx) = CommandRouter::new(backend, sink.clone(), RouterSettings::default());
        send(&router, r#"{"cmd":"select_device","bus":1,"address":5}"#).await;

        let first = tokio::spawn({
            let router = Arc::clone(&router);
            async move { send(&router, r#"{"cmd":"connect"}"#).await }
        });
        tokio::time::sleep(Duration::from_millis(5)).await;
        let second = send(&router, r#"{"cmd":"connect"}"#).await;
        let first = first.await.unwrap();

        assert_eq!(first["already_connected"], false);
        assert_eq!(second["already_connected"], true);
        let connected = sink.names().iter().filter(|n| n.as_str() == "connected").count();
        assert_eq!(connected, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_replacing_an_effect_switches_its_cells_off() {
        // Arrange
        let (router, backend, sink) = router();
        let probe = backend.plug(vest(1, 5));
        send(&router, r#"{"cmd":"select_device","bus":1,"address":5}"#).await;
        send(&router, r#"{"cmd":"play_effect","effect_name":"machinegun_front"}"#).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        sink.clear();

        // Act
        let resp = send(&router, r#"{"cmd":"play_effect","effect_name":"pistol_back"}"#).await;
        tokio::time::sleep(Duration::from_secs(3)).await;

        // Assert
        assert_eq!(resp["response"], "play_effect");
        let written = probe.cells_written();
        assert!(written.iter().any(|&(_, speed)| speed == 6));
        let mut speeds = vec![0u8; usize::from(vest_core::CELL_COUNT)];
        for (cell, speed) in written {
            speeds[usize::from(cell)] = speed;
        }
        assert!(speeds.iter().all(|&s| s == 0), "cells left running: {speeds:?}");
        assert_eq!(sink.names(), vec!["effect_started", "effect_completed"]);
    }
}
