//! JSON message types for the client-facing line protocol.
//!
//! Every message is one JSON object on one line, in both directions.
//!
//! # Message flow
//!
//! ```text
//! Client → Daemon:  {"cmd":"trigger","cell":2,"speed":5,"req_id":"r7"}
//! Daemon → Client:  {"response":"trigger","req_id":"r7","device_id":"mock_1a2b3c4d"}
//! Daemon → All:     {"event":"effect_triggered","device_id":"mock_1a2b3c4d","cell":2,"speed":5,"ts":1712.5}
//! ```
//!
//! Requests are parsed in two stages.  [`parse_request`] only checks that the
//! line is a JSON object; a failure there is a framing error and the line is
//! dropped.  [`Request::command`] then validates the command name and every
//! parameter; a failure there becomes an `error` response carrying the
//! original `req_id`.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::Serialize;
use serde_json::{Map, Value};
use thiserror::Error;
use vest_core::{find_effect, CellCommand, Effect, InvalidParameter, PacketError};

use crate::domain::device::{DeviceDescriptor, DeviceId, DeviceSelector};
use crate::domain::player::{GamePlayerMapping, Player};

// ── Inbound requests ──────────────────────────────────────────────────────────

/// A line that was not a JSON object.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FramingError {
    #[error("invalid JSON: {0}")]
    InvalidJson(String),
    #[error("message is not a JSON object")]
    NotAnObject,
}

/// A JSON object received from a client, before command validation.
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    pub cmd: Option<String>,
    /// Echoed verbatim in the response; may be a string or a number.
    pub req_id: Option<Value>,
    params: Map<String, Value>,
}

/// Parses one framed line into a [`Request`].
///
/// # Errors
///
/// Returns [`FramingError`] if the line is not a JSON object.
pub fn parse_request(line: &str) -> Result<Request, FramingError> {
    let value: Value =
        serde_json::from_str(line).map_err(|e| FramingError::InvalidJson(e.to_string()))?;
    let Value::Object(mut params) = value else {
        return Err(FramingError::NotAnObject);
    };

    let req_id = params.remove("req_id").filter(|v| !v.is_null());
    let cmd = params
        .remove("cmd")
        .and_then(|v| v.as_str().map(str::to_owned));

    Ok(Request {
        cmd,
        req_id,
        params,
    })
}

impl Request {
    /// Validates the command name and its parameters.
    ///
    /// # Errors
    ///
    /// Returns [`CommandError`] for an unknown command or any invalid or
    /// missing parameter.  No device is touched during validation.
    pub fn command(&self) -> Result<Command, CommandError> {
        let name = self.cmd.as_deref().ok_or(CommandError::MissingCommand)?;
        Command::parse(name, &Params(&self.params))
    }
}

/// Which device an effect-style command should land on.
///
/// Resolution order: `device_id`, then `player_id`, then
/// `(game_id, player_num)`, then the main device.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TargetSelector {
    pub device_id: Option<DeviceId>,
    pub player_id: Option<String>,
    pub game_id: Option<String>,
    pub player_num: Option<u32>,
}

/// A fully validated client command.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Ping,
    Status { device_id: Option<DeviceId> },
    List,
    SelectDevice(DeviceSelector),
    GetSelectedDevice,
    ClearDevice,
    Connect { device_id: Option<DeviceId> },
    Disconnect { device_id: Option<DeviceId> },
    Trigger { target: TargetSelector, command: CellCommand },
    Stop { target: TargetSelector },
    ListConnectedDevices,
    SetMainDevice { device_id: DeviceId },
    DisconnectDevice { device_id: DeviceId },
    CreateMockDevice,
    RemoveMockDevice { device_id: DeviceId },
    CreatePlayer { player_id: String, name: Option<String> },
    RemovePlayer { player_id: String },
    AssignPlayer { player_id: String, device_id: DeviceId },
    UnassignPlayer { player_id: String },
    ListPlayers,
    GetPlayerDevice { player_id: String },
    SetGamePlayerMapping { game_id: String, player_num: u32, device_id: DeviceId },
    ClearGamePlayerMapping { game_id: String, player_num: Option<u32> },
    ListGamePlayerMappings { game_id: Option<String> },
    PlayEffect { target: TargetSelector, effect: &'static Effect },
    ListEffects,
    StopEffect { target: TargetSelector },
}

impl Command {
    fn parse(name: &str, p: &Params<'_>) -> Result<Self, CommandError> {
        let command = match name {
            "ping" => Command::Ping,
            "status" => Command::Status {
                device_id: p.opt_device_id()?,
            },
            "list" => Command::List,
            "select_device" => Command::SelectDevice(p.selector()?),
            "get_selected_device" => Command::GetSelectedDevice,
            "clear_device" => Command::ClearDevice,
            "connect" => Command::Connect {
                device_id: p.opt_device_id()?,
            },
            "disconnect" => Command::Disconnect {
                device_id: p.opt_device_id()?,
            },
            "trigger" => {
                // Effect parameters first so a bad cell is reported even when
                // the target is also wrong.
                let command = p.effect()?;
                Command::Trigger {
                    target: p.target()?,
                    command,
                }
            }
            "stop" => Command::Stop {
                target: p.target()?,
            },
            "list_connected_devices" => Command::ListConnectedDevices,
            "set_main_device" => Command::SetMainDevice {
                device_id: p.device_id()?,
            },
            "disconnect_device" => Command::DisconnectDevice {
                device_id: p.device_id()?,
            },
            "create_mock_device" => Command::CreateMockDevice,
            "remove_mock_device" => Command::RemoveMockDevice {
                device_id: p.device_id()?,
            },
            "create_player" => Command::CreatePlayer {
                player_id: p.string("player_id")?,
                name: p.opt_string("name")?,
            },
            "remove_player" => Command::RemovePlayer {
                player_id: p.string("player_id")?,
            },
            "assign_player" => Command::AssignPlayer {
                player_id: p.string("player_id")?,
                device_id: p.device_id()?,
            },
            "unassign_player" => Command::UnassignPlayer {
                player_id: p.string("player_id")?,
            },
            "list_players" => Command::ListPlayers,
            "get_player_device" => Command::GetPlayerDevice {
                player_id: p.string("player_id")?,
            },
            "set_game_player_mapping" => Command::SetGamePlayerMapping {
                game_id: p.string("game_id")?,
                player_num: p.player_num()?.ok_or_else(|| CommandError::missing("player_num"))?,
                device_id: p.device_id()?,
            },
            "clear_game_player_mapping" => Command::ClearGamePlayerMapping {
                game_id: p.string("game_id")?,
                player_num: p.player_num()?,
            },
            "list_game_player_mappings" => Command::ListGamePlayerMappings {
                game_id: p.opt_string("game_id")?,
            },
            "play_effect" => {
                let effect_name = p.string("effect_name")?;
                let effect = find_effect(&effect_name).ok_or_else(|| {
                    CommandError::Parameter(format!("unknown effect: {effect_name}"))
                })?;
                Command::PlayEffect {
                    target: p.target()?,
                    effect,
                }
            }
            "list_effects" => Command::ListEffects,
            "stop_effect" => Command::StopEffect {
                target: p.target()?,
            },
            other => return Err(CommandError::UnknownCommand(other.to_owned())),
        };
        Ok(command)
    }
}

/// Typed accessors over the parameter object.
///
/// JSON `null` is treated the same as an absent key.
struct Params<'a>(&'a Map<String, Value>);

impl<'a> Params<'a> {
    fn get(&self, key: &str) -> Option<&'a Value> {
        self.0.get(key).filter(|v| !v.is_null())
    }

    fn opt_string(&self, key: &str) -> Result<Option<String>, CommandError> {
        match self.get(key) {
            None => Ok(None),
            Some(Value::String(s)) if !s.is_empty() => Ok(Some(s.clone())),
            Some(_) => Err(CommandError::invalid(key)),
        }
    }

    fn string(&self, key: &str) -> Result<String, CommandError> {
        self.opt_string(key)?
            .ok_or_else(|| CommandError::missing(key))
    }

    fn opt_u8(&self, key: &str) -> Result<Option<u8>, CommandError> {
        match self.get(key) {
            None => Ok(None),
            Some(v) => small_int(v).map(Some).ok_or_else(|| CommandError::invalid(key)),
        }
    }

    fn opt_device_id(&self) -> Result<Option<DeviceId>, CommandError> {
        Ok(self.opt_string("device_id")?.map(DeviceId::new))
    }

    fn device_id(&self) -> Result<DeviceId, CommandError> {
        self.opt_device_id()?
            .ok_or_else(|| CommandError::missing("device_id"))
    }

    fn player_num(&self) -> Result<Option<u32>, CommandError> {
        match self.get("player_num") {
            None => Ok(None),
            Some(v) => v
                .as_u64()
                .and_then(|n| u32::try_from(n).ok())
                .filter(|n| *n >= 1)
                .map(Some)
                .ok_or_else(|| CommandError::invalid("player_num")),
        }
    }

    fn target(&self) -> Result<TargetSelector, CommandError> {
        Ok(TargetSelector {
            device_id: self.opt_device_id()?,
            player_id: self.opt_string("player_id")?,
            game_id: self.opt_string("game_id")?,
            player_num: self.player_num()?,
        })
    }

    fn selector(&self) -> Result<DeviceSelector, CommandError> {
        if let Some(serial) = self.opt_string("serial")? {
            return Ok(DeviceSelector::Serial(serial));
        }
        match (self.opt_u8("bus")?, self.opt_u8("address")?) {
            (Some(bus), Some(address)) => Ok(DeviceSelector::BusAddress { bus, address }),
            _ => Err(CommandError::Parameter(
                "must specify bus and address, or serial".to_owned(),
            )),
        }
    }

    /// `cell` in 0..=7 and `speed` in 1..=10.
    fn effect(&self) -> Result<CellCommand, CommandError> {
        let cell = self.get("cell").ok_or_else(|| CommandError::missing("cell"))?;
        let cell = small_int(cell).ok_or(InvalidParameter::Cell(u8::MAX))?;

        let speed = self.get("speed").ok_or_else(|| CommandError::missing("speed"))?;
        let speed = small_int(speed)
            .filter(|s| *s >= 1)
            .ok_or(InvalidParameter::Speed(0))?;

        Ok(CellCommand::new(cell, speed)?)
    }
}

fn small_int(value: &Value) -> Option<u8> {
    value.as_u64().and_then(|n| u8::try_from(n).ok())
}

// ── Errors ────────────────────────────────────────────────────────────────────

/// Why a command failed.  The `Display` text is sent as the error `message`.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CommandError {
    #[error("missing cmd")]
    MissingCommand,

    #[error("unknown command: {0}")]
    UnknownCommand(String),

    /// A parameter is missing, malformed, or out of range.
    #[error("{0}")]
    Parameter(String),

    /// A referenced device, player, or mapping does not exist.
    #[error("{0}")]
    NotFound(String),

    /// No rule of the resolution order produced a device.
    #[error("{0}")]
    DeviceNotResolved(String),

    #[error("failed to open device {device_id}: {reason}")]
    DeviceOpen { device_id: DeviceId, reason: String },

    #[error("write to device {device_id} failed: {reason}")]
    DeviceWrite { device_id: DeviceId, reason: String },

    /// The request conflicts with the current state (limits, busy devices).
    #[error("{0}")]
    Conflict(String),

    #[error("device discovery failed: {0}")]
    Discovery(String),
}

impl CommandError {
    pub fn missing(key: &str) -> Self {
        CommandError::Parameter(format!("missing {key}"))
    }

    pub fn invalid(key: &str) -> Self {
        CommandError::Parameter(format!("invalid {key}"))
    }
}

impl From<InvalidParameter> for CommandError {
    fn from(p: InvalidParameter) -> Self {
        CommandError::Parameter(p.to_string())
    }
}

impl From<PacketError> for CommandError {
    fn from(e: PacketError) -> Self {
        CommandError::Parameter(e.to_string())
    }
}

// ── Outbound responses ────────────────────────────────────────────────────────

/// A reply to exactly one request, sent only to the requesting session.
///
/// ```json
/// {"response":"select_device","req_id":"r1","device_id":"device_0a1b2c3d"}
/// {"response":"error","req_id":"r2","message":"invalid cell"}
/// ```
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Response {
    pub response: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub req_id: Option<Value>,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl Response {
    /// A success response named after the command.
    pub fn ok(cmd: impl Into<String>) -> Self {
        Self {
            response: cmd.into(),
            req_id: None,
            fields: Map::new(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        let mut fields = Map::new();
        fields.insert("message".to_owned(), Value::String(message.into()));
        Self {
            response: "error".to_owned(),
            req_id: None,
            fields,
        }
    }

    /// Adds one payload field.
    pub fn with(mut self, key: &str, value: impl Serialize) -> Self {
        let value = serde_json::to_value(value).unwrap_or(Value::Null);
        self.fields.insert(key.to_owned(), value);
        self
    }

    pub fn with_req_id(mut self, req_id: Option<Value>) -> Self {
        self.req_id = req_id;
        self
    }

    /// Serializes to a single line (no trailing newline).
    pub fn to_line(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|e| {
            serde_json::json!({"response": "error", "message": e.to_string()}).to_string()
        })
    }
}

// ── Outbound events ───────────────────────────────────────────────────────────

/// Why a device left the `Connected` state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DisconnectReason {
    /// A client sent `disconnect`.
    Requested,
    /// A queued write failed definitively.
    WriteFailed,
    /// The device disappeared from a bus rescan.
    Unplugged,
}

/// Every state change observers can see, tagged by `"event"`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum EventPayload {
    Connected {
        device_id: DeviceId,
        device: DeviceDescriptor,
    },
    Disconnected {
        device_id: DeviceId,
        reason: DisconnectReason,
        #[serde(skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    EffectTriggered {
        device_id: DeviceId,
        cell: u8,
        speed: u8,
    },
    AllStopped {
        device_id: DeviceId,
    },
    DeviceSelected {
        device_id: DeviceId,
        device: DeviceDescriptor,
    },
    DeviceCleared {
        previous: Option<DeviceId>,
    },
    DevicesChanged {
        devices: Vec<DeviceDescriptor>,
    },
    MainDeviceChanged {
        device_id: Option<DeviceId>,
    },
    DeviceRemoved {
        device_id: DeviceId,
        main_device_id: Option<DeviceId>,
    },
    MockDeviceCreated {
        device_id: DeviceId,
        device: DeviceDescriptor,
        is_main: bool,
    },
    MockDeviceRemoved {
        device_id: DeviceId,
        main_device_id: Option<DeviceId>,
    },
    PlayerCreated {
        player: Player,
    },
    PlayerRemoved {
        player_id: String,
    },
    PlayerAssigned {
        player_id: String,
        device_id: DeviceId,
    },
    PlayerUnassigned {
        player_id: String,
    },
    GamePlayerMappingChanged {
        game_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        player_num: Option<u32>,
        device_id: Option<DeviceId>,
    },
    EffectStarted {
        device_id: DeviceId,
        effect_name: String,
        duration_ms: u32,
    },
    EffectCompleted {
        device_id: DeviceId,
        effect_name: String,
    },
    EffectStopped {
        device_id: DeviceId,
        effect_name: String,
    },
    ClientConnected {
        client_id: String,
    },
    ClientDisconnected {
        client_id: String,
    },
}

impl From<GamePlayerMapping> for EventPayload {
    fn from(m: GamePlayerMapping) -> Self {
        EventPayload::GamePlayerMappingChanged {
            game_id: m.game_id,
            player_num: Some(m.player_num),
            device_id: Some(m.device_id),
        }
    }
}

/// An event stamped with the wall-clock time it was produced.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Event {
    #[serde(flatten)]
    pub payload: EventPayload,
    /// Seconds since the Unix epoch.
    pub ts: f64,
}

impl Event {
    pub fn new(payload: EventPayload) -> Self {
        let ts = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs_f64();
        Self { payload, ts }
    }

    /// Serializes to a single line (no trailing newline).
    pub fn to_line(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|e| {
            serde_json::json!({"event": "error", "message": e.to_string(), "ts": self.ts})
                .to_string()
        })
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
