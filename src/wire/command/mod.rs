//! Polymorphic wire items: the commands an agent can be asked to run and the
//! answers it sends back.
//!
//! Every item travels as `(tag, payload)` where the tag is the discriminator
//! below and the payload is a MessagePack map with string keys. Unknown tags
//! are preserved verbatim so a peer on a newer minor version can still talk
//! to us.

pub mod payload;

use rmpv::Value;

use payload::{
    decode_payload, encode_payload, get_bool, get_i64, get_string, get_u16, get_u32, get_u64,
    PayloadError, PayloadMap,
};

const PING_TAG: u16 = 0x0001;
const STARTUP_TAG: u16 = 0x0002;
const READY_CHECK_TAG: u16 = 0x0003;
const START_VM_TAG: u16 = 0x0010;
const STOP_VM_TAG: u16 = 0x0011;
const CREATE_VOLUME_TAG: u16 = 0x0020;
const DESTROY_VOLUME_TAG: u16 = 0x0021;
const MAINTENANCE_TAG: u16 = 0x0030;

const PLAIN_ANSWER_TAG: u16 = 0x8001;
const PONG_ANSWER_TAG: u16 = 0x8002;
const STARTUP_ACCEPTED_ANSWER_TAG: u16 = 0x8003;
const VM_STARTED_ANSWER_TAG: u16 = 0x8004;
const VOLUME_CREATED_ANSWER_TAG: u16 = 0x8005;
const UNSUPPORTED_ANSWER_TAG: u16 = 0x80FE;
const SKIPPED_ANSWER_TAG: u16 = 0x80FF;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CommandKind {
    Ping,
    Startup,
    ReadyCheck,
    StartVm,
    StopVm,
    CreateVolume,
    DestroyVolume,
    Maintenance,
}

impl CommandKind {
    pub fn tag(self) -> u16 {
        match self {
            Self::Ping => PING_TAG,
            Self::Startup => STARTUP_TAG,
            Self::ReadyCheck => READY_CHECK_TAG,
            Self::StartVm => START_VM_TAG,
            Self::StopVm => STOP_VM_TAG,
            Self::CreateVolume => CREATE_VOLUME_TAG,
            Self::DestroyVolume => DESTROY_VOLUME_TAG,
            Self::Maintenance => MAINTENANCE_TAG,
        }
    }

    pub fn from_tag(tag: u16) -> Option<Self> {
        match tag {
            PING_TAG => Some(Self::Ping),
            STARTUP_TAG => Some(Self::Startup),
            READY_CHECK_TAG => Some(Self::ReadyCheck),
            START_VM_TAG => Some(Self::StartVm),
            STOP_VM_TAG => Some(Self::StopVm),
            CREATE_VOLUME_TAG => Some(Self::CreateVolume),
            DESTROY_VOLUME_TAG => Some(Self::DestroyVolume),
            MAINTENANCE_TAG => Some(Self::Maintenance),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ping => "ping",
            Self::Startup => "startup",
            Self::ReadyCheck => "ready_check",
            Self::StartVm => "start_vm",
            Self::StopVm => "stop_vm",
            Self::CreateVolume => "create_volume",
            Self::DestroyVolume => "destroy_volume",
            Self::Maintenance => "maintenance",
        }
    }
}

/// An item whose discriminator this build does not know. The raw payload is
/// kept so the item re-encodes byte for byte.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UnknownItem {
    pub tag: u16,
    pub raw: Vec<u8>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PingCommand {
    pub host_id: u64,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StartupCommand {
    pub agent_id: u64,
    pub host_name: String,
    pub agent_version: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReadyCheckCommand {
    pub host_id: u64,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StartVmCommand {
    pub vm_name: String,
    pub cpus: u32,
    pub memory_mb: u64,
    pub boot_volume: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StopVmCommand {
    pub vm_name: String,
    pub force: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CreateVolumeCommand {
    pub pool: String,
    pub name: String,
    pub size_bytes: u64,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DestroyVolumeCommand {
    pub pool: String,
    pub path: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MaintenanceCommand {
    pub host_id: u64,
    pub enable: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Command {
    Ping(PingCommand),
    Startup(StartupCommand),
    ReadyCheck(ReadyCheckCommand),
    StartVm(StartVmCommand),
    StopVm(StopVmCommand),
    CreateVolume(CreateVolumeCommand),
    DestroyVolume(DestroyVolumeCommand),
    Maintenance(MaintenanceCommand),
    Unknown(UnknownItem),
}

impl Command {
    pub fn kind(&self) -> Option<CommandKind> {
        match self {
            Self::Ping(_) => Some(CommandKind::Ping),
            Self::Startup(_) => Some(CommandKind::Startup),
            Self::ReadyCheck(_) => Some(CommandKind::ReadyCheck),
            Self::StartVm(_) => Some(CommandKind::StartVm),
            Self::StopVm(_) => Some(CommandKind::StopVm),
            Self::CreateVolume(_) => Some(CommandKind::CreateVolume),
            Self::DestroyVolume(_) => Some(CommandKind::DestroyVolume),
            Self::Maintenance(_) => Some(CommandKind::Maintenance),
            Self::Unknown(_) => None,
        }
    }

    pub fn tag(&self) -> u16 {
        match self {
            Self::Unknown(item) => item.tag,
            known => known.kind().map(CommandKind::tag).unwrap_or_default(),
        }
    }

    pub fn name(&self) -> &'static str {
        self.kind().map(CommandKind::as_str).unwrap_or("unknown")
    }

    /// Commands whose effects on a host must never be reordered.
    pub fn execute_in_sequence(&self) -> bool {
        matches!(self, Self::StartVm(_) | Self::StopVm(_) | Self::Maintenance(_))
    }

    pub fn is_query(&self) -> bool {
        matches!(self, Self::Ping(_) | Self::ReadyCheck(_))
    }

    pub(crate) fn encode(&self) -> Result<(u16, Vec<u8>), PayloadError> {
        let map = match self {
            Self::Unknown(item) => return Ok((item.tag, item.raw.clone())),
            Self::Ping(cmd) => payload::payload([("host_id", Value::from(cmd.host_id))]),
            Self::Startup(cmd) => payload::payload([
                ("agent_id", Value::from(cmd.agent_id)),
                ("host_name", Value::from(cmd.host_name.as_str())),
                ("agent_version", Value::from(cmd.agent_version.as_str())),
            ]),
            Self::ReadyCheck(cmd) => payload::payload([("host_id", Value::from(cmd.host_id))]),
            Self::StartVm(cmd) => payload::payload([
                ("vm_name", Value::from(cmd.vm_name.as_str())),
                ("cpus", Value::from(cmd.cpus)),
                ("memory_mb", Value::from(cmd.memory_mb)),
                ("boot_volume", Value::from(cmd.boot_volume.as_str())),
            ]),
            Self::StopVm(cmd) => payload::payload([
                ("vm_name", Value::from(cmd.vm_name.as_str())),
                ("force", Value::from(cmd.force)),
            ]),
            Self::CreateVolume(cmd) => payload::payload([
                ("pool", Value::from(cmd.pool.as_str())),
                ("name", Value::from(cmd.name.as_str())),
                ("size_bytes", Value::from(cmd.size_bytes)),
            ]),
            Self::DestroyVolume(cmd) => payload::payload([
                ("pool", Value::from(cmd.pool.as_str())),
                ("path", Value::from(cmd.path.as_str())),
            ]),
            Self::Maintenance(cmd) => payload::payload([
                ("host_id", Value::from(cmd.host_id)),
                ("enable", Value::from(cmd.enable)),
            ]),
        };

        Ok((self.tag(), encode_payload(map)?))
    }

    pub(crate) fn decode(tag: u16, raw: &[u8]) -> Result<Self, PayloadError> {
        let Some(kind) = CommandKind::from_tag(tag) else {
            return Ok(Self::Unknown(UnknownItem {
                tag,
                raw: raw.to_vec(),
            }));
        };

        let map = decode_payload(raw)?;
        let command = match kind {
            CommandKind::Ping => Self::Ping(PingCommand {
                host_id: get_u64(&map, "host_id")?,
            }),
            CommandKind::Startup => Self::Startup(StartupCommand {
                agent_id: get_u64(&map, "agent_id")?,
                host_name: get_string(&map, "host_name")?,
                agent_version: get_string(&map, "agent_version")?,
            }),
            CommandKind::ReadyCheck => Self::ReadyCheck(ReadyCheckCommand {
                host_id: get_u64(&map, "host_id")?,
            }),
            CommandKind::StartVm => Self::StartVm(StartVmCommand {
                vm_name: get_string(&map, "vm_name")?,
                cpus: get_u32(&map, "cpus")?,
                memory_mb: get_u64(&map, "memory_mb")?,
                boot_volume: get_string(&map, "boot_volume")?,
            }),
            CommandKind::StopVm => Self::StopVm(StopVmCommand {
                vm_name: get_string(&map, "vm_name")?,
                force: get_bool(&map, "force")?,
            }),
            CommandKind::CreateVolume => Self::CreateVolume(CreateVolumeCommand {
                pool: get_string(&map, "pool")?,
                name: get_string(&map, "name")?,
                size_bytes: get_u64(&map, "size_bytes")?,
            }),
            CommandKind::DestroyVolume => Self::DestroyVolume(DestroyVolumeCommand {
                pool: get_string(&map, "pool")?,
                path: get_string(&map, "path")?,
            }),
            CommandKind::Maintenance => Self::Maintenance(MaintenanceCommand {
                host_id: get_u64(&map, "host_id")?,
                enable: get_bool(&map, "enable")?,
            }),
        };

        Ok(command)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AnswerBody {
    Plain,
    Pong { server_time_ms: i64 },
    StartupAccepted {
        agent_id: u64,
        management_server_id: u64,
    },
    VmStarted { console_port: u16 },
    VolumeCreated { path: String, size_bytes: u64 },
    Unsupported,
    /// Never attempted because an earlier item in a stop-on-error batch failed.
    Skipped,
    Unrecognized(UnknownItem),
}

impl AnswerBody {
    fn tag(&self) -> u16 {
        match self {
            Self::Plain => PLAIN_ANSWER_TAG,
            Self::Pong { .. } => PONG_ANSWER_TAG,
            Self::StartupAccepted { .. } => STARTUP_ACCEPTED_ANSWER_TAG,
            Self::VmStarted { .. } => VM_STARTED_ANSWER_TAG,
            Self::VolumeCreated { .. } => VOLUME_CREATED_ANSWER_TAG,
            Self::Unsupported => UNSUPPORTED_ANSWER_TAG,
            Self::Skipped => SKIPPED_ANSWER_TAG,
            Self::Unrecognized(item) => item.tag,
        }
    }
}

/// Result of one command. `command_tag` pairs it with the command that
/// occupied the same position in the request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Answer {
    pub command_tag: u16,
    pub success: bool,
    pub details: String,
    pub body: AnswerBody,
}

impl Answer {
    pub fn success(command: &Command, details: impl Into<String>) -> Self {
        Self::with_body(command, true, details, AnswerBody::Plain)
    }

    pub fn failure(command: &Command, details: impl Into<String>) -> Self {
        Self::with_body(command, false, details, AnswerBody::Plain)
    }

    pub fn with_body(
        command: &Command,
        success: bool,
        details: impl Into<String>,
        body: AnswerBody,
    ) -> Self {
        Self {
            command_tag: command.tag(),
            success,
            details: details.into(),
            body,
        }
    }

    pub fn unsupported(command: &Command) -> Self {
        Self::with_body(
            command,
            false,
            format!("command '{}' (tag {:#06x}) is not supported", command.name(), command.tag()),
            AnswerBody::Unsupported,
        )
    }

    pub fn skipped(command: &Command) -> Self {
        Self::with_body(
            command,
            false,
            "skipped after an earlier command in the batch failed",
            AnswerBody::Skipped,
        )
    }

    pub fn command_kind(&self) -> Option<CommandKind> {
        CommandKind::from_tag(self.command_tag)
    }

    pub fn is_skipped(&self) -> bool {
        matches!(self.body, AnswerBody::Skipped)
    }

    pub(crate) fn encode(&self) -> Result<(u16, Vec<u8>), PayloadError> {
        if let AnswerBody::Unrecognized(item) = &self.body {
            return Ok((item.tag, item.raw.clone()));
        }

        let mut map = payload::payload([
            ("cmd", Value::from(self.command_tag)),
            ("ok", Value::from(self.success)),
            ("details", Value::from(self.details.as_str())),
        ]);
        match &self.body {
            AnswerBody::Pong { server_time_ms } => {
                map.insert("server_time_ms".to_owned(), Value::from(*server_time_ms));
            }
            AnswerBody::StartupAccepted {
                agent_id,
                management_server_id,
            } => {
                map.insert("agent_id".to_owned(), Value::from(*agent_id));
                map.insert("msid".to_owned(), Value::from(*management_server_id));
            }
            AnswerBody::VmStarted { console_port } => {
                map.insert("console_port".to_owned(), Value::from(*console_port));
            }
            AnswerBody::VolumeCreated { path, size_bytes } => {
                map.insert("path".to_owned(), Value::from(path.as_str()));
                map.insert("size_bytes".to_owned(), Value::from(*size_bytes));
            }
            AnswerBody::Plain
            | AnswerBody::Unsupported
            | AnswerBody::Skipped
            | AnswerBody::Unrecognized(_) => {}
        }

        Ok((self.body.tag(), encode_payload(map)?))
    }

    pub(crate) fn decode(tag: u16, raw: &[u8]) -> Result<Self, PayloadError> {
        let map: PayloadMap = decode_payload(raw)?;
        let command_tag = get_u16(&map, "cmd")?;
        let success = get_bool(&map, "ok")?;
        let details = get_string(&map, "details")?;

        let body = match tag {
            PLAIN_ANSWER_TAG => AnswerBody::Plain,
            PONG_ANSWER_TAG => AnswerBody::Pong {
                server_time_ms: get_i64(&map, "server_time_ms")?,
            },
            STARTUP_ACCEPTED_ANSWER_TAG => AnswerBody::StartupAccepted {
                agent_id: get_u64(&map, "agent_id")?,
                management_server_id: get_u64(&map, "msid")?,
            },
            VM_STARTED_ANSWER_TAG => AnswerBody::VmStarted {
                console_port: get_u16(&map, "console_port")?,
            },
            VOLUME_CREATED_ANSWER_TAG => AnswerBody::VolumeCreated {
                path: get_string(&map, "path")?,
                size_bytes: get_u64(&map, "size_bytes")?,
            },
            UNSUPPORTED_ANSWER_TAG => AnswerBody::Unsupported,
            SKIPPED_ANSWER_TAG => AnswerBody::Skipped,
            _ => AnswerBody::Unrecognized(UnknownItem {
                tag,
                raw: raw.to_vec(),
            }),
        };

        Ok(Self {
            command_tag,
            success,
            details,
            body,
        })
    }
}
