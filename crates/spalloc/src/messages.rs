use serde::{Deserialize, Serialize};
use serde_json::{Map as JsonMap, Value};

/// Identifier of a remote allocation session.
pub type SessionId = u32;

/// A single command sent to the allocation service.
///
/// Serialized as `{"command": <name>, "args": [..], "kwargs": {..}}`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Request {
    pub command: String,
    pub args: Vec<Value>,
    pub kwargs: JsonMap<String, Value>,
}

impl Request {
    pub fn new(command: &str) -> Self {
        Self {
            command: command.to_string(),
            args: Vec::new(),
            kwargs: JsonMap::new(),
        }
    }

    pub fn arg<V: Into<Value>>(mut self, value: V) -> Self {
        self.args.push(value.into());
        self
    }

    pub fn kwarg<V: Into<Value>>(mut self, key: &str, value: V) -> Self {
        self.kwargs.insert(key.to_string(), value.into());
        self
    }

    pub fn create_job(boards: u32, owner: &str, tags: &[String]) -> Self {
        let request = Request::new("create_job").arg(boards).kwarg("owner", owner);
        if tags.is_empty() {
            request
        } else {
            request.kwarg("tags", tags.to_vec())
        }
    }

    pub fn destroy_job(id: SessionId) -> Self {
        Request::new("destroy_job").arg(id)
    }

    pub fn get_job_state(id: SessionId) -> Self {
        Request::new("get_job_state").arg(id)
    }

    pub fn get_job_machine_info(id: SessionId) -> Self {
        Request::new("get_job_machine_info").arg(id)
    }

    pub fn notify_job(id: SessionId) -> Self {
        Request::new("notify_job").arg(id)
    }

    pub fn no_notify_job(id: SessionId) -> Self {
        Request::new("no_notify_job").arg(id)
    }

    pub fn job_keepalive(id: SessionId) -> Self {
        Request::new("job_keepalive").arg(id)
    }

    pub fn list_machines() -> Self {
        Request::new("list_machines")
    }

    pub fn power_on_job_boards(id: SessionId) -> Self {
        Request::new("power_on_job_boards").arg(id)
    }

    pub fn power_off_job_boards(id: SessionId) -> Self {
        Request::new("power_off_job_boards").arg(id)
    }

    pub fn where_is(id: SessionId, chip_x: u32, chip_y: u32) -> Self {
        Request::new("where_is")
            .kwarg("job_id", id)
            .kwarg("chip_x", chip_x)
            .kwarg("chip_y", chip_y)
    }
}

/// Everything the service can send. The variant is selected by the single key of the object.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub enum Response {
    /// Successful reply to the outstanding command.
    #[serde(rename = "return")]
    Return(Value),
    /// Failed reply to the outstanding command.
    #[serde(rename = "exception")]
    Exception(Value),
    /// Unsolicited notification about sessions whose state has changed.
    #[serde(rename = "jobs_changed")]
    JobsChanged(Vec<SessionId>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum SessionState {
    Unknown,
    Queued,
    Power,
    Ready,
    Destroyed,
}

impl TryFrom<u8> for SessionState {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(SessionState::Unknown),
            1 => Ok(SessionState::Queued),
            2 => Ok(SessionState::Power),
            3 => Ok(SessionState::Ready),
            4 => Ok(SessionState::Destroyed),
            _ => Err(format!("Invalid session state {value}")),
        }
    }
}

impl From<SessionState> for u8 {
    fn from(state: SessionState) -> Self {
        match state {
            SessionState::Unknown => 0,
            SessionState::Queued => 1,
            SessionState::Power => 2,
            SessionState::Ready => 3,
            SessionState::Destroyed => 4,
        }
    }
}

/// Reply of `get_job_state`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionStatus {
    pub state: SessionState,
    #[serde(default)]
    pub power: Option<bool>,
    #[serde(default, alias = "keepAlive", alias = "keep_alive")]
    pub keepalive: Option<f64>,
    #[serde(default)]
    pub reason: Option<String>,
}

impl SessionStatus {
    pub fn is_terminal(&self) -> bool {
        self.state == SessionState::Destroyed
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(from = "(u32, u32)")]
pub struct ChipLocation {
    pub x: u32,
    pub y: u32,
}

impl From<(u32, u32)> for ChipLocation {
    fn from((x, y): (u32, u32)) -> Self {
        Self { x, y }
    }
}

/// Ethernet-attached chip of an allocation, sent as `[[x, y], "hostname"]`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(from = "(ChipLocation, String)")]
pub struct Connection {
    pub chip: ChipLocation,
    pub hostname: String,
}

impl From<(ChipLocation, String)> for Connection {
    fn from((chip, hostname): (ChipLocation, String)) -> Self {
        Self { chip, hostname }
    }
}

/// Reply of `get_job_machine_info`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct JobMachineInfo {
    pub width: u32,
    pub height: u32,
    #[serde(default)]
    pub connections: Vec<Connection>,
    #[serde(default, alias = "machineName")]
    pub machine_name: Option<String>,
}

/// One entry of the `list_machines` reply.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Machine {
    pub name: String,
    #[serde(default)]
    pub tags: Option<Vec<String>>,
    pub width: u32,
    pub height: u32,
}

impl Machine {
    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.iter().flatten().any(|t| t == tag)
    }
}

/// Reply of `where_is`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct WhereIs {
    #[serde(default)]
    pub machine: Option<String>,
    #[serde(default)]
    pub logical: Option<[u32; 3]>,
    #[serde(default)]
    pub physical: Option<[u32; 3]>,
    #[serde(default)]
    pub chip: Option<(u32, u32)>,
    #[serde(default, alias = "boardChip")]
    pub board_chip: Option<(u32, u32)>,
    #[serde(default, alias = "jobChip")]
    pub job_chip: Option<(u32, u32)>,
    #[serde(default, alias = "jobId")]
    pub job_id: Option<SessionId>,
}
