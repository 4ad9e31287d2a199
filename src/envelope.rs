// Event envelopes that flow from every producer to the Collector
//
// All three producers (kernel source, stdio proxy, network interceptor)
// speak the same outer JSON shape. Using an enum for the payload allows
// pattern matching and ensures the `eventType` discriminator can never
// disagree with the shape of `data`.

use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// Which producer constructed an envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Producer {
    /// Kernel trace source
    AgentCore,
    /// STDIO interposer
    Proxy,
    /// HTTP(S) interceptor feed
    Mitm,
}

/// The uniform outer event shape shared by all producers.
///
/// Serializes as `{"ts":…,"producer":…,"pid":…,"pname":…,"eventType":…,"data":{…}}`;
/// the `eventType`/`data` pair comes from the flattened [`EventData`] enum.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    /// Nanoseconds since epoch, taken by the producer at event construction.
    /// Monotonic within one producer; only wall-clock comparable across producers.
    pub ts: i64,
    pub producer: Producer,
    pub pid: u32,
    pub pname: String,
    #[serde(flatten)]
    pub data: EventData,
}

impl EventEnvelope {
    /// Build an envelope stamped with the current time.
    pub fn new(producer: Producer, pid: u32, pname: impl Into<String>, data: EventData) -> Self {
        Self {
            ts: now_ns(),
            producer,
            pid,
            pname: pname.into(),
            data,
        }
    }
}

/// Nanoseconds since the Unix epoch.
pub fn now_ns() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as i64)
        .unwrap_or(0)
}

/// Typed payload, discriminated by `eventType` on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "eventType", content = "data")]
pub enum EventData {
    Process(ProcessData),
    File(FileData),
    Network(NetworkData),
    #[serde(rename = "MCP")]
    Mcp(McpData),
    ProxyLog(ProxyLogData),
}

impl EventData {
    /// The wire name of the discriminator, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            EventData::Process(_) => "Process",
            EventData::File(_) => "File",
            EventData::Network(_) => "Network",
            EventData::Mcp(_) => "MCP",
            EventData::ProxyLog(_) => "ProxyLog",
        }
    }
}

/// Process start/stop, emitted by the kernel source only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessData {
    pub task: ProcessTask,
    pub pid: u32,
    pub pname: String,
    pub parent: ParentRef,
    pub image_filename: String,
    pub command_line: String,
    pub mcp_tag: String,
    /// Only present on Stop, and only when the trace facility reports it.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
}

/// Parent link carried on process events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParentRef {
    pub pid: u32,
    pub name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProcessTask {
    Start,
    Stop,
}

/// File I/O scoped to the tracked tree, after noise filtering.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileData {
    pub task: FileTask,
    pub pid: u32,
    pub file_path: String,
    pub mcp_tag: String,
    /// How many identical events were collapsed into this one by the
    /// dedup window. Omitted when zero.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub repeat_count: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub old_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub new_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum FileTask {
    Create,
    Write,
    Read,
    Delete,
    Rename,
    Close,
    DirEnum,
}

/// TCP activity of a tracked process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkData {
    pub task: NetTask,
    pub pid: u32,
    pub pname: String,
    pub mcp_tag: String,
    pub trans_port: String,
    pub src: String,
    pub sport: u16,
    pub dst: String,
    pub dport: u16,
    pub bytes: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum NetTask {
    Send,
    Recv,
    Connect,
}

/// One JSON-RPC frame observed by the stdio proxy or the interceptor.
///
/// `task` is emitted directly as SEND (client→server) or RECV
/// (server→client); there is no boolean form of the direction anywhere.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct McpData {
    pub task: McpTask,
    /// "stdio" for the proxy, "tcp" for the interceptor.
    pub transport: String,
    pub src: String,
    pub dst: String,
    pub message: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mcp_tag: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum McpTask {
    Send,
    Recv,
}

/// Out-of-band proxy diagnostics (child exit, stderr lines).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProxyLogData {
    #[serde(rename = "type")]
    pub kind: String,
    pub message: String,
}
