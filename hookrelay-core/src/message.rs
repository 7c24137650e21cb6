//! Protocol message types.
//!
//! Every logical RPC contract shares one transport, so everything that
//! crosses a channel is a variant of [`Message`]. Ordering and rate
//! policy therefore apply uniformly.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::RelayError;
use crate::event::Event;

/// Version advertised in [`Hello`]. Peers with a different version are
/// refused during the handshake.
pub const PROTOCOL_VERSION: u16 = 1;

// ── MessageKind ──────────────────────────────────────────────────

/// Wire discriminant stored in the frame header.
///
/// - `0x00xx`: link management
/// - `0x01xx`: helper → controller event stream
/// - `0x02xx`: interface calls in either direction
#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    Hello = 0x0001,
    Goodbye = 0x0002,
    Heartbeat = 0x0003,

    Event = 0x0101,
    ChannelLost = 0x0102,

    Call = 0x0201,
    Reply = 0x0202,
}

impl TryFrom<u16> for MessageKind {
    type Error = RelayError;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        match value {
            0x0001 => Ok(MessageKind::Hello),
            0x0002 => Ok(MessageKind::Goodbye),
            0x0003 => Ok(MessageKind::Heartbeat),
            0x0101 => Ok(MessageKind::Event),
            0x0102 => Ok(MessageKind::ChannelLost),
            0x0201 => Ok(MessageKind::Call),
            0x0202 => Ok(MessageKind::Reply),
            _ => Err(RelayError::UnknownVariant {
                type_name: "MessageKind",
                value: value as u64,
            }),
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

// ── Interface ────────────────────────────────────────────────────

/// Logical RPC contracts that ride a channel. Their operation tables and
/// argument layouts are defined elsewhere; here they are opaque.
#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Interface {
    /// Commands the helper sends to the controller.
    ControllerCommand = 1,
    /// Controller-internal notifications.
    ControllerInternal = 2,
    /// Virtual buffer queries answered by the helper.
    VirtualBuffer = 3,
    /// Utilities executed inside the host process.
    InProcessUtility = 4,
    /// Display model queries answered by the helper.
    DisplayModel = 5,
    /// Audio output service.
    Audio = 16,
    /// Screen curtain service.
    ScreenCurtain = 17,
    /// Remote access service.
    RemoteAccess = 18,
}

impl fmt::Display for Interface {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

// ── Payload bodies ───────────────────────────────────────────────

/// Who is on the other end of a helper channel.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProcessIdentity {
    pub pid: u32,
    /// Executable image name of the host process.
    pub image: String,
}

impl ProcessIdentity {
    pub fn new(pid: u32, image: impl Into<String>) -> Self {
        Self {
            pid,
            image: image.into(),
        }
    }

    /// Identity of the current process.
    pub fn current() -> Self {
        let image = std::env::current_exe()
            .ok()
            .and_then(|p| p.file_name().map(|n| n.to_string_lossy().into_owned()))
            .unwrap_or_else(|| "unknown".to_string());
        Self::new(std::process::id(), image)
    }
}

impl fmt::Display for ProcessIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]", self.image, self.pid)
    }
}

/// First message a helper sends on a new channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hello {
    pub protocol_version: u16,
    pub process: ProcessIdentity,
    /// Interfaces the helper answers calls for.
    pub interfaces: Vec<Interface>,
}

/// An operation invoked on a remote interface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Call {
    pub call_id: u64,
    pub interface: Interface,
    pub operation: u32,
    pub args: Vec<u8>,
}

/// Answer to a [`Call`], matched by `call_id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reply {
    pub call_id: u64,
    pub result: Result<Vec<u8>, String>,
}

// ── Message ──────────────────────────────────────────────────────

/// Everything that can cross a channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Hello(Hello),
    Goodbye,
    Heartbeat,
    Event(Event),
    /// Sent once on a fresh channel after the previous one broke;
    /// `discarded` counts events dropped instead of being buffered.
    ChannelLost { discarded: u32 },
    Call(Call),
    Reply(Reply),
}

impl Message {
    pub fn kind(&self) -> MessageKind {
        match self {
            Message::Hello(_) => MessageKind::Hello,
            Message::Goodbye => MessageKind::Goodbye,
            Message::Heartbeat => MessageKind::Heartbeat,
            Message::Event(_) => MessageKind::Event,
            Message::ChannelLost { .. } => MessageKind::ChannelLost,
            Message::Call(_) => MessageKind::Call,
            Message::Reply(_) => MessageKind::Reply,
        }
    }
}
