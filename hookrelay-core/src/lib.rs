//! # hookrelay-core
//!
//! Core library for an injected helper that hooks process-local APIs and
//! relays what it sees to a controller process.
//!
//! This crate contains:
//! - **Wire protocol**: `FrameHeader`, `Frame`, `Message`, `FrameFlags`
//!   and `RelayCodec` for framed TCP I/O via `tokio_util`
//! - **Hook table**: `ImportTable`, `HookTable` and trampolines that run a
//!   `CallObserver` around the original entry point
//! - **Limiter**: `EventRateLimiter` with per-class budgets, and the
//!   `LimiterService` task that feeds the transport
//! - **Transport**: `Channel`, one framed link with heartbeat and idle
//!   detection
//! - **Dispatcher**: controller-side `Dispatcher` and per-process `Session`
//! - **Helper**: `HelperRuntime`, everything above wired together
//! - **Error**: `RelayError` and component errors, `thiserror`-based

pub mod codec;
pub mod dispatcher;
pub mod error;
pub mod event;
pub mod flags;
pub mod header;
pub mod helper;
pub mod hook;
pub mod limiter;
pub mod message;
pub mod packet;
pub mod state;
pub mod transport;

// ── Re-exports for ergonomic usage ───────────────────────────────

pub use codec::RelayCodec;
pub use dispatcher::{Delivery, Dispatcher, DispatcherOptions, EventHandler, Session};
pub use error::{
    ConnectError, HookError, HookInstallError, HookNotFoundError, RelayError, SendError,
};
pub use event::{Event, MAX_EVENT_PAYLOAD, PriorityClass, SourceId};
pub use flags::FrameFlags;
pub use header::{FrameHeader, HEADER_LENGTH, MAGIC};
pub use helper::{
    CallRecord, EventObserver, HelperOptions, HelperRuntime, HookSpec, InterfaceHandler,
    InterfaceRegistry,
};
pub use hook::{
    CallObserver, CallingConvention, EntryPoint, HookCall, HookEntry, HookState, HookTable,
    HookTarget, ImportTable, Signature, Symbol,
};
pub use limiter::{
    Admission, Admitted, ClassPolicy, EventRateLimiter, EventSink, LimiterConfig, LimiterHandle,
    LimiterService, LimiterStats, OverflowPolicy, RateBudget, StatsSnapshot,
};
pub use message::{
    Call, Hello, Interface, Message, MessageKind, PROTOCOL_VERSION, ProcessIdentity, Reply,
};
pub use packet::{Frame, MAX_FRAME_SIZE, MAX_PAYLOAD_SIZE};
pub use state::{LinkState, PendingCall, PendingCalls};
pub use transport::{Channel, ChannelOptions, Endpoint, Inbound};
