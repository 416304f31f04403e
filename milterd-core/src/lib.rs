//! # milterd-core
//!
//! Server-side runtime for the Sendmail/Postfix mail-filtering ("milter")
//! protocol, version 6.
//!
//! This crate contains:
//! - **Definitions**: protocol constants, `MacroStage`, `AddressFamily`
//! - **Codec**: `PacketCodec` for length-prefixed framing via `tokio_util`
//! - **Protocol types**: `Command` variants with byte-level decoders,
//!   `Verdict`/`Manipulation` responses with byte-level encoders
//! - **Negotiation**: `ProtocolFlags` ⇄ wire bitmasks, `MtaCapabilities`
//! - **Session**: the per-connection command pipeline with macro
//!   attachment and manipulation staging
//! - **Network**: `handle_connection` for managed duplex streams with
//!   two-directional teardown
//! - **Server**: `MilterServer` — accept loop, connection tracking and
//!   signal-driven graceful shutdown
//! - **App**: the `MilterApp` trait your filter implements

pub mod app;
pub mod codec;
pub mod definitions;
pub mod error;
pub mod flags;
pub mod network;
pub mod protocol;
pub mod server;
pub mod session;

// ── Re-exports for ergonomic usage ───────────────────────────────

pub use app::{AppFactory, HookResult, MilterApp};
pub use codec::PacketCodec;
pub use definitions::{MAX_BODY_CHUNK_SIZE, MAX_DATA_SIZE, MacroStage, VERSION};
pub use error::MilterError;
pub use flags::{ActionOpts, MtaCapabilities, ProtocolFlags, ProtocolOpts};
pub use network::{ConnectionHandle, ConnectionId};
pub use protocol::commands::{
    BodyChunk, Command, CommandKind, Connect, ConnectionInfo, Data, DefineMacro, EndOfHeaders,
    EndOfMessage, Header, Helo, MailFrom, RcptTo, Unknown,
};
pub use protocol::responses::{
    HeaderName, Manipulation, OptionsNegotiateResponse, Reply, SymbolMap, Verdict,
};
pub use protocol::{EsmtpArgs, Macros};
pub use server::MilterServer;
pub use session::{SessionConfig, SessionPhase};

/// Default listening address for the bundled demo applications.
pub const DEFAULT_LISTENING_HOST: &str = "127.0.0.1";

/// Default listening port for the bundled demo applications.
pub const DEFAULT_LISTENING_PORT: u16 = 9000;
