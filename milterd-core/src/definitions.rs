//! Low-level milter protocol definitions.
//!
//! Numeric constants, macro stages and socket address families as they
//! appear on the wire, shared by the codec, the command decoders and the
//! response encoders.

/// The milter protocol version spoken by this runtime.
pub const VERSION: u32 = 6;

/// Length of the network-byte-order framing prefix in bytes.
pub const BASE_LEN_BYTES: usize = 4;

/// Maximum accepted payload length. Postfix sends packets with payload
/// length 65536 where the protocol headers say 65535; accept the larger.
pub const MAX_DATA_SIZE: usize = 65536;

/// Upper bound on a single replacement body chunk.
pub const MAX_BODY_CHUNK_SIZE: usize = MAX_DATA_SIZE - 1;

/// All protocol-flag bits a modern MTA is expected to advertise.
pub const PROTOCOL_FLAGS_ALL: u32 = 0x001F_FFFF;

// ── MacroStage ───────────────────────────────────────────────────

/// The protocol stage a macro bundle or symbol list applies to.
///
/// Variants are declared in wire-code order. Not all stages are
/// customizable by the MTA, but Postfix sends macros for all of them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u32)]
pub enum MacroStage {
    Connect = 0,
    Helo = 1,
    MailFrom = 2,
    RcptTo = 3,
    Data = 4,
    EndOfMessage = 5,
    EndOfHeaders = 6,
    Header = 7,
    Body = 8,
    Unknown = 9,
}

impl MacroStage {
    /// The u32 stage code used in the options-negotiate response.
    pub fn wire_code(self) -> u32 {
        self as u32
    }

    /// Map a command discriminator byte to the stage its macros apply to.
    ///
    /// `DefineMacro` payloads lead with the discriminator of the command
    /// the macros are scoped to, not with the numeric stage code.
    pub fn from_command_char(c: u8) -> Option<Self> {
        match c {
            b'C' => Some(Self::Connect),
            b'H' => Some(Self::Helo),
            b'M' => Some(Self::MailFrom),
            b'R' => Some(Self::RcptTo),
            b'T' => Some(Self::Data),
            b'L' => Some(Self::Header),
            b'N' => Some(Self::EndOfHeaders),
            b'B' => Some(Self::Body),
            b'E' => Some(Self::EndOfMessage),
            b'U' => Some(Self::Unknown),
            _ => None,
        }
    }
}

impl std::fmt::Display for MacroStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Connect => "connect",
            Self::Helo => "helo",
            Self::MailFrom => "mail-from",
            Self::RcptTo => "rcpt-to",
            Self::Data => "data",
            Self::EndOfMessage => "end-of-message",
            Self::EndOfHeaders => "end-of-headers",
            Self::Header => "header",
            Self::Body => "body",
            Self::Unknown => "unknown",
        };
        write!(f, "{name}")
    }
}

// ── AddressFamily ────────────────────────────────────────────────

/// Socket family byte in the Connect command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressFamily {
    Unknown,
    UnixSocket,
    Ipv4,
    Ipv6,
}

impl AddressFamily {
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            b'U' => Some(Self::Unknown),
            b'L' => Some(Self::UnixSocket),
            b'4' => Some(Self::Ipv4),
            b'6' => Some(Self::Ipv6),
            _ => None,
        }
    }
}
