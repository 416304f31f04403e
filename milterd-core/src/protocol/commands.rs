//! Inbound commands: one variant per MTA-to-milter message, each with its
//! byte-level decoder.
//!
//! Every payload leads with a single discriminator byte; the remainder is
//! command-specific. Decoding failures are protocol violations and close
//! the connection, so the decoders are strict about structure while being
//! tolerant about text encoding (escapes instead of hard failures wherever
//! the original data is free-form).

use std::net::{Ipv4Addr, Ipv6Addr};

use bytes::Bytes;
use tracing::{debug, warn};

use crate::definitions::{self, AddressFamily, MacroStage};
use crate::error::MilterError;
use crate::flags::MtaCapabilities;

use super::{
    EsmtpArgs, Macros, decode_ascii_escaped, decode_ascii_strict, decode_utf8_escaped,
    decode_utf8_strict, split_nul_array,
};

// ── Discriminator registry ───────────────────────────────────────

/// Discriminated command kinds, used for registry lookups and for the
/// macro-stage association without touching variant payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandKind {
    OptionsNegotiate,
    Connect,
    Helo,
    MailFrom,
    RcptTo,
    Data,
    Header,
    EndOfHeaders,
    BodyChunk,
    EndOfMessage,
    Abort,
    Quit,
    QuitNoClose,
    Unknown,
    DefineMacro,
}

/// The static discriminator table. Uniqueness of the discriminator bytes
/// is asserted by a unit test; a duplicate entry is a defect in this
/// table, never a runtime condition.
pub const COMMAND_REGISTRY: &[(u8, CommandKind)] = &[
    (b'O', CommandKind::OptionsNegotiate),
    (b'C', CommandKind::Connect),
    (b'H', CommandKind::Helo),
    (b'M', CommandKind::MailFrom),
    (b'R', CommandKind::RcptTo),
    (b'T', CommandKind::Data),
    (b'L', CommandKind::Header),
    (b'N', CommandKind::EndOfHeaders),
    (b'B', CommandKind::BodyChunk),
    (b'E', CommandKind::EndOfMessage),
    (b'A', CommandKind::Abort),
    (b'Q', CommandKind::Quit),
    (b'K', CommandKind::QuitNoClose),
    (b'U', CommandKind::Unknown),
    (b'D', CommandKind::DefineMacro),
];

impl CommandKind {
    pub fn from_char(c: u8) -> Option<Self> {
        COMMAND_REGISTRY
            .iter()
            .find(|(ch, _)| *ch == c)
            .map(|(_, kind)| *kind)
    }

    pub fn command_char(self) -> u8 {
        // The registry is the single source of truth; the kind always has
        // an entry.
        COMMAND_REGISTRY
            .iter()
            .find(|(_, kind)| *kind == self)
            .map(|(ch, _)| *ch)
            .unwrap_or(0)
    }

    /// The macro stage this command's bundle would be scoped to, if any.
    pub fn macro_stage(self) -> Option<MacroStage> {
        MacroStage::from_command_char(self.command_char())
    }
}

// ── Command ──────────────────────────────────────────────────────

/// A decoded inbound command.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    OptionsNegotiate(OptionsNegotiate),
    Connect(Connect),
    Helo(Helo),
    MailFrom(MailFrom),
    RcptTo(RcptTo),
    Data(Data),
    Header(Header),
    EndOfHeaders(EndOfHeaders),
    BodyChunk(BodyChunk),
    EndOfMessage(EndOfMessage),
    Abort,
    Quit,
    QuitNoClose,
    Unknown(Unknown),
    DefineMacro(DefineMacro),
}

impl Command {
    /// Decode one complete payload (discriminator byte plus data).
    pub fn decode(payload: &[u8]) -> Result<Command, MilterError> {
        let Some((&char_byte, data)) = payload.split_first() else {
            return Err(MilterError::ProtocolViolationPayload(
                "payload was empty".into(),
            ));
        };
        let Some(kind) = CommandKind::from_char(char_byte) else {
            return Err(MilterError::ProtocolViolationPayload(format!(
                "unknown command char {:?}",
                char_byte as char
            )));
        };
        debug!(command = ?kind, data_len = data.len(), "decoded payload discriminator");

        match kind {
            CommandKind::OptionsNegotiate => {
                Ok(Command::OptionsNegotiate(OptionsNegotiate::decode(data)?))
            }
            CommandKind::Connect => Ok(Command::Connect(Connect::decode(data)?)),
            CommandKind::Helo => Ok(Command::Helo(Helo::decode(data)?)),
            CommandKind::MailFrom => Ok(Command::MailFrom(MailFrom::decode(data)?)),
            CommandKind::RcptTo => Ok(Command::RcptTo(RcptTo::decode(data)?)),
            CommandKind::Data => {
                expect_no_data(data, "Data")?;
                Ok(Command::Data(Data::default()))
            }
            CommandKind::Header => Ok(Command::Header(Header::decode(data)?)),
            CommandKind::EndOfHeaders => {
                expect_no_data(data, "EndOfHeaders")?;
                Ok(Command::EndOfHeaders(EndOfHeaders::default()))
            }
            CommandKind::BodyChunk => Ok(Command::BodyChunk(BodyChunk::decode(data))),
            CommandKind::EndOfMessage => {
                expect_no_data(data, "EndOfMessage")?;
                Ok(Command::EndOfMessage(EndOfMessage::default()))
            }
            CommandKind::Abort => {
                expect_no_data(data, "Abort")?;
                Ok(Command::Abort)
            }
            CommandKind::Quit => {
                expect_no_data(data, "Quit")?;
                Ok(Command::Quit)
            }
            CommandKind::QuitNoClose => {
                expect_no_data(data, "QuitNoClose")?;
                Ok(Command::QuitNoClose)
            }
            CommandKind::Unknown => Ok(Command::Unknown(Unknown::decode(data))),
            CommandKind::DefineMacro => Ok(Command::DefineMacro(DefineMacro::decode(data)?)),
        }
    }

    pub fn kind(&self) -> CommandKind {
        match self {
            Command::OptionsNegotiate(_) => CommandKind::OptionsNegotiate,
            Command::Connect(_) => CommandKind::Connect,
            Command::Helo(_) => CommandKind::Helo,
            Command::MailFrom(_) => CommandKind::MailFrom,
            Command::RcptTo(_) => CommandKind::RcptTo,
            Command::Data(_) => CommandKind::Data,
            Command::Header(_) => CommandKind::Header,
            Command::EndOfHeaders(_) => CommandKind::EndOfHeaders,
            Command::BodyChunk(_) => CommandKind::BodyChunk,
            Command::EndOfMessage(_) => CommandKind::EndOfMessage,
            Command::Abort => CommandKind::Abort,
            Command::Quit => CommandKind::Quit,
            Command::QuitNoClose => CommandKind::QuitNoClose,
            Command::Unknown(_) => CommandKind::Unknown,
            Command::DefineMacro(_) => CommandKind::DefineMacro,
        }
    }

    /// Attach a macro bundle to this command, if it carries macros at all.
    pub(crate) fn set_macros(&mut self, macros: Macros) {
        match self {
            Command::Connect(c) => c.macros = macros,
            Command::Helo(c) => c.macros = macros,
            Command::MailFrom(c) => c.macros = macros,
            Command::RcptTo(c) => c.macros = macros,
            Command::Data(c) => c.macros = macros,
            Command::Header(c) => c.macros = macros,
            Command::EndOfHeaders(c) => c.macros = macros,
            Command::BodyChunk(c) => c.macros = macros,
            Command::EndOfMessage(c) => c.macros = macros,
            Command::Unknown(c) => c.macros = macros,
            _ => {}
        }
    }
}

fn expect_no_data(data: &[u8], name: &str) -> Result<(), MilterError> {
    if data.is_empty() {
        Ok(())
    } else {
        Err(MilterError::ProtocolViolationCommandData(format!(
            "expected no data for command {name}, got {} byte(s)",
            data.len()
        )))
    }
}

// ── OptionsNegotiate ─────────────────────────────────────────────

/// The MTA's opening command: protocol version plus its capability masks.
#[derive(Debug, Clone, PartialEq)]
pub struct OptionsNegotiate {
    pub capabilities: MtaCapabilities,
}

impl OptionsNegotiate {
    fn decode(data: &[u8]) -> Result<Self, MilterError> {
        let expected = definitions::BASE_LEN_BYTES * 3;
        if data.len() != expected {
            return Err(MilterError::ProtocolViolationCommandData(format!(
                "options negotiate data length {} is not valid, expected {expected}",
                data.len()
            )));
        }
        let version = read_u32(&data[0..4]);
        let action_flags = read_u32(&data[4..8]);
        let protocol_flags = read_u32(&data[8..12]);
        debug!(version, action_flags, protocol_flags, "MTA options negotiate");

        if version != definitions::VERSION {
            return Err(MilterError::ProtocolViolationCommandData(format!(
                "unexpected milter protocol version {version}, expected {}",
                definitions::VERSION
            )));
        }
        if protocol_flags != definitions::PROTOCOL_FLAGS_ALL {
            warn!(
                protocol_flags,
                "MTA connection does not support all protocol flags; are you \
                 using a modern Postfix? milter may misbehave"
            );
        }

        Ok(Self {
            capabilities: MtaCapabilities::from_bitmasks(protocol_flags, action_flags),
        })
    }
}

fn read_u32(data: &[u8]) -> u32 {
    let mut buf = [0u8; 4];
    buf.copy_from_slice(data);
    u32::from_be_bytes(buf)
}

fn read_u16(data: &[u8]) -> u16 {
    let mut buf = [0u8; 2];
    buf.copy_from_slice(data);
    u16::from_be_bytes(buf)
}

// ── Connect ──────────────────────────────────────────────────────

/// Where the SMTP client connected from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionInfo {
    Ipv4 {
        hostname: String,
        addr: Ipv4Addr,
        port: u16,
    },
    Ipv6 {
        hostname: String,
        addr: Ipv6Addr,
        port: u16,
    },
    UnixSocket {
        path: String,
    },
    /// Postfix could not obtain the client address from the kernel; the
    /// hostname field is the sole descriptor.
    Unknown {
        description: String,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Connect {
    pub info: ConnectionInfo,
    pub macros: Macros,
}

impl Connect {
    fn decode(data: &[u8]) -> Result<Self, MilterError> {
        // Example data:
        //   b"[172.17.0.1]\x004\xc36172.17.0.1\x00"
        //   b"ignored_hostname\x00L\x00\x00/run/mysock\x00"
        let Some(split_at) = data.iter().position(|&b| b == 0) else {
            return Err(MilterError::ProtocolViolationCommandData(
                "connection info data does not contain the NULs to split into \
                 hostname, socket family and host address"
                    .into(),
            ));
        };
        let hostname = decode_utf8_escaped(&data[..split_at]);
        let mut socket_data = &data[split_at + 1..];
        while let Some(stripped) = socket_data.strip_suffix(b"\x00") {
            socket_data = stripped;
        }

        let Some((&family_byte, addr_data)) = socket_data.split_first() else {
            return Err(MilterError::ProtocolViolationCommandData(
                "socket data empty".into(),
            ));
        };
        let Some(family) = AddressFamily::from_byte(family_byte) else {
            return Err(MilterError::ProtocolViolationCommandData(format!(
                "unsupported socket family {:?} in connection socket info",
                family_byte as char
            )));
        };

        let info = match family {
            AddressFamily::Ipv4 | AddressFamily::Ipv6 => {
                if addr_data.len() < 5 {
                    return Err(MilterError::ProtocolViolationCommandData(
                        "socket data too short for an IPv4/IPv6 address".into(),
                    ));
                }
                let port = read_u16(&addr_data[..2]);
                let text = decode_ascii_strict(&addr_data[2..], "IP address")?;
                if family == AddressFamily::Ipv4 {
                    let addr: Ipv4Addr = text.parse().map_err(|_| {
                        MilterError::ProtocolViolationCommandData(format!(
                            "unsupported socket hostaddr value {text:?} for family IPv4"
                        ))
                    })?;
                    ConnectionInfo::Ipv4 {
                        hostname,
                        addr,
                        port,
                    }
                } else {
                    let addr: Ipv6Addr = text.parse().map_err(|_| {
                        MilterError::ProtocolViolationCommandData(format!(
                            "unsupported socket hostaddr value {text:?} for family IPv6"
                        ))
                    })?;
                    ConnectionInfo::Ipv6 {
                        hostname,
                        addr,
                        port,
                    }
                }
            }
            AddressFamily::UnixSocket => {
                // Two padding bytes occupy the port position.
                if addr_data.len() < 2 {
                    return Err(MilterError::ProtocolViolationCommandData(
                        "socket data too short for a unix socket path".into(),
                    ));
                }
                let path = decode_utf8_strict(&addr_data[2..], "socket path")?;
                ConnectionInfo::UnixSocket { path }
            }
            AddressFamily::Unknown => ConnectionInfo::Unknown {
                description: hostname,
            },
        };

        Ok(Self {
            info,
            macros: Macros::new(),
        })
    }
}

// ── Helo ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct Helo {
    pub hostname: String,
    pub macros: Macros,
}

impl Helo {
    fn decode(data: &[u8]) -> Result<Self, MilterError> {
        if data.last() != Some(&0) {
            return Err(MilterError::ProtocolViolationCommandData(format!(
                "Helo hostname should be NUL-terminated [data={data:?}]"
            )));
        }
        let mut trimmed = data;
        while let Some(stripped) = trimmed.strip_suffix(b"\x00") {
            trimmed = stripped;
        }
        // HELO/EHLO data cannot be UTF-8: SMTPUTF8 awareness is negotiated
        // in this very stage (RFC 6531 §3.7.1).
        Ok(Self {
            hostname: decode_ascii_escaped(trimmed),
            macros: Macros::new(),
        })
    }
}

// ── MailFrom / RcptTo ────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct MailFrom {
    pub address: String,
    pub esmtp_args: EsmtpArgs,
    pub macros: Macros,
}

/// One per recipient; the MTA issues this for every RCPT TO.
#[derive(Debug, Clone, PartialEq)]
pub struct RcptTo {
    pub address: String,
    pub esmtp_args: EsmtpArgs,
    pub macros: Macros,
}

impl MailFrom {
    fn decode(data: &[u8]) -> Result<Self, MilterError> {
        let (address, esmtp_args) = decode_address_and_esmtp_args(data)?;
        Ok(Self {
            address,
            esmtp_args,
            macros: Macros::new(),
        })
    }
}

impl RcptTo {
    fn decode(data: &[u8]) -> Result<Self, MilterError> {
        let (address, esmtp_args) = decode_address_and_esmtp_args(data)?;
        Ok(Self {
            address,
            esmtp_args,
            macros: Macros::new(),
        })
    }
}

/// Decode a MAIL FROM / RCPT TO payload into the address and its ESMTP
/// arguments. With input `b"<test@example.com>\x00BODY=8BITMIME\x00FOO\x00"`
/// this yields address `test@example.com` and args
/// `{BODY: 8BITMIME, FOO: None}`.
fn decode_address_and_esmtp_args(data: &[u8]) -> Result<(String, EsmtpArgs), MilterError> {
    if data.last() != Some(&0) {
        return Err(MilterError::ProtocolViolationCommandData(format!(
            "Mail From / Rcpt To address should be NUL-terminated [data={data:?}]"
        )));
    }
    if data.iter().all(|&b| b == 0) {
        return Err(MilterError::ProtocolViolationCommandData(format!(
            "Mail From / Rcpt To address seems empty [data={data:?}]"
        )));
    }
    // The unwrap_or is unreachable: a NUL terminator is guaranteed above.
    let split_at = data.iter().position(|&b| b == 0).unwrap_or(data.len());
    let address_raw = decode_utf8_escaped(&data[..split_at]);
    let esmtp_data = &data[split_at + 1..];

    let address = match address_raw
        .strip_prefix('<')
        .and_then(|a| a.strip_suffix('>'))
    {
        Some(inner) => inner.to_string(),
        None => {
            warn!(
                address = %address_raw,
                "address in Mail From / Rcpt To appears not enclosed in angle brackets"
            );
            address_raw
        }
    };

    let mut esmtp_args = EsmtpArgs::new();
    for item in split_nul_array(esmtp_data) {
        let (keyword_raw, value_raw) = if !item.get(1..).unwrap_or(b"").contains(&b'=') {
            // Keyword-only case.
            (item, None)
        } else {
            let parts: Vec<&[u8]> = item.split(|&b| b == b'=').collect();
            let &[keyword, value] = &parts[..] else {
                return Err(MilterError::ProtocolViolationCommandData(format!(
                    "could not decode ESMTP keyword/value pair in {item:?}"
                )));
            };
            (keyword, Some(value))
        };
        // The esmtp-keyword is never UTF-8, even with the SMTPUTF8
        // extension; only the esmtp-value is (RFC 6531 §3.3).
        let keyword = decode_ascii_strict(keyword_raw, "ESMTP keyword")?;
        let value = value_raw.map(decode_utf8_escaped);
        if let Some(former) = esmtp_args.get(&keyword) {
            if former != value.as_deref() {
                debug!(
                    keyword = %keyword,
                    "ESMTP keyword already seen for this command, overriding former value"
                );
            }
        }
        esmtp_args.insert(keyword, value);
    }
    Ok((address, esmtp_args))
}

// ── Simple transaction commands ──────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Data {
    pub macros: Macros,
}

/// One per header field.
#[derive(Debug, Clone, PartialEq)]
pub struct Header {
    pub name: String,
    pub text: String,
    pub macros: Macros,
}

impl Header {
    fn decode(data: &[u8]) -> Result<Self, MilterError> {
        // Example data:
        //   b"From\x00Display Name <user@example.com>\x00"
        if data.last() != Some(&0) {
            return Err(MilterError::ProtocolViolationCommandData(format!(
                "header data should be NUL-terminated [data={data:?}]"
            )));
        }
        let items = split_nul_array(data);
        let &[name_raw, text_raw] = &items[..] else {
            return Err(MilterError::ProtocolViolationCommandData(format!(
                "could not decode the header data {data:?}"
            )));
        };
        Ok(Self {
            name: decode_ascii_escaped(name_raw),
            text: decode_utf8_escaped(text_raw),
            macros: Macros::new(),
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct EndOfHeaders {
    pub macros: Macros,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct BodyChunk {
    pub data: Bytes,
    pub macros: Macros,
}

impl BodyChunk {
    fn decode(data: &[u8]) -> Self {
        Self {
            data: Bytes::copy_from_slice(data),
            macros: Macros::new(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct EndOfMessage {
    pub macros: Macros,
}

// ── Unknown ──────────────────────────────────────────────────────

/// Unrecognized or unimplemented SMTP command. Completely unspecified
/// content; `data` holds the raw bytes with a single trailing NUL (if
/// present) removed. Example: `b"HELP\x00"` decodes to `b"HELP"`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Unknown {
    pub data: Bytes,
    pub macros: Macros,
}

impl Unknown {
    fn decode(data: &[u8]) -> Self {
        let trimmed = data.strip_suffix(b"\x00").unwrap_or(data);
        Self {
            data: Bytes::copy_from_slice(trimmed),
            macros: Macros::new(),
        }
    }
}

// ── DefineMacro ──────────────────────────────────────────────────

/// A macro bundle scoped to one stage, buffered by the session until the
/// matching command arrives.
#[derive(Debug, Clone, PartialEq)]
pub struct DefineMacro {
    pub stage: MacroStage,
    pub macros: Macros,
}

impl DefineMacro {
    fn decode(data: &[u8]) -> Result<Self, MilterError> {
        // Example data:
        //   b"Cj\x00myhost.sub.example.com\x00{daemon_addr}\x00172.17.0.2\x00"
        // decodes to stage=Connect,
        //   macros={j: myhost.sub.example.com, {daemon_addr}: 172.17.0.2}
        let Some((&stage_char, macro_data)) = data.split_first() else {
            return Err(MilterError::ProtocolViolationCommandData(
                "DefineMacro command data must define a command (stage) for which \
                 the macros apply"
                    .into(),
            ));
        };
        let Some(stage) = MacroStage::from_command_char(stage_char) else {
            return Err(MilterError::ProtocolViolationCommandData(format!(
                "unknown command (stage) {:?} for which macros apply",
                stage_char as char
            )));
        };

        let mut macros = Macros::new();
        if macro_data.is_empty() {
            debug!(%stage, "no macros in DefineMacro");
            return Ok(Self { stage, macros });
        }
        if macro_data.last() != Some(&0) {
            return Err(MilterError::ProtocolViolationCommandData(format!(
                "DefineMacro command data must be NUL-terminated [data={data:?}]"
            )));
        }

        let items = split_nul_array(macro_data);
        if items.len() % 2 != 0 {
            return Err(MilterError::ProtocolViolationCommandData(
                "macro data does not contain the expected number of NULs to split \
                 into symbol/value pairs"
                    .into(),
            ));
        }
        for pair in items.chunks_exact(2) {
            let symbol = decode_utf8_strict(pair[0], "macro symbol")?;
            let value = decode_utf8_strict(pair[1], "macro value")?;
            macros.insert(symbol, value);
        }
        debug!(%stage, count = macros.len(), "decoded macros");
        Ok(Self { stage, macros })
    }
}
