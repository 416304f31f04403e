//! Outbound responses: verdicts, deferred manipulations and the
//! options-negotiate reply, each with a deterministic byte encoder.
//!
//! Anything that can be invalid — header field names, reply-code digits,
//! oversized body chunks — is rejected when the value is constructed, never
//! at encode time. Encoding itself is infallible.

use std::collections::{BTreeMap, BTreeSet};

use bytes::{BufMut, Bytes, BytesMut};

use crate::definitions::{self, MAX_BODY_CHUNK_SIZE, MacroStage};
use crate::error::MilterError;
use crate::flags::ProtocolFlags;

use super::EsmtpArgs;

/// Requested macro symbols per stage, sent in the negotiation reply.
///
/// An empty set for a stage suppresses all macros for it; a stage absent
/// from the map keeps the MTA's default symbol list.
pub type SymbolMap = BTreeMap<MacroStage, BTreeSet<String>>;

// ── HeaderName ───────────────────────────────────────────────────

/// A validated RFC 5322 header field name: printable US-ASCII (octets
/// 33–126) excluding the colon, and never empty.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderName(String);

impl HeaderName {
    pub fn new(name: impl Into<String>) -> Result<Self, MilterError> {
        let name = name.into();
        if name.is_empty() {
            return Err(MilterError::InvalidResponse(
                "header field name cannot be empty".into(),
            ));
        }
        if !name.bytes().all(|b| (33..=126).contains(&b)) {
            return Err(MilterError::InvalidResponse(
                "header field names must contain only US-ASCII printable characters \
                 with values between 33 and 126 (RFC 5322)"
                    .into(),
            ));
        }
        if name.contains(':') {
            return Err(MilterError::InvalidResponse(
                "header field names must not contain a colon (RFC 5322)".into(),
            ));
        }
        Ok(Self(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for HeaderName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ── Verdict ──────────────────────────────────────────────────────

/// A response that decides the fate of the current SMTP operation.
///
/// `Continue` doubles as the "no verdict change" value for stages where a
/// reply is negotiated. `Skip` is only meaningful as a BodyChunk reply.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Verdict {
    #[default]
    Continue,
    Accept,
    Reject,
    RejectWithCode(SmtpReply),
    TempFailWithCode(SmtpReply),
    /// Drop the message silently while pretending to accept it.
    /// Invalid with Connect or Helo.
    Discard,
    /// Put the message in the hold queue. Only valid at EndOfMessage;
    /// Postfix currently ignores the reason text.
    Quarantine { reason: String },
    /// Cause an SMTP-connection failure.
    ConnectionFail,
    /// Skip further events of the same kind (body chunks on Sendmail; any
    /// repeated stage on Postfix).
    Skip,
    /// Still processing; resets the MTA's connection timeout.
    Progress,
}

impl Verdict {
    /// A 5xx rejection with an explicit SMTP reply code.
    pub fn reject_with_code(
        primary: (u8, u8, u8),
        enhanced: Option<(u8, u8, u8)>,
        text: Option<&str>,
    ) -> Result<Self, MilterError> {
        Ok(Self::RejectWithCode(SmtpReply::new(
            5, primary, enhanced, text,
        )?))
    }

    /// A 4xx temporary failure with an explicit SMTP reply code.
    pub fn temp_fail_with_code(
        primary: (u8, u8, u8),
        enhanced: Option<(u8, u8, u8)>,
        text: Option<&str>,
    ) -> Result<Self, MilterError> {
        Ok(Self::TempFailWithCode(SmtpReply::new(
            4, primary, enhanced, text,
        )?))
    }

    /// Encode to the unframed wire payload.
    pub fn encode(&self) -> Bytes {
        match self {
            Verdict::Continue => Bytes::from_static(b"c"),
            Verdict::Accept => Bytes::from_static(b"a"),
            Verdict::Reject => Bytes::from_static(b"r"),
            Verdict::RejectWithCode(reply) | Verdict::TempFailWithCode(reply) => reply.encode(),
            Verdict::Discard => Bytes::from_static(b"d"),
            Verdict::Quarantine { reason } => {
                let mut buf = BytesMut::with_capacity(reason.len() + 2);
                buf.put_u8(b'q');
                buf.put_slice(reason.as_bytes());
                buf.put_u8(0);
                buf.freeze()
            }
            Verdict::ConnectionFail => Bytes::from_static(b"f"),
            Verdict::Skip => Bytes::from_static(b"s"),
            Verdict::Progress => Bytes::from_static(b"p"),
        }
    }
}

/// An SMTP reply code with optional enhanced status code and text, e.g.
/// `551 5.7.1 delivery not authorized`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SmtpReply {
    primary: (u8, u8, u8),
    enhanced: Option<(u8, u8, u8)>,
    text: Option<String>,
}

impl SmtpReply {
    fn new(
        class: u8,
        primary: (u8, u8, u8),
        enhanced: Option<(u8, u8, u8)>,
        text: Option<&str>,
    ) -> Result<Self, MilterError> {
        if primary.0 != class {
            return Err(MilterError::InvalidResponse(format!(
                "reply code must be in the {class}xx class, got {}xx",
                primary.0
            )));
        }
        for digit in [primary.1, primary.2] {
            if digit > 9 {
                return Err(MilterError::InvalidResponse(format!(
                    "reply code digit out of range: {digit}"
                )));
            }
        }
        if let Some((e1, e2, e3)) = enhanced {
            if e1 != 4 && e1 != 5 {
                return Err(MilterError::InvalidResponse(format!(
                    "enhanced status class must be 4 or 5, got {e1}"
                )));
            }
            if e2 > 9 || e3 > 9 {
                return Err(MilterError::InvalidResponse(
                    "enhanced status code digit out of range".into(),
                ));
            }
        }
        Ok(Self {
            primary,
            enhanced,
            text: text.map(str::to_owned),
        })
    }

    fn encode(&self) -> Bytes {
        let (p1, p2, p3) = self.primary;
        let mut parts = vec![format!("{p1}{p2}{p3}")];
        if let Some((e1, e2, e3)) = self.enhanced {
            parts.push(format!("{e1}.{e2}.{e3}"));
        }
        if let Some(text) = &self.text {
            parts.push(text.clone());
        }
        let joined = parts.join(" ");
        let mut buf = BytesMut::with_capacity(joined.len() + 2);
        buf.put_u8(b'y');
        buf.put_slice(joined.as_bytes());
        buf.put_u8(0);
        buf.freeze()
    }
}

// ── Manipulation ─────────────────────────────────────────────────

/// A deferred message modification, collected during the transaction and
/// flushed right before the end-of-message verdict.
///
/// Constructed through the validating methods only; an existing value is
/// always encodable.
#[derive(Debug, Clone, PartialEq)]
pub struct Manipulation {
    kind: ManipulationKind,
}

#[derive(Debug, Clone, PartialEq)]
enum ManipulationKind {
    AddRecipient {
        recipient: String,
    },
    AddRecipientWithEsmtpArgs {
        recipient: String,
        esmtp_args: EsmtpArgs,
    },
    RemoveRecipient {
        recipient: String,
    },
    ReplaceBodyChunk {
        chunk: Bytes,
    },
    ChangeMailFrom {
        mail_from: String,
        esmtp_args: EsmtpArgs,
    },
    AppendHeader {
        name: HeaderName,
        text: String,
    },
    InsertHeader {
        index: u32,
        name: HeaderName,
        text: String,
    },
    ChangeHeader {
        nth_occurrence: u32,
        name: HeaderName,
        text: String,
    },
}

impl Manipulation {
    /// Add a recipient (RCPT TO) to the message. This does not adjust the
    /// `To` header displayed in user agents.
    pub fn add_recipient(recipient: impl Into<String>) -> Self {
        Self {
            kind: ManipulationKind::AddRecipient {
                recipient: recipient.into(),
            },
        }
    }

    pub fn add_recipient_with_esmtp_args(
        recipient: impl Into<String>,
        esmtp_args: EsmtpArgs,
    ) -> Self {
        Self {
            kind: ManipulationKind::AddRecipientWithEsmtpArgs {
                recipient: recipient.into(),
                esmtp_args,
            },
        }
    }

    /// Remove a recipient (RCPT TO) from the message.
    pub fn remove_recipient(recipient: impl Into<String>) -> Self {
        Self {
            kind: ManipulationKind::RemoveRecipient {
                recipient: recipient.into(),
            },
        }
    }

    /// Replace the message body, one chunk at a time. Emit one of these
    /// per chunk when the new body does not fit a single chunk.
    pub fn replace_body_chunk(chunk: impl Into<Bytes>) -> Result<Self, MilterError> {
        let chunk = chunk.into();
        if chunk.len() > MAX_BODY_CHUNK_SIZE {
            return Err(MilterError::InvalidResponse(format!(
                "body chunk of {} bytes exceeds the maximum of {MAX_BODY_CHUNK_SIZE}",
                chunk.len()
            )));
        }
        Ok(Self {
            kind: ManipulationKind::ReplaceBodyChunk { chunk },
        })
    }

    /// Replace the envelope sender (Return-Path). Oddly, the protocol has
    /// separate commands for adding recipients with and without ESMTP
    /// arguments but a single one for changing the envelope-from.
    pub fn change_mail_from(mail_from: impl Into<String>, esmtp_args: EsmtpArgs) -> Self {
        Self {
            kind: ManipulationKind::ChangeMailFrom {
                mail_from: mail_from.into(),
                esmtp_args,
            },
        }
    }

    /// Append a header to the end of the existing set.
    pub fn append_header(
        name: impl Into<String>,
        text: impl Into<String>,
    ) -> Result<Self, MilterError> {
        Ok(Self {
            kind: ManipulationKind::AppendHeader {
                name: HeaderName::new(name)?,
                text: text.into(),
            },
        })
    }

    /// Add a header at a given position. Use [`Manipulation::append_header`]
    /// unless the position matters.
    pub fn insert_header(
        index: u32,
        name: impl Into<String>,
        text: impl Into<String>,
    ) -> Result<Self, MilterError> {
        Ok(Self {
            kind: ManipulationKind::InsertHeader {
                index,
                name: HeaderName::new(name)?,
                text: text.into(),
            },
        })
    }

    /// Replace the nth header with this name; empty text deletes it.
    pub fn change_header(
        nth_occurrence: u32,
        name: impl Into<String>,
        text: impl Into<String>,
    ) -> Result<Self, MilterError> {
        Ok(Self {
            kind: ManipulationKind::ChangeHeader {
                nth_occurrence,
                name: HeaderName::new(name)?,
                text: text.into(),
            },
        })
    }

    /// Encode to the unframed wire payload.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        match &self.kind {
            ManipulationKind::AddRecipient { recipient } => {
                buf.put_u8(b'+');
                put_nul_str(&mut buf, recipient);
            }
            ManipulationKind::AddRecipientWithEsmtpArgs {
                recipient,
                esmtp_args,
            } => {
                buf.put_u8(b'2');
                put_nul_str(&mut buf, recipient);
                put_nul_str(&mut buf, &esmtp_args.to_wire_string());
            }
            ManipulationKind::RemoveRecipient { recipient } => {
                buf.put_u8(b'-');
                put_nul_str(&mut buf, recipient);
            }
            ManipulationKind::ReplaceBodyChunk { chunk } => {
                buf.put_u8(b'b');
                buf.put_slice(chunk);
            }
            ManipulationKind::ChangeMailFrom {
                mail_from,
                esmtp_args,
            } => {
                buf.put_u8(b'e');
                put_nul_str(&mut buf, mail_from);
                if !esmtp_args.is_empty() {
                    put_nul_str(&mut buf, &esmtp_args.to_wire_string());
                }
            }
            ManipulationKind::AppendHeader { name, text } => {
                buf.put_u8(b'h');
                put_nul_str(&mut buf, name.as_str());
                put_nul_str(&mut buf, text);
            }
            ManipulationKind::InsertHeader { index, name, text } => {
                buf.put_u8(b'i');
                buf.put_u32(*index);
                put_nul_str(&mut buf, name.as_str());
                put_nul_str(&mut buf, text);
            }
            ManipulationKind::ChangeHeader {
                nth_occurrence,
                name,
                text,
            } => {
                buf.put_u8(b'm');
                buf.put_u32(*nth_occurrence);
                put_nul_str(&mut buf, name.as_str());
                put_nul_str(&mut buf, text);
            }
        }
        buf.freeze()
    }
}

fn put_nul_str(buf: &mut BytesMut, s: &str) {
    buf.put_slice(s.as_bytes());
    buf.put_u8(0);
}

// ── Reply ────────────────────────────────────────────────────────

/// What an application callback hands back: a verdict plus any number of
/// manipulations to stage for the end-of-message flush.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Reply {
    pub verdict: Verdict,
    pub manipulations: Vec<Manipulation>,
}

impl Reply {
    /// `Continue` with the given manipulations staged.
    pub fn continue_with(manipulations: Vec<Manipulation>) -> Self {
        Self {
            verdict: Verdict::Continue,
            manipulations,
        }
    }
}

impl From<Verdict> for Reply {
    fn from(verdict: Verdict) -> Self {
        Self {
            verdict,
            manipulations: Vec::new(),
        }
    }
}

// ── OptionsNegotiateResponse ─────────────────────────────────────

/// The milter's half of the capability negotiation. Only here can the
/// requested macro symbols per stage be communicated: despite what the
/// libmilter headers suggest about SMFIR_SETSYMLIST, the lists ride along
/// in the negotiation reply payload.
#[derive(Debug, Clone, PartialEq)]
pub struct OptionsNegotiateResponse {
    pub flags: ProtocolFlags,
    pub symbols: SymbolMap,
}

impl OptionsNegotiateResponse {
    pub fn encode(&self) -> Bytes {
        let (protocol_flags, action_flags) = self.flags.encode_to_bitmasks();
        let mut buf = BytesMut::new();
        buf.put_u8(b'O');
        buf.put_u32(definitions::VERSION);
        buf.put_u32(action_flags);
        buf.put_u32(protocol_flags);
        for (stage, symbols) in &self.symbols {
            buf.put_u32(stage.wire_code());
            let joined = symbols.iter().cloned().collect::<Vec<_>>().join(" ");
            put_nul_str(&mut buf, &joined);
        }
        buf.freeze()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn symbols(entries: &[(MacroStage, &[&str])]) -> SymbolMap {
        entries
            .iter()
            .map(|(stage, syms)| {
                (
                    *stage,
                    syms.iter().map(|s| s.to_string()).collect::<BTreeSet<_>>(),
                )
            })
            .collect()
    }

    // ── HeaderName ──

    #[test]
    fn header_name_accepts_rfc5322_names() {
        assert!(HeaderName::new("From").is_ok());
        assert!(HeaderName::new("X-Spam-Level").is_ok());
        assert!(HeaderName::new("!#$%&'*+-.^_`|~").is_ok());
    }

    #[test]
    fn header_name_rejects_invalid_names() {
        assert!(HeaderName::new("").is_err());
        assert!(HeaderName::new("From:").is_err());
        assert!(HeaderName::new("With Space").is_err());
        assert!(HeaderName::new("Uni\u{e7}ode").is_err());
        assert!(HeaderName::new("tab\there").is_err());
    }

    // ── Verdicts ──

    #[test]
    fn no_data_verdicts_encode_to_single_chars() {
        assert_eq!(&Verdict::Continue.encode()[..], b"c");
        assert_eq!(&Verdict::Accept.encode()[..], b"a");
        assert_eq!(&Verdict::Reject.encode()[..], b"r");
        assert_eq!(&Verdict::Discard.encode()[..], b"d");
        assert_eq!(&Verdict::ConnectionFail.encode()[..], b"f");
        assert_eq!(&Verdict::Skip.encode()[..], b"s");
        assert_eq!(&Verdict::Progress.encode()[..], b"p");
    }

    #[test]
    fn reject_with_code_full_form() {
        let verdict = Verdict::reject_with_code(
            (5, 5, 1),
            Some((5, 7, 1)),
            Some("Delivery not authorized"),
        )
        .unwrap();
        assert_eq!(
            &verdict.encode()[..],
            b"y551 5.7.1 Delivery not authorized\x00"
        );
    }

    #[test]
    fn reject_with_code_minimal_form() {
        let verdict = Verdict::reject_with_code((5, 5, 0), None, None).unwrap();
        assert_eq!(&verdict.encode()[..], b"y550\x00");
    }

    #[test]
    fn temp_fail_with_code() {
        let verdict = Verdict::temp_fail_with_code((4, 5, 0), None, Some("try later")).unwrap();
        assert_eq!(&verdict.encode()[..], b"y450 try later\x00");
    }

    #[test]
    fn reply_codes_validate_class_and_digits() {
        assert!(Verdict::reject_with_code((4, 5, 0), None, None).is_err());
        assert!(Verdict::temp_fail_with_code((5, 5, 0), None, None).is_err());
        assert!(Verdict::reject_with_code((5, 12, 0), None, None).is_err());
        assert!(Verdict::reject_with_code((5, 5, 0), Some((3, 1, 1)), None).is_err());
        assert!(Verdict::reject_with_code((5, 5, 0), Some((5, 10, 1)), None).is_err());
    }

    #[test]
    fn quarantine_encodes_reason() {
        let verdict = Verdict::Quarantine {
            reason: "suspicious attachment".into(),
        };
        assert_eq!(&verdict.encode()[..], b"qsuspicious attachment\x00");
    }

    // ── Manipulations ──

    #[test]
    fn add_and_remove_recipient() {
        let m = Manipulation::add_recipient("<other@example.com>");
        assert_eq!(&m.encode()[..], b"+<other@example.com>\x00");

        let m = Manipulation::remove_recipient("<other@example.com>");
        assert_eq!(&m.encode()[..], b"-<other@example.com>\x00");
    }

    #[test]
    fn add_recipient_with_esmtp_args() {
        let args: EsmtpArgs = [
            ("NOTIFY", Some("NEVER".to_string())),
            ("FOO", None),
        ]
        .into_iter()
        .collect();
        let m = Manipulation::add_recipient_with_esmtp_args("<other@example.com>", args);
        assert_eq!(&m.encode()[..], b"2<other@example.com>\x00NOTIFY=NEVER FOO\x00");
    }

    #[test]
    fn replace_body_chunk_encodes_raw() {
        let m = Manipulation::replace_body_chunk(&b"new body\r\n"[..]).unwrap();
        assert_eq!(&m.encode()[..], b"bnew body\r\n");
    }

    #[test]
    fn replace_body_chunk_bounds() {
        assert!(Manipulation::replace_body_chunk(vec![b'x'; MAX_BODY_CHUNK_SIZE]).is_ok());
        assert!(Manipulation::replace_body_chunk(vec![b'x'; MAX_BODY_CHUNK_SIZE + 1]).is_err());
    }

    #[test]
    fn change_mail_from_with_and_without_args() {
        let m = Manipulation::change_mail_from("<bounce@example.com>", EsmtpArgs::new());
        assert_eq!(&m.encode()[..], b"e<bounce@example.com>\x00");

        let args: EsmtpArgs = [("BODY", Some("8BITMIME".to_string()))].into_iter().collect();
        let m = Manipulation::change_mail_from("<bounce@example.com>", args);
        assert_eq!(&m.encode()[..], b"e<bounce@example.com>\x00BODY=8BITMIME\x00");
    }

    #[test]
    fn append_header_matches_wire_form() {
        let m = Manipulation::append_header("From", "Display Name <user@example.com>").unwrap();
        assert_eq!(
            &m.encode()[..],
            b"hFrom\x00Display Name <user@example.com>\x00"
        );
    }

    #[test]
    fn insert_header_carries_index() {
        let m = Manipulation::insert_header(0, "X-First", "on top").unwrap();
        assert_eq!(&m.encode()[..], b"i\x00\x00\x00\x00X-First\x00on top\x00");

        let m = Manipulation::insert_header(4, "X-Later", "further down").unwrap();
        assert_eq!(&m.encode()[..], b"i\x00\x00\x00\x04X-Later\x00further down\x00");
    }

    #[test]
    fn change_header_empty_text_deletes() {
        let m = Manipulation::change_header(1, "X-Spam-Level", "").unwrap();
        assert_eq!(&m.encode()[..], b"m\x00\x00\x00\x01X-Spam-Level\x00\x00");
    }

    #[test]
    fn header_manipulations_validate_names() {
        assert!(Manipulation::append_header("With:Colon", "x").is_err());
        assert!(Manipulation::insert_header(0, "", "x").is_err());
        assert!(Manipulation::change_header(0, "spa ced", "x").is_err());
    }

    // ── OptionsNegotiateResponse ──

    #[test]
    fn negotiate_response_without_symbols() {
        let response = OptionsNegotiateResponse {
            flags: ProtocolFlags::default(),
            symbols: SymbolMap::new(),
        };
        let encoded = response.encode();
        assert_eq!(&encoded[..5], b"O\x00\x00\x00\x06");
        // action flags, then protocol flags.
        assert_eq!(&encoded[5..9], b"\x00\x00\x01\x00");
        assert_eq!(&encoded[9..13], b"\x00\x0f\xf7\xff");
        assert_eq!(encoded.len(), 13);
    }

    #[test]
    fn negotiate_response_symbol_lists_sorted() {
        let response = OptionsNegotiateResponse {
            flags: ProtocolFlags::default(),
            symbols: symbols(&[
                (MacroStage::Connect, &["{daemon_addr}", "j"]),
                (MacroStage::EndOfMessage, &[]),
            ]),
        };
        let encoded = response.encode();
        let tail = &encoded[13..];
        assert_eq!(
            tail,
            &b"\x00\x00\x00\x00j {daemon_addr}\x00\x00\x00\x00\x05\x00"[..]
        );
    }

    #[test]
    fn negotiate_response_stages_in_wire_order() {
        let response = OptionsNegotiateResponse {
            flags: ProtocolFlags::default(),
            symbols: symbols(&[
                (MacroStage::Header, &["i"]),
                (MacroStage::Connect, &["j"]),
            ]),
        };
        let encoded = response.encode();
        let tail = &encoded[13..];
        // Connect (0) must precede Header (7).
        assert_eq!(tail, &b"\x00\x00\x00\x00j\x00\x00\x00\x00\x07i\x00"[..]);
    }

    #[test]
    fn reply_defaults_to_continue() {
        let reply = Reply::default();
        assert_eq!(reply.verdict, Verdict::Continue);
        assert!(reply.manipulations.is_empty());
    }
}
