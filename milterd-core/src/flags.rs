//! Capability negotiation model.
//!
//! The wire carries two u32 bitmasks: protocol flags (which callbacks the
//! MTA sends and which replies the milter emits) and action flags (which
//! message modifications the milter may perform). Callback and reply bits
//! use *disable* polarity on the wire: a clear bit means enabled.
//!
//! [`ProtocolFlags`] is the application-facing boolean form; it encodes to
//! the bitmasks for the negotiation response. [`MtaCapabilities`] is the
//! decoded form of what the MTA advertised in its OptionsNegotiate.

use bitflags::bitflags;

use crate::error::MilterError;

bitflags! {
    /// Protocol-flag bitmask (SMFIP_* in libmilter terms).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ProtocolOpts: u32 {
        /// Skip the Connect callback.
        const NO_CONNECT = 0x0000_0001;
        /// Skip the Helo callback.
        const NO_HELO = 0x0000_0002;
        /// Skip the MailFrom callback.
        const NO_MAIL_FROM = 0x0000_0004;
        /// Skip the RcptTo callback.
        const NO_RCPT_TO = 0x0000_0008;
        /// Skip the BodyChunk callback.
        const NO_BODY = 0x0000_0010;
        /// Skip the Header callback.
        const NO_HEADERS = 0x0000_0020;
        /// Skip the EndOfHeaders callback.
        const NO_END_OF_HEADERS = 0x0000_0040;
        /// No reply to Header commands.
        const NR_HEADERS = 0x0000_0080;
        /// Skip the Unknown callback.
        const NO_UNKNOWN = 0x0000_0100;
        /// Skip the Data callback.
        const NO_DATA = 0x0000_0200;
        /// The Skip response is understood.
        const SKIP = 0x0000_0400;
        /// Also deliver RcptTo callbacks for already-rejected recipients.
        const SEND_REJECTED_RCPT_TOS = 0x0000_0800;
        /// No reply to Connect commands.
        const NR_CONNECT = 0x0000_1000;
        /// No reply to Helo commands.
        const NR_HELO = 0x0000_2000;
        /// No reply to MailFrom commands.
        const NR_MAIL_FROM = 0x0000_4000;
        /// No reply to RcptTo commands.
        const NR_RCPT_TO = 0x0000_8000;
        /// No reply to Data commands.
        const NR_DATA = 0x0001_0000;
        /// No reply to Unknown commands.
        const NR_UNKNOWN = 0x0002_0000;
        /// No reply to EndOfHeaders commands.
        const NR_END_OF_HEADERS = 0x0004_0000;
        /// No reply to BodyChunk commands.
        const NR_BODY = 0x0008_0000;
        /// Keep leading spaces in unfolded header values.
        const HEADER_VALUE_LEADING_SPACE = 0x0010_0000;
    }
}

bitflags! {
    /// Action-flag bitmask (SMFIF_* in libmilter terms).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ActionOpts: u32 {
        const ADD_HEADERS = 0x0000_0001;
        const CHANGE_BODY = 0x0000_0002;
        const ADD_RECIPIENTS = 0x0000_0004;
        const REMOVE_RECIPIENTS = 0x0000_0008;
        const CHANGE_HEADERS = 0x0000_0010;
        const QUARANTINE = 0x0000_0020;
        const CHANGE_ENVELOPE_FROM = 0x0000_0040;
        const ADD_RECIPIENT_ESMTP_ARGS = 0x0000_0080;
        const SET_MACROS_LIST = 0x0000_0100;
    }
}

// ── ProtocolFlags ────────────────────────────────────────────────

/// What the application requests from the MTA, in boolean form.
///
/// Default values reflect the very minimum negotiation: no callbacks
/// besides the mandatory EndOfMessage, no replies except where the
/// protocol demands them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtocolFlags {
    pub call_connect: bool,
    pub call_helo: bool,
    pub call_mail_from: bool,
    pub call_rcpt_to: bool,
    pub call_rcpt_to_rejected: bool,
    pub call_data: bool,
    pub call_headers: bool,
    pub call_end_of_headers: bool,
    pub call_body_chunk: bool,
    pub call_unknown: bool,

    pub reply_connect: bool,
    pub reply_helo: bool,
    pub reply_mail_from: bool,
    pub reply_rcpt_to: bool,
    pub reply_data: bool,
    pub reply_headers: bool,
    pub reply_end_of_headers: bool,
    pub reply_body_chunk: bool,
    pub reply_unknown: bool,

    pub can_change_mail_from: bool,
    pub can_add_headers: bool,
    pub can_change_headers: bool,
    pub can_change_body: bool,
    pub can_add_recipients: bool,
    pub can_add_recipients_with_esmtp_args: bool,
    pub can_remove_recipients: bool,
    pub can_quarantine: bool,
    pub can_specify_macros: bool,
    pub can_skip_body_chunks: bool,

    pub headers_with_leading_space: bool,
}

impl Default for ProtocolFlags {
    fn default() -> Self {
        Self {
            call_connect: false,
            call_helo: false,
            call_mail_from: false,
            call_rcpt_to: false,
            call_rcpt_to_rejected: false,
            call_data: false,
            call_headers: false,
            call_end_of_headers: false,
            call_body_chunk: false,
            call_unknown: false,

            reply_connect: false,
            reply_helo: false,
            reply_mail_from: false,
            reply_rcpt_to: false,
            reply_data: false,
            reply_headers: false,
            reply_end_of_headers: false,
            reply_body_chunk: false,
            reply_unknown: false,

            can_change_mail_from: false,
            can_add_headers: false,
            can_change_headers: false,
            can_change_body: false,
            can_add_recipients: false,
            can_add_recipients_with_esmtp_args: false,
            can_remove_recipients: false,
            can_quarantine: false,
            can_specify_macros: true,
            can_skip_body_chunks: true,

            headers_with_leading_space: false,
        }
    }
}

impl ProtocolFlags {
    /// Encode to the `(protocol, action)` bitmask pair for the
    /// options-negotiate response.
    pub fn encode_to_bitmasks(&self) -> (u32, u32) {
        let mut protocol = ProtocolOpts::empty();
        let mut action = ActionOpts::empty();

        // Callback bits use disable polarity: clear = stage enabled.
        protocol.set(ProtocolOpts::NO_CONNECT, !self.call_connect);
        protocol.set(ProtocolOpts::NO_HELO, !self.call_helo);
        protocol.set(ProtocolOpts::NO_MAIL_FROM, !self.call_mail_from);
        protocol.set(ProtocolOpts::NO_RCPT_TO, !self.call_rcpt_to);
        protocol.set(ProtocolOpts::NO_DATA, !self.call_data);
        protocol.set(ProtocolOpts::NO_HEADERS, !self.call_headers);
        protocol.set(ProtocolOpts::NO_END_OF_HEADERS, !self.call_end_of_headers);
        protocol.set(ProtocolOpts::NO_BODY, !self.call_body_chunk);
        protocol.set(ProtocolOpts::NO_UNKNOWN, !self.call_unknown);
        protocol.set(
            ProtocolOpts::SEND_REJECTED_RCPT_TOS,
            self.call_rcpt_to_rejected,
        );

        // Reply bits, same disable-to-encode polarity.
        protocol.set(ProtocolOpts::NR_CONNECT, !self.reply_connect);
        protocol.set(ProtocolOpts::NR_HELO, !self.reply_helo);
        protocol.set(ProtocolOpts::NR_MAIL_FROM, !self.reply_mail_from);
        protocol.set(ProtocolOpts::NR_RCPT_TO, !self.reply_rcpt_to);
        protocol.set(ProtocolOpts::NR_DATA, !self.reply_data);
        protocol.set(ProtocolOpts::NR_HEADERS, !self.reply_headers);
        protocol.set(ProtocolOpts::NR_END_OF_HEADERS, !self.reply_end_of_headers);
        protocol.set(ProtocolOpts::NR_BODY, !self.reply_body_chunk);
        protocol.set(ProtocolOpts::NR_UNKNOWN, !self.reply_unknown);

        protocol.set(ProtocolOpts::SKIP, self.can_skip_body_chunks);
        protocol.set(
            ProtocolOpts::HEADER_VALUE_LEADING_SPACE,
            self.headers_with_leading_space,
        );

        action.set(ActionOpts::CHANGE_ENVELOPE_FROM, self.can_change_mail_from);
        action.set(ActionOpts::ADD_HEADERS, self.can_add_headers);
        action.set(ActionOpts::CHANGE_HEADERS, self.can_change_headers);
        action.set(ActionOpts::CHANGE_BODY, self.can_change_body);
        action.set(ActionOpts::ADD_RECIPIENTS, self.can_add_recipients);
        action.set(
            ActionOpts::ADD_RECIPIENT_ESMTP_ARGS,
            self.can_add_recipients_with_esmtp_args,
        );
        action.set(ActionOpts::REMOVE_RECIPIENTS, self.can_remove_recipients);
        action.set(ActionOpts::QUARANTINE, self.can_quarantine);
        action.set(ActionOpts::SET_MACROS_LIST, self.can_specify_macros);

        (protocol.bits(), action.bits())
    }

    /// Check the configuration for contradictions.
    ///
    /// A reply bit for a stage whose callback is disabled can never be
    /// honored; this is a configuration mistake, not an MTA problem.
    pub fn validate(&self) -> Result<(), MilterError> {
        let pairs = [
            (self.call_connect, self.reply_connect, "connect"),
            (self.call_helo, self.reply_helo, "helo"),
            (self.call_mail_from, self.reply_mail_from, "mail-from"),
            (self.call_rcpt_to, self.reply_rcpt_to, "rcpt-to"),
            (self.call_data, self.reply_data, "data"),
            (self.call_headers, self.reply_headers, "header"),
            (
                self.call_end_of_headers,
                self.reply_end_of_headers,
                "end-of-headers",
            ),
            (self.call_body_chunk, self.reply_body_chunk, "body"),
            (self.call_unknown, self.reply_unknown, "unknown"),
        ];
        for (call, reply, stage) in pairs {
            if reply && !call {
                return Err(MilterError::ProgrammingError(format!(
                    "reply requested for disabled {stage} callback"
                )));
            }
        }
        if self.call_rcpt_to_rejected && !self.call_rcpt_to {
            return Err(MilterError::ProgrammingError(
                "rejected-recipient delivery requires the rcpt-to callback".into(),
            ));
        }
        Ok(())
    }
}

// ── MtaCapabilities ──────────────────────────────────────────────

/// What the MTA reported in its OptionsNegotiate command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MtaCapabilities {
    pub disable_call_connect: bool,
    pub disable_call_helo: bool,
    pub disable_call_mail_from: bool,
    pub disable_call_rcpt_to: bool,
    pub disable_call_rcpt_to_rejected: bool,
    pub disable_call_data: bool,
    pub disable_call_headers: bool,
    pub disable_call_end_of_headers: bool,
    pub disable_call_body_chunk: bool,
    pub disable_call_unknown: bool,

    pub disable_reply_connect: bool,
    pub disable_reply_helo: bool,
    pub disable_reply_mail_from: bool,
    pub disable_reply_rcpt_to: bool,
    pub disable_reply_data: bool,
    pub disable_reply_headers: bool,
    pub disable_reply_end_of_headers: bool,
    pub disable_reply_body_chunk: bool,
    pub disable_reply_unknown: bool,

    pub allows_change_mail_from: bool,
    pub allows_add_headers: bool,
    pub allows_change_headers: bool,
    pub allows_change_body: bool,
    pub allows_add_recipients: bool,
    pub allows_add_recipients_with_esmtp_args: bool,
    pub allows_remove_recipients: bool,
    pub allows_quarantine: bool,
    pub allows_specify_macros: bool,
    pub allows_skip_body_chunks: bool,

    pub headers_with_leading_space: bool,
}

impl MtaCapabilities {
    /// Decode the `(protocol, action)` bitmask pair sent by the MTA.
    pub fn from_bitmasks(protocol: u32, action: u32) -> Self {
        let p = ProtocolOpts::from_bits_retain(protocol);
        let a = ActionOpts::from_bits_retain(action);
        Self {
            disable_call_connect: p.contains(ProtocolOpts::NO_CONNECT),
            disable_call_helo: p.contains(ProtocolOpts::NO_HELO),
            disable_call_mail_from: p.contains(ProtocolOpts::NO_MAIL_FROM),
            disable_call_rcpt_to: p.contains(ProtocolOpts::NO_RCPT_TO),
            disable_call_rcpt_to_rejected: p.contains(ProtocolOpts::SEND_REJECTED_RCPT_TOS),
            disable_call_data: p.contains(ProtocolOpts::NO_DATA),
            disable_call_headers: p.contains(ProtocolOpts::NO_HEADERS),
            disable_call_end_of_headers: p.contains(ProtocolOpts::NO_END_OF_HEADERS),
            disable_call_body_chunk: p.contains(ProtocolOpts::NO_BODY),
            disable_call_unknown: p.contains(ProtocolOpts::NO_UNKNOWN),

            disable_reply_connect: p.contains(ProtocolOpts::NR_CONNECT),
            disable_reply_helo: p.contains(ProtocolOpts::NR_HELO),
            disable_reply_mail_from: p.contains(ProtocolOpts::NR_MAIL_FROM),
            disable_reply_rcpt_to: p.contains(ProtocolOpts::NR_RCPT_TO),
            disable_reply_data: p.contains(ProtocolOpts::NR_DATA),
            disable_reply_headers: p.contains(ProtocolOpts::NR_HEADERS),
            disable_reply_end_of_headers: p.contains(ProtocolOpts::NR_END_OF_HEADERS),
            disable_reply_body_chunk: p.contains(ProtocolOpts::NR_BODY),
            disable_reply_unknown: p.contains(ProtocolOpts::NR_UNKNOWN),

            allows_change_mail_from: a.contains(ActionOpts::CHANGE_ENVELOPE_FROM),
            allows_add_headers: a.contains(ActionOpts::ADD_HEADERS),
            allows_change_headers: a.contains(ActionOpts::CHANGE_HEADERS),
            allows_change_body: a.contains(ActionOpts::CHANGE_BODY),
            allows_add_recipients: a.contains(ActionOpts::ADD_RECIPIENTS),
            allows_add_recipients_with_esmtp_args: a.contains(ActionOpts::ADD_RECIPIENT_ESMTP_ARGS),
            allows_remove_recipients: a.contains(ActionOpts::REMOVE_RECIPIENTS),
            allows_quarantine: a.contains(ActionOpts::QUARANTINE),
            allows_specify_macros: a.contains(ActionOpts::SET_MACROS_LIST),
            allows_skip_body_chunks: p.contains(ProtocolOpts::SKIP),

            headers_with_leading_space: p.contains(ProtocolOpts::HEADER_VALUE_LEADING_SPACE),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_flags_encode_to_minimal_negotiation() {
        let (protocol, action) = ProtocolFlags::default().encode_to_bitmasks();
        // All callback-disable and reply-disable bits set, plus SKIP.
        assert_eq!(protocol, 0x000F_F7FF);
        // Only SET_MACROS_LIST advertised.
        assert_eq!(action, 0x0000_0100);
    }

    #[test]
    fn enabled_callback_clears_disable_bit() {
        let flags = ProtocolFlags {
            call_connect: true,
            reply_connect: true,
            ..Default::default()
        };
        let (protocol, _) = flags.encode_to_bitmasks();
        assert_eq!(protocol & ProtocolOpts::NO_CONNECT.bits(), 0);
        assert_eq!(protocol & ProtocolOpts::NR_CONNECT.bits(), 0);
        assert_ne!(protocol & ProtocolOpts::NO_HELO.bits(), 0);
    }

    #[test]
    fn rejected_rcpt_tos_is_enable_polarity() {
        let flags = ProtocolFlags {
            call_rcpt_to: true,
            call_rcpt_to_rejected: true,
            ..Default::default()
        };
        let (protocol, _) = flags.encode_to_bitmasks();
        assert_ne!(protocol & ProtocolOpts::SEND_REJECTED_RCPT_TOS.bits(), 0);
    }

    #[test]
    fn action_bits() {
        let flags = ProtocolFlags {
            can_add_headers: true,
            can_change_body: true,
            can_quarantine: true,
            can_specify_macros: false,
            ..Default::default()
        };
        let (_, action) = flags.encode_to_bitmasks();
        assert_eq!(
            action,
            (ActionOpts::ADD_HEADERS | ActionOpts::CHANGE_BODY | ActionOpts::QUARANTINE).bits()
        );
    }

    #[test]
    fn mta_capabilities_from_all_flags() {
        let caps = MtaCapabilities::from_bitmasks(crate::definitions::PROTOCOL_FLAGS_ALL, 0x1FF);
        assert!(caps.disable_call_connect);
        assert!(caps.disable_reply_body_chunk);
        assert!(caps.allows_skip_body_chunks);
        assert!(caps.headers_with_leading_space);
        assert!(caps.allows_add_headers);
        assert!(caps.allows_specify_macros);
    }

    #[test]
    fn mta_capabilities_from_zero_flags() {
        let caps = MtaCapabilities::from_bitmasks(0, 0);
        assert!(!caps.disable_call_connect);
        assert!(!caps.allows_quarantine);
        assert!(!caps.allows_skip_body_chunks);
    }

    #[test]
    fn bitmask_roundtrip_through_capabilities() {
        let flags = ProtocolFlags {
            call_connect: true,
            call_body_chunk: true,
            reply_body_chunk: true,
            can_add_headers: true,
            ..Default::default()
        };
        let (protocol, action) = flags.encode_to_bitmasks();
        let caps = MtaCapabilities::from_bitmasks(protocol, action);
        assert!(!caps.disable_call_connect);
        assert!(caps.disable_call_helo);
        assert!(!caps.disable_reply_body_chunk);
        assert!(caps.allows_add_headers);
    }

    #[test]
    fn validate_rejects_reply_without_callback() {
        let flags = ProtocolFlags {
            reply_helo: true,
            ..Default::default()
        };
        assert!(matches!(
            flags.validate(),
            Err(MilterError::ProgrammingError(_))
        ));
    }

    #[test]
    fn validate_rejects_rejected_rcpts_without_rcpt_callback() {
        let flags = ProtocolFlags {
            call_rcpt_to_rejected: true,
            ..Default::default()
        };
        assert!(flags.validate().is_err());
    }

    #[test]
    fn validate_accepts_consistent_config() {
        let flags = ProtocolFlags {
            call_connect: true,
            reply_connect: true,
            call_rcpt_to: true,
            call_rcpt_to_rejected: true,
            ..Default::default()
        };
        assert!(flags.validate().is_ok());
    }
}
