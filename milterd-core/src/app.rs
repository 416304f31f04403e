//! The application-facing contract.
//!
//! A milter application implements [`MilterApp`]: per-stage async hooks
//! plus an explicit statement of which callbacks it wants and which of
//! them reply ([`ProtocolFlags`]). The session consults those flags for
//! dispatch; a hook for a stage that was not requested is never invoked,
//! and a verdict returned from a no-reply stage is dropped (only its
//! manipulations are kept).
//!
//! Apps are instantiated per connection through an [`AppFactory`].

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::MilterError;
use crate::flags::ProtocolFlags;
use crate::protocol::commands::{
    BodyChunk, Connect, Data, EndOfHeaders, EndOfMessage, Header, Helo, MailFrom, RcptTo, Unknown,
};
use crate::protocol::responses::{Reply, SymbolMap};

/// What a stage hook hands back: nothing (no reply / `Continue`), or a
/// verdict with optional manipulations.
pub type HookResult = Result<Option<Reply>, MilterError>;

/// Per-connection milter application instance.
///
/// Every hook has a no-op default, so an implementation only overrides the
/// stages it enabled in its [`ProtocolFlags`].
#[async_trait]
pub trait MilterApp: Send + Sync {
    /// Application name, used in log messages.
    fn name(&self) -> &str;

    /// Which callbacks this app wants, which of them reply, and which
    /// message modifications it may perform. Must be consistent for the
    /// lifetime of the process; validated at server start.
    fn protocol_flags(&self) -> ProtocolFlags;

    /// Macro symbols to request per stage. An empty set for a stage
    /// suppresses all macros for it; an absent stage keeps the MTA's
    /// default list. The default requests nothing special.
    fn symbols(&self) -> SymbolMap {
        SymbolMap::new()
    }

    async fn on_connect(&mut self, _command: &Connect) -> HookResult {
        Ok(None)
    }

    async fn on_helo(&mut self, _command: &Helo) -> HookResult {
        Ok(None)
    }

    async fn on_mail_from(&mut self, _command: &MailFrom) -> HookResult {
        Ok(None)
    }

    async fn on_rcpt_to(&mut self, _command: &RcptTo) -> HookResult {
        Ok(None)
    }

    async fn on_data(&mut self, _command: &Data) -> HookResult {
        Ok(None)
    }

    async fn on_header(&mut self, _command: &Header) -> HookResult {
        Ok(None)
    }

    async fn on_end_of_headers(&mut self, _command: &EndOfHeaders) -> HookResult {
        Ok(None)
    }

    /// May return [`Verdict::Skip`](crate::protocol::responses::Verdict::Skip)
    /// to tell the MTA to stop sending body chunks.
    async fn on_body_chunk(&mut self, _command: &BodyChunk) -> HookResult {
        Ok(None)
    }

    /// The only stage whose reply is mandatory. Returning `Ok(None)` is
    /// interpreted as `Continue` with no additional manipulations.
    async fn on_end_of_message(&mut self, _command: &EndOfMessage) -> HookResult {
        Ok(None)
    }

    async fn on_unknown(&mut self, _command: &Unknown) -> HookResult {
        Ok(None)
    }

    /// The MTA aborted the current message. Never replied to.
    async fn on_abort(&mut self) -> Result<(), MilterError> {
        Ok(())
    }

    /// The MTA is closing the milter channel. Never replied to.
    async fn on_quit(&mut self) -> Result<(), MilterError> {
        Ok(())
    }

    /// Called exactly once when the connection goes away underneath us
    /// (bottom-up close).
    async fn on_mta_close_connection(&mut self) -> Result<(), MilterError> {
        Ok(())
    }
}

/// Builds one app instance per MTA connection.
pub type AppFactory = Arc<dyn Fn() -> Box<dyn MilterApp> + Send + Sync>;

#[cfg(test)]
mod tests {
    use super::*;

    struct MinimalApp;

    #[async_trait]
    impl MilterApp for MinimalApp {
        fn name(&self) -> &str {
            "minimal"
        }

        fn protocol_flags(&self) -> ProtocolFlags {
            ProtocolFlags::default()
        }
    }

    #[tokio::test]
    async fn default_hooks_return_nothing() {
        let mut app = MinimalApp;
        let eom = EndOfMessage::default();
        assert!(app.on_end_of_message(&eom).await.unwrap().is_none());
        assert!(app.on_abort().await.is_ok());
        assert!(app.on_mta_close_connection().await.is_ok());
    }

    #[test]
    fn factory_builds_boxed_apps() {
        let factory: AppFactory = Arc::new(|| Box::new(MinimalApp));
        let app = factory();
        assert_eq!(app.name(), "minimal");
        assert!(app.protocol_flags().validate().is_ok());
    }
}
