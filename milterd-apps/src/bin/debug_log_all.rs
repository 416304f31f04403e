//! Milter that only logs every event, for protocol debugging.
//!
//! Requests every callback (including rejected recipients) and leaves the
//! MTA's default macro lists untouched, so everything the MTA sends shows
//! up in the logs.

use std::sync::Arc;

use async_trait::async_trait;
use clap::Parser;
use tracing::info;

use milterd_apps::{CommonArgs, init_tracing};
use milterd_core::{
    AppFactory, BodyChunk, Connect, Data, EndOfHeaders, EndOfMessage, Header, Helo, HookResult,
    MailFrom, MilterApp, MilterError, MilterServer, ProtocolFlags, RcptTo, Unknown,
};

#[derive(Parser, Debug)]
#[command(
    name = "debug-log-all",
    about = "Milter app that only logs all events for debugging purposes"
)]
struct Cli {
    #[command(flatten)]
    common: CommonArgs,
}

struct DebugLogAll;

#[async_trait]
impl MilterApp for DebugLogAll {
    fn name(&self) -> &str {
        "debug_log_all"
    }

    fn protocol_flags(&self) -> ProtocolFlags {
        ProtocolFlags {
            call_connect: true,
            call_helo: true,
            call_mail_from: true,
            call_rcpt_to: true,
            call_rcpt_to_rejected: true,
            call_data: true,
            call_headers: true,
            call_end_of_headers: true,
            call_body_chunk: true,
            call_unknown: true,
            ..Default::default()
        }
    }

    async fn on_connect(&mut self, command: &Connect) -> HookResult {
        info!(info = ?command.info, macros = ?command.macros, "on connect");
        Ok(None)
    }

    async fn on_helo(&mut self, command: &Helo) -> HookResult {
        info!(hostname = %command.hostname, macros = ?command.macros, "on HELO");
        Ok(None)
    }

    async fn on_mail_from(&mut self, command: &MailFrom) -> HookResult {
        info!(
            address = %command.address,
            esmtp_args = ?command.esmtp_args,
            macros = ?command.macros,
            "on MAIL FROM"
        );
        Ok(None)
    }

    async fn on_rcpt_to(&mut self, command: &RcptTo) -> HookResult {
        info!(
            address = %command.address,
            esmtp_args = ?command.esmtp_args,
            macros = ?command.macros,
            "on RCPT TO"
        );
        Ok(None)
    }

    async fn on_data(&mut self, command: &Data) -> HookResult {
        info!(macros = ?command.macros, "on DATA");
        Ok(None)
    }

    async fn on_header(&mut self, command: &Header) -> HookResult {
        info!(
            name = %command.name,
            text = %command.text,
            macros = ?command.macros,
            "on header"
        );
        Ok(None)
    }

    async fn on_end_of_headers(&mut self, command: &EndOfHeaders) -> HookResult {
        info!(macros = ?command.macros, "on end of headers");
        Ok(None)
    }

    async fn on_body_chunk(&mut self, command: &BodyChunk) -> HookResult {
        info!(
            length = command.data.len(),
            macros = ?command.macros,
            "on body chunk"
        );
        Ok(None)
    }

    async fn on_end_of_message(&mut self, command: &EndOfMessage) -> HookResult {
        info!(macros = ?command.macros, "on end of message");
        Ok(None)
    }

    async fn on_unknown(&mut self, command: &Unknown) -> HookResult {
        info!(data = ?command.data, "on unknown command");
        Ok(None)
    }

    async fn on_abort(&mut self) -> Result<(), MilterError> {
        info!("on abort");
        Ok(())
    }

    async fn on_quit(&mut self) -> Result<(), MilterError> {
        info!("on quit");
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<(), MilterError> {
    let cli = Cli::parse();
    init_tracing(&cli.common.log_level);

    info!("debug-log-all v{}", env!("CARGO_PKG_VERSION"));
    let factory: AppFactory = Arc::new(|| Box::new(DebugLogAll));

    MilterServer::bind(&cli.common.bind_host, cli.common.bind_port, factory)
        .await?
        .run()
        .await
}
