//! Milter that replaces every message body with a fixed text.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use clap::Parser;
use tracing::info;

use milterd_apps::{CommonArgs, init_tracing};
use milterd_core::{
    AppFactory, EndOfMessage, HookResult, Manipulation, MilterApp, MilterError, MilterServer,
    ProtocolFlags, Reply,
};

#[derive(Parser, Debug)]
#[command(
    name = "change-body",
    about = "Milter app that replaces the message body with the --newbody value"
)]
struct Cli {
    #[command(flatten)]
    common: CommonArgs,

    /// Replacement body text.
    #[arg(long, default_value = "foobar", env = "MILTERD_NEWBODY")]
    newbody: String,
}

struct ChangeBody {
    newbody: Bytes,
}

#[async_trait]
impl MilterApp for ChangeBody {
    fn name(&self) -> &str {
        "change_body"
    }

    fn protocol_flags(&self) -> ProtocolFlags {
        ProtocolFlags {
            can_change_body: true,
            ..Default::default()
        }
    }

    async fn on_end_of_message(&mut self, _command: &EndOfMessage) -> HookResult {
        Ok(Some(Reply::continue_with(vec![
            Manipulation::replace_body_chunk(self.newbody.clone())?,
        ])))
    }
}

#[tokio::main]
async fn main() -> Result<(), MilterError> {
    let cli = Cli::parse();
    init_tracing(&cli.common.log_level);

    // Surface an oversized replacement body before any MTA connects.
    let newbody = Bytes::from(cli.newbody.clone().into_bytes());
    Manipulation::replace_body_chunk(newbody.clone())?;

    info!("change-body v{}", env!("CARGO_PKG_VERSION"));
    let factory: AppFactory = Arc::new(move || {
        Box::new(ChangeBody {
            newbody: newbody.clone(),
        })
    });

    MilterServer::bind(&cli.common.bind_host, cli.common.bind_port, factory)
        .await?
        .run()
        .await
}
