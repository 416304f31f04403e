//! Milter that appends a header carrying the connecting client's IP.
//!
//! By default the header is added as:
//!   X-MilterExample-Connect-IP: 1.2.3.4
//!
//! No end-of-message hook is needed: the session tracks the staged header
//! and applies it at the end-of-message stage.

use std::sync::Arc;

use async_trait::async_trait;
use clap::Parser;
use tracing::{info, warn};

use milterd_apps::{CommonArgs, init_tracing};
use milterd_core::{
    AppFactory, Connect, ConnectionInfo, HeaderName, HookResult, Manipulation, MilterApp,
    MilterError, MilterServer, ProtocolFlags, Reply,
};

#[derive(Parser, Debug)]
#[command(
    name = "append-header-ip",
    about = "Milter app that appends a header with the value of the connecting IP"
)]
struct Cli {
    #[command(flatten)]
    common: CommonArgs,

    /// Name of the header to append.
    #[arg(
        long,
        default_value = "X-MilterExample-Connect-IP",
        env = "MILTERD_HEADERNAME"
    )]
    headername: String,
}

struct AppendHeaderIp {
    headername: String,
}

#[async_trait]
impl MilterApp for AppendHeaderIp {
    fn name(&self) -> &str {
        "append_header_ip"
    }

    fn protocol_flags(&self) -> ProtocolFlags {
        ProtocolFlags {
            call_connect: true,
            reply_connect: true,
            can_add_headers: true,
            ..Default::default()
        }
    }

    async fn on_connect(&mut self, command: &Connect) -> HookResult {
        let ip = match &command.info {
            ConnectionInfo::Ipv4 { addr, .. } => addr.to_string(),
            ConnectionInfo::Ipv6 { addr, .. } => addr.to_string(),
            other => {
                warn!(
                    info = ?other,
                    "connection socket family is not IP, skip adding header"
                );
                return Ok(Some(Reply::default()));
            }
        };
        info!(header = %self.headername, %ip, "adding header");
        Ok(Some(Reply::continue_with(vec![Manipulation::append_header(
            self.headername.clone(),
            ip,
        )?])))
    }
}

#[tokio::main]
async fn main() -> Result<(), MilterError> {
    let cli = Cli::parse();
    init_tracing(&cli.common.log_level);

    // Fail fast on an invalid header name from the command line.
    HeaderName::new(&cli.headername)?;

    info!("append-header-ip v{}", env!("CARGO_PKG_VERSION"));
    let headername = cli.headername.clone();
    let factory: AppFactory = Arc::new(move || {
        Box::new(AppendHeaderIp {
            headername: headername.clone(),
        })
    });

    MilterServer::bind(&cli.common.bind_host, cli.common.bind_port, factory)
        .await?
        .run()
        .await
}
