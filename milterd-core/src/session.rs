//! Per-connection session: the protocol state machine between the MTA and
//! the application.
//!
//! Commands arrive on an unbounded FIFO queue and are drained by a single
//! consumer task, which guarantees that callbacks run in arrival order and
//! that every verdict is written before the next callback begins. The
//! consumer also owns macro-bundle attachment, manipulation staging and
//! the end-of-message flush.
//!
//! Teardown is two-directional: [`SessionHandle::notify_mta_closed`]
//! (bottom-up, the transport died first) runs the application's MTA-close
//! hook exactly once; cancelling the stop token (top-down) ends the
//! consumer without re-entering the application.

use std::collections::BTreeMap;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, Span, debug, error, info, warn};

use crate::app::MilterApp;
use crate::definitions::MacroStage;
use crate::error::MilterError;
use crate::flags::ProtocolFlags;
use crate::protocol::Macros;
use crate::protocol::commands::{Command, CommandKind, DefineMacro, OptionsNegotiate};
use crate::protocol::responses::{Manipulation, OptionsNegotiateResponse, Reply, Verdict};

/// Default bound on one queue read. Purely a liveness poll: hitting it
/// loops, it is not an error.
pub const QUEUE_READER_TIMEOUT_DEFAULT: Duration = Duration::from_secs(30);

// ── SessionPhase ─────────────────────────────────────────────────

/// Lifecycle of one MTA connection.
///
/// ```text
///  AwaitingNegotiation ──► Negotiated ──► InTransaction
///            ▲                 │  ▲            │
///            │ (quit-nc)       │  └────────────┘ (end-of-message, abort)
///            └─────────────────┤
///                              ▼
///                          Terminated  (quit)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionPhase {
    #[default]
    AwaitingNegotiation,
    Negotiated,
    InTransaction,
    Terminated,
}

impl std::fmt::Display for SessionPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::AwaitingNegotiation => "awaiting-negotiation",
            Self::Negotiated => "negotiated",
            Self::InTransaction => "in-transaction",
            Self::Terminated => "terminated",
        };
        write!(f, "{name}")
    }
}

// ── SessionState ─────────────────────────────────────────────────

/// The synchronous half of the session: everything that changes as
/// commands are consumed, separated from the async plumbing so it can be
/// exercised directly in tests.
#[derive(Default)]
struct SessionState {
    phase: SessionPhase,
    last_macro_bundle: Option<DefineMacro>,
    macros_per_stage: BTreeMap<MacroStage, Macros>,
    all_macros: Macros,
    pending_manipulations: Vec<Manipulation>,
    manipulations_sent: bool,
}

impl SessionState {
    fn set_phase(&mut self, next: SessionPhase) {
        if self.phase != next {
            debug!(from = %self.phase, to = %next, "session phase transition");
            self.phase = next;
        }
    }

    /// Record a macro bundle: buffer it for attachment to the next
    /// command, and keep all seen symbols for diagnostics.
    fn absorb_macro_bundle(&mut self, bundle: DefineMacro) {
        if self.last_macro_bundle.is_some() {
            debug!("discarding previously pending macro bundle");
        }
        bundle.macros.merge_into(&mut self.all_macros);
        self.macros_per_stage
            .insert(bundle.stage, bundle.macros.clone());
        self.last_macro_bundle = Some(bundle);
    }

    /// Hand out the pending bundle iff `kind` belongs to its stage. The
    /// bundle is consumed either way: it attaches to at most one command.
    fn take_macros_for(&mut self, kind: CommandKind) -> Option<Macros> {
        let bundle = self.last_macro_bundle.take()?;
        if kind.macro_stage() == Some(bundle.stage) {
            Some(bundle.macros)
        } else {
            debug!(
                stage = %bundle.stage,
                command = ?kind,
                "discarding macro bundle, stage does not match"
            );
            None
        }
    }

    fn stage_manipulations(&mut self, manipulations: Vec<Manipulation>) {
        if manipulations.is_empty() {
            return;
        }
        if self.manipulations_sent {
            warn!(
                count = manipulations.len(),
                "adding manipulations after the end-of-message flush is not \
                 allowed; ignoring"
            );
            return;
        }
        debug!(
            adding = manipulations.len(),
            pending = self.pending_manipulations.len(),
            "staging manipulations"
        );
        self.pending_manipulations.extend(manipulations);
    }

    /// Take everything staged and set the sticky sent flag.
    fn flush_manipulations(&mut self) -> Vec<Manipulation> {
        self.manipulations_sent = true;
        std::mem::take(&mut self.pending_manipulations)
    }

    /// Drop transaction-scoped state (on Abort).
    fn reset_transaction(&mut self) {
        self.pending_manipulations.clear();
        self.manipulations_sent = false;
    }

    /// Back to a pristine pre-negotiation session (on quit-nc).
    fn reset_for_renegotiation(&mut self) {
        self.reset_transaction();
        self.last_macro_bundle = None;
        self.macros_per_stage.clear();
        self.all_macros = Macros::new();
        self.set_phase(SessionPhase::AwaitingNegotiation);
    }
}

// ── Queue plumbing ───────────────────────────────────────────────

enum SessionItem {
    Command {
        command: Command,
        done: oneshot::Sender<()>,
    },
    MtaClosed,
}

/// Cheaply cloneable entry point used by the connection handler to feed
/// the consumer task.
#[derive(Clone)]
pub(crate) struct SessionHandle {
    tx: mpsc::UnboundedSender<SessionItem>,
}

impl SessionHandle {
    /// Enqueue a command. The returned receiver fires once the command has
    /// been fully processed, including writing its response.
    pub(crate) fn queue_command(
        &self,
        command: Command,
    ) -> Result<oneshot::Receiver<()>, MilterError> {
        let (done, done_rx) = oneshot::channel();
        self.tx
            .send(SessionItem::Command { command, done })
            .map_err(|_| MilterError::ChannelClosed)?;
        Ok(done_rx)
    }

    /// Bottom-up close: tell the consumer the MTA side is gone. The
    /// application's MTA-close hook runs once, after already-queued
    /// commands.
    pub(crate) fn notify_mta_closed(&self) {
        let _ = self.tx.send(SessionItem::MtaClosed);
    }
}

/// Knobs for the consumer task.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Bound on a single queue read, used to poll for shutdown.
    pub queue_read_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            queue_read_timeout: QUEUE_READER_TIMEOUT_DEFAULT,
        }
    }
}

// ── Session consumer ─────────────────────────────────────────────

pub(crate) struct Session {
    app: Box<dyn MilterApp>,
    flags: ProtocolFlags,
    rx: mpsc::UnboundedReceiver<SessionItem>,
    writer: mpsc::Sender<Bytes>,
    stop: CancellationToken,
    conn_cancel: CancellationToken,
    state: SessionState,
    config: SessionConfig,
}

/// Start the commands-consumer task for one connection.
///
/// `writer` receives encoded response payloads for framing; `stop` ends
/// the consumer without involving the application (top-down close);
/// `conn_cancel` is cancelled by the consumer itself when the application
/// fails, telling the connection handler to tear the transport down. The
/// span carries the connection id as ambient logging context.
pub(crate) fn spawn(
    app: Box<dyn MilterApp>,
    writer: mpsc::Sender<Bytes>,
    stop: CancellationToken,
    conn_cancel: CancellationToken,
    config: SessionConfig,
    span: Span,
) -> (SessionHandle, JoinHandle<()>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let flags = app.protocol_flags();
    let session = Session {
        app,
        flags,
        rx,
        writer,
        stop,
        conn_cancel,
        state: SessionState::default(),
        config,
    };
    let join = tokio::spawn(session.run().instrument(span));
    (SessionHandle { tx }, join)
}

impl Session {
    async fn run(mut self) {
        debug!(app = self.app.name(), "commands consumer started");
        loop {
            let item = tokio::select! {
                biased;
                _ = self.stop.cancelled() => {
                    debug!("commands consumer stopped");
                    return;
                }
                polled = tokio::time::timeout(self.config.queue_read_timeout, self.rx.recv()) => {
                    match polled {
                        // A timeout is only the liveness poll coming around.
                        Err(_) => {
                            debug!("timeout reading the command queue");
                            continue;
                        }
                        Ok(None) => {
                            debug!("command queue closed");
                            return;
                        }
                        Ok(Some(item)) => item,
                    }
                }
            };

            match item {
                SessionItem::MtaClosed => {
                    debug!("MTA closed the connection");
                    if let Err(e) = self.app.on_mta_close_connection().await {
                        warn!(error = %e, "error in the MTA-close hook, ignoring");
                    }
                    return;
                }
                SessionItem::Command { command, done } => {
                    let result = self.process_command(command).await;
                    let _ = done.send(());
                    match result {
                        Ok(()) => {}
                        Err(MilterError::ChannelClosed) => {
                            debug!("response channel closed, stopping consumer");
                            return;
                        }
                        Err(e) => {
                            error!(
                                error = %e,
                                "error while processing a command; cancelling the connection"
                            );
                            self.conn_cancel.cancel();
                            return;
                        }
                    }
                }
            }
        }
    }

    async fn process_command(&mut self, mut command: Command) -> Result<(), MilterError> {
        debug!(command = ?command.kind(), phase = %self.state.phase, "processing command");

        // Negotiation and macro bundles are session-level concerns, not
        // application callbacks.
        match command {
            Command::OptionsNegotiate(optneg) => return self.on_options_negotiate(&optneg).await,
            Command::DefineMacro(bundle) => {
                self.state.absorb_macro_bundle(bundle);
                return Ok(());
            }
            _ => {}
        }

        if let Some(macros) = self.state.take_macros_for(command.kind()) {
            command.set_macros(macros);
        }

        match command {
            Command::OptionsNegotiate(_) | Command::DefineMacro(_) => Ok(()),
            Command::Connect(ref c) => {
                let reply = self.app.on_connect(c).await?;
                self.finish_stage(reply, self.flags.reply_connect, "connect")
                    .await
            }
            Command::Helo(ref c) => {
                let reply = self.app.on_helo(c).await?;
                self.finish_stage(reply, self.flags.reply_helo, "helo").await
            }
            Command::MailFrom(ref c) => {
                self.state.set_phase(SessionPhase::InTransaction);
                let reply = self.app.on_mail_from(c).await?;
                self.finish_stage(reply, self.flags.reply_mail_from, "mail-from")
                    .await
            }
            Command::RcptTo(ref c) => {
                let reply = self.app.on_rcpt_to(c).await?;
                self.finish_stage(reply, self.flags.reply_rcpt_to, "rcpt-to")
                    .await
            }
            Command::Data(ref c) => {
                let reply = self.app.on_data(c).await?;
                self.finish_stage(reply, self.flags.reply_data, "data").await
            }
            Command::Header(ref c) => {
                let reply = self.app.on_header(c).await?;
                self.finish_stage(reply, self.flags.reply_headers, "header")
                    .await
            }
            Command::EndOfHeaders(ref c) => {
                let reply = self.app.on_end_of_headers(c).await?;
                self.finish_stage(reply, self.flags.reply_end_of_headers, "end-of-headers")
                    .await
            }
            Command::BodyChunk(ref c) => {
                let reply = self.app.on_body_chunk(c).await?;
                self.finish_stage(reply, self.flags.reply_body_chunk, "body")
                    .await
            }
            Command::Unknown(ref c) => {
                let reply = self.app.on_unknown(c).await?;
                self.finish_stage(reply, self.flags.reply_unknown, "unknown")
                    .await
            }
            Command::EndOfMessage(ref c) => {
                // The one mandatory reply; a silent hook means Continue.
                let reply = self.app.on_end_of_message(c).await?.unwrap_or_default();
                self.state.stage_manipulations(reply.manipulations);
                let pending = self.state.flush_manipulations();
                debug!(
                    count = pending.len(),
                    "sending staged manipulations before the end-of-message verdict"
                );
                for manipulation in pending {
                    self.send_payload(manipulation.encode()).await?;
                }
                self.send_payload(reply.verdict.encode()).await?;
                self.state.set_phase(SessionPhase::Negotiated);
                Ok(())
            }
            Command::Abort => {
                self.app.on_abort().await?;
                self.state.reset_transaction();
                self.state.set_phase(SessionPhase::Negotiated);
                Ok(())
            }
            Command::Quit => {
                self.app.on_quit().await?;
                self.state.set_phase(SessionPhase::Terminated);
                Ok(())
            }
            Command::QuitNoClose => {
                // The reference behavior for quit-nc is underspecified;
                // treat it as quit with the transport left open so the MTA
                // can renegotiate on the same connection.
                info!("quit-nc received; resetting session for renegotiation");
                self.app.on_quit().await?;
                self.state.reset_for_renegotiation();
                Ok(())
            }
        }
    }

    async fn on_options_negotiate(
        &mut self,
        command: &OptionsNegotiate,
    ) -> Result<(), MilterError> {
        self.flags.validate()?;
        debug!(capabilities = ?command.capabilities, "MTA capabilities received");
        let response = OptionsNegotiateResponse {
            flags: self.flags.clone(),
            symbols: self.app.symbols(),
        };
        self.send_payload(response.encode()).await?;
        self.state.set_phase(SessionPhase::Negotiated);
        Ok(())
    }

    /// Stage a returned reply's manipulations and write its verdict when
    /// this stage negotiated a reply. A verdict from a no-reply stage is
    /// dropped; only its manipulations survive.
    async fn finish_stage(
        &mut self,
        reply: Option<Reply>,
        reply_expected: bool,
        stage: &'static str,
    ) -> Result<(), MilterError> {
        let Some(Reply {
            verdict,
            manipulations,
        }) = reply
        else {
            return Ok(());
        };
        self.state.stage_manipulations(manipulations);
        if reply_expected {
            self.send_payload(verdict.encode()).await
        } else {
            if verdict != Verdict::Continue {
                debug!(stage, "dropping verdict returned from a no-reply stage");
            }
            Ok(())
        }
    }

    async fn send_payload(&self, payload: Bytes) -> Result<(), MilterError> {
        self.writer
            .send(payload)
            .await
            .map_err(|_| MilterError::ChannelClosed)
    }
}
