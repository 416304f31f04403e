//! Per-connection handler: owns the framed duplex stream and its
//! background reader/writer tasks.
//!
//! The stream splits into a reader driving the packet codec and a writer
//! draining an mpsc of encoded response payloads. Decoded commands are
//! queued into the session; the session writes responses back through the
//! channel, which keeps the two directions independent and avoids holding
//! a stream borrow across await points.
//!
//! Close is two-directional and idempotent:
//! - *bottom-up* (EOF, protocol violation, or the server shutting down):
//!   the session is told the MTA side is gone, runs the application's
//!   MTA-close hook once, and the transport is released afterwards.
//! - *top-down* (application failure or explicit request): the transport
//!   closes and the consumer stops without re-entering the application.

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, Span, debug, warn};

use crate::app::MilterApp;
use crate::codec::PacketCodec;
use crate::network::ConnectionId;
use crate::protocol::commands::Command;
use crate::session::{self, SessionConfig};

/// Called exactly once when the connection is released, whichever side
/// initiated the close.
pub type OnClose = Box<dyn FnOnce(ConnectionId) + Send>;

/// Depth of the response-writer channel.
const WRITER_QUEUE_DEPTH: usize = 128;

enum CloseKind {
    BottomUp,
    TopDown,
}

/// Control handle for a spawned connection, kept by the server.
#[derive(Debug)]
pub struct ConnectionHandle {
    id: ConnectionId,
    bottom_up: CancellationToken,
    top_down: CancellationToken,
}

impl ConnectionHandle {
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Close as if the MTA went away: queued commands finish, the
    /// application's MTA-close hook runs, then the transport is released.
    pub fn close_bottom_up(&self) {
        self.bottom_up.cancel();
    }

    /// Close from above: release the transport and stop the consumer
    /// without re-entering the application.
    pub fn close_top_down(&self) {
        self.top_down.cancel();
    }
}

/// Spawn the reader, writer and session-consumer tasks for one accepted
/// stream, all instrumented with the connection's log span.
pub fn handle_connection<S>(
    stream: S,
    id: ConnectionId,
    app: Box<dyn MilterApp>,
    config: SessionConfig,
    on_close: OnClose,
    span: Span,
) -> ConnectionHandle
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (mut sink, mut frames) = Framed::new(stream, PacketCodec).split();
    let (writer_tx, mut writer_rx) = mpsc::channel::<Bytes>(WRITER_QUEUE_DEPTH);

    let bottom_up = CancellationToken::new();
    let top_down = CancellationToken::new();
    let consumer_stop = CancellationToken::new();

    let (session_handle, _consumer_join) = session::spawn(
        app,
        writer_tx,
        consumer_stop.clone(),
        top_down.clone(),
        config,
        span.clone(),
    );

    // Writer task: frame and send each payload, then close the transport
    // (EOF) once every sender is gone.
    tokio::spawn(
        async move {
            while let Some(payload) = writer_rx.recv().await {
                debug!(len = payload.len(), "writing framed payload");
                if let Err(e) = sink.send(payload).await {
                    warn!(error = %e, "write error");
                    break;
                }
            }
            if let Err(e) = sink.close().await {
                debug!(error = %e, "error closing the transport writer, ignoring");
            }
        }
        .instrument(span.clone()),
    );

    // Reader task: drive the codec, queue decoded commands, initiate the
    // appropriate close.
    let handle_bottom_up = bottom_up.clone();
    let handle_top_down = top_down.clone();
    tokio::spawn(
        async move {
            let close_kind = loop {
                tokio::select! {
                    biased;
                    _ = top_down.cancelled() => {
                        debug!("top-down close requested");
                        break CloseKind::TopDown;
                    }
                    _ = bottom_up.cancelled() => {
                        debug!("bottom-up close requested");
                        break CloseKind::BottomUp;
                    }
                    frame = frames.next() => match frame {
                        Some(Ok(payload)) => match Command::decode(&payload) {
                            Ok(command) => {
                                if session_handle.queue_command(command).is_err() {
                                    warn!("command queue is not being read anymore; closing");
                                    break CloseKind::TopDown;
                                }
                            }
                            Err(e) => {
                                warn!(error = %e, "protocol violation, going to close the connection");
                                break CloseKind::BottomUp;
                            }
                        },
                        Some(Err(e)) => {
                            if e.is_protocol_violation() {
                                warn!(error = %e, "protocol violation, going to close the connection");
                            } else {
                                warn!(error = %e, "transport error, going to close the connection");
                            }
                            break CloseKind::BottomUp;
                        }
                        None => {
                            debug!("milter-MTA connection closed (EOF)");
                            break CloseKind::BottomUp;
                        }
                    }
                }
            };

            match close_kind {
                CloseKind::BottomUp => {
                    // The consumer finishes queued commands, runs the
                    // MTA-close hook and drops the writer, which releases
                    // the transport.
                    session_handle.notify_mta_closed();
                }
                CloseKind::TopDown => {
                    consumer_stop.cancel();
                }
            }
            on_close(id);
        }
        .instrument(span),
    );

    ConnectionHandle {
        id,
        bottom_up: handle_bottom_up,
        top_down: handle_top_down,
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    };
    use std::time::Duration;

    use async_trait::async_trait;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::sync::oneshot;

    use super::*;
    use crate::app::HookResult;
    use crate::codec::encode_payload;
    use crate::error::MilterError;
    use crate::flags::ProtocolFlags;
    use crate::protocol::commands::EndOfMessage;
    use crate::protocol::responses::Reply;

    struct CountingApp {
        flags: ProtocolFlags,
        mta_closes: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl MilterApp for CountingApp {
        fn name(&self) -> &str {
            "counting"
        }

        fn protocol_flags(&self) -> ProtocolFlags {
            self.flags.clone()
        }

        async fn on_end_of_message(&mut self, _command: &EndOfMessage) -> HookResult {
            Ok(Some(Reply::default()))
        }

        async fn on_mta_close_connection(&mut self) -> Result<(), MilterError> {
            self.mta_closes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn start_on_duplex() -> (
        tokio::io::DuplexStream,
        ConnectionHandle,
        Arc<AtomicUsize>,
        oneshot::Receiver<ConnectionId>,
    ) {
        let (mta_side, milter_side) = tokio::io::duplex(1 << 16);
        let mta_closes = Arc::new(AtomicUsize::new(0));
        let app = CountingApp {
            flags: ProtocolFlags::default(),
            mta_closes: mta_closes.clone(),
        };
        let (closed_tx, closed_rx) = oneshot::channel();
        let handle = handle_connection(
            milter_side,
            ConnectionId::generate(),
            Box::new(app),
            SessionConfig::default(),
            Box::new(move |id| {
                let _ = closed_tx.send(id);
            }),
            Span::none(),
        );
        (mta_side, handle, mta_closes, closed_rx)
    }

    const OPTNEG_PAYLOAD: &[u8] = b"O\x00\x00\x00\x06\x00\x00\x01\xff\x00\x1f\xff\xff";

    async fn read_frame(stream: &mut tokio::io::DuplexStream) -> Vec<u8> {
        let mut len_buf = [0u8; 4];
        stream.read_exact(&mut len_buf).await.unwrap();
        let len = u32::from_be_bytes(len_buf) as usize;
        let mut payload = vec![0u8; len];
        stream.read_exact(&mut payload).await.unwrap();
        payload
    }

    #[tokio::test]
    async fn negotiation_roundtrip_over_a_stream() {
        let (mut mta, _handle, _closes, _closed) = start_on_duplex();

        mta.write_all(&encode_payload(OPTNEG_PAYLOAD)).await.unwrap();
        let payload = read_frame(&mut mta).await;
        assert_eq!(payload[0], b'O');
        assert_eq!(&payload[1..5], b"\x00\x00\x00\x06");
        assert_eq!(payload.len(), 13);
    }

    #[tokio::test]
    async fn eof_triggers_bottom_up_close() {
        let (mta, _handle, mta_closes, closed) = start_on_duplex();

        drop(mta);
        let _ = closed.await.unwrap();
        // Give the consumer a beat to run the hook.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(mta_closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn framing_violation_closes_without_a_reply() {
        let (mut mta, _handle, _closes, closed) = start_on_duplex();

        // Length prefix way out of range, then garbage.
        mta.write_all(b"\xf0\x00\x00\x0dOjunk").await.unwrap();
        let _ = closed.await.unwrap();

        // The MTA observes a clean close with no bytes sent.
        let mut buf = Vec::new();
        let n = mta.read_to_end(&mut buf).await.unwrap();
        assert_eq!(n, 0);
    }

    #[tokio::test]
    async fn unknown_discriminator_closes_the_connection() {
        let (mut mta, _handle, _closes, closed) = start_on_duplex();

        mta.write_all(&encode_payload(b"Zwhat")).await.unwrap();
        let _ = closed.await.unwrap();
        let mut buf = Vec::new();
        assert_eq!(mta.read_to_end(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn top_down_close_skips_the_mta_close_hook() {
        let (mut mta, handle, mta_closes, closed) = start_on_duplex();

        handle.close_top_down();
        let _ = closed.await.unwrap();

        let mut buf = Vec::new();
        assert_eq!(mta.read_to_end(&mut buf).await.unwrap(), 0);
        assert_eq!(mta_closes.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn bottom_up_close_runs_the_mta_close_hook() {
        let (mut mta, handle, mta_closes, closed) = start_on_duplex();

        handle.close_bottom_up();
        let _ = closed.await.unwrap();
        let mut buf = Vec::new();
        assert_eq!(mta.read_to_end(&mut buf).await.unwrap(), 0);
        assert_eq!(mta_closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn close_operations_are_idempotent() {
        let (_mta, handle, mta_closes, closed) = start_on_duplex();

        handle.close_bottom_up();
        handle.close_bottom_up();
        handle.close_top_down();
        let _ = closed.await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(mta_closes.load(Ordering::SeqCst) <= 1);
    }

    #[tokio::test]
    async fn violation_mid_stream_uses_scripted_io() {
        // Scripted stream: a valid negotiation, its reply, then a frame
        // with a zero length prefix. No further writes may happen.
        let mta_closes = Arc::new(AtomicUsize::new(0));
        let app = CountingApp {
            flags: ProtocolFlags::default(),
            mta_closes: mta_closes.clone(),
        };

        let expected_reply = {
            let response = crate::protocol::responses::OptionsNegotiateResponse {
                flags: ProtocolFlags::default(),
                symbols: Default::default(),
            };
            encode_payload(&response.encode())
        };

        let mock = tokio_test::io::Builder::new()
            .read(&encode_payload(OPTNEG_PAYLOAD))
            .write(&expected_reply)
            .read(b"\x00\x00\x00\x00")
            .build();

        let (closed_tx, closed_rx) = oneshot::channel();
        let _handle = handle_connection(
            mock,
            ConnectionId::generate(),
            Box::new(app),
            SessionConfig::default(),
            Box::new(move |id| {
                let _ = closed_tx.send(id);
            }),
            Span::none(),
        );

        let _ = closed_rx.await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(mta_closes.load(Ordering::SeqCst), 1);
    }
}
