//! Integration tests — full negotiation and message conversations, close
//! semantics and error scenarios over a real TCP connection on localhost.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use milterd_core::{
    AppFactory, Connect, ConnectionInfo, EndOfMessage, HookResult, Manipulation, MilterApp,
    MilterServer, ProtocolFlags, Reply, codec::encode_payload,
};

// ── Helpers ──────────────────────────────────────────────────────

/// A filter that stages one header at connect time and one more at end of
/// message, without replying at the connect stage.
struct StampingApp;

#[async_trait]
impl MilterApp for StampingApp {
    fn name(&self) -> &str {
        "stamping"
    }

    fn protocol_flags(&self) -> ProtocolFlags {
        ProtocolFlags {
            call_connect: true,
            can_add_headers: true,
            ..Default::default()
        }
    }

    async fn on_connect(&mut self, _command: &Connect) -> HookResult {
        Ok(Some(Reply::continue_with(vec![
            Manipulation::append_header("X-A", "1").unwrap(),
        ])))
    }

    async fn on_end_of_message(&mut self, _command: &EndOfMessage) -> HookResult {
        Ok(Some(Reply::continue_with(vec![
            Manipulation::append_header("X-B", "2").unwrap(),
        ])))
    }
}

/// Connect-replying filter that records the connection info it saw.
struct ConnectEchoApp {
    seen: Arc<std::sync::Mutex<Vec<ConnectionInfo>>>,
}

#[async_trait]
impl MilterApp for ConnectEchoApp {
    fn name(&self) -> &str {
        "connect-echo"
    }

    fn protocol_flags(&self) -> ProtocolFlags {
        ProtocolFlags {
            call_connect: true,
            reply_connect: true,
            ..Default::default()
        }
    }

    async fn on_connect(&mut self, command: &Connect) -> HookResult {
        self.seen.lock().unwrap().push(command.info.clone());
        Ok(Some(Reply::default()))
    }
}

async fn start_server(factory: AppFactory) -> (std::net::SocketAddr, tokio_util::sync::CancellationToken, tokio::task::JoinHandle<()>) {
    let server = MilterServer::bind("127.0.0.1", 0, factory).await.unwrap();
    let addr = server.local_addr().unwrap();
    let shutdown = server.shutdown_handle();
    let task = tokio::spawn(async move {
        server.run().await.unwrap();
    });
    (addr, shutdown, task)
}

async fn read_frame(stream: &mut TcpStream) -> Vec<u8> {
    let mut len_buf = [0u8; 4];
    stream.read_exact(&mut len_buf).await.unwrap();
    let len = u32::from_be_bytes(len_buf) as usize;
    let mut payload = vec![0u8; len];
    stream.read_exact(&mut payload).await.unwrap();
    payload
}

const OPTNEG_FRAME: &[u8] = b"\x00\x00\x00\x0dO\x00\x00\x00\x06\x00\x00\x01\xff\x00\x1f\xff\xff";

// ── Negotiation ──────────────────────────────────────────────────

#[tokio::test]
async fn negotiation_only() {
    let (addr, shutdown, task) = start_server(Arc::new(|| Box::new(StampingApp))).await;

    let mut mta = TcpStream::connect(addr).await.unwrap();
    mta.write_all(OPTNEG_FRAME).await.unwrap();

    let payload = read_frame(&mut mta).await;
    assert_eq!(&payload[..5], b"O\x00\x00\x00\x06");
    // Action flags: only ADD_HEADERS plus SET_MACROS_LIST from defaults.
    assert_eq!(&payload[5..9], b"\x00\x00\x01\x01");
    // Protocol flags: connect callback enabled (bit clear), everything
    // else at the minimal defaults.
    let protocol = u32::from_be_bytes(payload[9..13].try_into().unwrap());
    assert_eq!(protocol & 0x0000_0001, 0);
    assert_ne!(protocol & 0x0000_0002, 0);

    shutdown.cancel();
    task.await.unwrap();
}

#[tokio::test]
async fn negotiation_version_mismatch_closes_without_bytes() {
    let (addr, shutdown, task) = start_server(Arc::new(|| Box::new(StampingApp))).await;

    let mut mta = TcpStream::connect(addr).await.unwrap();
    mta.write_all(b"\x00\x00\x00\x0dO\x00\x00\x00\x07\x00\x00\x01\xff\x00\x1f\xff\xff")
        .await
        .unwrap();

    let mut buf = Vec::new();
    let n = mta.read_to_end(&mut buf).await.unwrap();
    assert_eq!(n, 0, "no bytes may be sent on a version mismatch");

    shutdown.cancel();
    task.await.unwrap();
}

// ── Commands and macro plumbing ──────────────────────────────────

#[tokio::test]
async fn connect_with_macros_reaches_the_app() {
    let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
    let factory: AppFactory = {
        let seen = seen.clone();
        Arc::new(move || {
            Box::new(ConnectEchoApp {
                seen: seen.clone(),
            })
        })
    };
    let (addr, shutdown, task) = start_server(factory).await;

    let mut mta = TcpStream::connect(addr).await.unwrap();
    mta.write_all(OPTNEG_FRAME).await.unwrap();
    let _ = read_frame(&mut mta).await;

    mta.write_all(&encode_payload(b"DCj\x00myhost.sub.example.com\x00"))
        .await
        .unwrap();
    mta.write_all(&encode_payload(b"C[172.17.0.1]\x004\xc36172.17.0.1\x00"))
        .await
        .unwrap();

    // The connect verdict.
    assert_eq!(read_frame(&mut mta).await, b"c");

    let seen = seen.lock().unwrap();
    assert_eq!(
        seen[0],
        ConnectionInfo::Ipv4 {
            hostname: "[172.17.0.1]".into(),
            addr: "172.17.0.1".parse().unwrap(),
            port: 49974,
        }
    );

    shutdown.cancel();
    task.await.unwrap();
}

// ── Manipulation ordering ────────────────────────────────────────

#[tokio::test]
async fn manipulations_flush_in_order_before_the_verdict() {
    let (addr, shutdown, task) = start_server(Arc::new(|| Box::new(StampingApp))).await;

    let mut mta = TcpStream::connect(addr).await.unwrap();
    mta.write_all(OPTNEG_FRAME).await.unwrap();
    let _ = read_frame(&mut mta).await;

    // Connect is a no-reply stage here: nothing comes back.
    mta.write_all(&encode_payload(b"C[172.17.0.1]\x004\xc36172.17.0.1\x00"))
        .await
        .unwrap();
    mta.write_all(&encode_payload(b"E")).await.unwrap();

    assert_eq!(read_frame(&mut mta).await, b"hX-A\x001\x00");
    assert_eq!(read_frame(&mut mta).await, b"hX-B\x002\x00");
    assert_eq!(read_frame(&mut mta).await, b"c");

    shutdown.cancel();
    task.await.unwrap();
}

// ── Error and close behavior ─────────────────────────────────────

#[tokio::test]
async fn framing_violation_closes_the_connection_silently() {
    let (addr, shutdown, task) = start_server(Arc::new(|| Box::new(StampingApp))).await;

    let mut mta = TcpStream::connect(addr).await.unwrap();
    // Valid negotiation bytes behind a length prefix far out of range.
    mta.write_all(b"\xf0\x00\x00\x0dO\x00\x00\x00\x06\x00\x00\x01\xff\x00\x1f\xff\xff")
        .await
        .unwrap();

    let mut buf = Vec::new();
    let n = mta.read_to_end(&mut buf).await.unwrap();
    assert_eq!(n, 0);

    shutdown.cancel();
    task.await.unwrap();
}

#[tokio::test]
async fn quit_then_disconnect_is_clean() {
    let (addr, shutdown, task) = start_server(Arc::new(|| Box::new(StampingApp))).await;

    let mut mta = TcpStream::connect(addr).await.unwrap();
    mta.write_all(OPTNEG_FRAME).await.unwrap();
    let _ = read_frame(&mut mta).await;
    mta.write_all(&encode_payload(b"Q")).await.unwrap();
    drop(mta);

    // The server must survive the disconnect and still shut down cleanly.
    shutdown.cancel();
    task.await.unwrap();
}

#[tokio::test]
async fn shutdown_closes_open_connections() {
    let (addr, shutdown, task) = start_server(Arc::new(|| Box::new(StampingApp))).await;

    let mut mta = TcpStream::connect(addr).await.unwrap();
    mta.write_all(OPTNEG_FRAME).await.unwrap();
    let _ = read_frame(&mut mta).await;

    shutdown.cancel();
    task.await.unwrap();

    let mut buf = Vec::new();
    let n = mta.read_to_end(&mut buf).await.unwrap();
    assert_eq!(n, 0);
}
