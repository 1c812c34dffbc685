//! End-to-end tests driving the proxy against the in-memory backend.

use std::cell::Cell;
use std::io;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt, duplex};

use vizproxy::backend::{
    Directive, DirectiveChannel, ExitOutcome, MemoryBackend, ProcessTransport, Reply,
};
use vizproxy::protocol::{ImageFormat, LineBuffer, ReadMode};
use vizproxy::queue::{DrainStatus, ImageQueue};
use vizproxy::transport::{BoxedReader, ClientSink};
use vizproxy::{ClientEndpoint, ClientListener, Proxy, ProxyConfig, ProxyError, ProxySession, SessionEnd};

/// Client sink that accepts at most `per_call` bytes between two
/// `writable` notifications.
struct PacedSink {
    received: Vec<u8>,
    per_call: usize,
    budget: Cell<usize>,
}

impl PacedSink {
    fn new(per_call: usize) -> Self {
        Self {
            received: Vec::new(),
            per_call,
            budget: Cell::new(per_call),
        }
    }
}

impl ClientSink for PacedSink {
    fn try_write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let budget = self.budget.get();
        if budget == 0 {
            return Err(io::ErrorKind::WouldBlock.into());
        }
        let n = buf.len().min(budget);
        self.received.extend_from_slice(&buf[..n]);
        self.budget.set(budget - n);
        Ok(n)
    }

    async fn writable(&self) -> io::Result<()> {
        self.budget.set(self.per_call);
        Ok(())
    }
}

fn config() -> ProxyConfig {
    let mut config = ProxyConfig::new(vec!["pymol".into()]);
    config.banner = None;
    config.stats_log = None;
    config
}

/// Client stream that delivers `input` and then closes.
fn client_input(input: &str) -> BoxedReader {
    let (mut writer, reader) = duplex(64 * 1024);
    let input = input.to_string();
    tokio::spawn(async move {
        let _ = writer.write_all(input.as_bytes()).await;
    });
    Box::new(reader)
}

fn channel_for(backend: &mut MemoryBackend) -> DirectiveChannel {
    let io = backend.take_io().unwrap();
    let stdout = LineBuffer::new("backend", io.stdout, 64 * 1024, ReadMode::Blocking);
    DirectiveChannel::new(io.stdin, stdout, "PyMOL>")
}

fn pattern(len: usize) -> Bytes {
    (0..len).map(|i| (i % 251) as u8).collect::<Vec<u8>>().into()
}

// ============================================================================
// Coalescing
// ============================================================================

/// Deferred rotations are summed into one directive before the pushed render.
#[tokio::test]
async fn test_deferred_rotations_reach_backend_once() {
    let mut backend = MemoryBackend::prompting("PyMOL>", ImageFormat::Bmp, Bytes::from_static(b"BMxx"));
    let mut sink = PacedSink::new(usize::MAX);
    let mut proxy = Proxy::new(config());

    let client = client_input("rotate 10 0 0 -defer\nrotate 0 5 0 -defer\nrotate 0 0 0 -push\n");
    let end = proxy.run(&mut backend, client, &mut sink).await.unwrap();

    assert_eq!(end, SessionEnd::ClientClosed);
    assert_eq!(
        backend.directives(),
        vec!["turn x,10.000000;turn y,5.000000;turn z,0.000000", "bmp -"]
    );
    assert_eq!(sink.received, b"nv>image 4 0 1 0\nBMxx");
    assert_eq!(proxy.session().cache_id, 0);
    assert_eq!(proxy.session().stats.frames_sent, 1);
}

/// A pending update renders once the client goes quiet.
#[tokio::test]
async fn test_idle_timer_renders_pending_update() {
    let mut backend = MemoryBackend::prompting("PyMOL>", ImageFormat::Bmp, Bytes::from_static(b"BM"));
    let mut sink = PacedSink::new(usize::MAX);
    let mut config = config();
    config.idle_timeout = Duration::from_millis(20);
    let mut proxy = Proxy::new(config);

    let (mut writer, reader) = duplex(4096);
    let driver = async move {
        writer.write_all(b"zoom 2\npan 10 0\n").await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        drop(writer);
    };
    let (end, ()) = tokio::join!(proxy.run(&mut backend, Box::new(reader), &mut sink), driver);

    assert_eq!(end.unwrap(), SessionEnd::ClientClosed);
    assert_eq!(
        backend.directives(),
        vec!["move x,0.500000;move y,0.000000", "move z,2.000000", "bmp -"]
    );
    assert_eq!(sink.received, b"nv>image 2 0 1 0\nBM");
}

/// Scene and frame changes both render under the unchanged cache id.
#[tokio::test]
async fn test_cache_transparent_command_keeps_cache_id() {
    let mut backend = MemoryBackend::prompting("PyMOL>", ImageFormat::Bmp, Bytes::from_static(b"B"));
    let mut sink = PacedSink::new(usize::MAX);
    let mut proxy = Proxy::new(config());

    let client = client_input("reset -push\nframe 5 -push\n");
    proxy.run(&mut backend, client, &mut sink).await.unwrap();

    assert_eq!(sink.received, b"nv>image 1 0 1 0\nBnv>image 1 0 5 0\nB");
}

// ============================================================================
// Image exchange
// ============================================================================

/// An image arriving in several backend chunks reaches the client whole.
#[tokio::test]
async fn test_chunked_image_reassembled() {
    let payload = pattern(10_000);
    let expected = payload.clone();
    let mut backend = MemoryBackend::spawn(move |line| {
        if line == "bmp -" {
            vec![Reply::Image {
                format: ImageFormat::Bmp,
                payload: payload.clone(),
                chunk: 4096,
            }]
        } else {
            vec![Reply::prompt("PyMOL>")]
        }
    });
    let mut sink = PacedSink::new(usize::MAX);
    let mut proxy = Proxy::new(config());

    proxy
        .run(&mut backend, client_input("bmp\n"), &mut sink)
        .await
        .unwrap();

    let header = b"nv>image 10000 0 1 0\n";
    assert_eq!(&sink.received[..header.len()], header);
    assert_eq!(&sink.received[header.len()..], &expected[..]);
}

/// `print` tags its image with the client token.
#[tokio::test]
async fn test_print_uses_token_and_restores_background() {
    let mut backend = MemoryBackend::spawn(|line| {
        if line.starts_with("png -:") {
            vec![Reply::image(ImageFormat::Png, Bytes::from_static(b"\x89PNG"))]
        } else {
            vec![Reply::prompt("PyMOL>")]
        }
    });
    let mut sink = PacedSink::new(usize::MAX);
    let mut proxy = Proxy::new(config());

    proxy
        .run(&mut backend, client_input("print hires 640 480 none\n"), &mut sink)
        .await
        .unwrap();

    assert_eq!(
        backend.directives(),
        vec![
            "set ray_opaque_background,off;refresh",
            "png -:hires:0:0,width=640,height=480,ray=1,dpi=300",
            "bg_color black",
        ]
    );
    assert_eq!(sink.received, b"nv>image 4 hires 0 0\n\x89PNG");
}

/// `loadpdb follows` reads the structure from the bytes after the command.
#[tokio::test]
async fn test_loadpdb_follows_reads_client_bytes() {
    let seen = Arc::new(Mutex::new(String::new()));
    let captured = seen.clone();
    let mut backend = MemoryBackend::spawn(move |line| {
        if let Some(args) = line.strip_prefix("loadandremovepdbfile ") {
            let path = args.split(',').next().unwrap_or_default();
            let text = std::fs::read_to_string(path).unwrap_or_default();
            let _ = std::fs::remove_file(path);
            *captured.lock().unwrap() = text;
        }
        vec![Reply::prompt("PyMOL>")]
    });
    let mut sink = PacedSink::new(usize::MAX);
    let mut proxy = Proxy::new(config());

    let pdb = "ATOM      1  N   ALA A   1\nEND\n";
    let input = format!("loadpdb follows protein 2 {} -defer\n{}", pdb.len(), pdb);
    proxy
        .run(&mut backend, client_input(&input), &mut sink)
        .await
        .unwrap();

    assert_eq!(*seen.lock().unwrap(), pdb);
    let directives = backend.directives();
    assert_eq!(directives.len(), 1);
    assert!(directives[0].ends_with(",protein,2"));
    assert_eq!(proxy.session().cache_id, 2);
}

/// A view change after a structure load keeps the loaded state as cache id.
#[tokio::test]
async fn test_view_change_keeps_loaded_state_cache_id() {
    let mut backend = MemoryBackend::spawn(|line| {
        if line == "bmp -" {
            return vec![Reply::image(ImageFormat::Bmp, Bytes::from_static(b"BM"))];
        }
        if let Some(args) = line.strip_prefix("loadandremovepdbfile ") {
            let path = args.split(',').next().unwrap_or_default();
            let _ = std::fs::remove_file(path);
        }
        vec![Reply::prompt("PyMOL>")]
    });
    let mut sink = PacedSink::new(usize::MAX);
    let mut proxy = Proxy::new(config());

    let client = client_input("loadpdb {ATOM} protein 5 -defer\nrotate 10 0 0 -push\n");
    proxy.run(&mut backend, client, &mut sink).await.unwrap();

    assert_eq!(sink.received, b"nv>image 2 5 1 0\nBM");
    assert_eq!(proxy.session().cache_id, 5);
    assert_eq!(proxy.session().stats.bytes_sent, 2);
}

// ============================================================================
// Delivery
// ============================================================================

/// A client taking 100 bytes per write still gets every byte in order.
#[test]
fn test_slow_client_gets_whole_image() {
    let payload = pattern(100_000);
    let mut queue = ImageQueue::new();
    let mut sink = PacedSink::new(100);
    queue.push(payload.clone());
    queue.push(Bytes::from_static(b"next"));

    let mut calls = 0;
    while queue.len() == 2 {
        sink.budget.set(100);
        assert_eq!(queue.drain_to(&mut sink).unwrap(), DrainStatus::Blocked);
        calls += 1;
    }
    assert_eq!(calls, 1_000);
    assert_eq!(&sink.received[..], &payload[..]);

    sink.budget.set(100);
    assert_eq!(queue.drain_to(&mut sink).unwrap(), DrainStatus::Drained);
    assert_eq!(&sink.received[100_000..], b"next");
}

/// Images reach a slow client in render order.
#[tokio::test]
async fn test_images_delivered_in_order_through_slow_client() {
    let mut frames = 0u8;
    let mut backend = MemoryBackend::spawn(move |line| {
        if line == "bmp -" {
            frames += 1;
            vec![Reply::image(ImageFormat::Bmp, vec![b'0' + frames; 300])]
        } else {
            vec![Reply::prompt("PyMOL>")]
        }
    });
    let mut sink = PacedSink::new(7);
    let mut proxy = Proxy::new(config());

    proxy
        .run(&mut backend, client_input("bmp\nbmp\nbmp\n"), &mut sink)
        .await
        .unwrap();

    let mut expected = Vec::new();
    for digit in [b'1', b'2', b'3'] {
        expected.extend_from_slice(b"nv>image 300 0 1 0\n");
        expected.extend_from_slice(&[digit; 300]);
    }
    assert_eq!(sink.received, expected);
}

// ============================================================================
// Faults
// ============================================================================

/// A backend hang-up latches the fault and later sends do no I/O.
#[tokio::test]
async fn test_hangup_latches_fault() {
    let mut backend = MemoryBackend::spawn(|line| {
        if line == "reset" {
            vec![Reply::Hangup]
        } else {
            vec![Reply::prompt("PyMOL>")]
        }
    });
    let mut channel = channel_for(&mut backend);
    let mut session = ProxySession::new();

    let err = channel
        .send_directive(&mut session, &Directive::new("reset"))
        .await
        .unwrap_err();
    assert!(matches!(err, ProxyError::ConnectionClosed("backend")));
    assert!(session.fault.is_set());

    let err = channel
        .send_directive(&mut session, &Directive::new("frame 2"))
        .await
        .unwrap_err();
    assert!(matches!(err, ProxyError::Faulted(_)));

    tokio::task::yield_now().await;
    assert_eq!(backend.directives(), vec!["reset"]);
}

/// A backend hang-up mid-command fails the session.
#[tokio::test]
async fn test_session_fails_on_backend_hangup() {
    let mut backend = MemoryBackend::spawn(|_| vec![Reply::Hangup]);
    let mut sink = PacedSink::new(usize::MAX);
    let mut proxy = Proxy::new(config());

    let (mut writer, reader) = duplex(4096);
    writer.write_all(b"reset\n").await.unwrap();

    let err = proxy
        .run(&mut backend, Box::new(reader), &mut sink)
        .await
        .unwrap_err();
    assert!(matches!(err, ProxyError::ConnectionClosed("backend")));
    assert!(proxy.session().fault.is_set());
    drop(writer);
}

/// A bad argument is reported to the client and later commands still run.
#[tokio::test]
async fn test_malformed_command_reported_and_session_continues() {
    let mut backend = MemoryBackend::prompting("PyMOL>", ImageFormat::Bmp, Bytes::from_static(b"B"));
    let mut sink = PacedSink::new(usize::MAX);
    let mut proxy = Proxy::new(config());

    let client = client_input("rotate 1 x 0\nframe 3 -defer\n");
    proxy.run(&mut backend, client, &mut sink).await.unwrap();

    assert_eq!(
        sink.received,
        b"nv>error rotate: expected a number for y angle, got \"x\"\n"
    );
    assert_eq!(backend.directives(), vec!["frame 3"]);
    assert_eq!(proxy.session().stats.commands, 2);
}

/// Backend exit ends the session with its outcome.
#[tokio::test]
async fn test_backend_exit_ends_session() {
    let mut backend = MemoryBackend::spawn(|line| {
        if line == "quit" {
            vec![Reply::Exit(ExitOutcome::signaled(9))]
        } else {
            vec![Reply::prompt("PyMOL>")]
        }
    });
    let mut sink = PacedSink::new(usize::MAX);
    let mut proxy = Proxy::new(config());

    let (mut writer, reader) = duplex(4096);
    writer.write_all(b"frame 2 -defer\nraw quit\n").await.unwrap();

    let end = proxy
        .run(&mut backend, Box::new(reader), &mut sink)
        .await
        .unwrap();
    assert_eq!(end, SessionEnd::BackendExited(ExitOutcome::signaled(9)));
    assert_eq!(ExitOutcome::signaled(9).exit_code(), 137);
    drop(writer);
}

// ============================================================================
// Client transport
// ============================================================================

/// Full session over a TCP client connection.
#[tokio::test]
async fn test_tcp_client_session() {
    let endpoint: ClientEndpoint = "127.0.0.1:0".parse().unwrap();
    let listener = ClientListener::bind(&endpoint).await.unwrap();
    let ClientEndpoint::Tcp(addr) = listener.local_endpoint().unwrap() else {
        panic!("expected a TCP endpoint");
    };

    let client = tokio::spawn(async move {
        let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
        stream.write_all(b"screen 320 240 -push\n").await.unwrap();

        let mut expected = b"vizproxy ".len() + env!("CARGO_PKG_VERSION").len() + 1;
        expected += b"nv>image 3 0 1 0\nBMP".len();
        let mut received = vec![0u8; expected];
        stream.read_exact(&mut received).await.unwrap();
        received
    });

    let mut conn = listener.accept().await.unwrap();
    let mut backend = MemoryBackend::prompting("PyMOL>", ImageFormat::Bmp, Bytes::from_static(b"BMP"));
    let mut config = config();
    config.banner = Some(vizproxy::config::default_banner());
    let mut proxy = Proxy::new(config);

    let end = proxy
        .run(&mut backend, conn.reader, &mut conn.writer)
        .await
        .unwrap();
    assert_eq!(end, SessionEnd::ClientClosed);

    let received = client.await.unwrap();
    let text = String::from_utf8_lossy(&received);
    assert!(text.starts_with("vizproxy "));
    assert!(text.ends_with("\nnv>image 3 0 1 0\nBMP"));
    assert_eq!(backend.directives(), vec!["viewport 320,240;refresh", "bmp -"]);
}
