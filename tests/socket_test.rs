//! Integration tests for the socket manager
//!
//! Real sockets on 127.0.0.1 with blocking std clients:
//! - HTTP round trips through a kernel listener
//! - Pipelined requests answered in arrival order
//! - Slow dependency construction stays off the selector threads
//! - Processes that fail or never answer get the failure response
//! - Half-sent requests, idle connections and bad TLS never start jobs
//! - TLS round trip with a CA-signed certificate

use std::io::{Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use bytes::BytesMut;
use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, ServerName};
use rustls::{ClientConfig, ClientConnection, RootCertStore, StreamOwned};
use team_kernel::config::{ListenerConfig, ManagedObjectConfig, TeamConfig, TlsConfig};
use team_kernel::core::{source_fn, Outcome, TaskSpec};
use team_kernel::infra::{
    HttpProtocol, HttpRequest, HttpResponse, Inbound, LineProtocol, ResponseWriter, SocketManager,
};
use team_kernel::Kernel;

const TIMEOUT: Duration = Duration::from_secs(5);

// ============================================================================
// HELPERS
// ============================================================================

fn fixture(name: &str) -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("tests/fixtures")
        .join(name)
}

fn tls_config() -> TlsConfig {
    TlsConfig {
        cert_path: fixture("server.crt"),
        key_path: fixture("server.key"),
    }
}

fn listener_config() -> ListenerConfig {
    ListenerConfig::new("127.0.0.1:0")
        .with_selector_loops(2)
        .with_housekeeping_interval_ms(50)
}

/// Poll `condition` until it holds or the timeout elapses.
fn eventually(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + TIMEOUT;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    false
}

fn connect(addr: SocketAddr) -> TcpStream {
    let stream = TcpStream::connect(addr).unwrap();
    stream.set_read_timeout(Some(TIMEOUT)).unwrap();
    stream
}

fn read_response(stream: &mut impl Read, buffer: &mut BytesMut) -> HttpResponse {
    let mut chunk = [0_u8; 4096];
    loop {
        if let Some(response) = HttpProtocol::decode_response(buffer).unwrap() {
            return response;
        }
        let n = stream.read(&mut chunk).expect("response bytes");
        assert!(n > 0, "connection closed before a full response");
        buffer.extend_from_slice(&chunk[..n]);
    }
}

/// Kernel serving `GET /path` with `echo /path`; `/fail` errors and
/// `/silent` finishes without answering. Requests for `/slow/N` sleep
/// `N` milliseconds first.
fn echo_kernel(config: ListenerConfig, jobs: Arc<AtomicUsize>) -> Kernel {
    let kernel = Kernel::builder()
        .team(TeamConfig::fixed_pool("handlers", 4))
        .task(TaskSpec::new("serve", "handlers", move |ctx| {
            jobs.fetch_add(1, Ordering::SeqCst);
            let inbound = ctx
                .take_argument::<Inbound<HttpProtocol>>()
                .ok_or_else(|| anyhow::anyhow!("missing request"))?;
            let path = inbound.request.path.clone();
            if let Some(ms) = path.strip_prefix("/slow/") {
                thread::sleep(Duration::from_millis(ms.parse()?));
            }
            match path.as_str() {
                "/fail" => anyhow::bail!("handler failed"),
                "/silent" => Ok(Outcome::Finish),
                _ => {
                    inbound
                        .writer
                        .send(HttpResponse::ok(format!("echo {path}")))
                        .map_err(|refused| refused.reason)?;
                    Ok(Outcome::Finish)
                }
            }
        }))
        .listener("web", config, HttpProtocol::default(), "serve")
        .build()
        .unwrap();
    kernel.open_kernel().unwrap();
    kernel
}

// ============================================================================
// PLAIN HTTP
// ============================================================================

#[test]
fn test_http_round_trip() {
    let jobs = Arc::new(AtomicUsize::new(0));
    let kernel = echo_kernel(listener_config(), Arc::clone(&jobs));
    let addr = kernel.listener_addr("web").unwrap();

    let mut stream = connect(addr);
    let mut buffer = BytesMut::new();
    for path in ["/hello", "/world"] {
        stream
            .write_all(&HttpProtocol::encode_request(&HttpRequest::get(path)))
            .unwrap();
        let response = read_response(&mut stream, &mut buffer);
        assert_eq!(response.status, 200);
        assert_eq!(&response.body[..], format!("echo {path}").as_bytes());
    }

    assert_eq!(jobs.load(Ordering::SeqCst), 2);
    let stats = kernel.listener_stats("web").unwrap();
    assert_eq!(stats.accepted, 1);
    assert_eq!(stats.requests, 2);
    assert!(stats.bytes_written > 0);
}

#[test]
fn test_pipelined_responses_keep_request_order() {
    let jobs = Arc::new(AtomicUsize::new(0));
    let kernel = echo_kernel(listener_config(), Arc::clone(&jobs));
    let addr = kernel.listener_addr("web").unwrap();

    let mut stream = connect(addr);
    // The first request takes longest, so processes finish out of order.
    let paths = ["/slow/150", "/slow/75", "/slow/0"];
    let mut wire = Vec::new();
    for path in paths {
        wire.extend_from_slice(&HttpProtocol::encode_request(&HttpRequest::get(path)));
    }
    stream.write_all(&wire).unwrap();

    let mut buffer = BytesMut::new();
    for path in paths {
        let response = read_response(&mut stream, &mut buffer);
        assert_eq!(&response.body[..], format!("echo {path}").as_bytes());
    }
}

#[test]
fn test_failed_or_silent_process_gets_failure_response() {
    let jobs = Arc::new(AtomicUsize::new(0));
    let kernel = echo_kernel(listener_config(), Arc::clone(&jobs));
    let addr = kernel.listener_addr("web").unwrap();

    let mut stream = connect(addr);
    let mut buffer = BytesMut::new();
    for path in ["/fail", "/silent", "/ok"] {
        stream
            .write_all(&HttpProtocol::encode_request(&HttpRequest::get(path)))
            .unwrap();
    }
    assert_eq!(read_response(&mut stream, &mut buffer).status, 500);
    assert_eq!(read_response(&mut stream, &mut buffer).status, 500);
    assert_eq!(read_response(&mut stream, &mut buffer).status, 200);
}

#[test]
fn test_slow_source_does_not_stall_other_connections() {
    let created_on = Arc::new(parking_lot::Mutex::new(Vec::new()));
    let first = Arc::new(AtomicUsize::new(0));
    let threads = Arc::clone(&created_on);
    let kernel = Kernel::builder()
        .team(TeamConfig::fixed_pool("handlers", 4))
        .managed_object_with(
            "conn",
            ManagedObjectConfig::eager(),
            source_fn(move || {
                threads
                    .lock()
                    .push(thread::current().name().unwrap_or_default().to_string());
                if first.fetch_add(1, Ordering::SeqCst) == 0 {
                    thread::sleep(Duration::from_millis(1500));
                }
                Ok(())
            }),
        )
        .task(
            TaskSpec::new("serve", "handlers", |ctx| {
                let inbound = ctx
                    .take_argument::<Inbound<HttpProtocol>>()
                    .ok_or_else(|| anyhow::anyhow!("missing request"))?;
                let path = inbound.request.path.clone();
                inbound
                    .writer
                    .send(HttpResponse::ok(format!("echo {path}")))
                    .map_err(|refused| refused.reason)?;
                Ok(Outcome::Finish)
            })
            .depends_on("conn"),
        )
        .listener("web", listener_config().with_selector_loops(1), HttpProtocol::default(), "serve")
        .build()
        .unwrap();
    kernel.open_kernel().unwrap();
    let addr = kernel.listener_addr("web").unwrap();

    let mut slow = connect(addr);
    slow.write_all(&HttpProtocol::encode_request(&HttpRequest::get("/slow")))
        .unwrap();
    assert!(eventually(|| created_on.lock().len() == 1));

    // Same selector loop; answered while the first source is still building.
    let started = Instant::now();
    let mut fast = connect(addr);
    fast.write_all(&HttpProtocol::encode_request(&HttpRequest::get("/fast")))
        .unwrap();
    let response = read_response(&mut fast, &mut BytesMut::new());
    assert_eq!(&response.body[..], b"echo /fast");
    assert!(started.elapsed() < Duration::from_millis(1000));

    let response = read_response(&mut slow, &mut BytesMut::new());
    assert_eq!(&response.body[..], b"echo /slow");
    assert!(created_on.lock().iter().all(|name| !name.contains("selector")));
}

#[test]
fn test_partial_request_then_close_starts_no_job() {
    let jobs = Arc::new(AtomicUsize::new(0));
    let kernel = echo_kernel(listener_config(), Arc::clone(&jobs));
    let addr = kernel.listener_addr("web").unwrap();

    let mut stream = connect(addr);
    stream.write_all(b"GET /half HTTP/1.1\r\nHost: loc").unwrap();
    stream.shutdown(Shutdown::Write).unwrap();

    // The server closes its side once it sees EOF.
    let mut rest = Vec::new();
    let _ = stream.read_to_end(&mut rest);
    assert!(rest.is_empty());

    assert!(eventually(|| kernel.listener_stats("web").unwrap().closed == 1));
    assert_eq!(jobs.load(Ordering::SeqCst), 0);
    assert_eq!(kernel.listener_stats("web").unwrap().requests, 0);
}

#[test]
fn test_oversized_body_closes_connection() {
    let jobs = Arc::new(AtomicUsize::new(0));
    let kernel = echo_kernel(listener_config(), Arc::clone(&jobs));
    let addr = kernel.listener_addr("web").unwrap();

    let mut stream = connect(addr);
    stream
        .write_all(b"POST /big HTTP/1.1\r\nContent-Length: 999999999999\r\n\r\n")
        .unwrap();
    let _ = stream.write_all(&[b'x'; 64 * 1024]);
    let mut rest = Vec::new();
    let _ = stream.read_to_end(&mut rest);

    assert!(eventually(|| kernel.listener_stats("web").unwrap().protocol_errors == 1));
    assert_eq!(jobs.load(Ordering::SeqCst), 0);
}

#[test]
fn test_idle_connection_is_evicted() {
    let jobs = Arc::new(AtomicUsize::new(0));
    let kernel = echo_kernel(listener_config().with_idle_timeout_ms(200), Arc::clone(&jobs));
    let addr = kernel.listener_addr("web").unwrap();

    let mut stream = connect(addr);
    let started = Instant::now();
    let mut byte = [0_u8; 1];
    let n = stream.read(&mut byte).unwrap_or(0);
    assert_eq!(n, 0);
    assert!(started.elapsed() >= Duration::from_millis(150));

    assert!(eventually(|| kernel.listener_stats("web").unwrap().idle_evicted == 1));
    assert_eq!(jobs.load(Ordering::SeqCst), 0);
}

#[test]
fn test_undecodable_input_closes_connection() {
    let seen = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&seen);
    let manager = SocketManager::bind(
        "lines",
        listener_config(),
        LineProtocol::with_max_line(8),
        move |line: String, writer: ResponseWriter<LineProtocol>| {
            counter.fetch_add(1, Ordering::SeqCst);
            let _ = writer.send(line.to_uppercase());
        },
    )
    .unwrap();

    let mut stream = connect(manager.local_addr());
    stream.write_all(b"ok\n").unwrap();
    let mut reply = [0_u8; 3];
    stream.read_exact(&mut reply).unwrap();
    assert_eq!(&reply, b"OK\n");

    stream.write_all(b"this line never ends").unwrap();
    let mut rest = Vec::new();
    let _ = stream.read_to_end(&mut rest);

    assert!(eventually(|| manager.stats().protocol_errors == 1));
    assert_eq!(seen.load(Ordering::SeqCst), 1);
    manager.shutdown();
    assert!(!manager.is_running());
}

#[test]
fn test_shutdown_closes_open_connections() {
    let manager = SocketManager::bind(
        "lines",
        listener_config(),
        LineProtocol::default(),
        |line: String, writer: ResponseWriter<LineProtocol>| {
            let _ = writer.send(line);
        },
    )
    .unwrap();
    let mut stream = connect(manager.local_addr());
    assert!(eventually(|| manager.stats().active == 1));

    manager.shutdown();
    manager.shutdown();
    let mut rest = Vec::new();
    let _ = stream.read_to_end(&mut rest);
    assert_eq!(manager.stats().active, 0);
    assert_eq!(manager.stats().closed, 1);
}

// ============================================================================
// TLS
// ============================================================================

fn tls_client(addr: SocketAddr) -> StreamOwned<ClientConnection, TcpStream> {
    let mut roots = RootCertStore::empty();
    roots
        .add(CertificateDer::from_pem_file(fixture("ca.crt")).unwrap())
        .unwrap();
    let config = ClientConfig::builder_with_provider(Arc::new(
        rustls::crypto::ring::default_provider(),
    ))
    .with_safe_default_protocol_versions()
    .unwrap()
    .with_root_certificates(roots)
    .with_no_client_auth();
    let server_name = ServerName::try_from("localhost").unwrap();
    let connection = ClientConnection::new(Arc::new(config), server_name).unwrap();
    StreamOwned::new(connection, connect(addr))
}

#[test]
fn test_tls_round_trip() {
    let jobs = Arc::new(AtomicUsize::new(0));
    let kernel = echo_kernel(listener_config().with_tls(tls_config()), Arc::clone(&jobs));
    let addr = kernel.listener_addr("web").unwrap();

    let mut stream = tls_client(addr);
    stream
        .write_all(&HttpProtocol::encode_request(&HttpRequest::get("/secure")))
        .unwrap();
    let mut buffer = BytesMut::new();
    let response = read_response(&mut stream, &mut buffer);
    assert_eq!(response.status, 200);
    assert_eq!(&response.body[..], b"echo /secure");
    assert_eq!(kernel.listener_stats("web").unwrap().handshake_failures, 0);
}

#[test]
fn test_failed_handshake_starts_no_job() {
    let jobs = Arc::new(AtomicUsize::new(0));
    let kernel = echo_kernel(listener_config().with_tls(tls_config()), Arc::clone(&jobs));
    let addr = kernel.listener_addr("web").unwrap();

    // Plain HTTP against a TLS listener.
    let mut stream = connect(addr);
    stream
        .write_all(&HttpProtocol::encode_request(&HttpRequest::get("/plain")))
        .unwrap();
    let mut rest = Vec::new();
    let _ = stream.read_to_end(&mut rest);

    assert!(eventually(|| kernel.listener_stats("web").unwrap().handshake_failures == 1));
    assert_eq!(jobs.load(Ordering::SeqCst), 0);
    assert_eq!(kernel.listener_stats("web").unwrap().requests, 0);
}
