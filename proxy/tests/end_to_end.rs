//! End-to-end tests over real sockets.
//!
//! Each test runs the balancer on a background thread, connects backends to
//! the backend listeners and sends HTTP requests through the frontend.

use balancer::client::SERVER_UNAVAILABLE;
use balancer::{Config, Worker};
use memchr::memmem;
use socket2::{Domain, Protocol, Socket, Type};
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

/// Get an available port for testing.
fn get_available_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

fn addr(port: u16) -> SocketAddr {
    format!("127.0.0.1:{}", port).parse().unwrap()
}

struct Running {
    shutdown: Arc<AtomicBool>,
    handle: thread::JoinHandle<()>,
}

impl Running {
    fn stop(self) {
        self.shutdown.store(true, Ordering::SeqCst);
        self.handle.join().unwrap();
    }
}

fn start(config_str: &str) -> Running {
    let config: Config = config_str.parse().unwrap();
    let worker = Worker::bind(&config).unwrap();
    let shutdown = Arc::new(AtomicBool::new(false));
    let flag = shutdown.clone();
    let handle = thread::spawn(move || worker.run(&flag).unwrap());
    Running { shutdown, handle }
}

fn config(frontend: u16, backend: u16, extra: &str) -> String {
    format!(
        r#"
cluster_address = "127.0.0.1"
cluster_port = {frontend}
{extra}

[[map]]
incoming = ["app.example.com"]
outgoing = ["127.0.0.1:{backend}"]
keepalive = true
default = true
"#
    )
}

fn response(body: &[u8]) -> Vec<u8> {
    let mut response = format!("HTTP/1.1 200 OK\r\nContent-Length: {}\r\n\r\n", body.len()).into_bytes();
    response.extend_from_slice(body);
    response
}

/// Connect a backend, announce `id` and answer `requests` requests with
/// `body`. Returns the request heads it saw.
fn spawn_backend(
    port: u16,
    id: &'static [u8],
    body: impl Into<Vec<u8>>,
    requests: usize,
) -> thread::JoinHandle<Vec<Vec<u8>>> {
    let body = body.into();
    let mut stream = TcpStream::connect(addr(port)).unwrap();
    stream.set_nodelay(true).unwrap();
    stream.write_all(id).unwrap();

    thread::spawn(move || {
        stream
            .set_read_timeout(Some(Duration::from_secs(10)))
            .unwrap();
        let mut seen = Vec::new();
        let mut pending = Vec::new();
        let mut buf = [0u8; 4096];

        while seen.len() < requests {
            if let Some(end) = memmem::find(&pending, b"\r\n\r\n") {
                seen.push(pending.drain(..end + 4).collect());
                stream.write_all(&response(&body)).unwrap();
                continue;
            }
            let n = stream.read(&mut buf).unwrap();
            assert!(n > 0, "balancer closed the backend connection");
            pending.extend_from_slice(&buf[..n]);
        }
        seen
    })
}

/// Send one request and read until the balancer closes the connection.
fn request(port: u16, path: &str, host: Option<&str>) -> Vec<u8> {
    let mut stream = TcpStream::connect(addr(port)).unwrap();
    stream
        .set_read_timeout(Some(Duration::from_secs(10)))
        .unwrap();

    let mut head = format!("GET {path} HTTP/1.1\r\n");
    if let Some(host) = host {
        head.push_str(&format!("Host: {host}\r\n"));
    }
    head.push_str("\r\n");
    stream.write_all(head.as_bytes()).unwrap();

    let mut response = Vec::new();
    stream.read_to_end(&mut response).unwrap();
    response
}

#[test]
fn relays_response_and_reuses_backend() {
    let frontend = get_available_port();
    let backend = get_available_port();
    let running = start(&config(frontend, backend, ""));
    thread::sleep(Duration::from_millis(100));

    let backend_thread = spawn_backend(backend, b"abcdefghijkl", b"hello", 3);

    for _ in 0..3 {
        let reply = request(frontend, "/index.html", Some("app.example.com"));
        assert_eq!(reply, response(b"hello"));
    }

    let seen = backend_thread.join().unwrap();
    assert_eq!(seen.len(), 3);
    assert!(seen[0].starts_with(b"GET /index.html HTTP/1.1\r\nHost: app.example.com\r\n"));

    running.stop();
}

#[test]
fn client_waits_for_a_backend_to_connect() {
    let frontend = get_available_port();
    let backend = get_available_port();
    let running = start(&config(frontend, backend, ""));
    thread::sleep(Duration::from_millis(100));

    // no Host header: served by the default route
    let client = thread::spawn(move || request(frontend, "/", None));
    thread::sleep(Duration::from_millis(200));

    let backend_thread = spawn_backend(backend, b"abcdefghijkl", b"late", 1);
    assert_eq!(client.join().unwrap(), response(b"late"));
    backend_thread.join().unwrap();

    running.stop();
}

#[test]
fn sticky_request_reaches_its_backend() {
    let frontend = get_available_port();
    let backend = get_available_port();
    let running = start(&config(frontend, backend, ""));
    thread::sleep(Duration::from_millis(100));

    let first = spawn_backend(backend, b"aaaaaaaaaaaa", b"first", 1);
    let second = spawn_backend(backend, b"bbbbbbbbbbbb", b"second", 1);
    thread::sleep(Duration::from_millis(200));

    let reply = request(
        frontend,
        "/app-eu-1.example.com-bbbbbbbbbbbb",
        Some("app.example.com"),
    );
    assert_eq!(reply, response(b"second"));
    second.join().unwrap();

    let reply = request(frontend, "/", Some("app.example.com"));
    assert_eq!(reply, response(b"first"));
    first.join().unwrap();

    running.stop();
}

#[test]
fn waiting_client_is_answered_with_503() {
    let frontend = get_available_port();
    let backend = get_available_port();
    let extra = r#"timeout = 0.3

[timers]
clock_tick_ms = 50
sweep_interval_ms = 50
"#;
    let running = start(&config(frontend, backend, extra));
    thread::sleep(Duration::from_millis(100));

    let reply = request(frontend, "/", Some("app.example.com"));
    assert_eq!(reply, SERVER_UNAVAILABLE);

    running.stop();
}

#[test]
fn large_response_reaches_slow_client_intact() {
    let frontend = get_available_port();
    let backend = get_available_port();
    let running = start(&config(frontend, backend, ""));
    thread::sleep(Duration::from_millis(100));

    let body: Vec<u8> = (0..8 * 1024 * 1024).map(|i| (i % 251) as u8).collect();
    let expected = response(&body);
    let backend_thread = spawn_backend(backend, b"abcdefghijkl", body, 2);

    // a small receive window keeps the balancer's writes blocking
    let socket = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP)).unwrap();
    socket.set_recv_buffer_size(16 * 1024).unwrap();
    socket.connect(&addr(frontend).into()).unwrap();
    let mut stream: TcpStream = socket.into();
    stream
        .set_read_timeout(Some(Duration::from_secs(10)))
        .unwrap();
    stream
        .write_all(b"GET /big HTTP/1.1\r\nHost: app.example.com\r\n\r\n")
        .unwrap();

    // let the backend finish while nothing is being read
    thread::sleep(Duration::from_millis(500));

    let mut received = Vec::with_capacity(expected.len());
    let mut chunk = [0u8; 16 * 1024];
    loop {
        let n = stream.read(&mut chunk).unwrap();
        if n == 0 {
            break;
        }
        received.extend_from_slice(&chunk[..n]);
        thread::sleep(Duration::from_millis(1));
    }
    assert_eq!(received.len(), expected.len());
    assert!(received == expected, "response bytes differ");

    // the backend went back to the pool and serves the next request
    let reply = request(frontend, "/again", Some("app.example.com"));
    assert_eq!(reply.len(), expected.len());
    assert!(reply == expected, "second response bytes differ");

    let seen = backend_thread.join().unwrap();
    assert_eq!(seen.len(), 2);
    assert!(seen[1].starts_with(b"GET /again HTTP/1.1\r\n"));

    running.stop();
}

#[test]
fn shared_outgoing_address_binds_once() {
    let frontend = get_available_port();
    let backend = get_available_port();
    let config: Config = format!(
        r#"
cluster_address = "127.0.0.1"
cluster_port = {frontend}

[[map]]
incoming = ["a.example.com"]
outgoing = ["127.0.0.1:{backend}"]
keepalive = true

[[map]]
incoming = ["b.example.com"]
outgoing = ["127.0.0.1:{backend}"]
keepalive = true
"#
    )
    .parse()
    .unwrap();

    let worker = Worker::bind(&config).unwrap();
    assert_eq!(worker.listener_count(), 2);
    assert_eq!(worker.backend_addrs().len(), 1);
}
