//! Test support: a scripted loopback HTTP server
//!
//! Each connection pops canned responses off a shared queue, one per
//! received request, so tests control exactly what arrives on the wire,
//! including truncated bodies, delayed writes and early closes.

#![allow(dead_code)]

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

/// One pre-baked response with write behavior knobs
#[derive(Clone)]
pub struct CannedResponse {
    pub raw: Vec<u8>,
    pub delay: Duration,
    pub close_after: bool,
}

impl CannedResponse {
    pub fn raw(raw: Vec<u8>) -> Self {
        Self {
            raw,
            delay: Duration::ZERO,
            close_after: false,
        }
    }

    /// 200 with a Content-Length body, keep-alive
    pub fn ok(body: &[u8]) -> Self {
        Self::status(200, "OK", &[], body)
    }

    /// Arbitrary status with explicit extra headers and a sized body
    pub fn status(status: u16, reason: &str, headers: &[(&str, &str)], body: &[u8]) -> Self {
        let mut raw = format!("HTTP/1.1 {status} {reason}\r\n");
        for (name, value) in headers {
            raw.push_str(&format!("{name}: {value}\r\n"));
        }
        raw.push_str(&format!("Content-Length: {}\r\n\r\n", body.len()));
        let mut raw = raw.into_bytes();
        raw.extend_from_slice(body);
        Self::raw(raw)
    }

    /// Redirect with an empty body so the connection stays reusable
    pub fn redirect(status: u16, location: &str) -> Self {
        Self::status(status, "Redirect", &[("Location", location)], b"")
    }

    /// Declare `declared` body bytes but only send a prefix, then close
    pub fn truncated(declared: usize, sent: &[u8]) -> Self {
        let mut raw = format!("HTTP/1.1 200 OK\r\nContent-Length: {declared}\r\n\r\n").into_bytes();
        raw.extend_from_slice(sent);
        Self::raw(raw).then_close()
    }

    /// Close the connection without writing anything
    pub fn slam() -> Self {
        Self::raw(Vec::new()).then_close()
    }

    pub fn delayed(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn then_close(mut self) -> Self {
        self.close_after = true;
        self
    }
}

/// Loopback server answering from a shared response queue
pub struct TestServer {
    addr: SocketAddr,
    responses: Arc<Mutex<VecDeque<CannedResponse>>>,
    requests: Arc<Mutex<Vec<String>>>,
    connections: Arc<AtomicUsize>,
}

impl TestServer {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let responses: Arc<Mutex<VecDeque<CannedResponse>>> = Arc::default();
        let requests: Arc<Mutex<Vec<String>>> = Arc::default();
        let connections = Arc::new(AtomicUsize::new(0));

        {
            let responses = Arc::clone(&responses);
            let requests = Arc::clone(&requests);
            let connections = Arc::clone(&connections);
            tokio::spawn(async move {
                loop {
                    let Ok((stream, _)) = listener.accept().await else {
                        break;
                    };
                    connections.fetch_add(1, Ordering::SeqCst);
                    let responses = Arc::clone(&responses);
                    let requests = Arc::clone(&requests);
                    tokio::spawn(serve_connection(stream, responses, requests));
                }
            });
        }

        Self {
            addr,
            responses,
            requests,
            connections,
        }
    }

    pub fn push(&self, response: CannedResponse) {
        self.responses.lock().push_back(response);
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    pub fn host(&self) -> String {
        self.addr.to_string()
    }

    /// Full request texts in arrival order
    pub fn requests(&self) -> Vec<String> {
        self.requests.lock().clone()
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().len()
    }

    pub fn connection_count(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }
}

async fn serve_connection(
    mut stream: TcpStream,
    responses: Arc<Mutex<VecDeque<CannedResponse>>>,
    requests: Arc<Mutex<Vec<String>>>,
) {
    loop {
        let Some(request) = read_request_head(&mut stream).await else {
            break;
        };
        requests.lock().push(request);

        let Some(response) = responses.lock().pop_front() else {
            break;
        };
        if !response.delay.is_zero() {
            tokio::time::sleep(response.delay).await;
        }
        if !response.raw.is_empty() && stream.write_all(&response.raw).await.is_err() {
            break;
        }
        stream.flush().await.ok();
        if response.close_after {
            break;
        }
    }
}

/// Read until the blank line ending a (bodyless) request head
async fn read_request_head(stream: &mut TcpStream) -> Option<String> {
    let mut head = Vec::new();
    let mut buf = [0u8; 1024];
    loop {
        if head.windows(4).any(|w| w == b"\r\n\r\n") {
            return Some(String::from_utf8_lossy(&head).into_owned());
        }
        match stream.read(&mut buf).await {
            Ok(0) | Err(_) => return None,
            Ok(n) => head.extend_from_slice(&buf[..n]),
        }
    }
}
