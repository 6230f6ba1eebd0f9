//! HTTP stats server.
//!
//! Serves `GET /stats` as JSON from a background thread. Uses `tiny_http`,
//! which runs on both host and ESP32 (via std::net).
//!
//! # Example Response
//!
//! ```json
//! {
//!   "mode": "wan",
//!   "powered": true,
//!   "sync_in_use": 1,
//!   "sync_capacity": 10,
//!   "wan": { "state": "joined", "joined": true, "pending_tx": false, ... }
//! }
//! ```

use crate::manager::LoraManager;
use crate::stats::LoraStats;
use log::{error, info, warn};
use std::io;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tiny_http::{Header, Method, Response, Server};

pub const DEFAULT_STATS_PORT: u16 = 8080;

/// Anything that can produce a stats snapshot.
pub trait StatsSource: Send + Sync {
    fn snapshot(&self) -> LoraStats;
}

impl StatsSource for LoraManager {
    fn snapshot(&self) -> LoraStats {
        self.stats()
    }
}

/// Runs in a background thread; drop it to stop.
pub struct StatsServer {
    handle: Option<thread::JoinHandle<()>>,
    shutdown: Arc<AtomicBool>,
    port: u16,
}

impl StatsServer {
    /// Bind and start serving. `None` binds every interface; port 0 picks
    /// a free port.
    pub fn start(
        bind_addr: Option<IpAddr>,
        port: u16,
        source: Arc<dyn StatsSource>,
    ) -> io::Result<Self> {
        let addr = match bind_addr {
            Some(ip) => format!("{}:{}", ip, port),
            None => format!("0.0.0.0:{}", port),
        };

        let server = Server::http(&addr)
            .map_err(|e| io::Error::new(io::ErrorKind::AddrInUse, format!("{}", e)))?;
        let port = server
            .server_addr()
            .to_ip()
            .map(|a| a.port())
            .unwrap_or(port);

        info!("Stats server listening on http://{}/stats", addr);

        let shutdown = Arc::new(AtomicBool::new(false));
        let flag = shutdown.clone();
        let handle = thread::Builder::new()
            .name("lora-stats".into())
            .spawn(move || Self::run_server(server, source, flag))?;

        Ok(Self {
            handle: Some(handle),
            shutdown,
            port,
        })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    fn run_server(server: Server, source: Arc<dyn StatsSource>, shutdown: Arc<AtomicBool>) {
        let (Ok(content_type), Ok(location), Ok(allow_get)) = (
            Header::from_bytes(&b"Content-Type"[..], &b"application/json"[..]),
            Header::from_bytes(&b"Location"[..], &b"/stats"[..]),
            Header::from_bytes(&b"Allow"[..], &b"GET"[..]),
        ) else {
            error!("stats server: bad static header");
            return;
        };

        loop {
            if shutdown.load(Ordering::Acquire) {
                info!("Stats server shutting down");
                break;
            }

            let request = match server.recv_timeout(Duration::from_millis(100)) {
                Ok(Some(request)) => request,
                Ok(None) => continue,
                Err(e) => {
                    error!("Server error: {}", e);
                    break;
                }
            };

            if request.method() != &Method::Get {
                let response = Response::from_string("Method Not Allowed")
                    .with_status_code(405)
                    .with_header(allow_get.clone());
                let _ = request.respond(response);
                continue;
            }

            let result = match request.url() {
                "/stats" | "/stats/" => {
                    let response = Response::from_string(source.snapshot().to_json())
                        .with_header(content_type.clone())
                        .with_status_code(200);
                    request.respond(response)
                }
                "/" => {
                    let response = Response::from_string("See /stats for stack statistics")
                        .with_status_code(302)
                        .with_header(location.clone());
                    request.respond(response)
                }
                _ => request.respond(Response::from_string("Not Found").with_status_code(404)),
            };
            if let Err(e) = result {
                warn!("Failed to send response: {}", e);
            }
        }
    }

    /// Stop the server. May take up to one 100 ms poll.
    pub fn stop(&mut self) {
        self.shutdown.store(true, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for StatsServer {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::net::{Ipv4Addr, TcpStream};

    struct Fixed;

    impl StatsSource for Fixed {
        fn snapshot(&self) -> LoraStats {
            LoraStats {
                mode: None,
                powered: false,
                sync_in_use: 0,
                sync_capacity: 4,
                raw: None,
                wan: None,
            }
        }
    }

    fn get(port: u16, method: &str, path: &str) -> String {
        let mut stream = TcpStream::connect((Ipv4Addr::LOCALHOST, port)).unwrap();
        write!(
            stream,
            "{} {} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n",
            method, path
        )
        .unwrap();
        let mut text = String::new();
        stream.read_to_string(&mut text).unwrap();
        text
    }

    #[test]
    fn test_routes() {
        let server = StatsServer::start(Some(Ipv4Addr::LOCALHOST.into()), 0, Arc::new(Fixed)).unwrap();
        let port = server.port();

        let stats = get(port, "GET", "/stats");
        assert!(stats.starts_with("HTTP/1.1 200"));
        assert!(stats.contains(r#""sync_capacity":4"#));

        assert!(get(port, "GET", "/").starts_with("HTTP/1.1 302"));
        assert!(get(port, "GET", "/nope").starts_with("HTTP/1.1 404"));
        assert!(get(port, "POST", "/stats").starts_with("HTTP/1.1 405"));
    }

    #[test]
    fn test_stop_joins_thread() {
        let mut server =
            StatsServer::start(Some(Ipv4Addr::LOCALHOST.into()), 0, Arc::new(Fixed)).unwrap();
        server.stop();
        assert!(server.handle.is_none());
    }
}
