//! HTTP and WebSocket front end.
//!
//! The accept thread only accepts. Each connection goes to a small request
//! pool that reads the head, answers plain HTTP (viewer page, snapshot,
//! health) and passes WebSocket upgrades to a bounded pool of session workers.
//! The session pool size caps concurrent viewers; upgrades beyond it and its
//! queue are refused with 503.

mod http;
mod pool;
mod ws;

use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};

use crate::detect::DetectionEngine;
use crate::frame::FrameCache;
use crate::session::{SessionConfig, SessionLoop};

use self::http::{consume_head, peek_request, write_json_response, write_response, HttpRequest};
use self::pool::WorkerPool;
use self::ws::WsChannel;

const VIEWER_PAGE: &str = include_str!("viewer.html");

/// Threads reading request heads. A silent client holds one for at most
/// `http::REQUEST_TIMEOUT`.
const REQUEST_WORKERS: usize = 4;
const REQUEST_QUEUE: usize = 32;

#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub addr: String,
    pub max_sessions: usize,
    pub queue_depth: usize,
    pub session: SessionConfig,
    /// Per-cycle wait for client commands.
    pub recv_timeout: Duration,
    pub write_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            addr: "0.0.0.0:8080".to_string(),
            max_sessions: 8,
            queue_depth: 4,
            session: SessionConfig::default(),
            recv_timeout: Duration::from_millis(5),
            write_timeout: Duration::from_secs(2),
        }
    }
}

// ----------------------------------------------------------------------------
// Server / ServerHandle
// ----------------------------------------------------------------------------

pub struct Server {
    config: ServerConfig,
    cache: Arc<FrameCache>,
    engine: Arc<DetectionEngine>,
}

#[derive(Debug)]
pub struct ServerHandle {
    pub addr: SocketAddr,
    shutdown: Arc<AtomicBool>,
    active: Arc<AtomicUsize>,
    join: Option<JoinHandle<()>>,
}

impl ServerHandle {
    pub fn active_sessions(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Stop accepting, signal every session to close and wait for them.
    pub fn stop(mut self) -> Result<()> {
        self.shutdown_and_join()
    }

    fn shutdown_and_join(&mut self) -> Result<()> {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(join) = self.join.take() {
            join.join()
                .map_err(|_| anyhow!("server accept thread panicked"))?;
            log::info!("server on {} stopped", self.addr);
        }
        Ok(())
    }
}

impl Drop for ServerHandle {
    fn drop(&mut self) {
        if let Err(err) = self.shutdown_and_join() {
            log::error!("{:#}", err);
        }
    }
}

impl Server {
    pub fn new(config: ServerConfig, cache: Arc<FrameCache>, engine: Arc<DetectionEngine>) -> Self {
        Self {
            config,
            cache,
            engine,
        }
    }

    /// Bind and begin accepting. Bind failures are returned to the caller.
    pub fn start(self) -> Result<ServerHandle> {
        let listener = TcpListener::bind(&self.config.addr)
            .with_context(|| format!("bind {}", self.config.addr))?;
        let addr = listener.local_addr()?;
        listener.set_nonblocking(true)?;

        let shutdown = Arc::new(AtomicBool::new(false));
        let active = Arc::new(AtomicUsize::new(0));
        let context = Arc::new(ConnectionContext {
            session: SessionLoop::new(
                self.cache.clone(),
                self.engine.clone(),
                self.config.session,
                shutdown.clone(),
            ),
            cache: self.cache,
            active: active.clone(),
            shutdown: shutdown.clone(),
            recv_timeout: self.config.recv_timeout,
            write_timeout: self.config.write_timeout,
        });

        let session_context = context.clone();
        let sessions = Arc::new(WorkerPool::new(
            "framecast-session",
            self.config.max_sessions,
            self.config.queue_depth,
            move |upgrade: PendingUpgrade| serve_websocket(upgrade, &session_context),
        )?);

        let request_sessions = sessions.clone();
        let requests = WorkerPool::new(
            "framecast-request",
            REQUEST_WORKERS,
            REQUEST_QUEUE,
            move |accepted: (TcpStream, SocketAddr)| {
                let (stream, peer) = accepted;
                if let Err(err) = handle_connection(stream, peer, &context, &request_sessions) {
                    log::warn!("request from {} rejected: {:#}", peer, err);
                }
            },
        )?;

        let shutdown_thread = shutdown.clone();
        let join = std::thread::Builder::new()
            .name("framecast-accept".to_string())
            .spawn(move || {
                if let Err(err) = run_server(listener, &requests, &shutdown_thread) {
                    log::error!("server stopped: {:#}", err);
                }
                shutdown_thread.store(true, Ordering::SeqCst);
                // Request workers hold the other session pool handle.
                requests.shutdown();
                match Arc::try_unwrap(sessions) {
                    Ok(sessions) => sessions.shutdown(),
                    Err(_) => log::error!("session pool still shared at shutdown"),
                }
            })
            .context("spawn accept thread")?;

        log::info!(
            "listening on {} ({} session workers)",
            addr,
            self.config.max_sessions
        );
        Ok(ServerHandle {
            addr,
            shutdown,
            active,
            join: Some(join),
        })
    }
}

// ----------------------------------------------------------------------------
// Accept loop and request routing
// ----------------------------------------------------------------------------

struct ConnectionContext {
    session: SessionLoop,
    cache: Arc<FrameCache>,
    active: Arc<AtomicUsize>,
    shutdown: Arc<AtomicBool>,
    recv_timeout: Duration,
    write_timeout: Duration,
}

struct PendingUpgrade {
    stream: TcpStream,
    peer: SocketAddr,
}

fn run_server(
    listener: TcpListener,
    requests: &WorkerPool<(TcpStream, SocketAddr)>,
    shutdown: &AtomicBool,
) -> Result<()> {
    loop {
        if shutdown.load(Ordering::SeqCst) {
            break;
        }
        match listener.accept() {
            Ok((stream, peer)) => {
                if requests.try_submit((stream, peer)).is_err() {
                    log::warn!("dropping connection from {}: request queue full", peer);
                }
            }
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(Duration::from_millis(50));
                continue;
            }
            Err(err) => return Err(err.into()),
        }
    }
    Ok(())
}

fn handle_connection(
    mut stream: TcpStream,
    peer: SocketAddr,
    context: &ConnectionContext,
    pool: &WorkerPool<PendingUpgrade>,
) -> Result<()> {
    if context.shutdown.load(Ordering::SeqCst) {
        return Ok(());
    }
    stream.set_nonblocking(false)?;
    configure_stream(&stream, http::REQUEST_TIMEOUT, context.write_timeout)?;
    let request = peek_request(&stream)?;

    if request.method == "GET" && request.path == "/ws" && request.is_websocket_upgrade() {
        return match pool.try_submit(PendingUpgrade { stream, peer }) {
            Ok(()) => Ok(()),
            Err(PendingUpgrade { mut stream, .. }) => {
                log::warn!("refusing viewer {}: all session workers busy", peer);
                consume_head(&mut stream, &request)?;
                write_json_response(&mut stream, 503, r#"{"error":"too_many_sessions"}"#)
            }
        };
    }

    consume_head(&mut stream, &request)?;
    respond(&mut stream, &request, context)
}

fn respond(stream: &mut TcpStream, request: &HttpRequest, context: &ConnectionContext) -> Result<()> {
    if request.method != "GET" {
        return write_json_response(stream, 405, r#"{"error":"method_not_allowed"}"#);
    }
    match request.path.as_str() {
        "/" => write_response(stream, 200, "text/html; charset=utf-8", VIEWER_PAGE.as_bytes()),
        "/snapshot" | "/stream" => match context.cache.read() {
            Some(frame) => write_response(stream, 200, "image/jpeg", frame.bytes()),
            None => write_json_response(stream, 503, r#"{"error":"no_frame"}"#),
        },
        "/health" => {
            let frame_age_ms = context
                .cache
                .read()
                .map(|frame| frame.age().as_millis() as u64);
            let body = serde_json::json!({
                "status": "ok",
                "capture_frames": context.cache.writes(),
                "frame_age_ms": frame_age_ms,
                "active_sessions": context.active.load(Ordering::SeqCst),
            });
            write_json_response(stream, 200, &body.to_string())
        }
        _ => write_json_response(stream, 404, r#"{"error":"not_found"}"#),
    }
}

// ----------------------------------------------------------------------------
// Session workers
// ----------------------------------------------------------------------------

/// Counts a session as active for as long as it is alive.
struct ActiveGuard<'a>(&'a AtomicUsize);

impl<'a> ActiveGuard<'a> {
    fn new(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

fn serve_websocket(upgrade: PendingUpgrade, context: &ConnectionContext) {
    let PendingUpgrade { stream, peer } = upgrade;
    if let Err(err) = configure_stream(&stream, http::REQUEST_TIMEOUT, context.write_timeout) {
        log::warn!("viewer {}: {:#}", peer, err);
        return;
    }
    let socket = match tungstenite::accept(stream) {
        Ok(socket) => socket,
        Err(err) => {
            log::warn!("viewer {}: websocket handshake failed: {}", peer, err);
            return;
        }
    };
    if let Err(err) = configure_stream(socket.get_ref(), context.recv_timeout, context.write_timeout) {
        log::warn!("viewer {}: {:#}", peer, err);
        return;
    }

    let _active = ActiveGuard::new(&context.active);
    let mut channel = WsChannel::new(socket);
    let report = context.session.run(&mut channel, &peer.to_string());
    log::info!(
        "viewer {}: closed ({:?}, {} frames, {} detection messages)",
        peer,
        report.end,
        report.frames_sent,
        report.detection_messages
    );
}

fn configure_stream(stream: &TcpStream, read: Duration, write: Duration) -> Result<()> {
    stream
        .set_read_timeout(Some(read.max(Duration::from_millis(1))))
        .context("set read timeout")?;
    stream
        .set_write_timeout(Some(write.max(Duration::from_millis(1))))
        .context("set write timeout")?;
    stream.set_nodelay(true).context("set nodelay")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::DetectionConfig;
    use std::io::{Read, Write};

    fn start() -> Result<(ServerHandle, Arc<FrameCache>)> {
        let cache = Arc::new(FrameCache::new());
        let engine = Arc::new(DetectionEngine::unavailable(&DetectionConfig::default()));
        let config = ServerConfig {
            addr: "127.0.0.1:0".to_string(),
            max_sessions: 1,
            queue_depth: 1,
            ..ServerConfig::default()
        };
        let handle = Server::new(config, cache.clone(), engine).start()?;
        Ok((handle, cache))
    }

    fn request(addr: SocketAddr, raw: &str) -> Result<(String, Vec<u8>)> {
        let mut stream = TcpStream::connect(addr)?;
        stream.set_read_timeout(Some(Duration::from_secs(5)))?;
        stream.write_all(raw.as_bytes())?;
        let mut response = Vec::new();
        stream.read_to_end(&mut response)?;
        let split = response
            .windows(4)
            .position(|w| w == b"\r\n\r\n")
            .ok_or_else(|| anyhow!("response has no header terminator"))?;
        let head = String::from_utf8_lossy(&response[..split]).to_string();
        Ok((head, response[split + 4..].to_vec()))
    }

    fn get(addr: SocketAddr, path: &str) -> Result<(String, Vec<u8>)> {
        request(addr, &format!("GET {} HTTP/1.1\r\nHost: test\r\n\r\n", path))
    }

    #[test]
    fn serves_viewer_page_and_health() -> Result<()> {
        let (handle, cache) = start()?;
        cache.write(vec![0xFF, 0xD8, 0xFF, 0xD9]);

        let (head, body) = get(handle.addr, "/")?;
        assert!(head.starts_with("HTTP/1.1 200"));
        assert!(head.contains("text/html"));
        assert!(String::from_utf8(body)?.contains("/ws"));

        let (head, body) = get(handle.addr, "/health")?;
        assert!(head.starts_with("HTTP/1.1 200"));
        let health: serde_json::Value = serde_json::from_slice(&body)?;
        assert_eq!(health["status"], "ok");
        assert_eq!(health["capture_frames"], 1);
        assert_eq!(health["active_sessions"], 0);
        assert!(health["frame_age_ms"].as_u64().is_some());

        handle.stop()
    }

    #[test]
    fn health_without_frames_has_no_frame_age() -> Result<()> {
        let (handle, _) = start()?;
        let (_, body) = get(handle.addr, "/health")?;
        let health: serde_json::Value = serde_json::from_slice(&body)?;
        assert_eq!(health["capture_frames"], 0);
        assert!(health["frame_age_ms"].is_null());
        handle.stop()
    }

    #[test]
    fn silent_connections_do_not_block_requests() -> Result<()> {
        let (handle, _) = start()?;
        let idle: Vec<TcpStream> = (0..3)
            .map(|_| TcpStream::connect(handle.addr))
            .collect::<std::io::Result<_>>()?;

        let started = std::time::Instant::now();
        let (head, _) = get(handle.addr, "/health")?;
        assert!(head.starts_with("HTTP/1.1 200"));
        assert!(started.elapsed() < http::REQUEST_TIMEOUT / 2);

        drop(idle);
        handle.stop()
    }

    #[test]
    fn snapshot_reflects_cache_state() -> Result<()> {
        let (handle, cache) = start()?;

        let (head, _) = get(handle.addr, "/snapshot")?;
        assert!(head.starts_with("HTTP/1.1 503"));

        cache.write(vec![0xFF, 0xD8, 1, 2, 0xFF, 0xD9]);
        let (head, body) = get(handle.addr, "/stream")?;
        assert!(head.starts_with("HTTP/1.1 200"));
        assert!(head.contains("image/jpeg"));
        assert_eq!(body, vec![0xFF, 0xD8, 1, 2, 0xFF, 0xD9]);

        handle.stop()
    }

    #[test]
    fn unknown_paths_and_methods_are_refused() -> Result<()> {
        let (handle, _) = start()?;

        let (head, _) = get(handle.addr, "/missing")?;
        assert!(head.starts_with("HTTP/1.1 404"));

        let (head, _) = request(
            handle.addr,
            "POST /health HTTP/1.1\r\nHost: test\r\nContent-Length: 0\r\n\r\n",
        )?;
        assert!(head.starts_with("HTTP/1.1 405"));

        handle.stop()
    }

    #[test]
    fn bind_failure_is_reported() -> Result<()> {
        let (handle, _) = start()?;
        let cache = Arc::new(FrameCache::new());
        let engine = Arc::new(DetectionEngine::unavailable(&DetectionConfig::default()));
        let config = ServerConfig {
            addr: handle.addr.to_string(),
            ..ServerConfig::default()
        };
        assert!(Server::new(config, cache, engine).start().is_err());
        handle.stop()
    }
}
