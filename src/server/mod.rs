//! Server: the listening socket, the client table, one non-blocking,
//! `poll(2)`-multiplexed event loop iteration, and command dispatch.
//!
//! Readiness never implies a full frame is available, so every session
//! keeps its own bounded receive buffer and scans it for `\n` on every
//! read. There are no locks and no threads here; everything runs from
//! the one thread the supervisor drives, and every socket operation is
//! non-blocking so no single client can suspend the loop.

use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::os::unix::io::AsRawFd;
use std::time::{Duration, Instant};

use log::warn;
use socket2::{Domain, Protocol, Socket, Type};
use thiserror::Error;

use crate::config::Config;
use crate::protocol::{self, Command, ErrorCode, Response};
use crate::registry::Registry;

/// Process-fatal startup failures, distinct from the client-visible
/// [`ErrorCode`] that never leaves a session. Propagated through `main`
/// wrapped in `anyhow::Context`.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("invalid bind address {addr:?}: {source}")]
    InvalidBindAddress {
        addr: String,
        #[source]
        source: std::net::AddrParseError,
    },
    #[error("binding listener on {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
}

struct Session {
    stream: TcpStream,
    recv_buf: Vec<u8>,
    send_buf: Vec<u8>,
    monitoring: bool,
    monitor_target: String,
    monitor_interval_ms: u64,
    last_monitor_push: Instant,
    closing: bool,
}

impl Session {
    fn new(stream: TcpStream) -> Self {
        Self {
            stream,
            recv_buf: Vec::new(),
            send_buf: Vec::new(),
            monitoring: false,
            monitor_target: String::new(),
            monitor_interval_ms: 0,
            last_monitor_push: Instant::now(),
            closing: false,
        }
    }

    /// Attempts to drain `send_buf` into the socket without blocking.
    /// A `WouldBlock` or partial write simply leaves the remainder
    /// queued for the next attempt; the event loop never waits on it.
    fn flush(&mut self) -> io::Result<()> {
        while !self.send_buf.is_empty() {
            match self.stream.write(&self.send_buf) {
                Ok(0) => return Err(io::Error::new(io::ErrorKind::WriteZero, "write returned 0")),
                Ok(n) => {
                    self.send_buf.drain(..n);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}

pub struct Server {
    listener: TcpListener,
    sessions: Vec<Option<Session>>,
    cmd_buffer_size: usize,
    response_buffer_size: usize,
    pv_name_max: usize,
    select_timeout_ms: u64,
}

/// Binds the listening socket with `SO_REUSEADDR` and the configured
/// backlog, via `socket2` rather than hand-rolled `libc` `sockaddr`
/// plumbing; the same syscalls, without the unsafe boilerplate.
fn bind_listener(addr: SocketAddr, backlog: i32) -> io::Result<TcpListener> {
    let domain = if addr.is_ipv4() { Domain::IPV4 } else { Domain::IPV6 };
    let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(backlog)?;
    Ok(socket.into())
}

impl Server {
    pub fn bind(cfg: &Config) -> Result<Self, ServerError> {
        let ip = cfg
            .bind
            .parse()
            .map_err(|source| ServerError::InvalidBindAddress {
                addr: cfg.bind.clone(),
                source,
            })?;
        let addr = SocketAddr::new(ip, cfg.port);
        let listener = bind_listener(addr, cfg.backlog)
            .map_err(|source| ServerError::Bind { addr, source })?;
        log::info!("listening on {}", listener.local_addr().unwrap_or(addr));
        let mut sessions = Vec::with_capacity(cfg.max_clients);
        sessions.resize_with(cfg.max_clients, || None);
        Ok(Self {
            listener,
            sessions,
            cmd_buffer_size: cfg.cmd_buffer_size,
            response_buffer_size: cfg.response_buffer_size,
            pv_name_max: cfg.pv_name_max,
            select_timeout_ms: cfg.select_timeout_ms,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn active_sessions(&self) -> usize {
        self.sessions.iter().filter(|s| s.is_some()).count()
    }

    /// Closes every active session and the listening socket. Called by
    /// the supervisor once it observes the shutdown signal.
    pub fn shutdown(&mut self) {
        for slot in &mut self.sessions {
            *slot = None;
        }
    }

    /// One event-loop iteration: wait for readiness, accept at most one
    /// new connection, read and frame every ready client, run pending
    /// commands, and emit any monitor pushes that are due.
    pub fn run_once(&mut self, registry: &mut Registry) {
        let ready = self.poll_ready();
        if ready.listener {
            self.accept_one();
        }
        for slot in ready.client_slots {
            self.service_client(slot, registry);
        }
        self.emit_monitor_pushes(registry);
        self.flush_pending_writes();
    }

    fn poll_ready(&self) -> Ready {
        let mut fds: Vec<libc::pollfd> = Vec::with_capacity(1 + self.sessions.len());
        fds.push(libc::pollfd {
            fd: self.listener.as_raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        });
        let mut slot_for_fd_index = Vec::with_capacity(self.sessions.len());
        for (i, slot) in self.sessions.iter().enumerate() {
            if let Some(session) = slot {
                fds.push(libc::pollfd {
                    fd: session.stream.as_raw_fd(),
                    events: libc::POLLIN,
                    revents: 0,
                });
                slot_for_fd_index.push(i);
            }
        }

        let rc = unsafe {
            libc::poll(
                fds.as_mut_ptr(),
                fds.len() as libc::nfds_t,
                self.select_timeout_ms as libc::c_int,
            )
        };
        if rc < 0 {
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                warn!("poll() failed: {err}");
            }
            return Ready {
                listener: false,
                client_slots: Vec::new(),
            };
        }

        let listener_ready = fds[0].revents & (libc::POLLIN | libc::POLLERR) != 0;
        let mut client_slots = Vec::new();
        for (fd_idx, &slot) in slot_for_fd_index.iter().enumerate() {
            let revents = fds[fd_idx + 1].revents;
            if revents & (libc::POLLIN | libc::POLLHUP | libc::POLLERR) != 0 {
                client_slots.push(slot);
            }
        }
        Ready {
            listener: listener_ready,
            client_slots,
        }
    }

    fn accept_one(&mut self) {
        match self.listener.accept() {
            Ok((stream, addr)) => {
                let Some(slot) = self.sessions.iter().position(|s| s.is_none()) else {
                    warn!("MAX_CLIENTS reached, refusing connection from {addr}");
                    drop(stream);
                    return;
                };
                if let Err(e) = stream.set_nonblocking(true) {
                    warn!("failed to set {addr} non-blocking: {e}");
                    return;
                }
                log::debug!("accepted connection from {addr} into slot {slot}");
                self.sessions[slot] = Some(Session::new(stream));
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
            Err(e) => warn!("accept() failed: {e}"),
        }
    }

    fn service_client(&mut self, slot: usize, registry: &mut Registry) {
        let mut close = false;
        if let Some(session) = self.sessions[slot].as_mut() {
            let mut chunk = [0u8; 4096];
            match session.stream.read(&mut chunk) {
                Ok(0) => close = true,
                Ok(n) => session.recv_buf.extend_from_slice(&chunk[..n]),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(e) => {
                    warn!("recv error, closing session: {e}");
                    close = true;
                }
            }
        }
        if !close {
            self.drain_lines(slot, registry);
        }
        if close {
            self.sessions[slot] = None;
        }
    }

    /// Scans a session's receive buffer for complete `\n`-terminated
    /// lines, dispatching each one, then slides any leftover bytes to the
    /// front. A client that fills `CMD_BUFFER_SIZE` without ever sending
    /// a newline is disconnected.
    fn drain_lines(&mut self, slot: usize, registry: &mut Registry) {
        loop {
            let line = {
                let Some(session) = self.sessions[slot].as_mut() else {
                    return;
                };
                let Some(newline_pos) = session.recv_buf.iter().position(|&b| b == b'\n') else {
                    if session.recv_buf.len() > self.cmd_buffer_size {
                        warn!("session in slot {slot} exceeded command buffer without newline");
                        self.sessions[slot] = None;
                    }
                    return;
                };
                let mut line_bytes: Vec<u8> = session.recv_buf.drain(..=newline_pos).collect();
                line_bytes.pop(); // trailing '\n'
                if line_bytes.last() == Some(&b'\r') {
                    line_bytes.pop();
                }
                String::from_utf8_lossy(&line_bytes).into_owned()
            };
            self.handle_line(slot, &line, registry);
            if self.sessions[slot].is_none() {
                return;
            }
        }
    }

    fn handle_line(&mut self, slot: usize, line: &str, registry: &mut Registry) {
        let cmd = protocol::parse_line(line, self.pv_name_max);
        let response = {
            let Some(session) = self.sessions[slot].as_mut() else {
                return;
            };
            dispatch(session, cmd, registry)
        };
        self.send_response(slot, &response);
        let should_close = self.sessions[slot].as_ref().map(|s| s.closing).unwrap_or(false);
        if should_close {
            self.sessions[slot] = None;
        }
    }

    /// Queues a response onto the session's outbound buffer and makes a
    /// single best-effort non-blocking attempt to drain it immediately.
    /// A slow reader simply leaves bytes queued for
    /// [`Server::flush_pending_writes`] on a later iteration; this never
    /// waits on the socket.
    fn send_response(&mut self, slot: usize, response: &Response) {
        let line = protocol::format_response(response, self.response_buffer_size);
        if let Some(session) = self.sessions[slot].as_mut() {
            session.send_buf.extend_from_slice(line.as_bytes());
            if let Err(e) = session.flush() {
                warn!("write error, closing session: {e}");
                self.sessions[slot] = None;
            }
        }
    }

    /// Gives every session with queued output one more non-blocking
    /// drain attempt per iteration, so a response that didn't fully fit
    /// the socket buffer when first sent eventually gets written without
    /// ever stalling the loop.
    fn flush_pending_writes(&mut self) {
        for slot in 0..self.sessions.len() {
            let Some(session) = self.sessions[slot].as_mut() else {
                continue;
            };
            if session.send_buf.is_empty() {
                continue;
            }
            if let Err(e) = session.flush() {
                warn!("write error, closing session: {e}");
                self.sessions[slot] = None;
            }
        }
    }

    /// For every subscribed session whose interval has elapsed, pushes
    /// `DATA:<value>` for its monitored PV. A target that no longer
    /// resolves is skipped silently.
    fn emit_monitor_pushes(&mut self, registry: &Registry) {
        let now = Instant::now();
        for slot in 0..self.sessions.len() {
            let due_target = match self.sessions[slot].as_ref() {
                Some(s) if s.monitoring
                    && now.duration_since(s.last_monitor_push)
                        >= Duration::from_millis(s.monitor_interval_ms) =>
                {
                    Some(s.monitor_target.clone())
                }
                _ => None,
            };
            let Some(target) = due_target else {
                continue;
            };
            if let Some(idx) = registry.find_pv(&target) {
                let value = registry.get(idx);
                self.send_response(slot, &Response::Data(value));
            }
            if let Some(session) = self.sessions[slot].as_mut() {
                session.last_monitor_push = now;
            }
        }
    }
}

struct Ready {
    listener: bool,
    client_slots: Vec<usize>,
}

/// Executes one parsed command against the registry, mutating
/// session-local state for `MONITOR`/`STOP`/`QUIT`.
fn dispatch(session: &mut Session, cmd: Command, registry: &mut Registry) -> Response {
    match cmd {
        Command::Ping => Response::OkPayload("PONG".to_owned()),
        Command::Quit => {
            session.closing = true;
            Response::OkPayload("BYE".to_owned())
        }
        Command::Stop => {
            session.monitoring = false;
            Response::OkPayload("STOPPED".to_owned())
        }
        Command::List(pattern) => {
            let names = registry.list(&pattern);
            Response::OkPayload(names.join(","))
        }
        Command::Get(name) => match registry.find_pv(&name) {
            Some(idx) => Response::ok_value(registry.get(idx)),
            None => Response::Err(ErrorCode::UnknownPv),
        },
        Command::Put(name, value) => match registry.find_pv(&name) {
            Some(idx) => {
                if registry.set(idx, value) {
                    Response::OkPayload("PUT".to_owned())
                } else {
                    Response::Err(ErrorCode::InvalidValue)
                }
            }
            None => Response::Err(ErrorCode::UnknownPv),
        },
        Command::Move(name, target) => {
            if registry.motor_move(&name, target) {
                Response::OkPayload("MOVING".to_owned())
            } else {
                Response::Err(ErrorCode::InvalidValue)
            }
        }
        Command::Status(name) => match registry.find_motor(&name) {
            Some(idx) => Response::OkPayload(registry.motor_status_string(idx).to_owned()),
            None => Response::Err(ErrorCode::UnknownPv),
        },
        Command::Monitor(name, interval_ms) => {
            session.monitoring = true;
            session.monitor_target = name;
            session.monitor_interval_ms = interval_ms.max(1);
            session.last_monitor_push = Instant::now();
            Response::OkPayload("MONITORING".to_owned())
        }
        Command::Invalid => Response::Err(ErrorCode::UnknownCmd),
    }
}
