//! Per-node network event loop.
//!
//! Each node runs one `mio` poll loop on its own thread. The loop owns the
//! HTTP listener (when enabled), the transport listener and every accepted
//! connection. [`ServerHandle::shutdown`] wakes the loop through a
//! [`Waker`] and joins the thread.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};

use mio::net::TcpListener;
use mio::{Events, Interest, Poll, Token, Waker};
use tracing::{debug, error, warn};

use crate::connection::{Connection, Protocol};
use crate::transport::{self, RemoteError, TransportResponse};
use crate::{Client, EngineError, EngineResult, http};

const HTTP_LISTENER_TOKEN: Token = Token(0);
const TRANSPORT_LISTENER_TOKEN: Token = Token(1);
const WAKER_TOKEN: Token = Token(2);
const FIRST_CONNECTION_TOKEN: usize = 3;

/// What the event loop answers with.
pub(crate) struct ServeContext {
    pub client: Arc<dyn Client>,
    pub node_name: String,
    pub cluster_name: String,
}

/// Owner's side of a running event loop.
pub(crate) struct ServerHandle {
    waker: Arc<Waker>,
    shutdown: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
    http_addr: Option<SocketAddr>,
    transport_addr: SocketAddr,
}

impl ServerHandle {
    pub fn http_addr(&self) -> Option<SocketAddr> {
        self.http_addr
    }

    pub fn transport_addr(&self) -> SocketAddr {
        self.transport_addr
    }

    /// Stops the loop and waits for its thread. Idempotent.
    pub fn shutdown(&mut self) -> EngineResult<()> {
        let Some(thread) = self.thread.take() else {
            return Ok(());
        };
        self.shutdown.store(true, Ordering::Release);
        self.waker.wake()?;
        thread
            .join()
            .map_err(|_| EngineError::internal("event loop thread panicked"))
    }
}

impl Drop for ServerHandle {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            warn!(error = %e, "event loop shutdown failed");
        }
    }
}

fn bind(addr: SocketAddr) -> EngineResult<TcpListener> {
    TcpListener::bind(addr).map_err(|source| EngineError::Bind { addr, source })
}

/// Binds the listeners and starts the event loop thread.
///
/// Binding happens on the caller's thread so failures surface immediately.
pub(crate) fn start(
    http_addr: Option<SocketAddr>,
    transport_addr: SocketAddr,
    ctx: ServeContext,
) -> EngineResult<ServerHandle> {
    let poll = Poll::new()?;

    let mut http = http_addr.map(bind).transpose()?;
    let mut transport = bind(transport_addr)?;
    if let Some(listener) = http.as_mut() {
        poll.registry()
            .register(listener, HTTP_LISTENER_TOKEN, Interest::READABLE)?;
    }
    poll.registry()
        .register(&mut transport, TRANSPORT_LISTENER_TOKEN, Interest::READABLE)?;

    let http_addr = http.as_ref().map(TcpListener::local_addr).transpose()?;
    let transport_addr = transport.local_addr()?;
    let waker = Arc::new(Waker::new(poll.registry(), WAKER_TOKEN)?);
    let shutdown = Arc::new(AtomicBool::new(false));

    let event_loop = EventLoop {
        poll,
        http,
        transport,
        connections: HashMap::new(),
        next_token: FIRST_CONNECTION_TOKEN,
        shutdown: Arc::clone(&shutdown),
        ctx,
    };
    let thread = thread::Builder::new()
        .name(format!("quarry-{}", event_loop.ctx.node_name.replace(' ', "-")))
        .spawn(move || event_loop.run())?;

    debug!(?http_addr, %transport_addr, "event loop started");
    Ok(ServerHandle {
        waker,
        shutdown,
        thread: Some(thread),
        http_addr,
        transport_addr,
    })
}

struct EventLoop {
    poll: Poll,
    http: Option<TcpListener>,
    transport: TcpListener,
    connections: HashMap<Token, Connection>,
    next_token: usize,
    shutdown: Arc<AtomicBool>,
    ctx: ServeContext,
}

impl EventLoop {
    fn run(mut self) {
        let mut events = Events::with_capacity(256);
        loop {
            if let Err(e) = self.poll.poll(&mut events, None) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                error!(node = %self.ctx.node_name, "poll error: {e}");
                break;
            }

            for event in &events {
                match event.token() {
                    WAKER_TOKEN => {}
                    HTTP_LISTENER_TOKEN => self.accept(Protocol::Http),
                    TRANSPORT_LISTENER_TOKEN => self.accept(Protocol::Transport),
                    token => self.handle_connection(token, event.is_readable()),
                }
            }

            if self.shutdown.load(Ordering::Acquire) {
                break;
            }
        }
        debug!(
            node = %self.ctx.node_name,
            open_connections = self.connections.len(),
            "event loop stopped"
        );
    }

    fn accept(&mut self, protocol: Protocol) {
        loop {
            let listener = match protocol {
                Protocol::Http => self.http.as_ref(),
                Protocol::Transport => Some(&self.transport),
            };
            let Some(listener) = listener else {
                return;
            };

            match listener.accept() {
                Ok((mut stream, addr)) => {
                    let token = Token(self.next_token);
                    self.next_token += 1;
                    if let Err(e) =
                        self.poll
                            .registry()
                            .register(&mut stream, token, Interest::READABLE)
                    {
                        warn!("failed to register connection from {addr}: {e}");
                        continue;
                    }
                    debug!(%addr, ?protocol, "connection accepted");
                    self.connections
                        .insert(token, Connection::new(token, stream, protocol));
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e) => {
                    error!("accept error: {e}");
                    return;
                }
            }
        }
    }

    fn handle_connection(&mut self, token: Token, readable: bool) {
        let Some(conn) = self.connections.get_mut(&token) else {
            return;
        };

        let mut open = true;
        if readable {
            open = conn.read().unwrap_or_else(|e| {
                debug!("read error: {e}");
                false
            });
            process(conn, &self.ctx);
        }

        if let Err(e) = conn.write() {
            debug!("write error: {e}");
            open = false;
        }

        if !open || conn.is_done() {
            if let Some(mut conn) = self.connections.remove(&token) {
                let _ = self.poll.registry().deregister(&mut conn.stream);
            }
            return;
        }

        let interest = conn.interest();
        if let Err(e) = self
            .poll
            .registry()
            .reregister(&mut conn.stream, token, interest)
        {
            warn!("failed to reregister connection: {e}");
            self.connections.remove(&token);
        }
    }
}

/// Answers every complete request buffered on `conn`.
fn process(conn: &mut Connection, ctx: &ServeContext) {
    match conn.protocol {
        Protocol::Http => process_http(conn, ctx),
        Protocol::Transport => process_transport(conn, ctx),
    }
}

fn process_http(conn: &mut Connection, ctx: &ServeContext) {
    if conn.closing {
        return;
    }
    match conn.try_take_http_request() {
        Ok(Some(request)) => {
            let response = http::dispatch(ctx.client.as_ref(), &ctx.node_name, &request);
            conn.queue_bytes(response.to_http().as_bytes());
            conn.closing = true;
        }
        Ok(None) => {}
        Err(e) => {
            debug!("malformed http request: {e}");
            conn.queue_bytes(http::parse_error_response(&e).as_bytes());
            conn.closing = true;
        }
    }
}

fn process_transport(conn: &mut Connection, ctx: &ServeContext) {
    while !conn.closing {
        let response = match conn.try_decode_request() {
            Ok(Some(request)) if conn.handshaken => {
                transport::dispatch(ctx.client.as_ref(), request)
            }
            Ok(Some(request)) => {
                let (response, accepted) =
                    transport::accept_handshake(&request, &ctx.cluster_name, &ctx.node_name);
                if accepted {
                    conn.handshaken = true;
                } else {
                    warn!(node = %ctx.node_name, "transport handshake rejected");
                    conn.closing = true;
                }
                response
            }
            Ok(None) => return,
            Err(e) => {
                warn!("undecodable transport frame: {e}");
                conn.closing = true;
                TransportResponse::Error(RemoteError::Protocol(e.to_string()))
            }
        };
        if let Err(e) = conn.queue_frame(&response) {
            warn!("failed to encode transport response: {e}");
            conn.closing = true;
        }
    }
}
