//! The serving loop: one task waits on every socket, pairs add-in connections with
//! fresh connector connections and relays one complete message per wakeup.

use std::collections::HashMap;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::time::Duration;

use citeproxy_core::control::{self, ControlAction};
use citeproxy_core::framer::{self, DEFAULT_BUFFER_SIZE, DEFAULT_IDLE_TIMEOUT};
use citeproxy_core::{cors, ChannelRegistry, ConnId, Message, ProxyError, Role};
use futures::stream::{FuturesUnordered, StreamExt};
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, warn};

/// Settings for one proxy run. Fixed for the lifetime of the run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyConfig {
    pub listen_addr: SocketAddr,
    /// Zotero connector server. Every accepted client gets its own connection here.
    pub upstream_addr: SocketAddr,
    /// Bound on every read, write and dial.
    pub idle_timeout: Duration,
    /// Bound on one readiness wait, so interrupts are noticed promptly.
    pub poll_interval: Duration,
    pub buffer_size: usize,
    /// Acknowledge stop commands instead of obeying them.
    pub persistent: bool,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 21931)),
            upstream_addr: SocketAddr::from(([127, 0, 0, 1], 23119)),
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            poll_interval: Duration::from_secs(1),
            buffer_size: DEFAULT_BUFFER_SIZE,
            persistent: false,
        }
    }
}

/// Snapshot of the run state's bookkeeping.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProxyStats {
    pub connections: usize,
    pub pairs: usize,
    pub clients: usize,
}

struct Connection {
    stream: TcpStream,
    peer: SocketAddr,
    role: Role,
}

enum Event {
    Accepted(io::Result<(TcpStream, SocketAddr)>),
    Readable(ConnId),
    Tick,
    Interrupted,
}

/// Run state: the listener, every open connection and the pairing between them.
/// Owned and mutated by the loop alone.
pub struct ProxyServer {
    config: ProxyConfig,
    listener: TcpListener,
    connections: HashMap<ConnId, Connection>,
    registry: ChannelRegistry,
    running: bool,
}

impl ProxyServer {
    /// Bind the listening socket. `AddrInUse` usually means another instance is running.
    pub async fn bind(config: ProxyConfig) -> Result<Self, ProxyError> {
        let listener = TcpListener::bind(config.listen_addr)
            .await
            .map_err(|e| ProxyError::from_bind(config.listen_addr, e))?;
        Ok(Self {
            config,
            listener,
            connections: HashMap::new(),
            registry: ChannelRegistry::new(),
            running: true,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn stats(&self) -> ProxyStats {
        ProxyStats {
            connections: self.connections.len(),
            pairs: self.registry.pair_count(),
            clients: self.registry.client_count(),
        }
    }

    /// Serve until a stop command (non-persistent mode) or `shutdown` resolves.
    /// Returns the bookkeeping left after teardown, which is always empty.
    pub async fn run<F>(mut self, shutdown: F) -> Result<ProxyStats, ProxyError>
    where
        F: Future<Output = ()>,
    {
        let mut shutdown = std::pin::pin!(shutdown);
        let mode = if self.config.persistent { "persistent" } else { "normal" };
        info!(addr = %self.local_addr()?, upstream = %self.config.upstream_addr, mode, "proxy server running");

        while self.running {
            let event = self.next_event(shutdown.as_mut()).await;
            self.dispatch(event).await;
        }

        self.close_all();
        let stats = self.stats();
        drop(self.listener);
        info!("proxy stopped");
        Ok(stats)
    }

    /// Wait for the first of: a new client, a readable connection, the poll timer, an interrupt.
    async fn next_event<F>(&self, shutdown: Pin<&mut F>) -> Event
    where
        F: Future<Output = ()>,
    {
        let mut readable: FuturesUnordered<_> = self
            .connections
            .iter()
            .map(|(&id, conn)| async move {
                // An error here resurfaces on the read, which tears the pair down.
                let _ = conn.stream.readable().await;
                id
            })
            .collect();

        tokio::select! {
            accepted = self.listener.accept() => Event::Accepted(accepted),
            Some(id) = readable.next() => Event::Readable(id),
            _ = tokio::time::sleep(self.config.poll_interval) => Event::Tick,
            _ = shutdown => Event::Interrupted,
        }
    }

    async fn dispatch(&mut self, event: Event) {
        match event {
            Event::Accepted(Ok((stream, addr))) => self.on_accept(stream, addr).await,
            Event::Accepted(Err(e)) => error!(error = %e, "accept error"),
            Event::Readable(id) => self.on_readable(id).await,
            Event::Tick => {}
            Event::Interrupted => {
                info!("interrupted, stopping proxy server");
                self.running = false;
            }
        }
    }

    async fn on_accept(&mut self, mut client: TcpStream, client_addr: SocketAddr) {
        info!(peer = %client_addr, "client connected");
        let idle = self.config.idle_timeout;
        let dial = tokio::time::timeout(idle, TcpStream::connect(self.config.upstream_addr)).await;
        let upstream = match dial {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                warn!("cannot connect to Zotero, is the app started?");
                debug!(upstream = %self.config.upstream_addr, error = %e, "upstream dial failed");
                reject(&mut client, idle).await;
                return;
            }
            Err(_) => {
                warn!(upstream = %self.config.upstream_addr, "upstream dial timed out");
                reject(&mut client, idle).await;
                return;
            }
        };

        let upstream_addr = match upstream.peer_addr() {
            Ok(addr) => addr,
            Err(e) => {
                error!(error = %e, "failed to get upstream peer address");
                reject(&mut client, idle).await;
                return;
            }
        };

        let client_id = self.registry.allocate();
        let upstream_id = self.registry.allocate();
        self.connections.insert(
            client_id,
            Connection {
                stream: client,
                peer: client_addr,
                role: Role::Client,
            },
        );
        self.connections.insert(
            upstream_id,
            Connection {
                stream: upstream,
                peer: upstream_addr,
                role: Role::Upstream,
            },
        );
        self.registry.pair(client_id, client_addr, upstream_id);
        debug!(client = %client_id, upstream = %upstream_id, "channel paired");
    }

    async fn on_readable(&mut self, id: ConnId) {
        let buffer_size = self.config.buffer_size;
        let idle = self.config.idle_timeout;
        let Some(conn) = self.connections.get_mut(&id) else {
            return;
        };
        let peer = conn.peer;

        // Readiness can outlive the data that caused it (a read that exactly filled the
        // buffer does not clear it), so the first read must not block.
        let mut first = vec![0u8; buffer_size.max(1)];
        let initial = match conn.stream.try_read(&mut first) {
            Ok(0) => {
                self.teardown(id);
                return;
            }
            Ok(n) => {
                first.truncate(n);
                first
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                debug!(conn = %id, "spurious wakeup, no data");
                return;
            }
            Err(e) => {
                debug!(conn = %id, %peer, error = %e, "read failed");
                self.teardown(id);
                return;
            }
        };

        let raw = match framer::continue_message(&mut conn.stream, initial, buffer_size, idle).await {
            Ok(raw) => raw,
            Err(e) => {
                error!(conn = %id, %peer, error = %e, "error receiving data");
                self.teardown(id);
                return;
            }
        };
        if raw.is_empty() {
            self.teardown(id);
            return;
        }

        if control::is_stop_command(&raw) {
            self.on_stop_command(id).await;
            return;
        }

        let Some(partner) = self.registry.partner(id) else {
            self.teardown(id);
            return;
        };

        let mut message = match Message::parse(&raw) {
            Ok(m) => m,
            Err(e) => {
                error!(conn = %id, error = %e, "failed to parse header");
                self.teardown(id);
                return;
            }
        };

        if self.registry.is_client(&peer) {
            info!(%peer, "message received from client");
            if cors::is_preflight(&message) {
                let response = cors::preflight_response(&message);
                if let Err(e) = self.send(id, &response).await {
                    error!(conn = %id, error = %e, "failed to send preflight response");
                    self.teardown(id);
                    return;
                }
                info!("responded to a preflight request");
                return;
            }
            cors::rewrite_request(&mut message, self.config.upstream_addr);
        } else {
            info!("message received from Zotero");
            cors::rewrite_response(&mut message);
        }

        if let Err(e) = self.send(partner, &message.to_bytes()).await {
            error!(conn = %partner, error = %e, "failed to send data");
            self.teardown(id);
        }
    }

    async fn on_stop_command(&mut self, id: ConnId) {
        info!("received stopping command");
        match control::on_stop_command(self.config.persistent) {
            ControlAction::Acknowledge => {
                info!("persistent mode enabled, ignoring stop command");
                if let Err(e) = self.send(id, control::STOP_ACK).await {
                    error!(conn = %id, error = %e, "failed to send response");
                }
            }
            ControlAction::Stop => {
                self.teardown(id);
                self.running = false;
            }
        }
    }

    async fn send(&mut self, id: ConnId, bytes: &[u8]) -> io::Result<()> {
        let idle = self.config.idle_timeout;
        let conn = self
            .connections
            .get_mut(&id)
            .ok_or_else(|| io::Error::from(io::ErrorKind::NotConnected))?;
        match tokio::time::timeout(idle, conn.stream.write_all(bytes)).await {
            Ok(result) => result,
            Err(_) => Err(io::ErrorKind::TimedOut.into()),
        }
    }

    /// Close `id` and its partner, and forget both.
    fn teardown(&mut self, id: ConnId) {
        let partner = self.registry.unpair(id);
        for conn_id in std::iter::once(id).chain(partner) {
            if let Some(conn) = self.connections.remove(&conn_id) {
                info!(conn = %conn_id, peer = %conn.peer, role = ?conn.role, "disconnected");
            }
        }
    }

    fn close_all(&mut self) {
        let open = self.connections.len();
        self.connections.clear();
        self.registry.clear();
        debug!(open, "closed all connections");
    }
}

/// Tell a client the connector is down, then drop it.
async fn reject(client: &mut TcpStream, idle: Duration) {
    let sent = tokio::time::timeout(idle, async {
        client.write_all(cors::SERVICE_UNAVAILABLE).await?;
        client.shutdown().await
    })
    .await;
    match sent {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!(error = %e, "failed to send response"),
        Err(_) => error!("timed out sending 503 response"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    fn test_config(upstream_addr: SocketAddr, persistent: bool) -> ProxyConfig {
        ProxyConfig {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            upstream_addr,
            idle_timeout: Duration::from_millis(500),
            poll_interval: Duration::from_secs(10),
            buffer_size: DEFAULT_BUFFER_SIZE,
            persistent,
        }
    }

    /// Drive the loop by hand until something other than a timer tick happens.
    async fn step(server: &mut ProxyServer) {
        let mut shutdown = std::pin::pin!(std::future::pending::<()>());
        loop {
            match server.next_event(shutdown.as_mut()).await {
                Event::Tick => continue,
                event => {
                    server.dispatch(event).await;
                    return;
                }
            }
        }
    }

    async fn paired_server(persistent: bool) -> (ProxyServer, TcpStream, TcpStream) {
        let upstream = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let mut server = ProxyServer::bind(test_config(upstream.local_addr().unwrap(), persistent))
            .await
            .unwrap();
        let client = TcpStream::connect(server.local_addr().unwrap()).await.unwrap();
        step(&mut server).await;
        let (upstream_side, _) = upstream.accept().await.unwrap();
        (server, client, upstream_side)
    }

    #[tokio::test]
    async fn accept_registers_one_pair() {
        let (server, _client, _upstream) = paired_server(false).await;
        assert_eq!(
            server.stats(),
            ProxyStats {
                connections: 2,
                pairs: 1,
                clients: 1
            }
        );
    }

    #[tokio::test]
    async fn client_close_tears_down_both_sides() {
        let (mut server, client, mut upstream) = paired_server(false).await;
        drop(client);
        step(&mut server).await;
        assert_eq!(server.stats(), ProxyStats::default());
        let mut buf = [0u8; 16];
        assert_eq!(upstream.read(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn upstream_close_tears_down_both_sides() {
        let (mut server, mut client, upstream) = paired_server(false).await;
        drop(upstream);
        step(&mut server).await;
        assert_eq!(server.stats(), ProxyStats::default());
        let mut buf = [0u8; 16];
        assert_eq!(client.read(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn dial_failure_registers_nothing() {
        let dead = {
            let l = TcpListener::bind("127.0.0.1:0").await.unwrap();
            l.local_addr().unwrap()
        };
        let mut server = ProxyServer::bind(test_config(dead, false)).await.unwrap();
        let mut client = TcpStream::connect(server.local_addr().unwrap()).await.unwrap();
        step(&mut server).await;
        assert_eq!(server.stats(), ProxyStats::default());
        let mut reply = Vec::new();
        client.read_to_end(&mut reply).await.unwrap();
        assert_eq!(reply, cors::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn stop_command_clears_running_flag() {
        let (mut server, mut client, _upstream) = paired_server(false).await;
        client.write_all(control::STOP_REQUEST).await.unwrap();
        step(&mut server).await;
        assert!(!server.running);
        assert_eq!(server.stats().pairs, 0);
    }

    #[tokio::test]
    async fn persistent_stop_command_keeps_serving() {
        let (mut server, mut client, _upstream) = paired_server(true).await;
        client.write_all(control::STOP_REQUEST).await.unwrap();
        step(&mut server).await;
        assert!(server.running);
        assert_eq!(server.stats().pairs, 1);
        let mut reply = vec![0u8; control::STOP_ACK.len()];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply, control::STOP_ACK);
    }

    #[tokio::test]
    async fn bind_conflict_is_addr_in_use() {
        let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let mut config = ProxyConfig::default();
        config.listen_addr = taken.local_addr().unwrap();
        match ProxyServer::bind(config).await {
            Err(ProxyError::AddrInUse(addr)) => assert_eq!(addr, taken.local_addr().unwrap()),
            Err(e) => panic!("unexpected error: {e}"),
            Ok(_) => panic!("second bind succeeded"),
        }
    }
}
