use crate::config::{EndpointConfig, UDP_PING_TICK_PERIOD};
use crate::connection::{spawn_connection, CloseReason, ConnectionShared, UdpConnection};
use crate::send_pipeline::SendPipeline;
use anyhow::bail;
use rustc_hash::FxHashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, error, info, span, warn, Instrument, Level};
use uuid::Uuid;

/// The place where the parts of the protocol come together: one UDP socket
///  shared by all connections, a receive loop dispatching datagrams by their
///  source address, and housekeeping for keepalive and garbage collection.
///  Incoming peers surface through [UdpEndpoint::accept], outgoing ones are
///  created with [UdpEndpoint::dial].
pub struct UdpEndpoint {
    socket: Arc<UdpSocket>,
    pipeline: Arc<SendPipeline>,
    config: Arc<EndpointConfig>,
    connections: RwLock<FxHashMap<SocketAddr, Arc<ConnectionShared>>>,
    accept_tx: Mutex<Option<mpsc::Sender<UdpConnection>>>,
    accept_rx: tokio::sync::Mutex<mpsc::Receiver<UdpConnection>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl UdpEndpoint {
    pub async fn bind(config: EndpointConfig) -> anyhow::Result<Arc<UdpEndpoint>> {
        config.validate()?;

        let socket = Arc::new(UdpSocket::bind(config.listen_addr).await?);
        info!("bound endpoint to {:?}", socket.local_addr()?);

        let (accept_tx, accept_rx) = mpsc::channel(config.accept_backlog);

        let endpoint = Arc::new(UdpEndpoint {
            pipeline: Arc::new(SendPipeline::new(Arc::new(socket.clone()))),
            socket,
            config: Arc::new(config),
            connections: RwLock::new(FxHashMap::default()),
            accept_tx: Mutex::new(Some(accept_tx)),
            accept_rx: tokio::sync::Mutex::new(accept_rx),
            tasks: Mutex::new(Vec::new()),
        });

        let receiver = tokio::spawn(endpoint.clone().recv_loop());
        let housekeeper = tokio::spawn(endpoint.clone().housekeeping_loop());
        endpoint.tasks.lock().unwrap().extend([receiver, housekeeper]);

        Ok(endpoint)
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.pipeline.local_addr()
    }

    /// Registers a connection to a remote peer. There is no handshake; the
    ///  peer learns about the connection with the first datagram.
    pub async fn dial(&self, remote_addr: SocketAddr) -> anyhow::Result<UdpConnection> {
        let mut connections = self.connections.write().await;
        if connections.contains_key(&remote_addr) {
            bail!("there is already a connection to {:?}", remote_addr);
        }

        debug!("dialing {:?}", remote_addr);
        let (shared, connection) =
            spawn_connection(remote_addr, self.pipeline.clone(), self.config.clone());
        connections.insert(remote_addr, shared);
        Ok(connection)
    }

    /// The next connection initiated by a remote peer. None once the endpoint
    ///  is shut down.
    pub async fn accept(&self) -> Option<UdpConnection> {
        self.accept_rx.lock().await.recv().await
    }

    pub async fn shutdown(&self) {
        info!("shutting down endpoint on {:?}", self.local_addr());

        let connections: Vec<_> = self
            .connections
            .write()
            .await
            .drain()
            .map(|(_, conn)| conn)
            .collect();
        for conn in connections {
            conn.close_internal(CloseReason::Local, true).await;
        }

        // terminates pending and future accept() calls
        self.accept_tx.lock().unwrap().take();

        for task in self.tasks.lock().unwrap().drain(..) {
            task.abort();
        }
    }

    async fn recv_loop(self: Arc<Self>) {
        debug!("starting receive loop");

        // larger than the protocol maximum, so an oversized datagram arrives
        //  unmangled and fails the checksum instead of masquerading
        let mut buf = vec![0u8; 2048];
        loop {
            let (num_read, from) = match self.socket.recv_from(&mut buf).await {
                Ok(received) => received,
                Err(e) => {
                    error!("socket error: {}", e);
                    continue;
                }
            };

            let correlation_id = Uuid::new_v4();
            let span = span!(Level::TRACE, "datagram_received", ?correlation_id, ?from);

            if let Some(conn) = self.connection_for(from).await {
                conn.on_datagram(&buf[..num_read]).instrument(span).await;
            }
        }
    }

    /// Looks up the connection for a source address, registering a fresh
    ///  server-side connection on the first datagram from an unknown peer.
    async fn connection_for(&self, from: SocketAddr) -> Option<Arc<ConnectionShared>> {
        if let Some(conn) = self.connections.read().await.get(&from) {
            return Some(conn.clone());
        }

        let created = {
            let mut connections = self.connections.write().await;
            if let Some(conn) = connections.get(&from) {
                return Some(conn.clone());
            }
            debug!("first datagram from {:?} - registering connection", from);
            let (shared, connection) =
                spawn_connection(from, self.pipeline.clone(), self.config.clone());
            connections.insert(from, shared.clone());
            (shared, connection)
        };

        let (shared, connection) = created;
        let accept_tx = self.accept_tx.lock().unwrap().clone();
        let accepted = match accept_tx {
            Some(tx) => tx.try_send(connection).is_ok(),
            None => false,
        };
        if accepted {
            Some(shared)
        } else {
            warn!("accept backlog full or endpoint shutting down - rejecting connection from {:?}", from);
            self.connections.write().await.remove(&from);
            shared.close_internal(CloseReason::Error, false).await;
            None
        }
    }

    /// One periodic task for all connections: keepalive pings, idle garbage
    ///  collection, and the minute tick of the latency analyser.
    async fn housekeeping_loop(self: Arc<Self>) {
        let mut ticker = time::interval(UDP_PING_TICK_PERIOD);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut tick_count: u64 = 0;

        loop {
            ticker.tick().await;
            tick_count += 1;
            let run_analyse = tick_count % 6 == 0;
            let now = Instant::now();

            let connections: Vec<_> = self.connections.read().await.values().cloned().collect();
            let mut defunct = Vec::new();
            for conn in connections {
                if conn.is_closed() {
                    defunct.push(conn.remote_addr());
                    continue;
                }
                if conn.is_expired(now) {
                    conn.close_timed_out().await;
                    defunct.push(conn.remote_addr());
                    continue;
                }
                conn.maybe_keepalive(now).await;
                if run_analyse {
                    conn.run_analyse();
                }
            }

            if !defunct.is_empty() {
                let mut connections = self.connections.write().await;
                for addr in defunct {
                    connections.remove(&addr);
                }
            }
        }
    }
}
