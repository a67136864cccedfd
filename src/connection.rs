use crate::bbr::{BbrController, BbrMode};
use crate::codec;
use crate::config::{EndpointConfig, MAX_MESSAGE_SIZE, MIN_RTO, PENDING_WINDOW_SIZE, UDP_GC_PERIOD, UDP_PING_TICK_PERIOD};
use crate::message::{Message, MessageType};
use crate::pending::{PendingStats, UdpPendingMap};
use crate::sampler::DeliverySampler;
use crate::send_pipeline::SendPipeline;
use anyhow::bail;
use bytes::Bytes;
use std::cmp::max;
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Notify};
use tokio::task::AbortHandle;
use tokio::time;
use tracing::{debug, trace, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// the application closed the connection
    Local,
    /// the peer sent FIN
    Peer,
    /// no activity for UDP_GC_PERIOD
    Timeout,
    /// the inbound channel was gone while a delivery was due
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnState {
    Open,
    Closing,
    Closed,
}

/// Everything the controller needs to see atomically on an ack.
struct CongestionState {
    sampler: DeliverySampler,
    controller: BbrController,
    bytes_in_flight: u64,
}

struct RecvState {
    /// lowest seq not yet handed to the application
    next_expected: u32,
    /// out-of-order messages parked until the gap before them closes
    reorder: BTreeMap<u32, Bytes>,
}

/// what to do with one received NORMAL, decided under the receive lock
enum Classified {
    Deliver(Vec<Bytes>),
    Buffered,
    Duplicate,
    ReorderFull,
}

/// Point-in-time view of a connection for monitoring.
#[derive(Debug, Clone)]
pub struct ConnectionStats {
    pub sent_bytes: u64,
    pub received_bytes: u64,
    pub corrupt_datagrams: u64,
    pub connected_at: Instant,
    pub last_ack_at: Option<Instant>,
    pub last_minute: Option<PendingStats>,
    pub pacing_rate_bytes_per_sec: u64,
    pub cwnd: u64,
    pub mode: BbrMode,
    pub close_reason: Option<CloseReason>,
}

/// The shared half of a connection: owned jointly by the endpoint's receive
///  loop, the writer task and the retransmission timers. The application
///  talks to it through [UdpConnection].
pub(crate) struct ConnectionShared {
    remote_addr: SocketAddr,
    pipeline: Arc<SendPipeline>,
    config: Arc<EndpointConfig>,

    send_seq: AtomicU32,
    pending: UdpPendingMap,
    ctrl: Mutex<CongestionState>,
    recv_state: Mutex<RecvState>,

    /// ordering discipline for concurrent senders: seq allocation, window add
    ///  and handover to the writer happen under this lock
    send_lock: tokio::sync::Mutex<()>,
    writer_tx: mpsc::Sender<Arc<Message>>,
    writer_abort: Mutex<Option<AbortHandle>>,
    /// wakes the writer when acks make room under the congestion window
    ack_notify: Notify,

    inbound_tx: Mutex<Option<mpsc::Sender<Bytes>>>,

    state: Mutex<ConnState>,
    close_reason: Mutex<Option<CloseReason>>,

    connected_at: Instant,
    last_activity: Mutex<Instant>,
    last_outbound: Mutex<Instant>,
    last_ack_at: Mutex<Option<Instant>>,
    sent_bytes: AtomicU64,
    received_bytes: AtomicU64,
    corrupt_datagrams: AtomicU64,
}

/// Creates the connection state and spawns its writer task.
pub(crate) fn spawn_connection(
    remote_addr: SocketAddr,
    pipeline: Arc<SendPipeline>,
    config: Arc<EndpointConfig>,
) -> (Arc<ConnectionShared>, UdpConnection) {
    let (writer_tx, writer_rx) = mpsc::channel(PENDING_WINDOW_SIZE as usize);
    let (inbound_tx, inbound_rx) = mpsc::channel(config.inbound_channel_capacity);

    let now = Instant::now();
    let shared = Arc::new(ConnectionShared {
        remote_addr,
        pipeline,
        config,
        send_seq: AtomicU32::new(0),
        pending: UdpPendingMap::new(),
        ctrl: Mutex::new(CongestionState {
            sampler: DeliverySampler::new(),
            controller: BbrController::new(),
            bytes_in_flight: 0,
        }),
        recv_state: Mutex::new(RecvState {
            next_expected: 1,
            reorder: BTreeMap::new(),
        }),
        send_lock: tokio::sync::Mutex::new(()),
        writer_tx,
        writer_abort: Mutex::new(None),
        ack_notify: Notify::new(),
        inbound_tx: Mutex::new(Some(inbound_tx)),
        state: Mutex::new(ConnState::Open),
        close_reason: Mutex::new(None),
        connected_at: now,
        last_activity: Mutex::new(now),
        last_outbound: Mutex::new(now),
        last_ack_at: Mutex::new(None),
        sent_bytes: AtomicU64::new(0),
        received_bytes: AtomicU64::new(0),
        corrupt_datagrams: AtomicU64::new(0),
    });

    let writer = tokio::spawn(writer_loop(shared.clone(), writer_rx));
    *shared.writer_abort.lock().unwrap() = Some(writer.abort_handle());

    let connection = UdpConnection {
        shared: shared.clone(),
        inbound_rx: tokio::sync::Mutex::new(inbound_rx),
    };
    (shared, connection)
}

impl ConnectionShared {
    pub(crate) fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    pub(crate) fn is_closed(&self) -> bool {
        *self.state.lock().unwrap() != ConnState::Open
    }

    /// Appends a message to the reliable stream. Waits while the window slot
    ///  for its seq is taken; fails for oversize bodies and closed connections.
    pub(crate) async fn send(&self, body: Bytes) -> anyhow::Result<()> {
        if body.len() > MAX_MESSAGE_SIZE {
            bail!(
                "message of {} bytes exceeds the maximum of {}",
                body.len(),
                MAX_MESSAGE_SIZE
            );
        }
        if self.is_closed() {
            bail!("connection to {:?} is closed", self.remote_addr);
        }

        let _ordered = self.send_lock.lock().await;

        let seq = self.send_seq.fetch_add(1, Ordering::Relaxed) + 1;
        let msg = Arc::new(Message::new(MessageType::Normal, seq, body));

        self.pending.add(seq, msg.clone()).await?;

        {
            let ctrl = self.ctrl.lock().unwrap();
            msg.stamp_delivery(ctrl.sampler.delivered_bytes(), Instant::now());
        }

        if self.writer_tx.send(msg).await.is_err() {
            bail!("connection to {:?} is closed", self.remote_addr);
        }
        Ok(())
    }

    /// Dispatches one datagram received from this connection's remote address.
    pub(crate) async fn on_datagram(&self, datagram: &[u8]) {
        if *self.state.lock().unwrap() == ConnState::Closed {
            trace!("dropping datagram for closed connection to {:?}", self.remote_addr);
            return;
        }
        *self.last_activity.lock().unwrap() = Instant::now();

        let msg = match codec::decode(datagram) {
            Ok(msg) => msg,
            Err(e) => {
                self.corrupt_datagrams.fetch_add(1, Ordering::Relaxed);
                debug!("dropping datagram from {:?}: {}", self.remote_addr, e);
                return;
            }
        };
        self.received_bytes
            .fetch_add(datagram.len() as u64, Ordering::Relaxed);

        match msg.msg_type {
            MessageType::Ack => self.on_ack(msg.seq).await,
            MessageType::Normal => self.on_normal(msg.seq, msg.body).await,
            MessageType::Ping => {
                trace!("ping from {:?}", self.remote_addr);
                self.send_control(Message::control(MessageType::Pong)).await;
            }
            MessageType::Pong => {
                trace!("pong from {:?}", self.remote_addr);
            }
            MessageType::Fin => {
                debug!("received FIN from {:?}", self.remote_addr);
                self.close_internal(CloseReason::Peer, false).await;
            }
        }
    }

    async fn on_ack(&self, seq: u32) {
        let Some((msg, losses)) = self.pending.ack_and_detect_loss(seq) else {
            trace!("ack from {:?} for unknown or already acked seq {}", self.remote_addr, seq);
            return;
        };
        *self.last_ack_at.lock().unwrap() = Some(Instant::now());

        // messages the receiver should have acked before this one are resent
        //  right away, bypassing pacing; the timer would catch them much later
        for lost in losses {
            if lost.is_acked() {
                continue;
            }
            let Some(frame) = lost.encoded() else {
                continue;
            };
            lost.record_loss_resend();
            debug!(
                "seq {} considered lost after ack of seq {} - retransmitting to {:?}",
                lost.seq, seq, self.remote_addr
            );
            let _ = self.pipeline.send_packet(self.remote_addr, &frame).await;
            self.note_outbound(frame.len());
        }

        let now = Instant::now();
        let framed_size = msg.total_framed_size();
        let (delivered_at_send, delivered_time_at_send) = msg.delivery_snapshot();
        let (rtt, retransmitted) = msg.ack_info();

        {
            let mut ctrl = self.ctrl.lock().unwrap();
            ctrl.bytes_in_flight = ctrl.bytes_in_flight.saturating_sub(framed_size as u64);

            let rtt_sample = if retransmitted { None } else { rtt };
            let sample = ctrl.sampler.on_ack(
                framed_size,
                delivered_at_send,
                delivered_time_at_send,
                rtt_sample,
                now,
            );

            let max_bw = ctrl.sampler.max_bandwidth();
            let min_rtt = ctrl.sampler.min_rtt(now);
            let bytes_in_flight = ctrl.bytes_in_flight;
            ctrl.controller
                .on_ack(max_bw, min_rtt, bytes_in_flight, sample.is_round_start);
        }

        self.ack_notify.notify_waiters();
    }

    async fn on_normal(&self, seq: u32, body: Bytes) {
        let classified = {
            let mut recv = self.recv_state.lock().unwrap();
            if seq < recv.next_expected {
                Classified::Duplicate
            } else if seq > recv.next_expected {
                if recv.reorder.len() >= self.config.reorder_buffer_bound
                    && !recv.reorder.contains_key(&seq)
                {
                    Classified::ReorderFull
                } else {
                    recv.reorder.insert(seq, body);
                    Classified::Buffered
                }
            } else {
                let mut ordered = vec![body];
                recv.next_expected += 1;
                while let Some(next) = {
                    let next_expected = recv.next_expected;
                    recv.reorder.remove(&next_expected)
                } {
                    ordered.push(next);
                    recv.next_expected += 1;
                }
                Classified::Deliver(ordered)
            }
        };

        match classified {
            Classified::ReorderFull => {
                // deliberately not acked so the peer resends once there is room
                debug!("reorder buffer full - dropping seq {} from {:?}", seq, self.remote_addr);
            }
            Classified::Duplicate => {
                trace!("duplicate seq {} from {:?} - ack only", seq, self.remote_addr);
                self.send_control(Message::ack(seq)).await;
            }
            Classified::Buffered => {
                trace!("buffering out-of-order seq {} from {:?}", seq, self.remote_addr);
                self.send_control(Message::ack(seq)).await;
            }
            Classified::Deliver(ordered) => {
                self.send_control(Message::ack(seq)).await;

                let inbound = self.inbound_tx.lock().unwrap().clone();
                let Some(inbound) = inbound else {
                    return;
                };
                for body in ordered {
                    if inbound.send(body).await.is_err() {
                        warn!(
                            "inbound channel gone while delivering - closing connection to {:?}",
                            self.remote_addr
                        );
                        self.close_internal(CloseReason::Error, false).await;
                        return;
                    }
                }
            }
        }
    }

    /// acks, pings, pongs and fins go out directly, without seq accounting or pacing
    async fn send_control(&self, msg: Message) {
        let frame = codec::encode(&msg);
        if let Err(e) = self.pipeline.send_packet(self.remote_addr, &frame).await {
            debug!("failed to send {:?} to {:?}: {}", msg.msg_type, self.remote_addr, e);
            return;
        }
        self.note_outbound(frame.len());
    }

    fn note_outbound(&self, frame_len: usize) {
        self.sent_bytes.fetch_add(frame_len as u64, Ordering::Relaxed);
        *self.last_outbound.lock().unwrap() = Instant::now();
    }

    fn current_rto(&self) -> Duration {
        let srtt = self.ctrl.lock().unwrap().sampler.srtt();
        match srtt {
            Some(srtt) => max(MIN_RTO, 2 * srtt),
            None => MIN_RTO,
        }
    }

    /// Sends a keepalive if the connection had no outbound traffic for a full
    ///  ping period. Driven by the endpoint's housekeeping.
    pub(crate) async fn maybe_keepalive(&self, now: Instant) {
        let stale = {
            let last_outbound = *self.last_outbound.lock().unwrap();
            now.saturating_duration_since(last_outbound) >= UDP_PING_TICK_PERIOD
        };
        if stale && !self.is_closed() {
            trace!("sending keepalive ping to {:?}", self.remote_addr);
            self.send_control(Message::control(MessageType::Ping)).await;
        }
    }

    /// True when the connection has seen no traffic in either direction for
    ///  longer than the GC period.
    pub(crate) fn is_expired(&self, now: Instant) -> bool {
        let last_activity = *self.last_activity.lock().unwrap();
        now.saturating_duration_since(last_activity) > UDP_GC_PERIOD
    }

    pub(crate) fn run_analyse(&self) {
        self.pending.analyse();
    }

    pub(crate) async fn close_timed_out(&self) {
        warn!("connection to {:?} idle for more than {:?} - closing", self.remote_addr, UDP_GC_PERIOD);
        self.close_internal(CloseReason::Timeout, false).await;
    }

    pub(crate) async fn close_internal(&self, reason: CloseReason, send_fin: bool) {
        {
            let mut state = self.state.lock().unwrap();
            if *state != ConnState::Open {
                return;
            }
            *state = ConnState::Closing;
        }
        self.close_reason.lock().unwrap().get_or_insert(reason);
        debug!("closing connection to {:?} ({:?})", self.remote_addr, reason);

        // senders waiting for a window slot fail now
        self.pending.close();

        if let Some(writer) = self.writer_abort.lock().unwrap().take() {
            writer.abort();
        }
        self.ack_notify.notify_waiters();

        if send_fin {
            self.send_control(Message::control(MessageType::Fin)).await;
        }

        // recv() drains what was delivered, then sees the closed channel
        self.inbound_tx.lock().unwrap().take();

        *self.state.lock().unwrap() = ConnState::Closed;
    }

    pub(crate) fn stats(&self) -> ConnectionStats {
        let ctrl = self.ctrl.lock().unwrap();
        ConnectionStats {
            sent_bytes: self.sent_bytes.load(Ordering::Relaxed),
            received_bytes: self.received_bytes.load(Ordering::Relaxed),
            corrupt_datagrams: self.corrupt_datagrams.load(Ordering::Relaxed),
            connected_at: self.connected_at,
            last_ack_at: *self.last_ack_at.lock().unwrap(),
            last_minute: self.pending.last_minute_stats(),
            pacing_rate_bytes_per_sec: ctrl.controller.pacing_rate_bytes_per_sec(),
            cwnd: ctrl.controller.cwnd(),
            mode: ctrl.controller.mode(),
            close_reason: *self.close_reason.lock().unwrap(),
        }
    }

    #[cfg(test)]
    pub(crate) fn pending_len(&self) -> usize {
        self.pending.len()
    }
}

/// Consumes the writer channel in seq order, gates on the congestion window,
///  enforces pacing, puts frames on the wire and arms their timers.
async fn writer_loop(shared: Arc<ConnectionShared>, mut writer_rx: mpsc::Receiver<Arc<Message>>) {
    let mut next_send_time: Option<time::Instant> = None;

    while let Some(msg) = writer_rx.recv().await {
        let frame = codec::encode(&msg);

        // wait until the frame fits under cwnd
        loop {
            if shared.is_closed() {
                return;
            }
            let notified = shared.ack_notify.notified();
            tokio::pin!(notified);
            {
                let ctrl = shared.ctrl.lock().unwrap();
                if ctrl.bytes_in_flight + frame.len() as u64 <= ctrl.controller.cwnd() {
                    break;
                }
                notified.as_mut().enable();
                trace!("cwnd full ({} in flight) - waiting for acks", ctrl.bytes_in_flight);
            }
            notified.await;
        }

        if let Some(t) = next_send_time {
            time::sleep_until(t).await;
        }

        let send_result = shared.pipeline.send_packet(shared.remote_addr, &frame).await;
        shared.note_outbound(frame.len());
        if send_result.is_err() {
            // transient; the timer retries the identical bytes
            debug!("send of seq {} failed - leaving it to the retransmission timer", msg.seq);
        }

        let pacing_delay = {
            let mut ctrl = shared.ctrl.lock().unwrap();
            ctrl.bytes_in_flight += frame.len() as u64;
            ctrl.controller.pacing_delay(frame.len())
        };
        next_send_time = if pacing_delay.is_zero() {
            None
        } else {
            let base = max(
                next_send_time.unwrap_or_else(time::Instant::now),
                time::Instant::now(),
            );
            Some(base + pacing_delay)
        };

        arm_rto(&shared, msg.seq);
    }
}

/// One timer per in-flight message. The task holds only a weak handle and the
///  seq, resolving the message through the pending map when it fires; it never
///  keeps the message alive by itself.
fn arm_rto(shared: &Arc<ConnectionShared>, seq: u32) {
    let weak: Weak<ConnectionShared> = Arc::downgrade(shared);
    let mut rto = shared.current_rto();

    tokio::spawn(async move {
        loop {
            time::sleep(rto).await;

            let Some(conn) = weak.upgrade() else {
                return;
            };
            if conn.is_closed() {
                return;
            }
            let Some(msg) = conn.pending.get(seq) else {
                return; // acked in the meantime
            };
            if msg.is_acked() {
                return;
            }
            let Some(frame) = msg.encoded() else {
                return;
            };

            msg.record_rto_resend();
            debug!("seq {} hit its retransmission timeout - resending to {:?}", seq, conn.remote_addr());
            if conn.pipeline.send_packet(conn.remote_addr, &frame).await.is_err() {
                debug!("resend of seq {} failed - not re-arming", seq);
                return;
            }
            conn.note_outbound(frame.len());

            rto = conn.current_rto();
        }
    });
}

/// A bidirectional, ordered, reliable message channel to one remote peer.
pub struct UdpConnection {
    shared: Arc<ConnectionShared>,
    inbound_rx: tokio::sync::Mutex<mpsc::Receiver<Bytes>>,
}

impl UdpConnection {
    /// Appends a message to the stream. Blocks while the send window is
    ///  exhausted, but never waits for the round trip.
    pub async fn send(&self, body: Bytes) -> anyhow::Result<()> {
        self.shared.send(body).await
    }

    /// The next in-order message. None once the connection is closed and
    ///  everything delivered before that has been drained.
    pub async fn recv(&self) -> Option<Bytes> {
        self.inbound_rx.lock().await.recv().await
    }

    /// Graceful shutdown: tells the peer with a FIN and releases the
    ///  connection's tasks.
    pub async fn close(&self) {
        self.shared.close_internal(CloseReason::Local, true).await;
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.shared.remote_addr()
    }

    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }

    pub fn stats(&self) -> ConnectionStats {
        self.shared.stats()
    }
}
