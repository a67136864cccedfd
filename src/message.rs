use crate::config::{MSG_HEADER_SIZE, PKG_HEADER_SIZE};
use bytes::Bytes;
use num_enum::{IntoPrimitive, TryFromPrimitive};
use std::sync::{Mutex, OnceLock};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum MessageType {
    /// payload carrying a sequence number
    Normal = 1,
    /// acknowledges the seq it carries
    Ack = 2,
    Ping = 3,
    Pong = 4,
    Fin = 5,
}

pub const MSG_STATUS_TRANSMITTED: u8 = 0x01;
pub const MSG_STATUS_ACKED: u8 = 0x02;

/// Mutable per-send state of a message. All of it is owned by the sending
///  side; received messages never touch it.
#[derive(Debug, Default)]
struct SendState {
    status: u8,
    transmitted_at: Option<Instant>,
    acked_at: Option<Instant>,
    rtt: Option<Duration>,
    /// incremented per loss-detected retransmission, reset by a timer resend
    miss_count: u32,
    retransmitted: bool,
    /// connection-level delivered bytes at the moment of first send
    delivered_at_send: u64,
    delivered_time_at_send: Option<Instant>,
}

/// A typed, sequenced message. Shared between the writer, the receive loop
///  and the retransmission timer, so the transmission state sits behind a
///  lock and the encoded frame is cached so retransmissions are byte-identical.
pub struct Message {
    pub msg_type: MessageType,
    pub seq: u32,
    pub body: Bytes,

    state: Mutex<SendState>,
    encoded_frame: OnceLock<Bytes>,
}

impl PartialEq for Message {
    fn eq(&self, other: &Self) -> bool {
        self.msg_type == other.msg_type && self.seq == other.seq && self.body == other.body
    }
}

impl Eq for Message {}

impl Message {
    pub fn new(msg_type: MessageType, seq: u32, body: Bytes) -> Message {
        Message {
            msg_type,
            seq,
            body,
            state: Mutex::new(SendState::default()),
            encoded_frame: OnceLock::new(),
        }
    }

    /// control messages carry the reserved seq 0 and no body
    pub fn control(msg_type: MessageType) -> Message {
        Message::new(msg_type, 0, Bytes::new())
    }

    pub fn ack(seq: u32) -> Message {
        Message::new(MessageType::Ack, seq, Bytes::new())
    }

    /// size of the message on the wire, including the checksum envelope
    pub fn total_framed_size(&self) -> usize {
        PKG_HEADER_SIZE + MSG_HEADER_SIZE + self.body.len()
    }

    pub(crate) fn encoded(&self) -> Option<Bytes> {
        self.encoded_frame.get().cloned()
    }

    pub(crate) fn cache_encoded(&self, frame: Bytes) {
        let _ = self.encoded_frame.set(frame);
    }

    /// The first call stamps the transmission time; retransmissions keep the
    ///  original stamp so only the first transmission produces an RTT.
    pub fn mark_transmitted(&self, now: Instant) {
        let mut state = self.state.lock().unwrap();
        state.status |= MSG_STATUS_TRANSMITTED;
        if state.transmitted_at.is_none() {
            state.transmitted_at = Some(now);
        }
    }

    /// Returns false if the message was already acked. Status and rtt are
    ///  final after the first ack.
    pub fn mark_acked(&self, now: Instant) -> bool {
        let mut state = self.state.lock().unwrap();
        if state.status & MSG_STATUS_ACKED != 0 {
            return false;
        }
        state.status |= MSG_STATUS_ACKED;
        state.acked_at = Some(now);
        state.rtt = Some(
            state
                .transmitted_at
                .map(|t| now.saturating_duration_since(t))
                .unwrap_or_default(),
        );
        true
    }

    pub fn is_acked(&self) -> bool {
        self.state.lock().unwrap().status & MSG_STATUS_ACKED != 0
    }

    pub fn status(&self) -> u8 {
        self.state.lock().unwrap().status
    }

    pub fn rtt(&self) -> Option<Duration> {
        self.state.lock().unwrap().rtt
    }

    pub fn miss_count(&self) -> u32 {
        self.state.lock().unwrap().miss_count
    }

    pub fn record_loss_resend(&self) {
        let mut state = self.state.lock().unwrap();
        state.miss_count += 1;
        state.retransmitted = true;
    }

    pub fn record_rto_resend(&self) {
        let mut state = self.state.lock().unwrap();
        state.miss_count = 0;
        state.retransmitted = true;
    }

    /// Stamps the delivery snapshot exactly once, at first send. A later
    ///  retransmission keeps the original snapshot so the eventual bandwidth
    ///  sample stays conservative.
    pub fn stamp_delivery(&self, delivered_bytes: u64, now: Instant) {
        let mut state = self.state.lock().unwrap();
        if state.delivered_time_at_send.is_none() {
            state.delivered_at_send = delivered_bytes;
            state.delivered_time_at_send = Some(now);
        }
    }

    pub fn delivery_snapshot(&self) -> (u64, Option<Instant>) {
        let state = self.state.lock().unwrap();
        (state.delivered_at_send, state.delivered_time_at_send)
    }

    /// rtt and whether the message was ever retransmitted
    pub fn ack_info(&self) -> (Option<Duration>, bool) {
        let state = self.state.lock().unwrap();
        (state.rtt, state.retransmitted)
    }
}

impl std::fmt::Debug for Message {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Message")
            .field("type", &self.msg_type)
            .field("seq", &self.seq)
            .field("len", &self.body.len())
            .field("status", &self.status())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use std::sync::Arc;

    #[rstest]
    #[case::normal(MessageType::Normal, 1)]
    #[case::ack(MessageType::Ack, 2)]
    #[case::ping(MessageType::Ping, 3)]
    #[case::pong(MessageType::Pong, 4)]
    #[case::fin(MessageType::Fin, 5)]
    fn test_message_type_wire_value(#[case] msg_type: MessageType, #[case] expected: u8) {
        let raw: u8 = msg_type.into();
        assert_eq!(raw, expected);
        assert_eq!(MessageType::try_from(expected).unwrap(), msg_type);
    }

    #[rstest]
    #[case(0)]
    #[case(6)]
    #[case(255)]
    fn test_message_type_reserved(#[case] raw: u8) {
        assert!(MessageType::try_from(raw).is_err());
    }

    #[rstest]
    #[case::empty(0, 13)]
    #[case::small(100, 113)]
    #[case::max(1011, 1024)]
    fn test_total_framed_size(#[case] body_len: usize, #[case] expected: usize) {
        let msg = Message::new(MessageType::Normal, 1, Bytes::from(vec![0u8; body_len]));
        assert_eq!(msg.total_framed_size(), expected);
    }

    #[test]
    fn test_transmit_then_ack() {
        let msg = Message::new(MessageType::Normal, 1, Bytes::from_static(b"hi"));
        assert_eq!(msg.status(), 0);

        let t0 = Instant::now();
        msg.mark_transmitted(t0);
        assert_eq!(msg.status(), MSG_STATUS_TRANSMITTED);

        let t1 = t0 + Duration::from_millis(40);
        assert!(msg.mark_acked(t1));
        assert_eq!(msg.status(), MSG_STATUS_TRANSMITTED | MSG_STATUS_ACKED);
        assert_eq!(msg.rtt(), Some(Duration::from_millis(40)));
    }

    #[test]
    fn test_ack_is_idempotent() {
        let msg = Message::new(MessageType::Normal, 1, Bytes::from_static(b"hi"));
        let t0 = Instant::now();
        msg.mark_transmitted(t0);

        assert!(msg.mark_acked(t0 + Duration::from_millis(10)));
        assert!(!msg.mark_acked(t0 + Duration::from_millis(99)));
        // the second ack must not touch the recorded rtt
        assert_eq!(msg.rtt(), Some(Duration::from_millis(10)));
    }

    #[test]
    fn test_retransmission_keeps_first_transmit_stamp() {
        let msg = Message::new(MessageType::Normal, 1, Bytes::from_static(b"hi"));
        let t0 = Instant::now();
        msg.mark_transmitted(t0);
        msg.mark_transmitted(t0 + Duration::from_millis(30));

        assert!(msg.mark_acked(t0 + Duration::from_millis(50)));
        assert_eq!(msg.rtt(), Some(Duration::from_millis(50)));
    }

    #[test]
    fn test_miss_count_bookkeeping() {
        let msg = Message::new(MessageType::Normal, 1, Bytes::from_static(b"hi"));
        msg.record_loss_resend();
        msg.record_loss_resend();
        assert_eq!(msg.miss_count(), 2);
        assert_eq!(msg.ack_info().1, true);

        msg.record_rto_resend();
        assert_eq!(msg.miss_count(), 0);
        assert_eq!(msg.ack_info().1, true);
    }

    #[test]
    fn test_delivery_snapshot_stamped_once() {
        let msg = Message::new(MessageType::Normal, 1, Bytes::from_static(b"hi"));
        let t0 = Instant::now();
        msg.stamp_delivery(500, t0);
        msg.stamp_delivery(9999, t0 + Duration::from_secs(1));

        let (delivered, time) = msg.delivery_snapshot();
        assert_eq!(delivered, 500);
        assert_eq!(time, Some(t0));
    }

    #[test]
    fn test_encoded_frame_cached_once() {
        let msg = Arc::new(Message::new(MessageType::Normal, 1, Bytes::from_static(b"hi")));
        assert!(msg.encoded().is_none());

        msg.cache_encoded(Bytes::from_static(b"first"));
        msg.cache_encoded(Bytes::from_static(b"second"));
        assert_eq!(msg.encoded().unwrap().as_ref(), b"first");
    }
}
