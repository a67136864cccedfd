use crate::config::PENDING_WINDOW_SIZE;
use crate::message::Message;
use rustc_hash::FxHashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tracing::trace;

/// Latency and volume of everything acked during the last analyser period.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingStats {
    pub sent_bytes: usize,
    pub min_rtt: Duration,
    pub max_rtt: Duration,
    pub avg_rtt: Duration,
    pub count: usize,
}

struct AckedSample {
    framed_size: usize,
    rtt: Duration,
}

struct PendingInner {
    pending: FxHashMap<u32, Arc<Message>>,
    /// one bit per window slot, bit i <=> a message with seq % 8 == i is in flight
    wait_bits: u8,
}

/// The table of in-flight messages, keyed by seq, with a sliding window of
///  `PENDING_WINDOW_SIZE` slots indexed by `seq % PENDING_WINDOW_SIZE`.
///  `add` on an occupied slot waits for the occupant to be acked; this is the
///  sender's ordering back-pressure.
pub struct UdpPendingMap {
    inner: Mutex<PendingInner>,
    slot_freed: Notify,
    closed: AtomicBool,
    /// acked messages accumulated for the minute analyser, kept out of the
    ///  window lock so the analyser never delays add or ack
    acked: Mutex<Vec<AckedSample>>,
    last_minute: Mutex<Option<PendingStats>>,
}

impl UdpPendingMap {
    pub fn new() -> UdpPendingMap {
        UdpPendingMap {
            inner: Mutex::new(PendingInner {
                pending: FxHashMap::default(),
                wait_bits: 0,
            }),
            slot_freed: Notify::new(),
            closed: AtomicBool::new(false),
            acked: Mutex::new(Vec::new()),
            last_minute: Mutex::new(None),
        }
    }

    /// Inserts the message and marks it transmitted. Waits while the window
    ///  slot is occupied by an earlier unacked seq. Fails only when the map
    ///  is closed underneath a waiter.
    pub async fn add(&self, seq: u32, msg: Arc<Message>) -> anyhow::Result<()> {
        loop {
            if self.closed.load(Ordering::Acquire) {
                anyhow::bail!("pending map is closed");
            }

            let notified = self.slot_freed.notified();
            tokio::pin!(notified);

            {
                let mut inner = self.inner.lock().unwrap();
                let bit = 1u8 << (seq % PENDING_WINDOW_SIZE);
                if inner.wait_bits & bit == 0 {
                    inner.wait_bits |= bit;
                    inner.pending.insert(seq, msg.clone());
                    drop(inner);
                    msg.mark_transmitted(Instant::now());
                    return Ok(());
                }
                // register for the wakeup before releasing the lock so an ack
                //  in between cannot be missed
                notified.as_mut().enable();
                trace!("window slot for seq {} occupied - waiting", seq);
            }

            notified.await;
        }
    }

    /// Acks `seq` and returns it together with the older messages in the same
    ///  window that should have been acked before it and are therefore
    ///  considered lost. Offsets seq-7 to seq-2 are scanned; the immediate
    ///  predecessor is left to the retransmission timer since a one-position
    ///  inversion is usually ack reordering rather than loss.
    ///
    /// Returns None for an unknown or already acked seq.
    pub fn ack_and_detect_loss(&self, seq: u32) -> Option<(Arc<Message>, Vec<Arc<Message>>)> {
        let (msg, losses) = {
            let mut inner = self.inner.lock().unwrap();
            let msg = inner.pending.remove(&seq)?;
            inner.wait_bits &= !(1u8 << (seq % PENDING_WINDOW_SIZE));

            let mut losses = Vec::new();
            for n in (2..PENDING_WINDOW_SIZE).rev() {
                let Some(prev_seq) = seq.checked_sub(n) else {
                    continue;
                };
                if let Some(lost) = inner.pending.get(&prev_seq) {
                    losses.push(lost.clone());
                }
            }
            (msg, losses)
        };
        self.slot_freed.notify_waiters();

        if msg.mark_acked(Instant::now()) {
            self.acked.lock().unwrap().push(AckedSample {
                framed_size: msg.total_framed_size(),
                rtt: msg.rtt().unwrap_or_default(),
            });
        }

        Some((msg, losses))
    }

    pub fn get(&self, seq: u32) -> Option<Arc<Message>> {
        self.inner.lock().unwrap().pending.get(&seq).cloned()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Swaps out the acked snapshot and condenses it into the last-minute
    ///  statistics. Driven by the endpoint's housekeeping once a minute.
    pub fn analyse(&self) -> Option<PendingStats> {
        let acked = std::mem::take(&mut *self.acked.lock().unwrap());
        if acked.is_empty() {
            *self.last_minute.lock().unwrap() = None;
            return None;
        }

        let mut sent_bytes = 0usize;
        let mut min_rtt = Duration::MAX;
        let mut max_rtt = Duration::ZERO;
        let mut sum_rtt = Duration::ZERO;
        for sample in &acked {
            sent_bytes += sample.framed_size;
            min_rtt = min_rtt.min(sample.rtt);
            max_rtt = max_rtt.max(sample.rtt);
            sum_rtt += sample.rtt;
        }

        let stats = PendingStats {
            sent_bytes,
            min_rtt,
            max_rtt,
            avg_rtt: sum_rtt / acked.len() as u32,
            count: acked.len(),
        };
        trace!(
            "last minute: sent {} bytes, latency min {:?} max {:?} avg {:?}, count {}",
            stats.sent_bytes,
            stats.min_rtt,
            stats.max_rtt,
            stats.avg_rtt,
            stats.count
        );
        *self.last_minute.lock().unwrap() = Some(stats.clone());
        Some(stats)
    }

    pub fn last_minute_stats(&self) -> Option<PendingStats> {
        self.last_minute.lock().unwrap().clone()
    }

    /// Fails pending and future `add` waiters. Acks arriving afterwards are
    ///  still processed so in-flight state can drain.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.slot_freed.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::MessageType;
    use bytes::Bytes;
    use rstest::rstest;
    use std::sync::atomic::AtomicU32;

    fn msg(seq: u32) -> Arc<Message> {
        Arc::new(Message::new(
            MessageType::Normal,
            seq,
            Bytes::from(vec![0u8; 10]),
        ))
    }

    async fn settle() {
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn test_add_marks_transmitted() {
        let map = UdpPendingMap::new();
        let m = msg(1);
        map.add(1, m.clone()).await.unwrap();

        assert_eq!(map.len(), 1);
        assert_eq!(m.status(), crate::message::MSG_STATUS_TRANSMITTED);
    }

    #[tokio::test]
    async fn test_ack_removes_and_marks() {
        let map = UdpPendingMap::new();
        let m = msg(1);
        map.add(1, m.clone()).await.unwrap();

        let (acked, losses) = map.ack_and_detect_loss(1).unwrap();
        assert!(Arc::ptr_eq(&acked, &m));
        assert!(losses.is_empty());
        assert!(acked.is_acked());
        assert!(map.is_empty());
    }

    #[tokio::test]
    async fn test_ack_unknown_seq_is_noop() {
        let map = UdpPendingMap::new();
        map.add(1, msg(1)).await.unwrap();

        assert!(map.ack_and_detect_loss(99).is_none());
        assert_eq!(map.len(), 1);

        // a second ack for the same seq is idempotent
        assert!(map.ack_and_detect_loss(1).is_some());
        assert!(map.ack_and_detect_loss(1).is_none());
    }

    #[rstest]
    #[case::no_gap(vec![1, 2, 3, 4, 5], 5, vec![1, 2, 3])]
    #[case::immediate_predecessor_excluded(vec![4, 5], 5, vec![])]
    #[case::single_gap(vec![3, 5], 5, vec![3])]
    #[case::window_edge(vec![1, 8], 8, vec![1])]
    #[case::far_predecessor_outside_scan(vec![1, 9], 9, vec![])]
    #[case::low_seq_no_underflow(vec![1, 2], 2, vec![])]
    #[tokio::test]
    async fn test_loss_detection(
        #[case] pending: Vec<u32>,
        #[case] ack: u32,
        #[case] expected_loss: Vec<u32>,
    ) {
        let map = UdpPendingMap::new();
        for seq in pending {
            map.add(seq, msg(seq)).await.unwrap();
        }

        let (_, losses) = map.ack_and_detect_loss(ack).unwrap();
        let loss_seqs: Vec<u32> = losses.iter().map(|m| m.seq).collect();
        assert_eq!(loss_seqs, expected_loss);
    }

    #[tokio::test]
    async fn test_window_capacity_is_eight() {
        let map = UdpPendingMap::new();
        for seq in 1..=8 {
            map.add(seq, msg(seq)).await.unwrap();
        }
        assert_eq!(map.len(), 8);
    }

    #[tokio::test]
    async fn test_ninth_add_waits_for_slot() {
        let map = Arc::new(UdpPendingMap::new());
        for seq in 1..=8 {
            map.add(seq, msg(seq)).await.unwrap();
        }

        let unblocked = Arc::new(AtomicU32::new(0));
        let map2 = map.clone();
        let unblocked2 = unblocked.clone();
        tokio::spawn(async move {
            // seq 9 shares the slot of seq 1
            map2.add(9, msg(9)).await.unwrap();
            unblocked2.store(9, Ordering::SeqCst);
        });

        settle().await;
        assert_eq!(unblocked.load(Ordering::SeqCst), 0);
        assert_eq!(map.len(), 8);

        // an ack in a different slot does not free seq 9
        map.ack_and_detect_loss(2);
        settle().await;
        assert_eq!(unblocked.load(Ordering::SeqCst), 0);

        map.ack_and_detect_loss(1);
        settle().await;
        assert_eq!(unblocked.load(Ordering::SeqCst), 9);
        assert_eq!(map.len(), 7);
        assert!(map.get(9).is_some());
    }

    #[tokio::test]
    async fn test_close_fails_waiters() {
        let map = Arc::new(UdpPendingMap::new());
        for seq in 1..=8 {
            map.add(seq, msg(seq)).await.unwrap();
        }

        let map2 = map.clone();
        let waiter = tokio::spawn(async move { map2.add(9, msg(9)).await });

        settle().await;
        map.close();

        assert!(waiter.await.unwrap().is_err());
        assert!(map.add(10, msg(10)).await.is_err());
    }

    #[tokio::test]
    async fn test_analyse_condenses_last_minute() {
        let map = UdpPendingMap::new();
        assert!(map.analyse().is_none());
        assert!(map.last_minute_stats().is_none());

        for seq in 1..=3 {
            map.add(seq, msg(seq)).await.unwrap();
            map.ack_and_detect_loss(seq);
        }

        let stats = map.analyse().unwrap();
        assert_eq!(stats.count, 3);
        assert_eq!(stats.sent_bytes, 3 * 23);
        assert!(stats.min_rtt <= stats.avg_rtt && stats.avg_rtt <= stats.max_rtt);
        assert_eq!(map.last_minute_stats(), Some(stats));

        // the snapshot was consumed
        assert!(map.analyse().is_none());
    }
}
