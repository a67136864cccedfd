use crate::config::{BANDWIDTH_WINDOW_ROUNDS, BW_UNIT, MIN_RTT_WINDOW};
use std::collections::VecDeque;
use std::time::{Duration, Instant};
use tracing::trace;

/// What one ack contributed to the estimators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateSample {
    /// delivery rate in bytes/ns << BW_SCALE; None when the sample had to be
    ///  discarded (no delivery stamp or non-positive elapsed time)
    pub bandwidth: Option<u64>,
    pub rtt: Option<Duration>,
    /// true when this ack started a new packet-timed round trip
    pub is_round_start: bool,
}

/// Turns ack events into delivery-rate and RTT estimates: a max-bandwidth
///  filter windowed by packet-timed round trips, a time-windowed min-RTT
///  filter, and a smoothed RTT for the retransmission timeout.
pub struct DeliverySampler {
    delivered_bytes: u64,

    round_count: u64,
    next_round_delivered: u64,

    /// (observed at, rtt), pruned to the last MIN_RTT_WINDOW
    min_rtt_window: VecDeque<(Instant, Duration)>,
    /// (round, bandwidth), pruned to the last BANDWIDTH_WINDOW_ROUNDS rounds
    max_bw_window: VecDeque<(u64, u64)>,

    srtt: Option<Duration>,
}

impl DeliverySampler {
    pub fn new() -> DeliverySampler {
        DeliverySampler {
            delivered_bytes: 0,
            round_count: 0,
            next_round_delivered: 0,
            min_rtt_window: VecDeque::new(),
            max_bw_window: VecDeque::new(),
            srtt: None,
        }
    }

    /// Total bytes delivered on this connection so far. Messages snapshot this
    ///  at first send.
    pub fn delivered_bytes(&self) -> u64 {
        self.delivered_bytes
    }

    /// Feeds the ack of one message. `rtt` must be None for retransmitted
    ///  messages; the bandwidth sample is still taken, against the first-send
    ///  delivery snapshot.
    pub fn on_ack(
        &mut self,
        framed_size: usize,
        delivered_at_send: u64,
        delivered_time_at_send: Option<Instant>,
        rtt: Option<Duration>,
        now: Instant,
    ) -> RateSample {
        if let Some(rtt) = rtt {
            self.min_rtt_window.push_back((now, rtt));
            self.expire_min_rtt(now);

            // RFC 6298 style smoothing at 1/8
            self.srtt = Some(match self.srtt {
                Some(srtt) => (srtt * 7 + rtt) / 8,
                None => rtt,
            });
        }

        let delivered_now = self.delivered_bytes + framed_size as u64;
        let bandwidth = delivered_time_at_send.and_then(|sent_at| {
            let elapsed = now.saturating_duration_since(sent_at);
            let elapsed_ns = elapsed.as_nanos() as u64;
            if elapsed_ns == 0 {
                trace!("discarding bandwidth sample with non-positive elapsed time");
                return None;
            }
            Some((delivered_now - delivered_at_send).saturating_mul(BW_UNIT) / elapsed_ns)
        });

        // the delivery totals advance only after the sample is taken
        self.delivered_bytes = delivered_now;

        let is_round_start = delivered_at_send >= self.next_round_delivered;
        if is_round_start {
            self.round_count += 1;
            self.next_round_delivered = self.delivered_bytes;
        }

        if let Some(bw) = bandwidth {
            self.max_bw_window.push_back((self.round_count, bw));
            let lower_bound = self.round_count.saturating_sub(BANDWIDTH_WINDOW_ROUNDS - 1);
            while let Some(&(round, _)) = self.max_bw_window.front() {
                if round >= lower_bound {
                    break;
                }
                self.max_bw_window.pop_front();
            }
        }

        RateSample {
            bandwidth,
            rtt,
            is_round_start,
        }
    }

    pub fn max_bandwidth(&self) -> Option<u64> {
        self.max_bw_window.iter().map(|&(_, bw)| bw).max()
    }

    pub fn min_rtt(&mut self, now: Instant) -> Option<Duration> {
        self.expire_min_rtt(now);
        self.min_rtt_window.iter().map(|&(_, rtt)| rtt).min()
    }

    pub fn srtt(&self) -> Option<Duration> {
        self.srtt
    }

    pub fn round_count(&self) -> u64 {
        self.round_count
    }

    fn expire_min_rtt(&mut self, now: Instant) {
        while let Some(&(at, _)) = self.min_rtt_window.front() {
            if now.saturating_duration_since(at) <= MIN_RTT_WINDOW {
                break;
            }
            self.min_rtt_window.pop_front();
        }
    }
}
