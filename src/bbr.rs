use crate::config::{
    BBR_SCALE, BBR_UNIT, BW_SCALE, BW_UNIT, CWND_GAIN, DRAIN_GAIN, FULL_BW_CNT, FULL_BW_THRESH,
    HIGH_GAIN, MIN_CWND, PACING_GAIN_CYCLE,
};
use std::cmp::max;
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BbrMode {
    /// probe for the bottleneck bandwidth with an aggressive gain
    Startup,
    /// pace below the estimate until the queue built up during startup drains
    Drain,
    /// cruise, cycling the pacing gain to keep probing and yielding
    ProbeBw,
}

impl std::fmt::Display for BbrMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BbrMode::Startup => write!(f, "startup"),
            BbrMode::Drain => write!(f, "drain"),
            BbrMode::ProbeBw => write!(f, "probeBW"),
        }
    }
}

/// The control loop steering pacing and the congestion window from the
///  sampler's bandwidth and min-RTT estimates. Loss never shrinks the window
///  here; it only triggers retransmission.
pub struct BbrController {
    mode: BbrMode,
    pacing_gain: u64,
    cwnd_gain: u64,

    /// bandwidth baseline of the full-pipe estimator
    full_bw: u64,
    full_bw_count: u32,

    cycle_index: usize,

    /// bytes/ns << BW_SCALE
    pacing_rate: u64,
    /// bytes
    cwnd: u64,
}

impl BbrController {
    pub fn new() -> BbrController {
        BbrController {
            mode: BbrMode::Startup,
            pacing_gain: HIGH_GAIN,
            cwnd_gain: HIGH_GAIN,
            full_bw: 0,
            full_bw_count: 0,
            cycle_index: 0,
            pacing_rate: 0,
            cwnd: MIN_CWND,
        }
    }

    pub fn mode(&self) -> BbrMode {
        self.mode
    }

    pub fn cwnd(&self) -> u64 {
        self.cwnd
    }

    /// current pacing rate in bytes per second, for observability
    pub fn pacing_rate_bytes_per_sec(&self) -> u64 {
        self.pacing_rate.saturating_mul(1_000_000_000) >> BW_SCALE
    }

    /// How long the writer has to wait after putting `bytes` on the wire.
    ///  Zero until a first bandwidth estimate exists.
    pub fn pacing_delay(&self, bytes: usize) -> Duration {
        if self.pacing_rate == 0 {
            return Duration::ZERO;
        }
        Duration::from_nanos((bytes as u64).saturating_mul(BW_UNIT) / self.pacing_rate)
    }

    /// Advances the mode machine and recomputes the outputs. Called on every
    ///  ack, after the sampler has been fed.
    pub fn on_ack(
        &mut self,
        max_bandwidth: Option<u64>,
        min_rtt: Option<Duration>,
        bytes_in_flight: u64,
        is_round_start: bool,
    ) {
        let Some(bandwidth) = max_bandwidth else {
            // nothing to steer by yet
            return;
        };

        match self.mode {
            BbrMode::Startup => {
                if is_round_start {
                    self.check_full_bandwidth(bandwidth);
                }
            }
            BbrMode::Drain => {
                if let Some(rtt) = min_rtt {
                    if bytes_in_flight <= self.target_cwnd(bandwidth, rtt) {
                        self.enter_probe_bw();
                    }
                }
            }
            BbrMode::ProbeBw => {
                if is_round_start {
                    self.advance_cycle();
                }
            }
        }

        self.pacing_rate = bandwidth.saturating_mul(self.pacing_gain) >> BBR_SCALE;
        if let Some(rtt) = min_rtt {
            self.cwnd = max(MIN_CWND, self.target_cwnd(bandwidth, rtt));
        }
    }

    /// The pipe counts as full once the bandwidth estimate stops growing by at
    ///  least a quarter per round, three rounds in a row.
    fn check_full_bandwidth(&mut self, bandwidth: u64) {
        if bandwidth.saturating_mul(BBR_UNIT) >= self.full_bw.saturating_mul(FULL_BW_THRESH) {
            self.full_bw = bandwidth;
            self.full_bw_count = 0;
            return;
        }

        self.full_bw_count += 1;
        if self.full_bw_count >= FULL_BW_CNT {
            debug!("bandwidth plateau detected - entering drain");
            self.mode = BbrMode::Drain;
            self.pacing_gain = DRAIN_GAIN;
            self.cwnd_gain = CWND_GAIN;
        }
    }

    fn enter_probe_bw(&mut self) {
        debug!("in-flight drained to target - entering probeBW");
        self.mode = BbrMode::ProbeBw;
        self.cycle_index = 0;
        self.pacing_gain = PACING_GAIN_CYCLE[0];
        self.cwnd_gain = CWND_GAIN;
    }

    fn advance_cycle(&mut self) {
        self.cycle_index = (self.cycle_index + 1) % PACING_GAIN_CYCLE.len();
        self.pacing_gain = PACING_GAIN_CYCLE[self.cycle_index];
    }

    fn target_cwnd(&self, bandwidth: u64, min_rtt: Duration) -> u64 {
        let bdp = bandwidth.saturating_mul(min_rtt.as_nanos() as u64);
        bdp.saturating_mul(self.cwnd_gain) >> (BW_SCALE + BBR_SCALE)
    }

    #[cfg(test)]
    pub(crate) fn set_internals(
        &mut self,
        mode: BbrMode,
        full_bw: u64,
        full_bw_count: u32,
        cycle_index: usize,
    ) {
        self.mode = mode;
        self.full_bw = full_bw;
        self.full_bw_count = full_bw_count;
        self.cycle_index = cycle_index;
        self.pacing_gain = match mode {
            BbrMode::Startup => HIGH_GAIN,
            BbrMode::Drain => DRAIN_GAIN,
            BbrMode::ProbeBw => PACING_GAIN_CYCLE[cycle_index],
        };
        self.cwnd_gain = match mode {
            BbrMode::Startup => HIGH_GAIN,
            _ => CWND_GAIN,
        };
    }
}
