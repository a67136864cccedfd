use anyhow::bail;
use std::net::SocketAddr;
use std::time::Duration;

/// Size of the checksum envelope preceding the message header.
pub const PKG_HEADER_SIZE: usize = 4;

/// Size of the message header: type (1) + seq (4) + len (4).
pub const MSG_HEADER_SIZE: usize = 9;

/// Upper bound for a whole datagram on the wire. The protocol never fragments,
///  so this must be small enough to pass every hop between peers unfragmented.
pub const MAX_UDP_PACKAGE_SIZE: usize = 1024;

/// Largest message body that still fits a single framed datagram.
pub const MAX_MESSAGE_SIZE: usize = MAX_UDP_PACKAGE_SIZE - PKG_HEADER_SIZE - MSG_HEADER_SIZE;

pub const MTU: usize = 1500;

/// A keepalive ping goes out if a connection had no outbound traffic for this long.
pub const UDP_PING_TICK_PERIOD: Duration = Duration::from_secs(10);

/// Connections with no activity for this long are garbage collected.
pub const UDP_GC_PERIOD: Duration = Duration::from_secs(90);

pub const MIN_RTO: Duration = Duration::from_millis(200);

/// Number of slots in the sliding window of sent-but-unacknowledged messages.
pub const PENDING_WINDOW_SIZE: u32 = 8;

/// Time window for the min-RTT filter.
pub const MIN_RTT_WINDOW: Duration = Duration::from_secs(10);

/// Bandwidth is fixed-point encoded as bytes per nanosecond shifted by this scale.
pub const BW_SCALE: u32 = 24;
pub const BW_UNIT: u64 = 1 << BW_SCALE;

/// Gains are fixed-point encoded at this scale.
pub const BBR_SCALE: u32 = 8;
pub const BBR_UNIT: u64 = 1 << BBR_SCALE;

/// 2/ln(2), the minimum gain that doubles the sending rate each round.
pub const HIGH_GAIN: u64 = BBR_UNIT * 2885 / 1000 + 1;
pub const DRAIN_GAIN: u64 = BBR_UNIT * 1000 / 2885;
pub const CWND_GAIN: u64 = BBR_UNIT * 2;

/// Bandwidth growth below this factor counts towards the pipe being full.
pub const FULL_BW_THRESH: u64 = BBR_UNIT * 5 / 4;
pub const FULL_BW_CNT: u32 = 3;

pub const PACING_GAIN_CYCLE: [u64; 8] = [
    BBR_UNIT * 5 / 4, // probe for more available bandwidth
    BBR_UNIT * 3 / 4, // drain the queue built up while probing
    BBR_UNIT,
    BBR_UNIT,
    BBR_UNIT,
    BBR_UNIT,
    BBR_UNIT,
    BBR_UNIT,
];

/// Window of the max-bandwidth filter, in packet-timed round trips.
pub const BANDWIDTH_WINDOW_ROUNDS: u64 = PACING_GAIN_CYCLE.len() as u64 + 2;

/// Lower bound for the congestion window, in bytes.
pub const MIN_CWND: u64 = 4 * MTU as u64;

/// Deployment-specific settings of an endpoint. Protocol behavior (frame
///  sizes, windows, gains, periods) is fixed at compile time; these knobs only
///  size the buffering towards the application.
pub struct EndpointConfig {
    pub listen_addr: SocketAddr,

    /// Capacity of the per-connection channel of in-order messages towards the
    ///  application. When the application is slow, the receive loop blocks on
    ///  this channel rather than dropping in-order messages, which in turn
    ///  slows down acks and thereby the sender.
    pub inbound_channel_capacity: usize,

    /// Maximum number of out-of-order messages buffered per connection.
    ///  Datagrams beyond the bound are dropped unacknowledged and will be
    ///  retransmitted by the peer.
    pub reorder_buffer_bound: usize,

    /// Connections initiated by remote peers queue up to this many before
    ///  further ones are rejected until the application calls accept.
    pub accept_backlog: usize,
}

impl EndpointConfig {
    pub fn new(listen_addr: SocketAddr) -> EndpointConfig {
        EndpointConfig {
            listen_addr,
            inbound_channel_capacity: 64,
            reorder_buffer_bound: 256,
            accept_backlog: 32,
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.inbound_channel_capacity == 0 {
            bail!("inbound channel capacity must be non-zero");
        }
        if self.reorder_buffer_bound == 0 {
            bail!("reorder buffer bound must be non-zero");
        }
        if self.accept_backlog == 0 {
            bail!("accept backlog must be non-zero");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_derived_sizes() {
        assert_eq!(MAX_MESSAGE_SIZE, 1011);
        assert_eq!(BANDWIDTH_WINDOW_ROUNDS, 10);
        assert_eq!(MIN_CWND, 6000);
    }

    #[test]
    fn test_validate() {
        let addr = "127.0.0.1:0".parse().unwrap();

        assert!(EndpointConfig::new(addr).validate().is_ok());

        let mut config = EndpointConfig::new(addr);
        config.inbound_channel_capacity = 0;
        assert!(config.validate().is_err());

        let mut config = EndpointConfig::new(addr);
        config.reorder_buffer_bound = 0;
        assert!(config.validate().is_err());

        let mut config = EndpointConfig::new(addr);
        config.accept_backlog = 0;
        assert!(config.validate().is_err());
    }
}
