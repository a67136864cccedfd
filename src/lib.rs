//! A peer-to-peer message transport that delivers an ordered, gap-free stream
//!  of byte messages over plain UDP, with per-connection retransmission, loss
//!  detection, RTT estimation and BBR-style pacing.
//!
//! ## Design goals
//!
//! * The abstraction is sending / receiving *messages* (defined-length chunks
//!   of data, not byte streams)
//! * One listening UDP socket per endpoint handles all connections; peers are
//!   told apart by their source address, and a connection springs into
//!   existence with the first datagram from an unknown peer
//! * Every message is delivered exactly once and in order, as long as the
//!   connection lives; duplicates on the wire are absorbed by the receiver
//! * No handshake: `dial` only registers local state, the first datagram
//!   carries real payload
//! * Datagrams are never fragmented; a message must fit a single frame
//! * Congestion control follows the BBR idea: pace at the rate the bottleneck
//!   is estimated to absorb, and use loss only to trigger retransmission,
//!   never to shrink the window
//!
//! ## Wire format
//!
//! All numbers in network byte order:
//!
//! ```ascii
//! 0:  crc32 (u32) - IEEE polynomial, over everything that follows
//! 4:  type (u8) - 1 NORMAL, 2 ACK, 3 PING, 4 PONG, 5 FIN
//! 5:  seq (u32) - 1-based for NORMAL, the acked seq for ACK, 0 otherwise
//! 9:  len (u32) - body length
//! 13: body
//! ```
//!
//! The whole datagram is capped at 1024 bytes. Corrupt, truncated or
//!  otherwise unparseable datagrams are counted and dropped; the connection
//!  keeps going.
//!
//! ## Reliability machinery
//!
//! The sender keeps up to eight messages in flight in a sliding window
//!  indexed by `seq % 8`; a send into an occupied slot waits for the ack of
//!  the occupant. The receiver acks every NORMAL it sees. An ack for seq `k`
//!  while an older seq within the same window is still unacknowledged marks
//!  that older message as lost and retransmits it immediately; everything
//!  else is backstopped by a per-message retransmission timer at
//!  `max(200ms, 2 * srtt)`.
//!
//! Acked messages feed a delivery-rate sampler (max filter over ten
//!  packet-timed round trips) and a min-RTT filter (ten second window). From
//!  those, the controller runs the startup / drain / probe-bandwidth cycle
//!  and produces the pacing rate and the congestion window applied by the
//!  writer.

mod bbr;
mod codec;
mod config;
mod connection;
mod endpoint;
mod message;
mod pending;
mod sampler;
mod send_pipeline;

pub use bbr::BbrMode;
pub use codec::WireError;
pub use config::{EndpointConfig, MAX_MESSAGE_SIZE, MAX_UDP_PACKAGE_SIZE};
pub use connection::{CloseReason, ConnectionStats, UdpConnection};
pub use endpoint::UdpEndpoint;
pub use pending::PendingStats;

#[cfg(test)]
mod tests {
    use tracing::Level;

    #[ctor::ctor]
    fn init_test_logging() {
        tracing_subscriber::fmt()
            .with_test_writer()
            .with_max_level(Level::DEBUG)
            .try_init()
            .ok();
    }
}
