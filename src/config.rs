use std::net::SocketAddr;
use std::time::Duration;
use anyhow::bail;

/// Configuration for a [crate::socket::Socket]. The defaults reproduce the
///  protocol's nominal timings; tests shrink them to keep wall-clock time low.
#[derive(Debug, Clone)]
pub struct SocketConfig {
    /// Local address the UDP socket is bound to. Port 0 lets the OS pick.
    pub bind_addr: SocketAddr,

    /// Upper bound for emitted datagrams, including all headers this protocol
    ///  adds inside the UDP payload.
    ///
    /// The default of 1452 is the UDP payload that fits a full Ethernet frame
    ///  with an IPV6 header (`1500 - 40 - 8`), which also fits IPV4 routes.
    ///  There is no MTU discovery: choosing this too big gets packets dropped
    ///  on the floor, choosing it too small wastes bandwidth.
    pub packet_size: usize,

    /// Interval after which an idle send loop emits a keepalive message. The
    ///  receive timeout is derived from this, see [SocketConfig::recv_timeout].
    pub keepalive_period: Duration,

    /// Congestion pacer rate: delay between consecutive packet sends, in
    ///  microseconds per byte of the previous packet. The default of 200
    ///  models a 40 kbit/s floor. Ignored (no delay) for loopback peers.
    pub pacer_micros_per_byte: u64,

    /// Cadence at which the hole punch re-sends its probe packet.
    pub punch_resend_interval: Duration,

    /// Overall deadline for the hole punch before the connect attempt fails.
    pub punch_timeout: Duration,

    /// Upper bound for the number of partially received or out-of-order
    ///  reliable messages buffered per endpoint. Parts for new sequence
    ///  numbers arriving beyond this bound are dropped unacknowledged, which
    ///  degrades to retransmission instead of unbounded memory growth.
    pub max_pending_reliable: usize,
}

impl Default for SocketConfig {
    fn default() -> SocketConfig {
        SocketConfig {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 0)),
            packet_size: 1452,
            keepalive_period: Duration::from_millis(200),
            pacer_micros_per_byte: 200,
            punch_resend_interval: Duration::from_millis(200),
            punch_timeout: Duration::from_secs(10),
            max_pending_reliable: 1024,
        }
    }
}

impl SocketConfig {
    /// If no datagram arrives within this duration, the endpoint closes and
    ///  registered receive callbacks fire with
    ///  [crate::error::TransportError::TimedOut].
    pub fn recv_timeout(&self) -> Duration {
        self.keepalive_period * 5
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.packet_size < 100 {
            bail!("packet size {} is too small to fit headers and a useful payload", self.packet_size);
        }
        if self.packet_size > 65507 {
            bail!("packet size {} exceeds what UDP can carry", self.packet_size);
        }
        if self.keepalive_period.is_zero() {
            bail!("keepalive period must be nonzero");
        }
        if self.punch_resend_interval.is_zero() {
            bail!("hole punch resend interval must be nonzero");
        }
        if self.punch_timeout < self.punch_resend_interval {
            bail!("hole punch timeout is shorter than a single resend interval");
        }
        if self.max_pending_reliable == 0 {
            bail!("pending reliable bound must be nonzero");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn test_default_is_valid() {
        let config = SocketConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.recv_timeout(), Duration::from_millis(1000));
    }

    #[rstest]
    #[case::packet_too_small(SocketConfig { packet_size: 99, ..SocketConfig::default() })]
    #[case::packet_too_big(SocketConfig { packet_size: 65508, ..SocketConfig::default() })]
    #[case::zero_keepalive(SocketConfig { keepalive_period: Duration::ZERO, ..SocketConfig::default() })]
    #[case::zero_punch_resend(SocketConfig { punch_resend_interval: Duration::ZERO, ..SocketConfig::default() })]
    #[case::punch_timeout_below_resend(SocketConfig { punch_timeout: Duration::from_millis(100), ..SocketConfig::default() })]
    #[case::zero_pending_bound(SocketConfig { max_pending_reliable: 0, ..SocketConfig::default() })]
    fn test_validate_rejects(#[case] config: SocketConfig) {
        assert!(config.validate().is_err());
    }
}
