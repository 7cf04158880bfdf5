//! Rendezvous hole punching: both peers fire their first packet at each other
//!  until one side's probe makes it through the NAT mappings the probes
//!  themselves create. The probe is a regular protocol packet (it carries the
//!  session's `sync` message), so whichever probe or data packet arrives
//!  first both finishes the punch and seeds the peer.

use std::net::SocketAddr;
use std::sync::Arc;
use bytes::Buf;
use tokio::net::UdpSocket;
use tokio::task::AbortHandle;
use tokio::time::{self, Instant};
use tracing::{debug, trace, warn};
use crate::ack_set::AckSet;
use crate::config::SocketConfig;
use crate::error::TransportError;

/// Repeatedly emits `first_packet` to `target` and watches for a reply that
///  parses as a protocol packet. On success invokes `on_done(Ok(ep))` where
///  `ep` is the endpoint the peer's reply actually arrived from (NATs may
///  translate it away from `target`); after the configured deadline invokes
///  `on_done(Err(TimedOut))`.
///
/// The returned handle aborts the punch; an aborted punch never invokes
///  `on_done`.
pub(crate) fn punch_hole(
    socket: Arc<UdpSocket>,
    target: SocketAddr,
    first_packet: Vec<u8>,
    config: &SocketConfig,
    on_done: impl FnOnce(Result<SocketAddr, TransportError>) + Send + 'static,
) -> AbortHandle {
    let resend_interval = config.punch_resend_interval;
    let deadline = Instant::now() + config.punch_timeout;
    let packet_size = config.packet_size;

    let task = tokio::spawn(async move {
        let mut rx_buf = vec![0u8; packet_size];
        loop {
            if Instant::now() >= deadline {
                debug!("hole punch toward {} timed out", target);
                on_done(Err(TransportError::TimedOut));
                return;
            }

            trace!("sending hole punch probe to {}", target);
            if let Err(e) = socket.send_to(&first_packet, target).await {
                warn!("hole punch send to {} failed: {}", target, e);
                on_done(Err(e.into()));
                return;
            }

            match time::timeout(resend_interval, socket.recv_from(&mut rx_buf)).await {
                Err(_elapsed) => {
                    // no reply yet, send the next probe
                }
                Ok(Err(e)) => {
                    warn!("hole punch receive failed: {}", e);
                    on_done(Err(e.into()));
                    return;
                }
                Ok(Ok((len, from))) => {
                    if is_protocol_packet(&rx_buf[..len]) {
                        debug!("hole punch toward {} answered from {}", target, from);
                        on_done(Ok(from));
                        return;
                    }
                    trace!("ignoring non-protocol datagram from {} during hole punch", from);
                }
            }
        }
    });

    task.abort_handle()
}

/// A reply counts as matching if it starts with a decodable ack set and
///  message count, i.e. it comes from a peer speaking this protocol.
fn is_protocol_packet(packet: &[u8]) -> bool {
    let mut buf: &[u8] = packet;
    if AckSet::deser(&mut buf).is_err() {
        return false;
    }
    buf.try_get_u16().is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::sync::oneshot;

    fn punch_config() -> SocketConfig {
        SocketConfig {
            punch_resend_interval: Duration::from_millis(20),
            punch_timeout: Duration::from_millis(500),
            ..SocketConfig::default()
        }
    }

    /// empty ack set + zero message count
    fn minimal_packet() -> Vec<u8> {
        vec![0; AckSet::SERIALIZED_LEN + 2]
    }

    async fn run_punch(
        peer_behavior: impl FnOnce(UdpSocket) -> tokio::task::JoinHandle<()>,
        config: SocketConfig,
    ) -> Result<SocketAddr, TransportError> {
        let socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let target = peer.local_addr().unwrap();
        peer_behavior(peer);

        let (tx, rx) = oneshot::channel();
        punch_hole(socket, target, minimal_packet(), &config, move |result| {
            let _ = tx.send(result);
        });
        time::timeout(Duration::from_secs(5), rx).await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn test_punch_succeeds_on_protocol_reply() {
        let result = run_punch(
            |peer| {
                tokio::spawn(async move {
                    let mut buf = [0u8; 2048];
                    let (_, from) = peer.recv_from(&mut buf).await.unwrap();
                    peer.send_to(&minimal_packet(), from).await.unwrap();
                })
            },
            punch_config(),
        )
        .await;

        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_punch_ignores_garbage_then_accepts_reply() {
        let result = run_punch(
            |peer| {
                tokio::spawn(async move {
                    let mut buf = [0u8; 2048];
                    let (_, from) = peer.recv_from(&mut buf).await.unwrap();
                    peer.send_to(&[0xff, 0xff, 0xff], from).await.unwrap();
                    peer.send_to(&minimal_packet(), from).await.unwrap();
                })
            },
            punch_config(),
        )
        .await;

        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_punch_times_out_against_silent_peer() {
        let result = run_punch(
            |peer| {
                tokio::spawn(async move {
                    // keep the socket bound but never answer
                    let _peer = peer;
                    time::sleep(Duration::from_secs(10)).await;
                })
            },
            punch_config(),
        )
        .await;
        assert_eq!(result, Err(TransportError::TimedOut));
    }

    #[tokio::test]
    async fn test_aborted_punch_never_reports() {
        let socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let target = socket.local_addr().unwrap();

        let (tx, mut rx) = oneshot::channel();
        let handle = punch_hole(socket, target, minimal_packet(), &punch_config(), move |result| {
            let _ = tx.send(result);
        });
        handle.abort();

        time::sleep(Duration::from_millis(700)).await;
        assert!(rx.try_recv().is_err());
    }
}
