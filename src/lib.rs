//! Rendezvous UDP: a per-peer datagram transport that pairs two processes
//!  across NATs and gives them two multiplexed message streams over a single
//!  pair of UDP sockets.
//!
//! ## Design goals
//!
//! * Peer-to-peer connection establishment without a relay: both sides call
//!   [socket::Socket::rendezvous_connect] at roughly the same time, and the
//!   probe packets each side emits open the NAT mappings the other side's
//!   packets travel through (UDP hole punching). The probe already carries
//!   the session's first protocol message, so no extra handshake round
//!   follows the punch.
//! * The abstraction is sending and receiving *messages* (defined-length
//!   chunks of data), not byte streams. A message is never delivered
//!   partially.
//! * Two delivery services over the same socket:
//!   * *reliable*: every message arrives, exactly once, in send order. The
//!     sender keeps re-sending until the receiver acknowledges.
//!   * *unreliable*: fire-and-forget with duplicate suppression; the
//!     receiver only ever sees messages newer than what it already
//!     delivered (latest wins, gaps allowed). Suited for state snapshots
//!     where a newer update obsoletes an older one.
//! * Messages larger than one packet are chunked and reassembled by the
//!   transport; a configured packet size is never exceeded and there is no
//!   IP-level fragmentation.
//! * Acknowledgements ride along on every outgoing packet as a compact
//!   sliding-window bitmap; there are no dedicated ack packets unless the
//!   connection is otherwise idle.
//! * Liveness is watched from both ends: an idle sender emits keepalives
//!   every 200ms, and a receiver that sees nothing for five keepalive
//!   periods closes with a timeout.
//! * A primitive congestion pacer spaces consecutive packets proportionally
//!   to the previous packet's size (no delay between processes on the same
//!   host).
//!
//! ## Packet layout
//!
//! One packet per UDP datagram, at most `packet_size` (default 1452) bytes,
//!  all integers big-endian:
//!
//! ```ascii
//! 0:  ack set (9 bytes)
//!     * present: u8 (0 = empty, 1 = populated)
//!     * highest acked reliable SN: u32
//!     * predecessor bitmap: u32 (bit i set <=> SN highest-1-i received)
//! 9:  message count: u16
//! 11: message parts, back to back
//! ```
//!
//! Message part layout (12-byte header plus chunk):
//!
//! ```ascii
//! 0:  type: u8 (0 sync, 1 reliable, 2 unreliable, 3 keep_alive, 4 close)
//! 1:  resend-until-acked flag: u8
//! 2:  sequence number: u32
//! 6:  total payload size: u16
//! 8:  chunk start offset: u16
//! 10: chunk length: u16
//! 12: chunk bytes
//! ```
//!
//! Sequence numbers are per-direction and per-stream: reliable SNs start at
//!  0, unreliable SNs at 1 (0 is reserved for the non-sequenced keepalive
//!  and close messages). The `sync` message opens a session: it is the first
//!  reliable message, and its SN seeds both of the receiver's delivery
//!  counters.
//!
//! ## Delivery rules
//!
//! * A reliable part is acknowledged only once the message is delivered to
//!   the application; the ack set is therefore a contiguous run in practice
//!   and doubles as the duplicate filter.
//! * Out-of-order reliable messages are buffered and replayed in SN order as
//!   gaps fill; the buffer is bounded, and anything dropped stays
//!   unacknowledged so the peer re-sends it.
//! * Unreliable messages keep a single reassembly slot. A fragment of a
//!   newer message evicts an older partial one; fragments older than the
//!   slot are dropped.
//!
//! Receive hooks are one-shot: they are moved out before being invoked, and
//!  a hook may re-register itself (or drop the whole endpoint) from inside
//!  the callback.
//!
//! ## Related
//!
//! * QUIC: connection based with a dedicated handshake, enforces TLS,
//!   stream oriented - heavier machinery than a per-peer message pipe needs
//! * UDT: stream/file transfer oriented, client-server rendezvous mode
//! * This crate deliberately stays at "two peers, two message streams" and
//!   leaves multi-peer routing to a layer above it

pub mod ack_set;
pub mod config;
pub mod error;
pub mod fixed_buffer;
pub mod in_message;
pub mod out_message;
mod punch_hole;
pub mod safe_converter;
pub mod socket;
pub mod transmit_queue;

pub use config::SocketConfig;
pub use error::TransportError;
pub use socket::Socket;

/// Per-direction, per-stream monotone counter identifying a message.
pub type SequenceNumber = u32;
