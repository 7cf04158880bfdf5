//! The per-peer connection endpoint. It owns the UDP socket, drives the
//!  receive loop and the paced send loop, reassembles fragmented messages,
//!  piggy-backs cumulative acks on every outgoing packet and watches peer
//!  liveness.
//!
//! All completions are delivered through user callbacks on the tokio
//!  executor. A callback may drop the [Socket] handle; every continuation
//!  re-checks the liveness flag before it touches endpoint state again.

use std::cmp::min;
use std::collections::BTreeMap;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use bytes::{Buf, BufMut};
use tokio::net::UdpSocket;
use tokio::task::AbortHandle;
use tokio::time;
use tracing::{debug, error, info, trace};

use crate::ack_set::AckSet;
use crate::config::SocketConfig;
use crate::error::TransportError;
use crate::fixed_buffer::FixedBuf;
use crate::in_message::{InMessageFull, InMessagePart, PendingMessage};
use crate::out_message::{MessageType, OutMessage};
use crate::punch_hole::punch_hole;
use crate::transmit_queue::TransmitQueue;
use crate::SequenceNumber;

/// One-shot receive hook. It is moved out of its slot before it is invoked,
///  so re-registering from inside the hook re-arms the endpoint.
pub type OnReceive = Box<dyn FnOnce(Result<Vec<u8>, TransportError>) + Send + 'static>;
/// One-shot hook invoked when the transmit queue drains with nothing left to ack.
pub type OnFlush = Box<dyn FnOnce() + Send + 'static>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SendState {
    /// not transmitting; a send pass may start
    Pending,
    /// UDP send in flight
    Sending,
    /// congestion pacer armed, waiting for its expiry
    Waiting,
}

/// Delivery counters, seeded from the SN of the peer's first `sync` message.
#[derive(Debug, Clone, Copy)]
struct SyncState {
    last_delivered_reliable_sn: SequenceNumber,
    last_delivered_unreliable_sn: SequenceNumber,
}

struct Inner {
    send_state: SendState,
    /// None once the endpoint is closed
    socket: Option<Arc<UdpSocket>>,
    remote_endpoint: Option<SocketAddr>,
    transmit_queue: TransmitQueue,
    /// None until the peer's first `sync` arrived
    sync: Option<SyncState>,
    pending_reliable: BTreeMap<SequenceNumber, PendingMessage>,
    /// single reassembly slot, latest SN wins
    pending_unreliable: Option<PendingMessage>,
    schedule_sending_acks: bool,
    /// what the peer told us it received, per its latest packet
    peer_acked: AckSet,
    /// what we received and delivered, sent with every packet
    local_acks: AckSet,
    next_reliable_sn: SequenceNumber,
    next_unreliable_sn: SequenceNumber,
    on_receive_reliable: Option<OnReceive>,
    on_receive_unreliable: Option<OnReceive>,
    on_flush: Option<OnFlush>,
    punch_task: Option<AbortHandle>,
    recv_task: Option<AbortHandle>,
    keepalive_task: Option<AbortHandle>,
    pacer_task: Option<AbortHandle>,
}

struct Shared {
    config: SocketConfig,
    local_addr: SocketAddr,
    /// Liveness token. Set when the owning [Socket] handle is dropped; every
    ///  scheduled continuation checks it before touching `inner`, and again
    ///  after invoking any user callback.
    destroyed: AtomicBool,
    inner: Mutex<Inner>,
}

/// A connection endpoint bound to one remote peer.
///
/// Freshly created endpoints are unbound; [Socket::rendezvous_connect]
///  establishes the peering. Dropping the handle stops all background
///  activity without notifying the peer; [Socket::close] announces an
///  orderly close first.
pub struct Socket {
    shared: Arc<Shared>,
}

impl Socket {
    /// Binds a fresh UDP socket at `config.bind_addr`.
    pub async fn bind(config: SocketConfig) -> anyhow::Result<Socket> {
        config.validate()?;
        let socket = UdpSocket::bind(config.bind_addr).await?;
        Self::with_socket(socket, config)
    }

    /// Adopts an already bound socket.
    pub fn with_socket(socket: UdpSocket, config: SocketConfig) -> anyhow::Result<Socket> {
        config.validate()?;
        let local_addr = socket.local_addr()?;
        info!("endpoint bound to {}", local_addr);

        Ok(Socket {
            shared: Arc::new(Shared {
                config,
                local_addr,
                destroyed: AtomicBool::new(false),
                inner: Mutex::new(Inner {
                    send_state: SendState::Pending,
                    socket: Some(Arc::new(socket)),
                    remote_endpoint: None,
                    transmit_queue: TransmitQueue::default(),
                    sync: None,
                    pending_reliable: BTreeMap::new(),
                    pending_unreliable: None,
                    schedule_sending_acks: false,
                    peer_acked: AckSet::default(),
                    local_acks: AckSet::default(),
                    next_reliable_sn: 0,
                    // 0 is reserved for non-sequenced messages
                    next_unreliable_sn: 1,
                    on_receive_reliable: None,
                    on_receive_unreliable: None,
                    on_flush: None,
                    punch_task: None,
                    recv_task: None,
                    keepalive_task: None,
                    pacer_task: None,
                }),
            }),
        })
    }

    pub fn local_endpoint(&self) -> SocketAddr {
        self.shared.local_addr
    }

    /// The peer's endpoint, once the rendezvous completed.
    pub fn remote_endpoint(&self) -> Option<SocketAddr> {
        self.shared.lock().remote_endpoint
    }

    pub fn recv_timeout(&self) -> Duration {
        self.shared.config.recv_timeout()
    }

    /// Initiates hole punching toward `remote`. The prepared first packet
    ///  carries this session's `sync` message; once the punch succeeds, the
    ///  same message enters the transmit queue (it participates in
    ///  retransmission until acked), the receive and send loops start, and
    ///  `on_connect` fires. Unspecified hosts are rewritten to the matching
    ///  family's loopback first.
    pub fn rendezvous_connect(
        &self,
        remote: SocketAddr,
        on_connect: impl FnOnce(Result<(), TransportError>) + Send + 'static,
    ) {
        let shared = self.shared.clone();
        let remote = sanitize_address(remote);

        let (socket, first_packet, sync_message) = {
            let mut inner = shared.lock();
            let Some(socket) = inner.socket.clone() else {
                drop(inner);
                on_connect(Err(TransportError::Closed));
                return;
            };
            let sn = inner.next_reliable_sn;
            inner.next_reliable_sn = inner.next_reliable_sn.wrapping_add(1);
            let mut sync_message = OutMessage::new(true, MessageType::Sync, sn, Vec::new());
            let first_packet =
                construct_packet_with_one_message(&inner.local_acks, &mut sync_message, shared.config.packet_size);
            (socket, first_packet.into_vec(), sync_message)
        };

        debug!("punching hole from {} toward {}", shared.local_addr, remote);

        let punch_shared = shared.clone();
        let handle = punch_hole(socket, remote, first_packet, &shared.config, move |result| {
            if punch_shared.was_destroyed() {
                return;
            }
            let actual_remote = match result {
                Ok(ep) => ep,
                Err(e) => {
                    debug!("hole punch failed: {}", e);
                    on_connect(Err(e));
                    return;
                }
            };
            {
                let mut inner = punch_shared.lock();
                inner.punch_task = None;
                let Some(socket) = inner.socket.clone() else {
                    drop(inner);
                    on_connect(Err(TransportError::Closed));
                    return;
                };
                inner.remote_endpoint = Some(actual_remote);
                inner.transmit_queue.insert(sync_message);
                let recv = tokio::spawn(receive_loop(punch_shared.clone(), socket, actual_remote));
                inner.recv_task = Some(recv.abort_handle());
            }
            info!("connected to {}", actual_remote);
            punch_shared.start_sending();
            if punch_shared.was_destroyed() {
                return;
            }
            on_connect(Ok(()))
        });
        shared.lock().punch_task = Some(handle);
    }

    /// Registers the one-shot hook for the next complete reliable message.
    ///  While no hook is registered, ready messages wait (sequencing does not
    ///  advance, the peer keeps re-sending).
    pub fn receive_reliable(&self, callback: impl FnOnce(Result<Vec<u8>, TransportError>) + Send + 'static) {
        self.shared.lock().on_receive_reliable = Some(Box::new(callback));
    }

    /// Registers the one-shot hook for the next complete unreliable message.
    ///  While no hook is registered, incoming unreliable messages are dropped.
    pub fn receive_unreliable(&self, callback: impl FnOnce(Result<Vec<u8>, TransportError>) + Send + 'static) {
        self.shared.lock().on_receive_unreliable = Some(Box::new(callback));
    }

    /// Enqueues a message for reliable, ordered, exactly-once delivery.
    pub fn send_reliable(&self, data: Vec<u8>) -> Result<(), TransportError> {
        if data.len() > u16::MAX as usize {
            return Err(TransportError::MessageTooLarge);
        }
        {
            let mut inner = self.shared.lock();
            let sn = inner.next_reliable_sn;
            inner.next_reliable_sn = inner.next_reliable_sn.wrapping_add(1);
            inner.transmit_queue.insert(OutMessage::new(true, MessageType::Reliable, sn, data));
        }
        self.shared.start_sending();
        Ok(())
    }

    /// Enqueues a message for unreliable delivery: sent at most once, the
    ///  receiver drops anything older than what it already delivered.
    pub fn send_unreliable(&self, data: Vec<u8>) -> Result<(), TransportError> {
        if data.len() > u16::MAX as usize {
            return Err(TransportError::MessageTooLarge);
        }
        {
            let mut inner = self.shared.lock();
            let sn = inner.next_unreliable_sn;
            inner.next_unreliable_sn = inner.next_unreliable_sn.wrapping_add(1);
            inner.transmit_queue.insert(OutMessage::new(false, MessageType::Unreliable, sn, data));
        }
        self.shared.start_sending();
        Ok(())
    }

    /// Registers a hook that fires exactly once when the transmit queue next
    ///  empties and no acks are waiting to go out. If the endpoint is already
    ///  quiescent, the hook is posted for execution right away.
    pub fn flush(&self, callback: impl FnOnce() + Send + 'static) {
        let mut inner = self.shared.lock();
        let quiescent =
            inner.socket.is_some() && inner.transmit_queue.is_empty() && !inner.schedule_sending_acks;
        if quiescent {
            drop(inner);
            let shared = self.shared.clone();
            tokio::spawn(async move {
                if shared.was_destroyed() {
                    return;
                }
                callback();
            });
        }
        else {
            inner.on_flush = Some(Box::new(callback));
        }
    }

    /// Idempotent orderly close: announces the close to the peer with one
    ///  best-effort packet, releases the UDP socket and stops all timers. No
    ///  user callbacks fire after this returns.
    pub fn close(&self) {
        self.shared.close();
    }
}

impl Drop for Socket {
    fn drop(&mut self) {
        self.shared.destroyed.store(true, Ordering::Release);
        if let Ok(mut inner) = self.shared.inner.lock() {
            if let Some(task) = inner.punch_task.take() {
                task.abort();
            }
            if let Some(task) = inner.recv_task.take() {
                task.abort();
            }
            if let Some(task) = inner.keepalive_task.take() {
                task.abort();
            }
            if let Some(task) = inner.pacer_task.take() {
                task.abort();
            }
            inner.socket = None;
            inner.on_receive_reliable = None;
            inner.on_receive_unreliable = None;
            inner.on_flush = None;
        }
    }
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().expect("endpoint state lock is never poisoned")
    }

    fn was_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::Acquire)
    }

    fn close(&self) {
        let mut inner = self.lock();
        if let Some(task) = inner.pacer_task.take() {
            task.abort();
        }
        if let Some(task) = inner.punch_task.take() {
            task.abort();
        }
        if let Some(socket) = inner.socket.take() {
            debug!("closing endpoint {}", self.local_addr);
            if let Some(remote) = inner.remote_endpoint {
                let mut close_message = OutMessage::new(false, MessageType::Close, 0, Vec::new());
                let packet =
                    construct_packet_with_one_message(&inner.local_acks, &mut close_message, self.config.packet_size);
                // best effort; the peer's receive timeout covers a lost close
                let _ = socket.try_send_to(packet.as_ref(), remote);
            }
        }
        if let Some(task) = inner.recv_task.take() {
            task.abort();
        }
        if let Some(task) = inner.keepalive_task.take() {
            task.abort();
        }
    }

    /// Common fatal path: close, then hand the error to both receive hooks.
    ///  The hooks are moved out before either is invoked, so a hook
    ///  destroying the endpoint cannot make this touch freed state.
    fn handle_error(self: &Arc<Shared>, error: TransportError) {
        debug!("endpoint {} failed: {}", self.local_addr, error);
        self.close();
        let (unreliable_hook, reliable_hook) = {
            let mut inner = self.lock();
            (inner.on_receive_unreliable.take(), inner.on_receive_reliable.take())
        };
        if let Some(callback) = unreliable_hook {
            callback(Err(error.clone()));
        }
        if let Some(callback) = reliable_hook {
            callback(Err(error));
        }
    }

    /// Decodes and dispatches one datagram. Returns whether the receive loop
    ///  should continue.
    fn on_packet(self: &Arc<Shared>, packet: &[u8]) -> bool {
        let mut buf: &[u8] = packet;

        let acks = match AckSet::deser(&mut buf) {
            Ok(acks) => acks,
            Err(e) => {
                debug!("undecodable ack set: {}", e);
                self.handle_error(TransportError::Parse);
                return false;
            }
        };
        self.handle_acks(acks);

        let message_count = match buf.try_get_u16() {
            Ok(count) => count,
            Err(_) => {
                debug!("packet truncated before message count");
                self.handle_error(TransportError::Parse);
                return false;
            }
        };

        for _ in 0..message_count {
            let part = match InMessagePart::deser(&mut buf) {
                Ok(part) => part,
                Err(e) => {
                    debug!("undecodable message part: {}", e);
                    self.handle_error(TransportError::Parse);
                    return false;
                }
            };
            self.handle_message(part);
            if self.was_destroyed() {
                return false;
            }
            if self.lock().socket.is_none() {
                return false;
            }
        }
        true
    }

    fn handle_acks(&self, acks: AckSet) {
        // TODO union the windows instead of replacing: a packet overtaken on
        //  the wire regresses what we know the peer has received
        self.lock().peer_acked = acks;
    }

    fn handle_message(self: &Arc<Shared>, message: InMessagePart) {
        trace!("handling {:?} part sn {}", message.message_type, message.sequence_number);
        match message.message_type {
            MessageType::Sync => self.handle_sync_message(&message),
            MessageType::KeepAlive => {}
            MessageType::Unreliable => self.handle_unreliable_message(message),
            MessageType::Reliable => self.handle_reliable_message(message),
            MessageType::Close => self.handle_close_message(),
        }

        // acks or delivery-triggered work may now be ready to egress
        if !self.was_destroyed() {
            self.start_sending();
        }
    }

    fn handle_sync_message(&self, message: &InMessagePart) {
        let mut inner = self.lock();
        inner.schedule_sending_acks = true;
        if inner.sync.is_none() {
            debug!("sync received, seeding delivery counters at sn {}", message.sequence_number);
            inner.local_acks.try_add(message.sequence_number);
            inner.sync = Some(SyncState {
                last_delivered_reliable_sn: message.sequence_number,
                last_delivered_unreliable_sn: message.sequence_number,
            });
        }
    }

    fn handle_close_message(self: &Arc<Shared>) {
        debug!("peer announced close");
        // release the handle first so no close reply goes out
        self.lock().socket = None;
        self.handle_error(TransportError::ConnectionReset);
    }

    fn handle_reliable_message(self: &Arc<Shared>, message: InMessagePart) {
        let next_expected = {
            let mut inner = self.lock();
            inner.schedule_sending_acks = true;
            let Some(sync) = inner.sync else {
                trace!("reliable part sn {} before sync, dropping", message.sequence_number);
                return;
            };
            if !inner.local_acks.can_add(message.sequence_number) {
                trace!("reliable part sn {} already delivered or out of window, dropping", message.sequence_number);
                return;
            }
            sync.last_delivered_reliable_sn.wrapping_add(1)
        };

        if message.sequence_number == next_expected {
            if let Some(full) = message.get_complete_message() {
                if !self.user_handle_reliable_msg(full) {
                    return;
                }
                self.replay_pending_messages();
                return;
            }
        }

        let mut inner = self.lock();
        if inner.pending_reliable.contains_key(&message.sequence_number) {
            let pending = inner
                .pending_reliable
                .get_mut(&message.sequence_number)
                .expect("checked just above");
            pending.update_payload(message.chunk_start, &message.payload);
            drop(inner);
            self.replay_pending_messages();
        }
        else if inner.pending_reliable.len() < self.config.max_pending_reliable {
            inner
                .pending_reliable
                .insert(message.sequence_number, PendingMessage::from_part(&message));
        }
        else {
            debug!(
                "pending reliable buffer full, dropping part sn {} unacknowledged",
                message.sequence_number
            );
        }
    }

    /// Delivers buffered reliable messages while the head of the pending map
    ///  is the next expected SN and complete. Stops at the first gap, at an
    ///  incomplete head, and when delivery fails.
    fn replay_pending_messages(self: &Arc<Shared>) {
        loop {
            let (next_sn, full) = {
                let inner = self.lock();
                let Some(sync) = inner.sync else {
                    return;
                };
                let next_sn = sync.last_delivered_reliable_sn.wrapping_add(1);
                let Some(pending) = inner.pending_reliable.get(&next_sn) else {
                    return;
                };
                let Some(full) = pending.get_complete_message() else {
                    return;
                };
                (next_sn, full)
            };
            if !self.user_handle_reliable_msg(full) {
                return;
            }
            self.lock().pending_reliable.remove(&next_sn);
        }
    }

    /// Moves the reliable hook out and invokes it; on success records the SN
    ///  as delivered. Returns false if there was no hook, the endpoint is
    ///  closed, or the hook destroyed the endpoint.
    fn user_handle_reliable_msg(self: &Arc<Shared>, message: InMessageFull) -> bool {
        let callback = {
            let mut inner = self.lock();
            if inner.socket.is_none() {
                return false;
            }
            match inner.on_receive_reliable.take() {
                Some(callback) => callback,
                None => {
                    trace!("reliable message sn {} ready but no receive hook registered", message.sequence_number);
                    return false;
                }
            }
        };

        let sn = message.sequence_number;
        callback(Ok(message.payload));
        if self.was_destroyed() {
            return false;
        }

        let mut inner = self.lock();
        inner.local_acks.try_add(sn);
        if let Some(sync) = inner.sync.as_mut() {
            sync.last_delivered_reliable_sn = sn;
        }
        true
    }

    fn handle_unreliable_message(self: &Arc<Shared>, message: InMessagePart) {
        {
            let inner = self.lock();
            if inner.on_receive_unreliable.is_none() {
                trace!("no unreliable receive hook registered, dropping sn {}", message.sequence_number);
                return;
            }
            let Some(sync) = inner.sync else {
                trace!("unreliable part sn {} before sync, dropping", message.sequence_number);
                return;
            };
            if message.sequence_number <= sync.last_delivered_unreliable_sn {
                trace!("unreliable part sn {} is stale, dropping", message.sequence_number);
                return;
            }
        }

        if message.is_complete() {
            let Some(callback) = self.lock().on_receive_unreliable.take() else {
                return;
            };
            callback(Ok(message.payload));
            if self.was_destroyed() {
                return;
            }
            let mut inner = self.lock();
            if let Some(sync) = inner.sync.as_mut() {
                sync.last_delivered_unreliable_sn = message.sequence_number;
            }
            inner.pending_unreliable = None;
            return;
        }

        // fragmented: one reassembly slot, the newest SN wins
        let mut inner = self.lock();
        let slot_sn = inner.pending_unreliable.as_ref().map(|p| p.sequence_number);
        match slot_sn {
            None => {
                inner.pending_unreliable = Some(PendingMessage::from_part(&message));
            }
            Some(slot_sn) if slot_sn < message.sequence_number => {
                trace!("unreliable slot sn {} superseded by sn {}", slot_sn, message.sequence_number);
                inner.pending_unreliable = Some(PendingMessage::from_part(&message));
            }
            Some(slot_sn) if slot_sn > message.sequence_number => {
                trace!("unreliable part sn {} older than slot sn {}, dropping", message.sequence_number, slot_sn);
            }
            Some(_) => {
                let pending = inner.pending_unreliable.as_mut().expect("slot checked above");
                pending.update_payload(message.chunk_start, &message.payload);
                let Some(full) = pending.get_complete_message() else {
                    return;
                };
                let Some(callback) = inner.on_receive_unreliable.take() else {
                    return;
                };
                drop(inner);
                callback(Ok(full.payload));
                if self.was_destroyed() {
                    return;
                }
                let mut inner = self.lock();
                if let Some(sync) = inner.sync.as_mut() {
                    sync.last_delivered_unreliable_sn = message.sequence_number;
                }
                inner.pending_unreliable = None;
            }
        }
    }

    /// One pass of the send loop. Packs a packet (acks plus as many queued
    ///  messages as fit) and puts it on the wire; when there is nothing to
    ///  send, fires a registered flush hook and arms the keepalive instead.
    fn start_sending(self: &Arc<Shared>) {
        let mut inner = self.lock();
        let Some(socket) = inner.socket.clone() else {
            return;
        };
        let Some(remote) = inner.remote_endpoint else {
            return;
        };
        if inner.send_state != SendState::Pending {
            return;
        }

        let mut tx_buf = FixedBuf::new(self.config.packet_size);
        inner.local_acks.ser(&mut tx_buf);
        let count = inner.encode_payload(&mut tx_buf);

        if count == 0 && !inner.schedule_sending_acks {
            if let Some(on_flush) = inner.on_flush.take() {
                drop(inner);
                trace!("transmit queue drained, flushing");
                on_flush();
                if self.was_destroyed() {
                    return;
                }
                inner = self.lock();
                if inner.socket.is_none() {
                    return;
                }
            }
            self.arm_keepalive(&mut inner);
            return;
        }

        inner.schedule_sending_acks = false;
        inner.send_state = SendState::Sending;
        drop(inner);

        trace!("sending packet with {} parts ({} bytes) to {}", count, tx_buf.len(), remote);

        let this = self.clone();
        tokio::spawn(async move {
            let sent = socket.send_to(tx_buf.as_ref(), remote).await;
            if this.was_destroyed() {
                return;
            }
            this.on_send(sent, tx_buf.len());
        });
    }

    fn on_send(self: &Arc<Shared>, sent: io::Result<usize>, packet_len: usize) {
        let mut inner = self.lock();
        inner.send_state = SendState::Pending;
        if inner.socket.is_none() {
            // closed while the send was in flight
            return;
        }
        if let Err(e) = sent {
            drop(inner);
            error!("send failed: {}", e);
            self.handle_error(TransportError::Io(e.kind()));
            return;
        }

        inner.send_state = SendState::Waiting;
        let delay = self.pacer_delay(inner.remote_endpoint, packet_len);
        let this = self.clone();
        let pacer = tokio::spawn(async move {
            time::sleep(delay).await;
            if this.was_destroyed() {
                return;
            }
            {
                let mut inner = this.lock();
                inner.pacer_task = None;
                inner.send_state = SendState::Pending;
            }
            this.start_sending();
        });
        inner.pacer_task = Some(pacer.abort_handle());
    }

    /// Delay until the next send, proportional to the size of the packet just
    ///  sent. No delay between processes on the same host.
    fn pacer_delay(&self, remote: Option<SocketAddr>, packet_len: usize) -> Duration {
        match remote {
            Some(ep) if ep.ip().is_loopback() => Duration::ZERO,
            _ => Duration::from_micros(self.config.pacer_micros_per_byte * packet_len as u64),
        }
    }

    fn arm_keepalive(self: &Arc<Shared>, inner: &mut Inner) {
        if let Some(previous) = inner.keepalive_task.take() {
            previous.abort();
        }
        let this = self.clone();
        let period = self.config.keepalive_period;
        let task = tokio::spawn(async move {
            time::sleep(period).await;
            if this.was_destroyed() {
                return;
            }
            {
                let mut inner = this.lock();
                if inner.socket.is_none() {
                    return;
                }
                inner.keepalive_task = None;
                inner
                    .transmit_queue
                    .insert(OutMessage::new(false, MessageType::KeepAlive, 0, Vec::new()));
            }
            trace!("enqueued keepalive");
            this.start_sending();
        });
        inner.keepalive_task = Some(task.abort_handle());
    }
}

impl Inner {
    /// Packs queued messages into the packet in round-robin order, pruning
    ///  reliable messages the peer has acked. Writes the message count over
    ///  its placeholder and returns it.
    fn encode_payload(&mut self, buf: &mut FixedBuf) -> usize {
        let count_offset = buf.len();
        buf.put_u16(0);

        let mut count: usize = 0;
        let peer_acked = self.peer_acked;
        let mut cycle = self.transmit_queue.cycle();
        loop {
            let Some(message) = cycle.current() else {
                break;
            };

            if message.resend_until_acked && peer_acked.is_in(message.sequence_number()) {
                trace!("message sn {} acked by peer, dropping from queue", message.sequence_number());
                cycle.erase();
                continue;
            }

            if !try_encode(buf, message) {
                break;
            }
            count += 1;

            if message.bytes_already_sent != message.payload_len() {
                // buffer exhausted mid-message; the rest goes out next packet,
                // after the remaining queue entries had their turn
                cycle.advance();
                break;
            }

            if message.resend_until_acked {
                cycle.advance();
            }
            else {
                cycle.erase();
            }
        }

        buf.patch(count_offset, &(count as u16).to_be_bytes());
        count
    }
}

/// Encodes the message if at least its header and one payload byte (for
///  non-empty payloads) fit, advancing its fragmentation cursor.
fn try_encode(buf: &mut FixedBuf, message: &mut OutMessage) -> bool {
    let minimal_encoded_size = OutMessage::HEADER_SIZE + min(1, message.payload_len());
    if minimal_encoded_size > buf.remaining_mut() {
        return false;
    }
    encode(buf, message);
    true
}

fn encode(buf: &mut FixedBuf, message: &mut OutMessage) {
    // a fully sent message being encoded again is a retransmit: start over
    if message.bytes_already_sent == message.payload_len() {
        message.bytes_already_sent = 0;
    }
    let written = message.encode_header_and_payload(buf, message.bytes_already_sent);
    message.bytes_already_sent += written as usize;
}

fn construct_packet_with_one_message(acks: &AckSet, message: &mut OutMessage, packet_size: usize) -> FixedBuf {
    let mut buf = FixedBuf::new(packet_size);
    acks.ser(&mut buf);
    buf.put_u16(1);
    let encoded = try_encode(&mut buf, message);
    debug_assert!(encoded, "a single empty message fits any valid packet size");
    buf
}

fn sanitize_address(ep: SocketAddr) -> SocketAddr {
    if !ep.ip().is_unspecified() {
        return ep;
    }
    match ep.ip() {
        IpAddr::V4(_) => SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), ep.port()),
        IpAddr::V6(_) => SocketAddr::new(IpAddr::V6(Ipv6Addr::LOCALHOST), ep.port()),
    }
}

async fn receive_loop(shared: Arc<Shared>, socket: Arc<UdpSocket>, remote: SocketAddr) {
    let mut rx_buf = vec![0u8; shared.config.packet_size];
    loop {
        let received = time::timeout(shared.config.recv_timeout(), socket.recv_from(&mut rx_buf)).await;
        if shared.was_destroyed() {
            return;
        }
        let (len, from) = match received {
            Err(_elapsed) => {
                debug!("nothing received from {} within {:?}", remote, shared.config.recv_timeout());
                shared.handle_error(TransportError::TimedOut);
                return;
            }
            Ok(Err(e)) => {
                error!("receive failed: {}", e);
                shared.handle_error(TransportError::Io(e.kind()));
                return;
            }
            Ok(Ok(x)) => x,
        };

        if from != remote {
            trace!("ignoring datagram from unknown source {}", from);
            continue;
        }

        trace!("received {} byte packet from {}", len, from);
        if !shared.on_packet(&rx_buf[..len]) {
            return;
        }
    }
}
