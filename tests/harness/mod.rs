// Copyright 2021 Protocol Labs.
//
// Permission is hereby granted, free of charge, to any person obtaining a
// copy of this software and associated documentation files (the "Software"),
// to deal in the Software without restriction, including without limitation
// the rights to use, copy, modify, merge, publish, distribute, sublicense,
// and/or sell copies of the Software, and to permit persons to whom the
// Software is furnished to do so, subject to the following conditions:
//
// The above copyright notice and this permission notice shall be included in
// all copies or substantial portions of the Software.
//
// THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS
// OR IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
// FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
// AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
// LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING
// FROM, OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER
// DEALINGS IN THE SOFTWARE.

//! In-memory host for driving the relay end to end: handle-style duplex
//! streams with half-close and reset, stop-stream expectations, tag and
//! notifiee recording, plus recording metrics and resource scopes.

use futures::channel::mpsc;
use futures::future::{self, BoxFuture, FutureExt};
use futures::io::{AsyncRead, AsyncWrite};
use futures::task::Waker;
use libp2p_circuit_relay::host::{
    Executor, Host, Notifiee, NotifieeId, StreamHandler, Substream,
};
use libp2p_circuit_relay::metrics::MetricsTracer;
use libp2p_circuit_relay::scope::{
    ReservationPriority, ResourceError, ResourceScope, ResourceScopeSpan,
};
use libp2p_circuit_relay::Status;
use libp2p_core::identity::Keypair;
use libp2p_core::{Multiaddr, PeerId};
use prost::Message;
use std::collections::{HashMap, HashSet, VecDeque};
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

// ---------------------------------------------------------------------------
// Streams

#[derive(Default)]
struct DirState {
    buf: VecDeque<u8>,
    /// The writing side closed cleanly; readers drain and then see EOF.
    write_closed: bool,
    /// The reading side refuses further input; writes fail.
    read_closed: bool,
    reset: bool,
    reader: Option<Waker>,
}

#[derive(Default)]
struct Dir {
    state: Mutex<DirState>,
}

impl Dir {
    fn wake_reader(state: &mut DirState) {
        if let Some(waker) = state.reader.take() {
            waker.wake();
        }
    }
}

struct Endpoint {
    read: Arc<Dir>,
    write: Arc<Dir>,
}

impl Drop for Endpoint {
    fn drop(&mut self) {
        // The last handle going away closes our writing direction.
        let mut state = self.write.state.lock().unwrap();
        state.write_closed = true;
        Dir::wake_reader(&mut state);
    }
}

/// One end of an in-memory duplex stream. Clones are handles onto the same
/// stream, like host-provided streams.
#[derive(Clone)]
pub struct MemoryStream {
    inner: Arc<Endpoint>,
}

/// A connected pair of stream ends.
pub fn stream_pair() -> (MemoryStream, MemoryStream) {
    let a_to_b = Arc::new(Dir::default());
    let b_to_a = Arc::new(Dir::default());
    let a = MemoryStream {
        inner: Arc::new(Endpoint {
            read: b_to_a.clone(),
            write: a_to_b.clone(),
        }),
    };
    let b = MemoryStream {
        inner: Arc::new(Endpoint {
            read: a_to_b,
            write: b_to_a,
        }),
    };
    (a, b)
}

impl AsyncRead for MemoryStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut [u8],
    ) -> Poll<io::Result<usize>> {
        let mut state = self.inner.read.state.lock().unwrap();
        if state.reset {
            return Poll::Ready(Err(io::ErrorKind::ConnectionReset.into()));
        }
        if state.read_closed {
            return Poll::Ready(Ok(0));
        }
        if !state.buf.is_empty() {
            let n = buf.len().min(state.buf.len());
            for slot in buf.iter_mut().take(n) {
                *slot = state.buf.pop_front().expect("n bytes buffered");
            }
            return Poll::Ready(Ok(n));
        }
        if state.write_closed {
            return Poll::Ready(Ok(0));
        }
        state.reader = Some(cx.waker().clone());
        Poll::Pending
    }
}

impl AsyncWrite for MemoryStream {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let mut state = self.inner.write.state.lock().unwrap();
        if state.reset {
            return Poll::Ready(Err(io::ErrorKind::ConnectionReset.into()));
        }
        if state.read_closed || state.write_closed {
            return Poll::Ready(Err(io::ErrorKind::BrokenPipe.into()));
        }
        state.buf.extend(buf.iter().copied());
        Dir::wake_reader(&mut state);
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_close(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let mut state = self.inner.write.state.lock().unwrap();
        state.write_closed = true;
        Dir::wake_reader(&mut state);
        Poll::Ready(Ok(()))
    }
}

impl Substream for MemoryStream {
    fn reset(&self) {
        for dir in &[&self.inner.read, &self.inner.write] {
            let mut state = dir.state.lock().unwrap();
            state.reset = true;
            Dir::wake_reader(&mut state);
        }
    }

    fn close_read(&self) {
        let mut state = self.inner.read.state.lock().unwrap();
        state.read_closed = true;
        state.buf.clear();
        Dir::wake_reader(&mut state);
    }
}

// ---------------------------------------------------------------------------
// Host

struct HostState {
    addrs: Vec<Multiaddr>,
    connected: HashSet<PeerId>,
    handlers: HashMap<&'static str, Arc<dyn StreamHandler<MemoryStream>>>,
    notifiees: HashMap<u64, Arc<dyn Notifiee>>,
    tags: HashMap<(PeerId, &'static str), usize>,
    stop_expectations: HashMap<PeerId, mpsc::UnboundedSender<MemoryStream>>,
}

struct HostInner {
    keypair: Keypair,
    peer_id: PeerId,
    next_notifiee: AtomicU64,
    state: Mutex<HostState>,
}

/// Test double for the host the relay runs on.
#[derive(Clone)]
pub struct MemoryHost {
    inner: Arc<HostInner>,
}

impl MemoryHost {
    pub fn new() -> Self {
        let keypair = Keypair::generate_ed25519();
        let peer_id = PeerId::from_public_key(keypair.public());
        MemoryHost {
            inner: Arc::new(HostInner {
                keypair,
                peer_id,
                next_notifiee: AtomicU64::new(0),
                state: Mutex::new(HostState {
                    addrs: vec![public_addr()],
                    connected: HashSet::new(),
                    handlers: HashMap::new(),
                    notifiees: HashMap::new(),
                    tags: HashMap::new(),
                    stop_expectations: HashMap::new(),
                }),
            }),
        }
    }

    /// Marks `peer` as connected.
    pub fn connect(&self, peer: PeerId) {
        self.inner.state.lock().unwrap().connected.insert(peer);
    }

    /// Drops all connections to `peer` and fires the disconnect hooks.
    pub fn disconnect(&self, peer: &PeerId) {
        let notifiees: Vec<Arc<dyn Notifiee>> = {
            let mut state = self.inner.state.lock().unwrap();
            state.connected.remove(peer);
            state.notifiees.values().cloned().collect()
        };
        for notifiee in notifiees {
            notifiee.on_disconnected(peer.clone());
        }
    }

    /// Delivers an inbound stream on `protocol` to the registered handler,
    /// driving the handler on its own task. Returns the remote's end of the
    /// stream, or `None` if no handler is registered.
    pub fn incoming_stream(
        &self,
        protocol: &'static str,
        peer: PeerId,
        addr: Multiaddr,
    ) -> Option<MemoryStream> {
        let handler = self.handler(protocol)?;
        let (local, remote) = stream_pair();
        async_std::task::spawn(handler.handle(local, peer, addr));
        Some(remote)
    }

    /// The handler currently registered for `protocol`.
    pub fn handler(&self, protocol: &'static str) -> Option<Arc<dyn StreamHandler<MemoryStream>>> {
        self.inner
            .state
            .lock()
            .unwrap()
            .handlers
            .get(protocol)
            .cloned()
    }

    /// Future stop streams opened towards `peer` are delivered to the
    /// returned receiver.
    pub fn expect_stop_streams(&self, peer: PeerId) -> mpsc::UnboundedReceiver<MemoryStream> {
        let (tx, rx) = mpsc::unbounded();
        self.inner
            .state
            .lock()
            .unwrap()
            .stop_expectations
            .insert(peer, tx);
        rx
    }

    /// The weight of `tag` on `peer`, if tagged.
    pub fn tag_weight(&self, peer: &PeerId, tag: &'static str) -> Option<usize> {
        self.inner
            .state
            .lock()
            .unwrap()
            .tags
            .get(&(peer.clone(), tag))
            .copied()
    }
}

impl Host for MemoryHost {
    type Substream = MemoryStream;

    fn local_peer_id(&self) -> PeerId {
        self.inner.peer_id.clone()
    }

    fn identity(&self) -> Keypair {
        self.inner.keypair.clone()
    }

    fn listen_addrs(&self) -> Vec<Multiaddr> {
        self.inner.state.lock().unwrap().addrs.clone()
    }

    fn is_connected(&self, peer: &PeerId) -> bool {
        self.inner.state.lock().unwrap().connected.contains(peer)
    }

    fn new_stream(
        &self,
        peer: PeerId,
        protocol: &'static str,
        no_dial: bool,
    ) -> BoxFuture<'static, io::Result<MemoryStream>> {
        assert_eq!(protocol, libp2p_circuit_relay::STOP_PROTOCOL_NAME);
        assert!(no_dial, "the relay only uses existing connections");
        let result = {
            let state = self.inner.state.lock().unwrap();
            if !state.connected.contains(&peer) {
                Err(io::ErrorKind::NotConnected.into())
            } else {
                match state.stop_expectations.get(&peer) {
                    Some(expectation) => {
                        let (local, remote) = stream_pair();
                        expectation
                            .unbounded_send(remote)
                            .map(|()| local)
                            .map_err(|_| io::ErrorKind::ConnectionRefused.into())
                    }
                    None => Err(io::ErrorKind::ConnectionRefused.into()),
                }
            }
        };
        future::ready(result).boxed()
    }

    fn tag_peer(&self, peer: PeerId, tag: &'static str, weight: usize) {
        self.inner
            .state
            .lock()
            .unwrap()
            .tags
            .insert((peer, tag), weight);
    }

    fn untag_peer(&self, peer: PeerId, tag: &'static str) {
        self.inner.state.lock().unwrap().tags.remove(&(peer, tag));
    }

    fn set_stream_handler(
        &self,
        protocol: &'static str,
        handler: Arc<dyn StreamHandler<MemoryStream>>,
    ) {
        self.inner
            .state
            .lock()
            .unwrap()
            .handlers
            .insert(protocol, handler);
    }

    fn remove_stream_handler(&self, protocol: &'static str) {
        self.inner.state.lock().unwrap().handlers.remove(protocol);
    }

    fn register_notifiee(&self, notifiee: Arc<dyn Notifiee>) -> NotifieeId {
        let id = self.inner.next_notifiee.fetch_add(1, Ordering::SeqCst);
        self.inner
            .state
            .lock()
            .unwrap()
            .notifiees
            .insert(id, notifiee);
        NotifieeId(id)
    }

    fn unregister_notifiee(&self, id: NotifieeId) {
        self.inner.state.lock().unwrap().notifiees.remove(&id.0);
    }
}

/// A publicly routable address for the relay host.
pub fn public_addr() -> Multiaddr {
    "/ip4/203.0.114.7/tcp/4001".parse().unwrap()
}

// ---------------------------------------------------------------------------
// Executor

/// Spawns relay background tasks onto the async-std runtime.
pub struct TaskExecutor;

impl Executor for TaskExecutor {
    fn exec(&self, future: BoxFuture<'static, ()>) {
        async_std::task::spawn(future);
    }
}

// ---------------------------------------------------------------------------
// Metrics

#[derive(Default)]
struct MetricsState {
    relay_status: Vec<bool>,
    reservations_allowed: Vec<bool>,
    reservations_closed: usize,
    reservation_statuses: Vec<Status>,
    connection_statuses: Vec<Status>,
    connections_opened: usize,
    connections_closed: usize,
    bytes_transferred: u64,
}

/// Tracer recording every event for assertions.
#[derive(Clone, Default)]
pub struct RecordingMetrics {
    state: Arc<Mutex<MetricsState>>,
}

impl RecordingMetrics {
    pub fn relay_status_events(&self) -> Vec<bool> {
        self.state.lock().unwrap().relay_status.clone()
    }

    pub fn reservations_allowed(&self) -> Vec<bool> {
        self.state.lock().unwrap().reservations_allowed.clone()
    }

    pub fn reservations_closed_total(&self) -> usize {
        self.state.lock().unwrap().reservations_closed
    }

    pub fn last_reservation_status(&self) -> Option<Status> {
        self.state.lock().unwrap().reservation_statuses.last().copied()
    }

    pub fn last_connection_status(&self) -> Option<Status> {
        self.state.lock().unwrap().connection_statuses.last().copied()
    }

    pub fn connections_opened(&self) -> usize {
        self.state.lock().unwrap().connections_opened
    }

    pub fn connections_closed(&self) -> usize {
        self.state.lock().unwrap().connections_closed
    }

    pub fn bytes_transferred(&self) -> u64 {
        self.state.lock().unwrap().bytes_transferred
    }
}

impl MetricsTracer for RecordingMetrics {
    fn relay_status(&self, enabled: bool) {
        self.state.lock().unwrap().relay_status.push(enabled);
    }

    fn reservation_allowed(&self, renewed: bool) {
        self.state.lock().unwrap().reservations_allowed.push(renewed);
    }

    fn reservations_closed(&self, count: usize) {
        self.state.lock().unwrap().reservations_closed += count;
    }

    fn reservation_request_handled(&self, status: Status) {
        self.state.lock().unwrap().reservation_statuses.push(status);
    }

    fn connection_opened(&self) {
        self.state.lock().unwrap().connections_opened += 1;
    }

    fn connection_closed(&self, _elapsed: Duration) {
        self.state.lock().unwrap().connections_closed += 1;
    }

    fn connection_request_handled(&self, status: Status) {
        self.state.lock().unwrap().connection_statuses.push(status);
    }

    fn bytes_transferred(&self, count: u64) {
        self.state.lock().unwrap().bytes_transferred += count;
    }
}

// ---------------------------------------------------------------------------
// Resource scopes

#[derive(Default)]
struct ScopeState {
    outstanding: AtomicI64,
    open_spans: AtomicI64,
    closed: AtomicBool,
}

/// Scope tracking reservation balance, for leak assertions.
#[derive(Clone, Default)]
pub struct CountingScope {
    state: Arc<ScopeState>,
}

impl CountingScope {
    /// Net memory currently reserved.
    pub fn outstanding(&self) -> i64 {
        self.state.outstanding.load(Ordering::SeqCst)
    }

    pub fn open_spans(&self) -> i64 {
        self.state.open_spans.load(Ordering::SeqCst)
    }

    pub fn closed(&self) -> bool {
        self.state.closed.load(Ordering::SeqCst)
    }
}

impl ResourceScope for CountingScope {
    fn reserve_memory(&self, size: usize, _priority: ReservationPriority) -> Result<(), ResourceError> {
        self.state.outstanding.fetch_add(size as i64, Ordering::SeqCst);
        Ok(())
    }

    fn release_memory(&self, size: usize) {
        self.state.outstanding.fetch_sub(size as i64, Ordering::SeqCst);
    }

    fn begin_span(&self) -> Result<Box<dyn ResourceScopeSpan>, ResourceError> {
        self.state.open_spans.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(CountingSpan {
            state: self.state.clone(),
            held: AtomicI64::new(0),
            done: AtomicBool::new(false),
        }))
    }

    fn done(&self) {
        self.state.closed.store(true, Ordering::SeqCst);
    }
}

struct CountingSpan {
    state: Arc<ScopeState>,
    held: AtomicI64,
    done: AtomicBool,
}

impl ResourceScopeSpan for CountingSpan {
    fn reserve_memory(&self, size: usize, _priority: ReservationPriority) -> Result<(), ResourceError> {
        self.held.fetch_add(size as i64, Ordering::SeqCst);
        self.state.outstanding.fetch_add(size as i64, Ordering::SeqCst);
        Ok(())
    }

    fn release_memory(&self, size: usize) {
        self.held.fetch_sub(size as i64, Ordering::SeqCst);
        self.state.outstanding.fetch_sub(size as i64, Ordering::SeqCst);
    }

    fn done(&self) {
        if !self.done.swap(true, Ordering::SeqCst) {
            let held = self.held.swap(0, Ordering::SeqCst);
            self.state.outstanding.fetch_sub(held, Ordering::SeqCst);
            self.state.open_spans.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

/// Scope refusing every reservation, for admission-failure tests.
#[derive(Clone, Copy, Default)]
pub struct RefusingScope;

impl ResourceScope for RefusingScope {
    fn reserve_memory(&self, _size: usize, _priority: ReservationPriority) -> Result<(), ResourceError> {
        Err(ResourceError)
    }

    fn release_memory(&self, _size: usize) {}

    fn begin_span(&self) -> Result<Box<dyn ResourceScopeSpan>, ResourceError> {
        Err(ResourceError)
    }

    fn done(&self) {}
}

// ---------------------------------------------------------------------------
// Wire helpers

/// Writes one length-delimited protobuf message.
pub async fn send_msg<M, S>(stream: &mut S, msg: &M) -> io::Result<()>
where
    M: Message,
    S: futures::io::AsyncWrite + Unpin,
{
    use futures::io::AsyncWriteExt;

    let mut body = Vec::with_capacity(msg.encoded_len());
    msg.encode(&mut body).expect("Vec provides capacity as needed");
    let mut len_buf = unsigned_varint::encode::usize_buffer();
    let mut frame = unsigned_varint::encode::usize(body.len(), &mut len_buf).to_vec();
    frame.extend_from_slice(&body);
    stream.write_all(&frame).await?;
    stream.flush().await
}

/// Reads one length-delimited protobuf message.
pub async fn read_msg<M, S>(stream: &mut S) -> io::Result<M>
where
    M: Message + Default,
    S: futures::io::AsyncRead + Unpin,
{
    use futures::io::AsyncReadExt;

    let mut len: u64 = 0;
    let mut shift = 0;
    loop {
        let mut byte = [0u8; 1];
        stream.read_exact(&mut byte).await?;
        len |= u64::from(byte[0] & 0x7f) << shift;
        if byte[0] & 0x80 == 0 {
            break;
        }
        shift += 7;
    }
    let mut body = vec![0u8; len as usize];
    stream.read_exact(&mut body).await?;
    M::decode(&body[..]).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

/// Polls `condition` until it holds or `deadline` passes.
pub async fn wait_until(deadline: Duration, mut condition: impl FnMut() -> bool) {
    let started = Instant::now();
    while !condition() {
        if started.elapsed() > deadline {
            panic!("condition not reached within {:?}", deadline);
        }
        async_std::task::sleep(Duration::from_millis(10)).await;
    }
}
