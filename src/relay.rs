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

use crate::acl::AclFilter;
use crate::codec::{self, MessageCodec};
use crate::config::Config;
use crate::constraints::{AsnResolver, ConstraintTable, NoAsn};
use crate::copy::{pump, BufferPool};
use crate::host::{Executor, Host, Notifiee, NotifieeId, StreamHandler, Substream};
use crate::proto;
use crate::proto::{hop_message, stop_message, Status};
use crate::metrics::{MetricsTracer, NullTracer};
use crate::scope::{ReservationPriority, ResourceScope, ResourceScopeSpan, UnmeteredScope};
use crate::voucher::{self, ReservationVoucher};
use crate::HOP_PROTOCOL_NAME;
use crate::STOP_PROTOCOL_NAME;

use asynchronous_codec::{Framed, FramedParts};
use futures::channel::oneshot;
use futures::future::{self, BoxFuture, Either, FutureExt};
use futures::{pin_mut, select, SinkExt, StreamExt};
use futures_timer::Delay;
use libp2p_core::{Multiaddr, PeerId};
use log::{debug, info, trace, warn};
use std::collections::HashMap;
use std::future::Future;
use std::io;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant, SystemTime};

/// Read and write deadline for protocol messages.
const STREAM_TIMEOUT: Duration = Duration::from_secs(60);

/// Deadline for opening the outbound stop stream.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Deadline for the stop handshake with the destination.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(60);

/// Connection-manager tag for peers holding a reservation.
const RESERVATION_TAG: &str = "relay-reservation";
const RESERVATION_TAG_WEIGHT: usize = 10;

/// Connection-manager tag for peers with at least one active circuit.
const HOP_TAG: &str = "relay-v2-hop";
const HOP_TAG_WEIGHT: usize = 2;

type HopFramed<S> = Framed<S, MessageCodec<proto::HopMessage>>;
type StopFramed<S> = Framed<S, MessageCodec<proto::StopMessage>>;

/// Identifier of an admitted circuit, for log and metrics correlation.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct CircuitId(u64);

impl CircuitId {
    fn new() -> CircuitId {
        CircuitId(rand::random())
    }
}

struct State {
    closed: bool,
    reservations: HashMap<PeerId, Instant>,
    circuits: HashMap<PeerId, usize>,
    constraints: ConstraintTable,
}

struct Inner<H: Host> {
    host: H,
    config: Config,
    executor: Box<dyn Executor>,
    acl: Option<Box<dyn AclFilter>>,
    metrics: Arc<dyn MetricsTracer>,
    scope: Box<dyn ResourceScope>,
    pool: Arc<BufferPool>,
    state: Mutex<State>,
    shutdown: Mutex<Option<oneshot::Sender<()>>>,
    notifiee: Mutex<Option<NotifieeId>>,
}

impl<H: Host> Inner<H> {
    fn release_circuit_slots(&self, src: &PeerId, dest: &PeerId) {
        let mut state = self.state.lock().unwrap();
        for peer in &[src.clone(), dest.clone()] {
            if let Some(count) = state.circuits.get_mut(peer) {
                *count -= 1;
                if *count == 0 {
                    state.circuits.remove(peer);
                    self.host.untag_peer(peer.clone(), HOP_TAG);
                }
            }
        }
    }
}

/// The relay service.
///
/// On construction the relay registers itself with the host as the handler
/// for the hop protocol and as an observer of disconnection events, and
/// spawns a background sweeper evicting expired reservations. It runs until
/// [`Relay::close`] is called; clones share the same service.
pub struct Relay<H: Host> {
    inner: Arc<Inner<H>>,
}

impl<H: Host> Clone for Relay<H> {
    fn clone(&self) -> Self {
        Relay {
            inner: self.inner.clone(),
        }
    }
}

/// Builder wiring optional collaborators into a [`Relay`].
pub struct RelayBuilder<H: Host> {
    host: H,
    config: Config,
    executor: Box<dyn Executor>,
    acl: Option<Box<dyn AclFilter>>,
    metrics: Arc<dyn MetricsTracer>,
    scope: Box<dyn ResourceScope>,
    resolver: Box<dyn AsnResolver>,
}

impl<H: Host> RelayBuilder<H> {
    pub fn config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    pub fn acl(mut self, acl: impl AclFilter) -> Self {
        self.acl = Some(Box::new(acl));
        self
    }

    pub fn metrics(mut self, tracer: impl MetricsTracer) -> Self {
        self.metrics = Arc::new(tracer);
        self
    }

    pub fn resource_scope(mut self, scope: impl ResourceScope) -> Self {
        self.scope = Box::new(scope);
        self
    }

    pub fn asn_resolver(mut self, resolver: impl AsnResolver) -> Self {
        self.resolver = Box::new(resolver);
        self
    }

    /// Starts the service.
    pub fn build(self) -> Relay<H> {
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let state = State {
            closed: false,
            reservations: HashMap::new(),
            circuits: HashMap::new(),
            constraints: ConstraintTable::new(&self.config, self.resolver),
        };
        let pool = Arc::new(BufferPool::new(self.config.buffer_size));
        let relay = Relay {
            inner: Arc::new(Inner {
                host: self.host,
                config: self.config,
                executor: self.executor,
                acl: self.acl,
                metrics: self.metrics,
                scope: self.scope,
                pool,
                state: Mutex::new(state),
                shutdown: Mutex::new(Some(shutdown_tx)),
                notifiee: Mutex::new(None),
            }),
        };

        relay
            .inner
            .host
            .set_stream_handler(HOP_PROTOCOL_NAME, Arc::new(relay.clone()));
        let notifiee = relay.inner.host.register_notifiee(Arc::new(relay.clone()));
        *relay.inner.notifiee.lock().unwrap() = Some(notifiee);

        let sweeper = relay.clone();
        relay
            .inner
            .executor
            .exec(async move { sweeper.sweep_loop(shutdown_rx).await }.boxed());

        relay.inner.metrics.relay_status(true);
        info!("relay: service up on {}", relay.inner.host.local_peer_id());
        relay
    }
}

impl<H: Host> Relay<H> {
    /// Starts a relay with the default configuration.
    pub fn new(host: H, executor: impl Executor) -> Relay<H> {
        Relay::builder(host, executor).build()
    }

    pub fn builder(host: H, executor: impl Executor) -> RelayBuilder<H> {
        RelayBuilder {
            host,
            config: Config::default(),
            executor: Box::new(executor),
            acl: None,
            metrics: Arc::new(NullTracer),
            scope: Box::new(UnmeteredScope),
            resolver: Box::new(NoAsn),
        }
    }

    /// Shuts the relay down: deregisters from the host, stops the sweeper,
    /// evicts every reservation and releases the service scope. Idempotent.
    /// In-flight circuits run on until their streams end or a limit fires.
    pub fn close(&self) {
        {
            let mut state = self.lock();
            if state.closed {
                return;
            }
            state.closed = true;
        }
        self.inner.host.remove_stream_handler(HOP_PROTOCOL_NAME);
        if let Some(notifiee) = self.inner.notifiee.lock().unwrap().take() {
            self.inner.host.unregister_notifiee(notifiee);
        }
        if let Some(shutdown) = self.inner.shutdown.lock().unwrap().take() {
            let _ = shutdown.send(());
        }
        self.gc();
        self.inner.scope.done();
        self.inner.metrics.relay_status(false);
        info!("relay: service down");
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.inner.state.lock().unwrap()
    }

    async fn sweep_loop(self, shutdown: oneshot::Receiver<()>) {
        let mut shutdown = shutdown.fuse();
        loop {
            let tick = Delay::new(self.inner.config.sweep_interval).fuse();
            pin_mut!(tick);
            select! {
                _ = shutdown => break,
                _ = tick => self.gc(),
            }
        }
        trace!("relay: sweeper stopped");
    }

    /// Evicts expired reservations (all of them once closed) and collects
    /// idle circuit counters.
    fn gc(&self) {
        let now = Instant::now();
        let mut evicted = 0;
        {
            let mut state = self.lock();
            let closed = state.closed;
            let host = &self.inner.host;
            state.reservations.retain(|peer, expiry| {
                if closed || *expiry <= now {
                    host.untag_peer(peer.clone(), RESERVATION_TAG);
                    evicted += 1;
                    false
                } else {
                    true
                }
            });
            state.circuits.retain(|_, count| *count > 0);
        }
        if evicted > 0 {
            debug!("relay: swept {} reservations", evicted);
        }
        self.inner.metrics.reservations_closed(evicted);
    }

    async fn handle_hop_stream(
        self,
        stream: H::Substream,
        remote_peer: PeerId,
        remote_addr: Multiaddr,
    ) {
        trace!("relay: inbound hop stream from {}", remote_peer);
        if self
            .inner
            .scope
            .reserve_memory(codec::MAX_MESSAGE_SIZE, ReservationPriority::Always)
            .is_err()
        {
            debug!("relay: no memory for hop stream from {}; resetting", remote_peer);
            stream.reset();
            return;
        }
        let _message_memory = MemoryGuard {
            scope: self.inner.scope.as_ref(),
            size: codec::MAX_MESSAGE_SIZE,
        };

        let raw = stream.clone();
        let mut framed = Framed::new(stream, MessageCodec::<proto::HopMessage>::new());

        let request = with_deadline(STREAM_TIMEOUT, framed.next()).await;
        let msg = match request {
            Ok(Some(Ok(msg))) => msg,
            Ok(Some(Err(e))) => {
                debug!("relay: malformed hop message from {}: {}", remote_peer, e);
                self.refuse(&mut framed, raw.clone(), Status::MalformedMessage).await;
                return;
            }
            Ok(None) => {
                debug!("relay: hop stream from {} ended before a message", remote_peer);
                self.refuse(&mut framed, raw.clone(), Status::MalformedMessage).await;
                return;
            }
            Err(_) => {
                debug!("relay: timed out reading hop message from {}", remote_peer);
                self.refuse(&mut framed, raw.clone(), Status::MalformedMessage).await;
                return;
            }
        };

        match hop_message::Type::from_i32(msg.r#type) {
            Some(hop_message::Type::Reserve) => {
                let status = self
                    .handle_reserve(&mut framed, raw, remote_peer, &remote_addr)
                    .await;
                self.inner.metrics.reservation_request_handled(status);
            }
            Some(hop_message::Type::Connect) => {
                let status = self
                    .handle_connect(framed, raw, msg, remote_peer, &remote_addr)
                    .await;
                self.inner.metrics.connection_request_handled(status);
            }
            _ => {
                debug!("relay: unexpected hop message type from {}", remote_peer);
                self.refuse(&mut framed, raw.clone(), Status::MalformedMessage).await;
            }
        }
    }

    async fn handle_reserve(
        &self,
        framed: &mut HopFramed<H::Substream>,
        raw: H::Substream,
        peer: PeerId,
        addr: &Multiaddr,
    ) -> Status {
        if voucher::is_relay_addr(addr) {
            debug!("relay: refusing reservation for {}: relayed connection", peer);
            return self.refuse(framed, raw.clone(), Status::PermissionDenied).await;
        }
        if let Some(acl) = &self.inner.acl {
            if !acl.allow_reserve(&peer, addr) {
                debug!("relay: refusing reservation for {}: filtered", peer);
                return self.refuse(framed, raw.clone(), Status::PermissionDenied).await;
            }
        }

        let expiry = Instant::now() + self.inner.config.reservation_ttl;
        let verdict = {
            let mut state = self.lock();
            if state.closed {
                Err(Status::PermissionDenied)
            } else {
                match state.constraints.reserve(peer.clone(), addr, expiry) {
                    Err(violation) => {
                        debug!("relay: refusing reservation for {}: {}", peer, violation);
                        Err(Status::ReservationRefused)
                    }
                    Ok(()) => {
                        let renewed = state.reservations.insert(peer.clone(), expiry).is_some();
                        self.inner.host.tag_peer(
                            peer.clone(),
                            RESERVATION_TAG,
                            RESERVATION_TAG_WEIGHT,
                        );
                        Ok(renewed)
                    }
                }
            }
        };
        let renewed = match verdict {
            Ok(renewed) => renewed,
            Err(status) => return self.refuse(framed, raw.clone(), status).await,
        };
        self.inner.metrics.reservation_allowed(renewed);

        let response = proto::HopMessage {
            r#type: hop_message::Type::Status.into(),
            peer: None,
            reservation: Some(self.make_reservation(peer.clone())),
            limit: self.limit_msg(),
            status: Some(Status::Ok.into()),
        };
        let sent = with_deadline(STREAM_TIMEOUT, framed.send(response)).await;
        match sent {
            Ok(Ok(())) => {
                let _ = with_deadline(STREAM_TIMEOUT, framed.close()).await;
                debug!("relay: reserved for {} (renewed: {})", peer, renewed);
                Status::Ok
            }
            _ => {
                // The reservation stands. If the peer never learned about
                // it, the sweeper collects it on expiry.
                debug!("relay: failed to send reservation response to {}", peer);
                raw.reset();
                Status::ConnectionFailed
            }
        }
    }

    async fn handle_connect(
        &self,
        mut framed: HopFramed<H::Substream>,
        raw: H::Substream,
        msg: proto::HopMessage,
        src: PeerId,
        src_addr: &Multiaddr,
    ) -> Status {
        let span = match self.begin_circuit_span() {
            Ok(span) => span,
            Err(_) => {
                debug!("relay: no circuit span for connect from {}", src);
                return self
                    .refuse(&mut framed, raw.clone(), Status::ResourceLimitExceeded)
                    .await;
            }
        };

        if voucher::is_relay_addr(src_addr) {
            debug!("relay: refusing connect from {}: relayed connection", src);
            return self.refuse(&mut framed, raw.clone(), Status::PermissionDenied).await;
        }
        let dest = match msg.peer.as_ref().and_then(|peer| PeerId::from_bytes(&peer.id).ok()) {
            Some(dest) => dest,
            None => {
                debug!("relay: connect from {} without a destination", src);
                return self.refuse(&mut framed, raw.clone(), Status::MalformedMessage).await;
            }
        };
        if let Some(acl) = &self.inner.acl {
            if !acl.allow_connect(&src, src_addr, &dest) {
                debug!("relay: refusing connect from {} to {}: filtered", src, dest);
                return self.refuse(&mut framed, raw.clone(), Status::PermissionDenied).await;
            }
        }

        let admitted: Result<(), Status> = {
            let mut state = self.lock();
            if !state.reservations.contains_key(&dest) {
                Err(Status::NoReservation)
            } else if state.circuits.get(&src).copied().unwrap_or(0)
                >= self.inner.config.max_circuits
                || state.circuits.get(&dest).copied().unwrap_or(0)
                    >= self.inner.config.max_circuits
            {
                Err(Status::ResourceLimitExceeded)
            } else {
                for peer in &[src.clone(), dest.clone()] {
                    let count = state.circuits.entry(peer.clone()).or_insert(0);
                    *count += 1;
                    if *count == 1 {
                        self.inner.host.tag_peer(peer.clone(), HOP_TAG, HOP_TAG_WEIGHT);
                    }
                }
                Ok(())
            }
        };
        if let Err(status) = admitted {
            debug!("relay: refusing connect from {} to {}: {:?}", src, dest, status);
            return self.refuse(&mut framed, raw.clone(), status).await;
        }

        let opened = with_deadline(
            CONNECT_TIMEOUT,
            self.inner.host.new_stream(dest.clone(), STOP_PROTOCOL_NAME, true),
        )
        .await;
        let stop = match opened {
            Ok(Ok(stop)) => stop,
            _ => {
                debug!("relay: failed to open stop stream to {}", dest);
                self.inner.release_circuit_slots(&src, &dest);
                return self.refuse(&mut framed, raw.clone(), Status::ConnectionFailed).await;
            }
        };
        let stop_raw = stop.clone();

        if self
            .inner
            .scope
            .reserve_memory(codec::MAX_MESSAGE_SIZE, ReservationPriority::Always)
            .is_err()
        {
            debug!("relay: no memory for stop stream to {}", dest);
            stop_raw.reset();
            self.inner.release_circuit_slots(&src, &dest);
            return self
                .refuse(&mut framed, raw.clone(), Status::ResourceLimitExceeded)
                .await;
        }
        let _stop_memory = MemoryGuard {
            scope: self.inner.scope.as_ref(),
            size: codec::MAX_MESSAGE_SIZE,
        };

        let mut stop_framed = Framed::new(stop, MessageCodec::<proto::StopMessage>::new());
        let connect = proto::StopMessage {
            r#type: stop_message::Type::Connect.into(),
            peer: Some(proto::Peer {
                id: src.to_bytes(),
                addrs: Vec::new(),
            }),
            limit: self.limit_msg(),
            status: None,
        };
        let response = {
            let handshake = async {
                stop_framed.send(connect).await?;
                match stop_framed.next().await {
                    Some(response) => response,
                    None => Err(codec::Error::Io(io::ErrorKind::UnexpectedEof.into())),
                }
            };
            pin_mut!(handshake);
            with_deadline(HANDSHAKE_TIMEOUT, handshake).await
        };
        let accepted = match response {
            Ok(Ok(response)) => {
                stop_message::Type::from_i32(response.r#type)
                    == Some(stop_message::Type::Status)
                    && response.status.and_then(Status::from_i32) == Some(Status::Ok)
            }
            _ => false,
        };
        if !accepted {
            debug!("relay: stop handshake with {} failed", dest);
            stop_raw.reset();
            self.inner.release_circuit_slots(&src, &dest);
            return self.refuse(&mut framed, raw.clone(), Status::ConnectionFailed).await;
        }

        let accept = proto::HopMessage {
            r#type: hop_message::Type::Status.into(),
            peer: None,
            reservation: None,
            limit: self.limit_msg(),
            status: Some(Status::Ok.into()),
        };
        let sent = with_deadline(STREAM_TIMEOUT, framed.send(accept)).await;
        match sent {
            Ok(Ok(())) => {}
            _ => {
                debug!("relay: failed to accept connect from {}", src);
                raw.reset();
                stop_raw.reset();
                self.inner.release_circuit_slots(&src, &dest);
                return Status::ConnectionFailed;
            }
        }

        let FramedParts {
            io: src_io,
            read_buffer: src_pending,
            ..
        } = framed.into_parts();
        let FramedParts {
            io: dest_io,
            read_buffer: dest_pending,
            ..
        } = stop_framed.into_parts();

        self.splice(
            CircuitId::new(),
            span,
            src,
            dest,
            src_io,
            dest_io,
            src_pending.freeze(),
            dest_pending.freeze(),
        );
        Status::Ok
    }

    #[allow(clippy::too_many_arguments)]
    fn splice(
        &self,
        id: CircuitId,
        span: SpanGuard,
        src_peer: PeerId,
        dest_peer: PeerId,
        src: H::Substream,
        dest: H::Substream,
        src_pending: bytes::Bytes,
        dest_pending: bytes::Bytes,
    ) {
        let (data, duration) = match self.inner.config.limit {
            Some(limit) => (limit.data, limit.duration),
            None => (None, None),
        };
        self.inner.metrics.connection_opened();
        debug!(
            "relay: circuit {:?} spliced between {} and {}",
            id, src_peer, dest_peer
        );

        // Both pumps share the guard; the last one to finish runs the
        // teardown exactly once.
        let guard = Arc::new(CircuitGuard {
            inner: self.inner.clone(),
            id,
            src: src_peer,
            dest: dest_peer,
            _span: span,
            opened_at: Instant::now(),
        });

        let legs = vec![
            (src.clone(), dest.clone(), src_pending),
            (dest, src, dest_pending),
        ];
        for (from, to, pending) in legs {
            let pool = self.inner.pool.clone();
            let metrics = self.inner.metrics.clone();
            let guard = guard.clone();
            self.inner.executor.exec(
                async move {
                    match pump(from, to, pending, data, duration, pool, metrics).await {
                        Ok(count) => {
                            trace!("relay: circuit {:?} leg relayed {} bytes", guard.id, count)
                        }
                        Err(e) => debug!("relay: circuit {:?} leg ended: {}", guard.id, e),
                    }
                    drop(guard);
                }
                .boxed(),
            );
        }
    }

    fn begin_circuit_span(&self) -> Result<SpanGuard, crate::scope::ResourceError> {
        let span = self.inner.scope.begin_span()?;
        if let Err(e) = span.reserve_memory(
            2 * self.inner.config.buffer_size,
            ReservationPriority::High,
        ) {
            span.done();
            return Err(e);
        }
        Ok(SpanGuard { span: Some(span) })
    }

    fn make_reservation(&self, peer: PeerId) -> proto::Reservation {
        let relay = self.inner.host.local_peer_id();
        let expiration = SystemTime::now() + self.inner.config.reservation_ttl;
        let addrs = voucher::relay_addrs(&relay, self.inner.host.listen_addrs());

        let sealed = ReservationVoucher {
            relay,
            peer,
            expiration,
        }
        .seal(&self.inner.host.identity());
        let sealed = match sealed {
            Ok(sealed) => Some(sealed),
            Err(e) => {
                // Hand out the reservation anyway; it only lacks the proof.
                warn!("relay: failed to seal reservation voucher: {}", e);
                None
            }
        };

        proto::Reservation {
            expire: voucher::unix_seconds(expiration),
            addrs: addrs.into_iter().map(|addr| addr.to_vec()).collect(),
            voucher: sealed,
        }
    }

    fn limit_msg(&self) -> Option<proto::Limit> {
        self.inner.config.limit.map(|limit| proto::Limit {
            duration: limit.duration.map(|d| d.as_secs() as u32),
            data: limit.data,
        })
    }

    /// Writes an error response; resets the stream if the write fails.
    async fn refuse(
        &self,
        framed: &mut HopFramed<H::Substream>,
        raw: H::Substream,
        status: Status,
    ) -> Status {
        let msg = proto::HopMessage {
            r#type: hop_message::Type::Status.into(),
            peer: None,
            reservation: None,
            limit: None,
            status: Some(status.into()),
        };
        let sent = with_deadline(STREAM_TIMEOUT, framed.send(msg)).await;
        match sent {
            Ok(Ok(())) => {
                let _ = with_deadline(STREAM_TIMEOUT, framed.close()).await;
            }
            _ => raw.reset(),
        }
        status
    }
}

impl<H: Host> StreamHandler<H::Substream> for Relay<H> {
    fn handle(
        &self,
        stream: H::Substream,
        remote_peer: PeerId,
        remote_addr: Multiaddr,
    ) -> BoxFuture<'static, ()> {
        let relay = self.clone();
        async move {
            relay.handle_hop_stream(stream, remote_peer, remote_addr).await
        }
        .boxed()
    }
}

impl<H: Host> Notifiee for Relay<H> {
    fn on_disconnected(&self, peer: PeerId) {
        if self.inner.host.is_connected(&peer) {
            // A connection remains; this was not a full disconnect.
            return;
        }
        let held = {
            let mut state = self.lock();
            if state.reservations.remove(&peer).is_some() {
                state.constraints.cleanup_peer(&peer);
                self.inner.host.untag_peer(peer.clone(), RESERVATION_TAG);
                true
            } else {
                false
            }
        };
        if held {
            debug!("relay: removed reservation of disconnected peer {}", peer);
            self.inner.metrics.reservations_closed(1);
        }
    }
}

/// Service-scope memory reservation released on drop.
struct MemoryGuard<'a> {
    scope: &'a dyn ResourceScope,
    size: usize,
}

impl<'a> Drop for MemoryGuard<'a> {
    fn drop(&mut self) {
        self.scope.release_memory(self.size);
    }
}

/// Resource span closed on drop.
struct SpanGuard {
    span: Option<Box<dyn ResourceScopeSpan>>,
}

impl Drop for SpanGuard {
    fn drop(&mut self) {
        if let Some(span) = self.span.take() {
            span.done();
        }
    }
}

/// Teardown rendezvous of a circuit, shared by its two pumps. Dropping the
/// last reference releases the span, returns both circuit slots and reports
/// the closure.
struct CircuitGuard<H: Host> {
    inner: Arc<Inner<H>>,
    id: CircuitId,
    src: PeerId,
    dest: PeerId,
    _span: SpanGuard,
    opened_at: Instant,
}

impl<H: Host> Drop for CircuitGuard<H> {
    fn drop(&mut self) {
        self.inner.release_circuit_slots(&self.src, &self.dest);
        self.inner
            .metrics
            .connection_closed(self.opened_at.elapsed());
        debug!(
            "relay: circuit {:?} between {} and {} closed",
            self.id, self.src, self.dest
        );
    }
}

/// Runs `fut` under `timeout`, mapping expiry to [`io::ErrorKind::TimedOut`].
async fn with_deadline<F>(timeout: Duration, fut: F) -> io::Result<F::Output>
where
    F: Future + Unpin,
{
    match future::select(fut, Delay::new(timeout)).await {
        Either::Left((output, _)) => Ok(output),
        Either::Right(((), _)) => Err(io::Error::new(
            io::ErrorKind::TimedOut,
            "operation deadline reached",
        )),
    }
}
