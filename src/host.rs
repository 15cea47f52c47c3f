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

//! Contracts towards the host this service runs on.
//!
//! The relay does not own a networking stack. It is handed inbound hop
//! streams by the host, opens stop streams through it, tags peers in the
//! host's connection manager and listens for disconnection events. All of
//! that surface is captured by the traits below; the host side of a real
//! node implements them against its swarm, the test harness against an
//! in-memory network.

use futures::future::BoxFuture;
use futures::io::{AsyncRead, AsyncWrite};
use libp2p_core::identity::Keypair;
use libp2p_core::{Multiaddr, PeerId};
use std::io;
use std::sync::Arc;

/// A bidirectional stream with libp2p half-close semantics.
///
/// Streams are handles: clones refer to the same underlying stream, and a
/// read through one clone may run concurrently with a write through
/// another. Closing the writer ([`AsyncWrite::poll_close`]) closes only the
/// write half; the read half stays usable until the remote closes its
/// writer in turn.
pub trait Substream: AsyncRead + AsyncWrite + Clone + Send + Unpin + 'static {
    /// Abruptly closes both directions. The remote observes an error rather
    /// than a clean end of stream.
    fn reset(&self);

    /// Stops accepting inbound data. Pending and subsequent remote writes
    /// fail.
    fn close_read(&self);
}

/// Handler for inbound streams on a registered protocol. The host invokes
/// [`StreamHandler::handle`] for every fully negotiated inbound stream and
/// drives the returned future on a task of its own.
pub trait StreamHandler<S>: Send + Sync + 'static {
    fn handle(&self, stream: S, remote_peer: PeerId, remote_addr: Multiaddr)
        -> BoxFuture<'static, ()>;
}

/// Observer of network-level events.
pub trait Notifiee: Send + Sync + 'static {
    /// The last connection to `peer` was closed.
    fn on_disconnected(&self, peer: PeerId);
}

/// Token identifying a [`Notifiee`] registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NotifieeId(pub u64);

/// Facility for spawning the background tasks run by the relay: the expiry
/// sweeper and the two pumps of every circuit.
pub trait Executor: Send + Sync + 'static {
    fn exec(&self, future: BoxFuture<'static, ()>);
}

/// The host node the relay service is attached to.
pub trait Host: Send + Sync + 'static {
    type Substream: Substream;

    /// Peer id of the local node.
    fn local_peer_id(&self) -> PeerId;

    /// Identity key of the local node, used to seal reservation vouchers.
    fn identity(&self) -> Keypair;

    /// Addresses the local node is reachable on.
    fn listen_addrs(&self) -> Vec<Multiaddr>;

    /// Whether there currently is a connection to `peer`.
    fn is_connected(&self, peer: &PeerId) -> bool;

    /// Opens a stream to `peer` on `protocol`. With `no_dial` set, only
    /// existing connections may be used; the host must not dial out.
    fn new_stream(
        &self,
        peer: PeerId,
        protocol: &'static str,
        no_dial: bool,
    ) -> BoxFuture<'static, io::Result<Self::Substream>>;

    /// Tags `peer` in the host's connection manager, protecting it from
    /// connection pruning in proportion to `weight`.
    fn tag_peer(&self, peer: PeerId, tag: &'static str, weight: usize);

    /// Removes a tag previously applied with [`Host::tag_peer`].
    fn untag_peer(&self, peer: PeerId, tag: &'static str);

    /// Routes inbound streams on `protocol` to `handler`.
    fn set_stream_handler(
        &self,
        protocol: &'static str,
        handler: Arc<dyn StreamHandler<Self::Substream>>,
    );

    /// Removes the handler for `protocol`; further inbound streams on it
    /// are refused by the host.
    fn remove_stream_handler(&self, protocol: &'static str);

    /// Subscribes `notifiee` to network events.
    fn register_notifiee(&self, notifiee: Arc<dyn Notifiee>) -> NotifieeId;

    /// Drops a subscription made with [`Host::register_notifiee`].
    fn unregister_notifiee(&self, id: NotifieeId);
}
