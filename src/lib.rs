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

//! Implementation of the relay side of the [libp2p circuit relay v2
//! specification](https://github.com/libp2p/specs/blob/master/relay/circuit-v2.md).
//!
//! A limited relay lets two peers exchange bytes through a third party when
//! they cannot connect directly. Peers that wish to be reachable make a
//! *reservation* with the relay over the *hop* protocol and receive a signed
//! voucher in return. A source peer then asks the relay to *connect* it to a
//! reserved destination; the relay opens a *stop* stream to the destination,
//! performs a short handshake and splices the two streams into a *circuit*,
//! relaying bytes in both directions until the streams end or the configured
//! byte or time caps fire.
//!
//! ## Terminology
//!
//! - **Source**: the node asking the relay for a circuit to a *destination*.
//! - **Relay**: the node implemented by this crate.
//! - **Destination**: the node holding a reservation, reached via the relay.
//! - **Reservation**: a time-bounded commitment by the relay to forward
//!   circuits addressed to a peer.
//! - **Circuit**: a bidirectional byte pipe spliced through the relay.
//!
//! The host networking stack is consumed through the traits in [`host`]:
//! the relay registers itself as the handler for the hop protocol, opens
//! stop streams through the host, tags peers in the host's connection
//! manager and listens for disconnection events. Policy and accounting
//! collaborators live in [`acl`], [`metrics`] and [`scope`].

pub mod acl;
pub mod host;
pub mod metrics;
pub mod scope;

mod codec;
mod config;
mod constraints;
mod copy;
mod relay;
mod voucher;

/// Generated wire messages of the hop and stop protocols.
pub mod proto {
    include!(concat!(env!("OUT_DIR"), "/circuit.pb.rs"));
}

pub use config::{Config, Limit};
pub use constraints::{AsnResolver, ConstraintViolation, NoAsn};
pub use proto::Status;
pub use relay::{CircuitId, Relay, RelayBuilder};
pub use voucher::{ReservationVoucher, VoucherError};

/// Protocol name of the hop protocol, spoken by sources to the relay.
pub const HOP_PROTOCOL_NAME: &str = "/libp2p/circuit/relay/0.2.0/hop";

/// Protocol name of the stop protocol, spoken by the relay to destinations.
pub const STOP_PROTOCOL_NAME: &str = "/libp2p/circuit/relay/0.2.0/stop";

/// Service name under which relay streams are accounted with the resource
/// manager.
pub const RELAY_SERVICE_NAME: &str = "libp2p.relay/v2";
