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

//! Event sink for relay observability.

use crate::proto::Status;
use std::time::Duration;

/// Sink for relay events. Every method defaults to a no-op, so
/// implementations only override what they record. Errors inside a tracer
/// must not propagate into the relay.
pub trait MetricsTracer: Send + Sync + 'static {
    /// The relay service went up or down.
    fn relay_status(&self, _enabled: bool) {}

    /// A reservation was admitted. `renewed` when it refreshed an existing
    /// reservation.
    fn reservation_allowed(&self, _renewed: bool) {}

    /// Reservations were released, whether by expiry, disconnection or
    /// shutdown.
    fn reservations_closed(&self, _count: usize) {}

    /// A RESERVE request finished with the given terminal status.
    fn reservation_request_handled(&self, _status: Status) {}

    /// A circuit was spliced.
    fn connection_opened(&self) {}

    /// A circuit was torn down after `elapsed`.
    fn connection_closed(&self, _elapsed: Duration) {}

    /// A CONNECT request finished with the given terminal status.
    fn connection_request_handled(&self, _status: Status) {}

    /// Bytes were relayed across a circuit, reported incrementally.
    fn bytes_transferred(&self, _count: u64) {}
}

/// Tracer that discards every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullTracer;

impl MetricsTracer for NullTracer {}
