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

use std::time::Duration;

/// Resource configuration of the relay service.
#[derive(Debug, Clone)]
pub struct Config {
    /// Lifetime of a reservation. Renewals restart it.
    pub reservation_ttl: Duration,
    /// Maximum number of concurrent reservations across all peers.
    pub max_reservations: usize,
    /// Maximum number of circuits a single peer may take part in at a time,
    /// counted for the source and the destination role alike.
    pub max_circuits: usize,
    /// Size of a relay buffer. Each circuit holds one per direction.
    pub buffer_size: usize,
    /// Caps applied to every circuit. `None` relays without caps.
    pub limit: Option<Limit>,
    /// Maximum number of reservation slots a single peer may hold.
    pub max_reservations_per_peer: usize,
    /// Maximum number of reservation slots per IP address (IPv6 addresses
    /// are grouped by their /64 prefix).
    pub max_reservations_per_ip: usize,
    /// Maximum number of reservation slots per autonomous system, where an
    /// ASN resolver is wired in.
    pub max_reservations_per_asn: usize,
    /// Interval of the background sweep evicting expired reservations.
    pub sweep_interval: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            reservation_ttl: Duration::from_secs(60 * 60),
            max_reservations: 128,
            max_circuits: 16,
            buffer_size: 2048,
            limit: Some(Limit::default()),
            max_reservations_per_peer: 4,
            max_reservations_per_ip: 8,
            max_reservations_per_asn: 32,
            sweep_interval: Duration::from_secs(60),
        }
    }
}

/// Caps applied to a single circuit. The limit is advertised to both ends
/// in the reservation and connect responses.
#[derive(Debug, Clone, Copy)]
pub struct Limit {
    /// Maximum lifetime of the circuit before it is torn down.
    pub duration: Option<Duration>,
    /// Maximum number of bytes relayed per direction.
    pub data: Option<u64>,
}

impl Default for Limit {
    fn default() -> Self {
        Limit {
            duration: Some(Duration::from_secs(2 * 60)),
            data: Some(1 << 17),
        }
    }
}
