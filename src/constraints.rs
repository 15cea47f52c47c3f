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

use crate::config::Config;
use libp2p_core::multiaddr::Protocol;
use libp2p_core::{Multiaddr, PeerId};
use std::collections::HashMap;
use std::net::IpAddr;
use std::time::Instant;
use thiserror::Error;

/// Resolves the autonomous system an IP address belongs to. Reservation
/// slots can be limited per ASN; a resolver answering `None` disables that
/// axis.
pub trait AsnResolver: Send + Sync + 'static {
    fn asn(&self, ip: &IpAddr) -> Option<u32>;
}

/// Resolver that knows no ASNs.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoAsn;

impl AsnResolver for NoAsn {
    fn asn(&self, _ip: &IpAddr) -> Option<u32> {
        None
    }
}

/// Violation of a reservation diversity limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ConstraintViolation {
    #[error("too many reservations")]
    TooManyReservations,
    #[error("too many reservations for peer")]
    TooManyReservationsForPeer,
    #[error("too many reservations for IP address")]
    TooManyReservationsForIp,
    #[error("too many reservations for ASN")]
    TooManyReservationsForAsn,
}

struct Entry {
    ip: Option<IpAddr>,
    asn: Option<u32>,
    expiry: Instant,
}

/// Admission constraints over the active reservations: a total cap plus
/// per-peer, per-IP and per-ASN diversity limits. One entry is tracked per
/// reserved peer; expired entries are reclaimed lazily on the next
/// reservation attempt.
pub(crate) struct ConstraintTable {
    max_reservations: usize,
    max_per_peer: usize,
    max_per_ip: usize,
    max_per_asn: usize,
    resolver: Box<dyn AsnResolver>,
    entries: HashMap<PeerId, Entry>,
    ips: HashMap<IpAddr, usize>,
    asns: HashMap<u32, usize>,
}

impl ConstraintTable {
    pub(crate) fn new(config: &Config, resolver: Box<dyn AsnResolver>) -> Self {
        ConstraintTable {
            max_reservations: config.max_reservations,
            max_per_peer: config.max_reservations_per_peer,
            max_per_ip: config.max_reservations_per_ip,
            max_per_asn: config.max_reservations_per_asn,
            resolver,
            entries: HashMap::new(),
            ips: HashMap::new(),
            asns: HashMap::new(),
        }
    }

    /// Admits or rejects a reservation by `peer` over `addr`, expiring at
    /// `expiry`. A renewal releases the peer's previous slot first, so
    /// constraint counts do not grow when a peer refreshes.
    pub(crate) fn reserve(
        &mut self,
        peer: PeerId,
        addr: &Multiaddr,
        expiry: Instant,
    ) -> Result<(), ConstraintViolation> {
        self.reclaim_expired(Instant::now());
        self.cleanup_peer(&peer);

        if self.entries.len() >= self.max_reservations {
            return Err(ConstraintViolation::TooManyReservations);
        }
        if self.max_per_peer == 0 {
            return Err(ConstraintViolation::TooManyReservationsForPeer);
        }

        let ip = multiaddr_ip(addr).map(ip_group);
        if let Some(ip) = ip {
            if self.ips.get(&ip).copied().unwrap_or(0) >= self.max_per_ip {
                return Err(ConstraintViolation::TooManyReservationsForIp);
            }
        }
        let asn = ip.and_then(|ip| self.resolver.asn(&ip));
        if let Some(asn) = asn {
            if self.asns.get(&asn).copied().unwrap_or(0) >= self.max_per_asn {
                return Err(ConstraintViolation::TooManyReservationsForAsn);
            }
        }

        if let Some(ip) = ip {
            *self.ips.entry(ip).or_insert(0) += 1;
        }
        if let Some(asn) = asn {
            *self.asns.entry(asn).or_insert(0) += 1;
        }
        self.entries.insert(peer, Entry { ip, asn, expiry });
        Ok(())
    }

    /// Releases every slot held by `peer`.
    pub(crate) fn cleanup_peer(&mut self, peer: &PeerId) {
        if let Some(entry) = self.entries.remove(peer) {
            if let Some(ip) = entry.ip {
                release(&mut self.ips, ip);
            }
            if let Some(asn) = entry.asn {
                release(&mut self.asns, asn);
            }
        }
    }

    fn reclaim_expired(&mut self, now: Instant) {
        let expired: Vec<PeerId> = self
            .entries
            .iter()
            .filter(|(_, entry)| entry.expiry <= now)
            .map(|(peer, _)| peer.clone())
            .collect();
        for peer in expired {
            self.cleanup_peer(&peer);
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.entries.len()
    }
}

fn release<K: std::hash::Hash + Eq>(counts: &mut HashMap<K, usize>, key: K) {
    if let Some(count) = counts.get_mut(&key) {
        *count -= 1;
        if *count == 0 {
            counts.remove(&key);
        }
    }
}

/// First IP component of `addr`, if any. Addresses without one (e.g. memory
/// transports) are only subject to the per-peer and total caps.
fn multiaddr_ip(addr: &Multiaddr) -> Option<IpAddr> {
    addr.iter().find_map(|proto| match proto {
        Protocol::Ip4(ip) => Some(IpAddr::V4(ip)),
        Protocol::Ip6(ip) => Some(IpAddr::V6(ip)),
        _ => None,
    })
}

/// Grouping key for per-IP counting: IPv4 addresses count individually,
/// IPv6 addresses by their /64 prefix.
fn ip_group(ip: IpAddr) -> IpAddr {
    match ip {
        IpAddr::V4(_) => ip,
        IpAddr::V6(ip) => {
            let mut octets = ip.octets();
            for octet in &mut octets[8..] {
                *octet = 0;
            }
            IpAddr::V6(octets.into())
        }
    }
}
