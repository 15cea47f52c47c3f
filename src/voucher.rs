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

use crate::proto;
use libp2p_core::identity::error::SigningError;
use libp2p_core::identity::{Keypair, PublicKey};
use libp2p_core::multiaddr::Protocol;
use libp2p_core::{Multiaddr, PeerId};
use prost::Message;
use smallvec::SmallVec;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error;

/// Domain separation string of the voucher signature.
const ENVELOPE_DOMAIN: &str = "libp2p-relay-rsvp";

/// Multicodec identifying the voucher payload inside its envelope.
const ENVELOPE_PAYLOAD_TYPE: [u8; 2] = [0x03, 0x02];

#[derive(Debug, Error)]
pub enum VoucherError {
    #[error("failed to sign voucher: {0}")]
    Signing(#[from] SigningError),
    #[error("failed to decode voucher: {0}")]
    Decode(#[from] prost::DecodeError),
    #[error("missing envelope field: {0}")]
    MissingField(&'static str),
    #[error("unexpected envelope payload type")]
    UnexpectedPayloadType,
    #[error("malformed public key")]
    MalformedPublicKey,
    #[error("invalid signature")]
    InvalidSignature,
    #[error("malformed peer id in voucher")]
    MalformedPeerId,
}

/// Proof that a relay committed to forward circuits addressed to `peer`
/// until `expiration`. Sealed into a signed envelope with the relay's
/// identity key and handed out in reservation responses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReservationVoucher {
    /// The relay that issued the voucher.
    pub relay: PeerId,
    /// The peer the reservation was issued for.
    pub peer: PeerId,
    /// When the reservation lapses.
    pub expiration: SystemTime,
}

impl ReservationVoucher {
    /// Seals the voucher into a signed envelope.
    pub fn seal(&self, key: &Keypair) -> Result<Vec<u8>, VoucherError> {
        let record = proto::ReservationVoucher {
            relay: self.relay.to_bytes(),
            peer: self.peer.to_bytes(),
            expiration: unix_seconds(self.expiration),
        };
        let mut payload = Vec::with_capacity(record.encoded_len());
        record
            .encode(&mut payload)
            .expect("Vec provides capacity as needed");

        let signature = key.sign(&signing_buffer(&payload))?;
        let envelope = proto::Envelope {
            public_key: Some(key.public().into_protobuf_encoding()),
            payload_type: Some(ENVELOPE_PAYLOAD_TYPE.to_vec()),
            payload: Some(payload),
            signature: Some(signature),
        };
        let mut bytes = Vec::with_capacity(envelope.encoded_len());
        envelope
            .encode(&mut bytes)
            .expect("Vec provides capacity as needed");
        Ok(bytes)
    }

    /// Opens a sealed voucher, verifying the signature against the key
    /// embedded in the envelope.
    pub fn open(bytes: &[u8]) -> Result<ReservationVoucher, VoucherError> {
        let envelope = proto::Envelope::decode(bytes)?;
        let key_bytes = envelope
            .public_key
            .ok_or(VoucherError::MissingField("public_key"))?;
        let key = PublicKey::from_protobuf_encoding(&key_bytes)
            .map_err(|_| VoucherError::MalformedPublicKey)?;
        let payload_type = envelope
            .payload_type
            .ok_or(VoucherError::MissingField("payload_type"))?;
        if payload_type != ENVELOPE_PAYLOAD_TYPE {
            return Err(VoucherError::UnexpectedPayloadType);
        }
        let payload = envelope
            .payload
            .ok_or(VoucherError::MissingField("payload"))?;
        let signature = envelope
            .signature
            .ok_or(VoucherError::MissingField("signature"))?;
        if !key.verify(&signing_buffer(&payload), &signature) {
            return Err(VoucherError::InvalidSignature);
        }

        let record = proto::ReservationVoucher::decode(&payload[..])?;
        Ok(ReservationVoucher {
            relay: PeerId::from_bytes(&record.relay).map_err(|_| VoucherError::MalformedPeerId)?,
            peer: PeerId::from_bytes(&record.peer).map_err(|_| VoucherError::MalformedPeerId)?,
            expiration: UNIX_EPOCH + Duration::from_secs(record.expiration),
        })
    }
}

/// Buffer the envelope signature covers: the varint-length-prefixed
/// concatenation of the domain string, the payload type and the payload.
fn signing_buffer(payload: &[u8]) -> Vec<u8> {
    let parts: [&[u8]; 3] = [ENVELOPE_DOMAIN.as_bytes(), &ENVELOPE_PAYLOAD_TYPE, payload];
    let mut buf = Vec::new();
    for part in &parts {
        let mut len = unsigned_varint::encode::usize_buffer();
        buf.extend_from_slice(unsigned_varint::encode::usize(part.len(), &mut len));
        buf.extend_from_slice(part);
    }
    buf
}

pub(crate) fn unix_seconds(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Relay addresses to advertise to a reserving peer: the publicly routable
/// listen addresses, each carrying the relay's peer id. Addresses embedding
/// a foreign peer id are skipped.
pub(crate) fn relay_addrs(relay: &PeerId, listen: Vec<Multiaddr>) -> SmallVec<[Multiaddr; 4]> {
    let mut addrs = SmallVec::new();
    for addr in listen {
        if !is_public_addr(&addr) {
            continue;
        }
        match embedded_peer(&addr) {
            None => {
                let mut addr = addr;
                addr.push(Protocol::P2p(relay.clone().into()));
                addrs.push(addr);
            }
            Some(ref peer) if peer == relay => addrs.push(addr),
            Some(_) => {}
        }
    }
    addrs
}

/// Whether `addr` is itself a relay circuit address.
pub(crate) fn is_relay_addr(addr: &Multiaddr) -> bool {
    addr.iter().any(|proto| matches!(proto, Protocol::P2pCircuit))
}

/// Whether `addr` is publicly routable. DNS addresses are taken at face
/// value; IP addresses are checked against the reserved ranges.
pub(crate) fn is_public_addr(addr: &Multiaddr) -> bool {
    match addr.iter().next() {
        Some(Protocol::Ip4(ip)) => {
            !(ip.is_loopback()
                || ip.is_private()
                || ip.is_link_local()
                || ip.is_unspecified()
                || ip.is_broadcast()
                || ip.is_documentation())
        }
        Some(Protocol::Ip6(ip)) => {
            let segments = ip.segments();
            // fc00::/7 unique-local, fe80::/10 link-local
            !(ip.is_loopback()
                || ip.is_unspecified()
                || (segments[0] & 0xfe00) == 0xfc00
                || (segments[0] & 0xffc0) == 0xfe80)
        }
        Some(Protocol::Dns(_))
        | Some(Protocol::Dns4(_))
        | Some(Protocol::Dns6(_))
        | Some(Protocol::Dnsaddr(_)) => true,
        _ => false,
    }
}

fn embedded_peer(addr: &Multiaddr) -> Option<PeerId> {
    addr.iter().find_map(|proto| match proto {
        Protocol::P2p(hash) => PeerId::from_multihash(hash).ok(),
        _ => None,
    })
}
