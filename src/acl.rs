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

//! Access control over reservations and circuits.

use libp2p_core::{Multiaddr, PeerId};

/// Filter consulted before admitting reservations and circuits. Denials
/// surface to the requesting peer as `PERMISSION_DENIED`.
pub trait AclFilter: Send + Sync + 'static {
    /// Whether `peer`, connected over `addr`, may reserve a slot.
    fn allow_reserve(&self, peer: &PeerId, addr: &Multiaddr) -> bool;

    /// Whether `src`, connected over `src_addr`, may open a circuit to
    /// `dest`.
    fn allow_connect(&self, src: &PeerId, src_addr: &Multiaddr, dest: &PeerId) -> bool;
}
