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

//! Resource accounting seams towards the host's resource manager.
//!
//! The relay accounts protocol messages and circuit buffers against a
//! service-wide scope, and opens a span per circuit so that everything a
//! circuit reserved is released together on teardown.

use thiserror::Error;

/// Priority of a memory reservation. Higher priorities may be admitted when
/// the scope is already under pressure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ReservationPriority {
    Low,
    Medium,
    High,
    Always,
}

/// A scope refused a reservation or span.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("resource limit exceeded")]
pub struct ResourceError;

/// Memory accounting scope of the relay service.
pub trait ResourceScope: Send + Sync + 'static {
    /// Reserves `size` bytes against the scope's limits.
    fn reserve_memory(&self, size: usize, priority: ReservationPriority) -> Result<(), ResourceError>;

    /// Returns memory obtained through [`ResourceScope::reserve_memory`].
    fn release_memory(&self, size: usize);

    /// Opens a span: a child scope whose reservations are released together
    /// when the span is done.
    fn begin_span(&self) -> Result<Box<dyn ResourceScopeSpan>, ResourceError>;

    /// Releases the scope and everything still reserved against it.
    fn done(&self);
}

/// A span obtained from [`ResourceScope::begin_span`]. Dropping the span
/// without calling [`ResourceScopeSpan::done`] leaks its reservations.
pub trait ResourceScopeSpan: Send + Sync + 'static {
    /// Reserves `size` bytes against the span.
    fn reserve_memory(&self, size: usize, priority: ReservationPriority) -> Result<(), ResourceError>;

    /// Returns memory obtained through [`ResourceScopeSpan::reserve_memory`].
    fn release_memory(&self, size: usize);

    /// Closes the span, releasing everything it reserved.
    fn done(&self);
}

/// Scope that admits everything. The default when no resource manager is
/// wired in.
#[derive(Debug, Clone, Copy, Default)]
pub struct UnmeteredScope;

impl ResourceScope for UnmeteredScope {
    fn reserve_memory(&self, _size: usize, _priority: ReservationPriority) -> Result<(), ResourceError> {
        Ok(())
    }

    fn release_memory(&self, _size: usize) {}

    fn begin_span(&self) -> Result<Box<dyn ResourceScopeSpan>, ResourceError> {
        Ok(Box::new(UnmeteredScope))
    }

    fn done(&self) {}
}

impl ResourceScopeSpan for UnmeteredScope {
    fn reserve_memory(&self, _size: usize, _priority: ReservationPriority) -> Result<(), ResourceError> {
        Ok(())
    }

    fn release_memory(&self, _size: usize) {}

    fn done(&self) {}
}
