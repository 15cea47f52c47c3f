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

use crate::host::Substream;
use crate::metrics::MetricsTracer;
use bytes::Bytes;
use futures::future::{self, Either};
use futures::io::{AsyncReadExt, AsyncWriteExt};
use futures_timer::Delay;
use std::future::Future;
use std::io;
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Pool of relay buffers. Every pump draws one buffer for its lifetime and
/// returns it on teardown.
pub(crate) struct BufferPool {
    size: usize,
    free: Mutex<Vec<Vec<u8>>>,
}

impl BufferPool {
    pub(crate) fn new(size: usize) -> Self {
        BufferPool {
            size,
            free: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn get(self: &Arc<Self>) -> PooledBuf {
        let buf = self
            .free
            .lock()
            .unwrap()
            .pop()
            .unwrap_or_else(|| vec![0; self.size]);
        PooledBuf {
            pool: self.clone(),
            buf: Some(buf),
        }
    }
}

pub(crate) struct PooledBuf {
    pool: Arc<BufferPool>,
    buf: Option<Vec<u8>>,
}

impl Deref for PooledBuf {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.buf.as_ref().expect("buffer present until drop")
    }
}

impl DerefMut for PooledBuf {
    fn deref_mut(&mut self) -> &mut [u8] {
        self.buf.as_mut().expect("buffer present until drop")
    }
}

impl Drop for PooledBuf {
    fn drop(&mut self) {
        if let Some(buf) = self.buf.take() {
            self.pool.free.lock().unwrap().push(buf);
        }
    }
}

/// Copies bytes from `src` to `dst` until end of stream, an error, the
/// optional byte cap `limit` or the `deadline`.
///
/// `pending` is data that was already read off `src` during the handshake;
/// it is flushed first and counts against the cap. On a clean end of stream
/// the write half of `dst` is closed. When the cap ends the transfer, the
/// read half of `src` is closed as well to refuse further input. Any error,
/// including the deadline firing, resets both streams. Returns the number
/// of bytes delivered to `dst`.
pub(crate) async fn pump<S: Substream>(
    mut src: S,
    mut dst: S,
    pending: Bytes,
    limit: Option<u64>,
    deadline: Option<Duration>,
    pool: Arc<BufferPool>,
    metrics: Arc<dyn MetricsTracer>,
) -> io::Result<u64> {
    let mut delay = deadline.map(Delay::new);
    let mut budget = limit;
    let mut total = 0u64;

    if !pending.is_empty() {
        let n = cap(pending.len(), budget);
        let written = deadline_io(&mut delay, dst.write_all(&pending[..n])).await;
        if let Err(e) = written {
            src.reset();
            dst.reset();
            return Err(e);
        }
        consume(&mut budget, n);
        total += n as u64;
        metrics.bytes_transferred(n as u64);
    }

    let mut buf = pool.get();
    loop {
        if budget == Some(0) {
            // The cap was reached exactly: propagate end of stream to the
            // destination and refuse further input from the source.
            src.close_read();
            let closed = deadline_io(&mut delay, dst.close()).await;
            if let Err(e) = closed {
                src.reset();
                dst.reset();
                return Err(e);
            }
            return Ok(total);
        }

        let max = cap(buf.len(), budget);
        let read = deadline_io(&mut delay, src.read(&mut buf[..max])).await;
        let n = match read {
            Ok(n) => n,
            Err(e) => {
                src.reset();
                dst.reset();
                return Err(e);
            }
        };

        if n == 0 {
            // Clean end of stream: propagate the half-close.
            let closed = deadline_io(&mut delay, dst.close()).await;
            if let Err(e) = closed {
                src.reset();
                dst.reset();
                return Err(e);
            }
            return Ok(total);
        }

        // A short write surfaces as `WriteZero` and is fatal.
        let written = deadline_io(&mut delay, dst.write_all(&buf[..n])).await;
        if let Err(e) = written {
            src.reset();
            dst.reset();
            return Err(e);
        }
        consume(&mut budget, n);
        total += n as u64;
        metrics.bytes_transferred(n as u64);
    }
}

fn cap(len: usize, budget: Option<u64>) -> usize {
    match budget {
        Some(budget) if (len as u64) > budget => budget as usize,
        _ => len,
    }
}

fn consume(budget: &mut Option<u64>, n: usize) {
    if let Some(budget) = budget {
        *budget -= n as u64;
    }
}

/// Runs `io` while `delay`, if any, keeps ticking. The deadline spans the
/// whole circuit, not a single operation.
async fn deadline_io<F, T>(delay: &mut Option<Delay>, io: F) -> io::Result<T>
where
    F: Future<Output = io::Result<T>> + Unpin,
{
    match delay {
        Some(delay) => match future::select(io, delay).await {
            Either::Left((result, _)) => result,
            Either::Right(((), _)) => Err(io::Error::new(
                io::ErrorKind::TimedOut,
                "circuit deadline reached",
            )),
        },
        None => io.await,
    }
}
