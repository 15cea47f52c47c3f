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

use asynchronous_codec::{Decoder, Encoder};
use bytes::{Bytes, BytesMut};
use prost::Message;
use std::io;
use std::marker::PhantomData;
use thiserror::Error;
use unsigned_varint::codec::UviBytes;

/// Hard cap on the size of a single protocol message.
pub(crate) const MAX_MESSAGE_SIZE: usize = 4096;

/// Length-delimited codec for one protobuf message type: an unsigned varint
/// length prefix followed by the encoded body, with [`MAX_MESSAGE_SIZE`]
/// enforced on receive.
pub(crate) struct MessageCodec<M> {
    uvi: UviBytes<Bytes>,
    _marker: PhantomData<M>,
}

impl<M> MessageCodec<M> {
    pub(crate) fn new() -> Self {
        let mut uvi = UviBytes::default();
        uvi.set_max_len(MAX_MESSAGE_SIZE);
        MessageCodec {
            uvi,
            _marker: PhantomData,
        }
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("failed to decode message: {0}")]
    Decode(#[from] prost::DecodeError),
}

impl<M: Message + Default> Decoder for MessageCodec<M> {
    type Item = M;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.uvi.decode(src)? {
            Some(bytes) => Ok(Some(M::decode(bytes)?)),
            None => Ok(None),
        }
    }
}

impl<M: Message> Encoder for MessageCodec<M> {
    type Item = M;
    type Error = Error;

    fn encode(&mut self, item: Self::Item, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let mut buf = Vec::with_capacity(item.encoded_len());
        item.encode(&mut buf)
            .expect("Vec provides capacity as needed");
        self.uvi.encode(Bytes::from(buf), dst)?;
        Ok(())
    }
}
