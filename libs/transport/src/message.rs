//! Framed Message Model
//!
//! A [`Message`] is a typed header plus an opaque byte body. The body is a
//! stack: [`Message::push`] appends the raw bytes of a fixed-layout value to
//! the end, [`Message::pop`] copies the last bytes back out and shrinks the
//! body. Values therefore come back in reverse push order:
//!
//! ```
//! use num_enum::{IntoPrimitive, TryFromPrimitive};
//! use transport::Message;
//!
//! #[repr(u32)]
//! #[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
//! enum Kind { Ping = 2 }
//!
//! let mut msg = Message::new(Kind::Ping);
//! msg.push(&1u32).push(&2u64);
//! assert_eq!(msg.pop::<u64>().unwrap(), 2);
//! assert_eq!(msg.pop::<u32>().unwrap(), 1);
//! assert!(msg.is_empty());
//! ```
//!
//! Only types implementing `zerocopy::AsBytes`/`FromBytes` can be pushed or
//! popped. Variable-length data goes through [`Message::push_bytes`] and
//! [`Message::push_str`].

use crate::connection::Connection;
use crate::error::{Result, TransportError};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use num_enum::TryFromPrimitive;
use std::fmt;
use std::mem::size_of;
use std::sync::Arc;
use zerocopy::{AsBytes, FromBytes};

/// Application-defined message type tag.
///
/// Transmitted as its underlying fixed-width integer. Any `num_enum` enum
/// deriving `IntoPrimitive` and `TryFromPrimitive` gets this for free.
pub trait MessageTag: Copy + Send + Sync + fmt::Debug + 'static {
    /// Integer representation written to the wire
    type Repr: AsBytes + FromBytes + Copy + fmt::Debug + Send + Sync + 'static;

    fn to_repr(self) -> Self::Repr;

    /// `None` when the integer does not name a known tag
    fn from_repr(repr: Self::Repr) -> Option<Self>;
}

impl<T> MessageTag for T
where
    T: TryFromPrimitive + Copy + Send + Sync + fmt::Debug + 'static,
    T::Primitive: From<T> + AsBytes + FromBytes + Send + Sync + 'static,
{
    type Repr = T::Primitive;

    fn to_repr(self) -> Self::Repr {
        T::Primitive::from(self)
    }

    fn from_repr(repr: Self::Repr) -> Option<Self> {
        T::try_from_primitive(repr).ok()
    }
}

/// Header sent in front of every frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageHeader<T: MessageTag> {
    pub id: T,
    pub size: u32,
}

impl<T: MessageTag> MessageHeader<T> {
    /// Encoded length: tag integer followed by the `u32` body size, no padding
    pub const LEN: usize = size_of::<T::Repr>() + size_of::<u32>();

    /// Encode in host-native byte order
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(Self::LEN);
        buf.put_slice(self.id.to_repr().as_bytes());
        buf.put_u32_ne(self.size);
        buf.freeze()
    }

    /// Decode a header previously produced by [`MessageHeader::encode`]
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() != Self::LEN {
            return Err(TransportError::protocol(format!(
                "Header must be {} bytes, got {}",
                Self::LEN,
                buf.len()
            )));
        }

        let (tag_bytes, mut size_bytes) = buf.split_at(size_of::<T::Repr>());
        let repr = T::Repr::read_from(tag_bytes)
            .ok_or_else(|| TransportError::protocol("Malformed message tag"))?;
        let id = T::from_repr(repr)
            .ok_or_else(|| TransportError::protocol(format!("Unknown message tag {:?}", repr)))?;

        Ok(Self {
            id,
            size: size_bytes.get_u32_ne(),
        })
    }
}

/// Typed message: header plus stack-encoded body
#[derive(Debug, Clone)]
pub struct Message<T: MessageTag> {
    header: MessageHeader<T>,
    body: Vec<u8>,
}

impl<T: MessageTag> Message<T> {
    /// Create an empty message with the given tag
    pub fn new(id: T) -> Self {
        Self {
            header: MessageHeader { id, size: 0 },
            body: Vec::new(),
        }
    }

    /// Rebuild a message from a decoded header and the body read after it
    pub(crate) fn from_parts(id: T, body: Vec<u8>) -> Self {
        let mut msg = Self {
            header: MessageHeader { id, size: 0 },
            body,
        };
        msg.sync_size();
        msg
    }

    pub fn id(&self) -> T {
        self.header.id
    }

    pub fn set_id(&mut self, id: T) {
        self.header.id = id;
    }

    pub fn header(&self) -> &MessageHeader<T> {
        &self.header
    }

    /// Body size as recorded in the header
    pub fn size(&self) -> u32 {
        self.header.size
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub fn is_empty(&self) -> bool {
        self.body.is_empty()
    }

    /// Append a fixed-layout value to the end of the body
    pub fn push<V: AsBytes>(&mut self, value: &V) -> &mut Self {
        self.body.extend_from_slice(value.as_bytes());
        self.sync_size();
        self
    }

    /// Remove the value stored in the last `size_of::<V>()` bytes of the body.
    ///
    /// The body is left untouched when it is too short.
    pub fn pop<V: FromBytes>(&mut self) -> Result<V> {
        let start = self.split_point(size_of::<V>())?;
        let value = V::read_from(&self.body[start..])
            .ok_or_else(|| TransportError::protocol("Failed to read value from body"))?;
        self.body.truncate(start);
        self.sync_size();
        Ok(value)
    }

    /// Append raw bytes. The reader must know `data.len()` to pop them.
    pub fn push_bytes(&mut self, data: &[u8]) -> &mut Self {
        self.body.extend_from_slice(data);
        self.sync_size();
        self
    }

    /// Remove the last `len` bytes of the body
    pub fn pop_bytes(&mut self, len: usize) -> Result<Vec<u8>> {
        let start = self.split_point(len)?;
        let data = self.body.split_off(start);
        self.sync_size();
        Ok(data)
    }

    /// Append a string followed by its `u32` byte length
    pub fn push_str(&mut self, value: &str) -> &mut Self {
        self.push_bytes(value.as_bytes());
        // Frames carry u32 sizes, so the length always fits.
        self.push(&(value.len() as u32))
    }

    /// Remove a string written by [`Message::push_str`]
    pub fn pop_string(&mut self) -> Result<String> {
        let len_start = self.split_point(size_of::<u32>())?;
        let len = u32::read_from(&self.body[len_start..])
            .ok_or_else(|| TransportError::protocol("Failed to read string length"))?
            as usize;
        if len > len_start {
            return Err(TransportError::body_underflow(
                len + size_of::<u32>(),
                self.body.len(),
            ));
        }

        let start = len_start - len;
        let value = std::str::from_utf8(&self.body[start..len_start])
            .map_err(|e| TransportError::protocol(format!("Invalid UTF-8 string: {}", e)))?
            .to_owned();
        self.body.truncate(start);
        self.sync_size();
        Ok(value)
    }

    fn split_point(&self, len: usize) -> Result<usize> {
        self.body
            .len()
            .checked_sub(len)
            .ok_or_else(|| TransportError::body_underflow(len, self.body.len()))
    }

    fn sync_size(&mut self) {
        self.header.size = self.body.len() as u32;
    }
}

impl<T: MessageTag> fmt::Display for Message<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ID: {:?} Size: {}", self.header.id.to_repr(), self.header.size)
    }
}

/// Message tagged with the connection it arrived on.
///
/// `remote` is `None` on the client side, where there is only one peer.
#[derive(Debug, Clone)]
pub struct OwnedMessage<T: MessageTag> {
    pub remote: Option<Arc<Connection<T>>>,
    pub msg: Message<T>,
}

impl<T: MessageTag> fmt::Display for OwnedMessage<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.msg, f)
    }
}
