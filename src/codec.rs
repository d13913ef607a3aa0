//! Codec plug-in contract
//!
//! Protocol implementations hand the orchestrator a codec per exchange: an
//! infallible `encode` for the request they built themselves, and a `decode`
//! that either matches a response or rejects the bytes. Rejection is how the
//! orchestrator skips datagrams meant for some other pending exchange.

use bytes::Bytes;
use std::fmt;
use std::marker::PhantomData;

/// Result of offering raw bytes to a codec
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decoded<R> {
    /// The bytes are a response to this exchange
    Matched(R),
    /// The bytes are malformed or answer something else
    Rejected,
}

impl<R> Decoded<R> {
    /// Convert a parser result, discarding the parse error
    pub fn from_result<E>(result: Result<R, E>) -> Self {
        match result {
            Ok(response) => Decoded::Matched(response),
            Err(_) => Decoded::Rejected,
        }
    }

    /// Whether the bytes were accepted
    pub fn is_matched(&self) -> bool {
        matches!(self, Decoded::Matched(_))
    }

    /// The accepted response, if any
    pub fn matched(self) -> Option<R> {
        match self {
            Decoded::Matched(response) => Some(response),
            Decoded::Rejected => None,
        }
    }
}

/// Conversion between a logical request/response pair and wire bytes
pub trait Codec {
    /// Logical request built by the caller
    type Request;
    /// Logical response produced from accepted bytes
    type Response;

    /// Serialize a request; never fails
    fn encode(&self, request: &Self::Request) -> Bytes;

    /// Parse bytes received from the peer
    fn decode(&self, bytes: &[u8]) -> Decoded<Self::Response>;
}

/// Codec built from a pair of closures
///
/// # Example
/// ```rust
/// use bytes::Bytes;
/// use portmap::codec::{Codec, Decoded, FnCodec};
///
/// let codec = FnCodec::new(
///     |n: &u32| Bytes::copy_from_slice(&n.to_be_bytes()),
///     |bytes: &[u8]| match <[u8; 4]>::try_from(bytes) {
///         Ok(raw) => Decoded::Matched(u32::from_be_bytes(raw)),
///         Err(_) => Decoded::Rejected,
///     },
/// );
///
/// let wire = codec.encode(&7);
/// assert_eq!(codec.decode(&wire), Decoded::Matched(7));
/// assert_eq!(codec.decode(b"xx"), Decoded::Rejected);
/// ```
pub struct FnCodec<Q, R, E, D> {
    encode: E,
    decode: D,
    _types: PhantomData<fn(&Q) -> R>,
}

impl<Q, R, E, D> FnCodec<Q, R, E, D>
where
    E: Fn(&Q) -> Bytes,
    D: Fn(&[u8]) -> Decoded<R>,
{
    /// Wrap an encode and a decode closure
    pub fn new(encode: E, decode: D) -> Self {
        Self {
            encode,
            decode,
            _types: PhantomData,
        }
    }
}

impl<Q, R, E: Clone, D: Clone> Clone for FnCodec<Q, R, E, D> {
    fn clone(&self) -> Self {
        Self {
            encode: self.encode.clone(),
            decode: self.decode.clone(),
            _types: PhantomData,
        }
    }
}

impl<Q, R, E, D> Codec for FnCodec<Q, R, E, D>
where
    E: Fn(&Q) -> Bytes,
    D: Fn(&[u8]) -> Decoded<R>,
{
    type Request = Q;
    type Response = R;

    fn encode(&self, request: &Q) -> Bytes {
        (self.encode)(request)
    }

    fn decode(&self, bytes: &[u8]) -> Decoded<R> {
        (self.decode)(bytes)
    }
}

impl<Q, R, E, D> fmt::Debug for FnCodec<Q, R, E, D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("FnCodec")
    }
}
