//! Message encoding for the simulated cluster, a thin wrapper of
//! [prost](https://docs.rs/prost/0.6.1/prost/).
//!
//! Every payload that crosses the wire or lands in a log entry or
//! snapshot goes through `encode`/`decode`, so the whole system shares a
//! single, self-describing format.

/// Anything that can travel through the codec.
pub trait Message: prost::Message + Default {}
impl<T: prost::Message + Default> Message for T {}

/// A message encoding error.
pub type EncodeError = prost::EncodeError;
/// A message decoding error.
pub type DecodeError = prost::DecodeError;

/// Appends the encoded form of `message` to `buf`.
pub fn encode<M: Message>(message: &M, buf: &mut Vec<u8>) -> Result<(), EncodeError> {
    buf.reserve(message.encoded_len());
    message.encode(buf)?;
    Ok(())
}

/// Decodes a message from the whole buffer.
pub fn decode<M: Message>(buf: &[u8]) -> Result<M, DecodeError> {
    M::decode(buf)
}
