//! Pluggable message codec.
//!
//! Framing is handled by [`protocol`](super::protocol); a codec only maps
//! the two message types to bytes and back. Both peers of a connection must
//! use the same codec.

use super::invocation::InvocationEnvelope;
use super::result::RpcResult;
use crate::Result;

/// Converts protocol messages to and from bytes.
///
/// Implementations must be lossless for `ApplicationError` payloads so a
/// remote failure reaches the caller unchanged.
pub trait Codec: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    fn encode_invocation(&self, envelope: &InvocationEnvelope) -> Result<Vec<u8>>;

    fn decode_invocation(&self, bytes: &[u8]) -> Result<InvocationEnvelope>;

    fn encode_result(&self, result: &RpcResult) -> Result<Vec<u8>>;

    fn decode_result(&self, bytes: &[u8]) -> Result<RpcResult>;
}

/// UTF-8 JSON codec (the default).
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl Codec for JsonCodec {
    fn name(&self) -> &'static str {
        "json"
    }

    fn encode_invocation(&self, envelope: &InvocationEnvelope) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(envelope)?)
    }

    fn decode_invocation(&self, bytes: &[u8]) -> Result<InvocationEnvelope> {
        Ok(serde_json::from_slice(bytes)?)
    }

    fn encode_result(&self, result: &RpcResult) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(result)?)
    }

    fn decode_result(&self, bytes: &[u8]) -> Result<RpcResult> {
        Ok(serde_json::from_slice(bytes)?)
    }
}
