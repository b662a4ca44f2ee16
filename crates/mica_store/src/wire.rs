//! Versioned wire codec for peer and proxy sockets.
//!
//! Every frame is a length-delimited payload whose first byte is the wire
//! version; the rest is a postcard serialization of the record. The same
//! codec carries `Message` on the peer mesh and `ClientCommand`/
//! `ClientReply` on proxy connections.

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio_util::codec::LengthDelimitedCodec;

pub const WIRE_VERSION: u8 = 1;

const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// The framing codec shared by every socket in the system.
pub fn codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .max_frame_length(MAX_FRAME_LEN)
        .new_codec()
}

pub fn encode<T: Serialize>(value: &T) -> anyhow::Result<Bytes> {
    let payload = postcard::to_allocvec(value)?;
    let mut out = Vec::with_capacity(payload.len() + 1);
    out.push(WIRE_VERSION);
    out.extend_from_slice(&payload);
    Ok(Bytes::from(out))
}

pub fn decode<T: DeserializeOwned>(frame: &[u8]) -> anyhow::Result<T> {
    let (version, payload) = frame
        .split_first()
        .ok_or_else(|| anyhow::anyhow!("empty wire frame"))?;
    anyhow::ensure!(
        *version == WIRE_VERSION,
        "unsupported wire version {version}"
    );
    Ok(postcard::from_bytes(payload)?)
}
