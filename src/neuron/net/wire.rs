use core::fmt;

use async_compression::tokio::write::{ZstdDecoder, ZstdEncoder};
use byteorder::{ByteOrder, LittleEndian};
use rkyv::{
    de::deserializers::SharedDeserializeMap,
    ser::serializers::AllocSerializer,
    validation::validators::DefaultValidator,
    AlignedVec, Archive, CheckBytes, Deserialize, Serialize,
};
use tokio::io::AsyncWriteExt;

use super::error::Error;
use crate::neuron::hex::HexDisplayExt;

/// Hard ceiling on a single frame, before and after compression.
pub const MAX_FRAME_BYTES: u32 = 64 * 1024 * 1024;

/// 256-bit content digest identifying one forward pass through the mesh.
///
/// The originator computes it over its own identity and the payload it is
/// about to send; everyone downstream carries it verbatim. A node receiving
/// an id it has already served answers from its cache instead of recursing
/// again, which is what keeps cyclic peer graphs from spiralling.
#[derive(
    Archive, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash,
)]
#[archive(check_bytes)]
pub struct MessageId(pub [u8; 32]);

impl MessageId {
    /// Digest of `identity_bytes || payload.canonical_bytes()`.
    pub fn digest(identity: &str, payload: &Tensor) -> Self {
        let mut hasher = blake3::Hasher::new();
        hasher.update(identity.as_bytes());
        hasher.update(&payload.canonical_bytes());
        Self(*hasher.finalize().as_bytes())
    }
}

impl AsRef<[u8]> for MessageId {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.hex())
    }
}

impl fmt::Debug for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self)
    }
}

/// Dense row-major f32 matrix, the only payload shape on the wire.
#[derive(Archive, Serialize, Deserialize, Clone, Debug, PartialEq)]
#[archive(check_bytes)]
pub struct Tensor {
    pub rows: u32,
    pub cols: u32,
    pub data: Vec<f32>,
}

impl Tensor {
    pub fn new(rows: u32, cols: u32, data: Vec<f32>) -> Self {
        Self { rows, cols, data }
    }

    pub fn zeros(rows: u32, cols: u32) -> Self {
        Self {
            rows,
            cols,
            data: vec![0.0; rows as usize * cols as usize],
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// A tensor is well formed when its buffer matches its header.
    pub fn well_formed(&self) -> bool {
        self.data.len() as u64 == self.rows as u64 * self.cols as u64
    }

    /// Canonical byte encoding: varint element count, row/col header in
    /// little-endian, then the f32 words in little-endian. This is the blob
    /// the message digest covers, so it must stay stable across versions.
    pub fn canonical_bytes(&self) -> Vec<u8> {
        let mut varint_buf = unsigned_varint::encode::usize_buffer();
        let prefix =
            unsigned_varint::encode::usize(self.data.len(), &mut varint_buf);
        let mut buf =
            Vec::with_capacity(prefix.len() + 8 + self.data.len() * 4);
        buf.extend_from_slice(prefix);
        buf.extend_from_slice(&self.rows.to_le_bytes());
        buf.extend_from_slice(&self.cols.to_le_bytes());
        let mut words = vec![0u8; self.data.len() * 4];
        LittleEndian::write_f32_into(&self.data, &mut words);
        buf.extend_from_slice(&words);
        buf
    }
}

/// One RPC request. Every request carries the caller's identity and the
/// message id of the pass it belongs to.
#[derive(Archive, Serialize, Deserialize, Clone, Debug, PartialEq)]
#[archive(check_bytes)]
pub enum Request {
    /// Forward pass: transform this payload.
    Spike {
        sender: String,
        message_id: MessageId,
        payload: Tensor,
    },
    /// Backward pass: a gradient for an earlier spike with this id.
    Grade {
        sender: String,
        message_id: MessageId,
        grad: Tensor,
    },
}

/// One RPC response.
#[derive(Archive, Serialize, Deserialize, Clone, Debug, PartialEq)]
#[archive(check_bytes)]
pub enum Response {
    Spike {
        responder: String,
        message_id: MessageId,
        payload: Tensor,
    },
    Grade {
        accepted: bool,
    },
    /// The remote failed to serve the request; `reason` is best-effort
    /// human-readable.
    Error {
        reason: String,
    },
}

/// Serializes and compresses one wire message. The result still needs the
/// length prefix the streams add.
pub async fn encode_frame<T>(msg: &T) -> Result<Vec<u8>, Error>
where
    T: Serialize<AllocSerializer<1024>>,
{
    let bytes = rkyv::to_bytes::<_, 1024>(msg)
        .map_err(|_| Error::CouldNotEncodeMessage)?;
    let mut encoder = ZstdEncoder::new(Vec::new());
    encoder.write_all(&bytes).await?;
    encoder.shutdown().await?;
    let frame = encoder.into_inner();
    if frame.len() > MAX_FRAME_BYTES as usize {
        return Err(Error::MessageLengthOverflowed);
    }
    Ok(frame)
}

/// Decompresses and deserializes one wire message, validating the archived
/// bytes before touching them.
pub async fn decode_frame<T>(frame: &[u8]) -> Result<T, Error>
where
    T: Archive,
    for<'a> <T as Archive>::Archived: CheckBytes<DefaultValidator<'a>>
        + Deserialize<T, SharedDeserializeMap>,
{
    let mut decoder = ZstdDecoder::new(Vec::new());
    decoder
        .write_all(frame)
        .await
        .map_err(|_| Error::CouldNotDecodeMessage)?;
    decoder
        .shutdown()
        .await
        .map_err(|_| Error::CouldNotDecodeMessage)?;
    let raw = decoder.into_inner();
    if raw.len() > MAX_FRAME_BYTES as usize {
        return Err(Error::MessageLengthOverflowed);
    }
    // rkyv validation assumes the buffer is aligned like the serializer's
    // output, which a plain Vec<u8> does not guarantee
    let mut aligned = AlignedVec::with_capacity(raw.len());
    aligned.extend_from_slice(&raw);
    rkyv::from_bytes::<T>(&aligned).map_err(|_| Error::CouldNotDecodeMessage)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload() -> Tensor {
        Tensor::new(1, 2, vec![1.0, 2.0])
    }

    #[test]
    fn digest_is_deterministic() {
        let a = MessageId::digest("A", &payload());
        let b = MessageId::digest("A", &payload());
        assert_eq!(a, b);
    }

    #[test]
    fn digest_separates_sender_and_payload() {
        let base = MessageId::digest("A", &payload());
        assert_ne!(base, MessageId::digest("B", &payload()));
        assert_ne!(
            base,
            MessageId::digest("A", &Tensor::new(1, 2, vec![1.0, 2.5]))
        );
        assert_ne!(
            base,
            MessageId::digest("A", &Tensor::new(2, 1, vec![1.0, 2.0]))
        );
    }

    #[test]
    fn canonical_bytes_layout() {
        let t = payload();
        let bytes = t.canonical_bytes();
        // 2 elements fits a single varint byte
        assert_eq!(bytes[0], 2);
        assert_eq!(&bytes[1..5], &1u32.to_le_bytes());
        assert_eq!(&bytes[5..9], &2u32.to_le_bytes());
        assert_eq!(bytes.len(), 1 + 8 + 8);
        assert_eq!(LittleEndian::read_f32(&bytes[9..13]), 1.0);
        assert_eq!(LittleEndian::read_f32(&bytes[13..17]), 2.0);
    }

    #[test]
    fn well_formed_checks_header_against_buffer() {
        assert!(payload().well_formed());
        assert!(Tensor::zeros(3, 4).well_formed());
        assert!(!Tensor::new(2, 2, vec![0.0; 3]).well_formed());
    }

    #[tokio::test]
    async fn frame_roundtrip() {
        let req = Request::Spike {
            sender: "A".into(),
            message_id: MessageId::digest("A", &payload()),
            payload: payload(),
        };
        let frame = encode_frame(&req).await.unwrap();
        let back: Request = decode_frame(&frame).await.unwrap();
        assert_eq!(back, req);
    }

    #[tokio::test]
    async fn garbage_frame_is_rejected() {
        let res = decode_frame::<Response>(b"not a frame at all").await;
        assert!(matches!(res, Err(Error::CouldNotDecodeMessage)));
    }
}
