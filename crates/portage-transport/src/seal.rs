//! Sealed-frame cipher layer.
//!
//! Wire format, one frame per codec item:
//!
//! ```text
//! [0..4]    ciphertext length including nonce (u32 BE)
//! [4..16]   random 96-bit nonce
//! [16..]    AES-256-GCM ciphertext + 16-byte tag
//! ```
//!
//! Plaintext per frame is capped at [`MAX_PLAINTEXT`] so the decoder can
//! bound its allocations; the encoder splits larger writes transparently.
//! A frame that fails authentication surfaces as `InvalidData`, which the
//! session layer treats as a dead connection.

use aes_gcm::aead::{Aead, AeadCore, OsRng};
use aes_gcm::{Aes256Gcm, Key, KeyInit, Nonce};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::StreamExt;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{Decoder, Encoder, Framed};
use tokio_util::io::{CopyToBytes, SinkWriter, StreamReader};

/// Maximum plaintext bytes carried by a single sealed frame.
pub const MAX_PLAINTEXT: usize = 64 * 1024;

const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;
const LEN_PREFIX: usize = 4;

/// Largest legal on-wire frame body (nonce + ciphertext + tag).
const MAX_SEALED: usize = NONCE_LEN + MAX_PLAINTEXT + TAG_LEN;

/// Symmetric codec sealing outbound frames and opening inbound ones.
pub struct SealedCodec {
    cipher: Aes256Gcm,
}

impl SealedCodec {
    pub fn new(key: &[u8; 32]) -> Self {
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
        Self { cipher }
    }

    fn seal_one(&self, plaintext: &[u8], dst: &mut BytesMut) -> std::io::Result<()> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, plaintext)
            .map_err(|_| std::io::Error::other("sealing frame failed"))?;

        let body_len = NONCE_LEN + ciphertext.len();
        dst.reserve(LEN_PREFIX + body_len);
        dst.put_u32(body_len as u32);
        dst.put_slice(&nonce);
        dst.put_slice(&ciphertext);
        Ok(())
    }
}

impl Encoder<Bytes> for SealedCodec {
    type Error = std::io::Error;

    fn encode(&mut self, item: Bytes, dst: &mut BytesMut) -> Result<(), Self::Error> {
        for chunk in item.chunks(MAX_PLAINTEXT) {
            self.seal_one(chunk, dst)?;
        }
        Ok(())
    }
}

impl Decoder for SealedCodec {
    type Item = Bytes;
    type Error = std::io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < LEN_PREFIX {
            return Ok(None);
        }
        let body_len = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;
        if body_len < NONCE_LEN + TAG_LEN || body_len > MAX_SEALED {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "sealed frame length out of bounds",
            ));
        }
        if src.len() < LEN_PREFIX + body_len {
            src.reserve(LEN_PREFIX + body_len - src.len());
            return Ok(None);
        }
        src.advance(LEN_PREFIX);
        let body = src.split_to(body_len);
        let nonce = Nonce::from_slice(&body[..NONCE_LEN]);
        let plaintext = self
            .cipher
            .decrypt(nonce, &body[NONCE_LEN..])
            .map_err(|_| {
                std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    "sealed frame failed authentication",
                )
            })?;
        Ok(Some(Bytes::from(plaintext)))
    }
}

/// Encrypted byte stream: `tokio::io::join` of the read and write halves of a
/// [`Framed`] sealed-codec transport.
pub type SecureStream<S> = tokio::io::Join<
    StreamReader<SplitStream<Framed<S, SealedCodec>>, Bytes>,
    SinkWriter<CopyToBytes<SplitSink<Framed<S, SealedCodec>, Bytes>>>,
>;

/// Wrap a raw byte stream in the sealed-frame layer.
pub fn secure<S>(io: S, key: &[u8; 32]) -> SecureStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let framed = Framed::new(io, SealedCodec::new(key));
    let (sink, stream) = framed.split();
    tokio::io::join(
        StreamReader::new(stream),
        SinkWriter::new(CopyToBytes::new(sink)),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::derive_key;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn round_trips_over_a_duplex_pipe() {
        let key = derive_key("round-trip").unwrap();
        let (a, b) = tokio::io::duplex(1024 * 1024);
        let mut alice = secure(a, &key);
        let mut bob = secure(b, &key);

        // A payload larger than one frame forces the encoder to split.
        let payload: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
        let expected = payload.clone();

        let writer = tokio::spawn(async move {
            alice.write_all(&payload).await.unwrap();
            alice.flush().await.unwrap();
            alice
        });

        let mut received = vec![0u8; expected.len()];
        bob.read_exact(&mut received).await.unwrap();
        writer.await.unwrap();
        assert_eq!(received, expected);
    }

    #[tokio::test]
    async fn wrong_key_fails_authentication() {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let mut alice = secure(a, &derive_key("right").unwrap());
        let mut bob = secure(b, &derive_key("wrong").unwrap());

        alice.write_all(b"hello").await.unwrap();
        alice.flush().await.unwrap();

        let mut buf = [0u8; 5];
        let err = bob.read_exact(&mut buf).await.unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::InvalidData);
    }

    #[test]
    fn oversized_length_prefix_is_rejected() {
        let key = derive_key("bounds").unwrap();
        let mut codec = SealedCodec::new(&key);
        let mut src = BytesMut::new();
        src.put_u32((MAX_SEALED + 1) as u32);
        src.put_slice(&[0u8; 64]);
        let err = codec.decode(&mut src).unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::InvalidData);
    }
}
