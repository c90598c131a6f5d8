//! Wire protocol between clients and the relay.
//!
//! Frames are JSON documents carried with a 4-byte big-endian length
//! prefix over a single bidirectional QUIC stream per client.

use std::io;

use bytes::{Buf, BufMut, BytesMut};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::warn;

use pqchat_crypto::{Delivery, EnvelopeRecord, Identity, PublicKey};

/// ALPN protocol identifier.
pub const ALPN: &[u8] = b"pqchat/1";

/// Default maximum frame size (256KB). History responses dominate.
pub const MAX_FRAME_SIZE: usize = 256 * 1024;

/// Smallest frame limit either side accepts in its configuration.
pub const MIN_FRAME_SIZE: usize = 16 * 1024;

/// QUIC application close code for a connection turned away at the handshake.
/// The close reason carries the same text as the `rejected` frame.
pub const REJECTED_CLOSE_CODE: u32 = 0x10;

/// Largest message plaintext accepted under a given frame limit.
///
/// A stored envelope carries the message twice in base64, so a quarter of
/// the limit keeps every history record small enough for a frame of its own.
pub fn max_plaintext_len(max_frame_size: usize) -> usize {
    max_frame_size / 4
}

/// Frames sent by a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    /// Must be the first frame on a connection.
    Hello {
        #[serde(default)]
        token: Option<String>,
    },
    /// Send a message. The sender is always the authenticated identity.
    Send { receiver: Identity, plaintext: String },
    /// Publish the caller's own KEM public key.
    RegisterKey { public_key: PublicKey },
    /// Fetch the conversation between the caller and `peer`.
    History { peer: Identity },
}

/// Frames sent by the relay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    Welcome { identity: Identity },
    Rejected { reason: String },
    Deliver { delivery: Delivery },
    /// One page of a history reply, oldest first. `more` is set on every
    /// page but the last.
    History {
        peer: Identity,
        envelopes: Vec<EnvelopeRecord>,
        #[serde(default)]
        more: bool,
    },
    KeyRegistered,
    Error { message: String },
}

#[derive(Debug, Error)]
pub enum FramingError {
    #[error("frame too large: {0} bytes (max: {1})")]
    TooLarge(usize, usize),

    #[error("invalid frame: {0}")]
    InvalidFormat(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

/// Split a history reply into pages that each encode within `max_frame_size`.
///
/// Always yields at least one frame. A record too large to fit any frame on
/// its own is left out and logged.
pub fn history_frames(peer: &Identity, envelopes: Vec<EnvelopeRecord>, max_frame_size: usize) -> Vec<ServerFrame> {
    let empty = ServerFrame::History {
        peer: peer.clone(),
        envelopes: Vec::new(),
        more: false,
    };
    let overhead = serde_json::to_vec(&empty).map(|b| b.len()).unwrap_or(max_frame_size);
    let budget = max_frame_size.saturating_sub(overhead);

    let mut pages: Vec<Vec<EnvelopeRecord>> = Vec::new();
    let mut current = Vec::new();
    let mut used = 0;
    for record in envelopes {
        let size = serde_json::to_vec(&record).map(|b| b.len()).unwrap_or(usize::MAX);
        if size > budget {
            warn!(id = %record.id, size, max_frame_size, "history record exceeds frame size, omitted");
            continue;
        }
        // records after the first are preceded by a comma
        if !current.is_empty() && used + 1 + size > budget {
            pages.push(std::mem::take(&mut current));
            used = 0;
        }
        used += if current.is_empty() { size } else { size + 1 };
        current.push(record);
    }
    pages.push(current);

    let last = pages.len() - 1;
    pages
        .into_iter()
        .enumerate()
        .map(|(i, envelopes)| ServerFrame::History {
            peer: peer.clone(),
            envelopes,
            more: i < last,
        })
        .collect()
}

/// Length-prefixed JSON frame codec.
#[derive(Debug, Clone, Copy)]
pub struct FrameCodec {
    max_frame_size: usize,
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new(MAX_FRAME_SIZE)
    }
}

impl FrameCodec {
    pub fn new(max_frame_size: usize) -> Self {
        Self { max_frame_size }
    }

    pub fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }

    /// Format: length (4 bytes BE) || json
    pub fn encode<T: Serialize>(&self, frame: &T) -> Result<Vec<u8>, FramingError> {
        let body = serde_json::to_vec(frame)?;
        if body.len() > self.max_frame_size {
            return Err(FramingError::TooLarge(body.len(), self.max_frame_size));
        }

        let mut encoded = Vec::with_capacity(4 + body.len());
        encoded.put_u32(body.len() as u32);
        encoded.extend_from_slice(&body);
        Ok(encoded)
    }

    /// Streaming decoder for partial reads.
    ///
    /// Returns `Some(frame)` once a complete frame is buffered.
    pub fn decode_stream<T: DeserializeOwned>(
        &self,
        buf: &mut BytesMut,
    ) -> Result<Option<T>, FramingError> {
        if buf.len() < 4 {
            return Ok(None);
        }

        let len = {
            let mut len_buf = &buf[..4];
            len_buf.get_u32() as usize
        };

        if len > self.max_frame_size {
            return Err(FramingError::TooLarge(len, self.max_frame_size));
        }

        if buf.len() < 4 + len {
            return Ok(None);
        }

        buf.advance(4);
        let body = buf.split_to(len);
        Ok(Some(serde_json::from_slice(&body)?))
    }

    /// Read one frame. `Ok(None)` means the peer finished the stream.
    pub async fn read_frame<R, T>(&self, reader: &mut R) -> Result<Option<T>, FramingError>
    where
        R: AsyncRead + Unpin,
        T: DeserializeOwned,
    {
        let mut len_buf = [0u8; 4];
        match reader.read_exact(&mut len_buf).await {
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        }

        let len = u32::from_be_bytes(len_buf) as usize;
        if len > self.max_frame_size {
            return Err(FramingError::TooLarge(len, self.max_frame_size));
        }

        let mut body = vec![0u8; len];
        reader.read_exact(&mut body).await?;
        Ok(Some(serde_json::from_slice(&body)?))
    }

    pub async fn write_frame<W, T>(&self, writer: &mut W, frame: &T) -> Result<(), FramingError>
    where
        W: AsyncWrite + Unpin,
        T: Serialize,
    {
        let encoded = self.encode(frame)?;
        writer.write_all(&encoded).await?;
        writer.flush().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_client_frame_json_shape() {
        let frame = ClientFrame::Send {
            receiver: Identity::parse("bob").unwrap(),
            plaintext: "hi".to_string(),
        };
        let json = serde_json::to_value(&frame).unwrap();
        assert_eq!(json["type"], "send");
        assert_eq!(json["receiver"], "bob");
    }

    #[test]
    fn test_embedded_sender_field_is_ignored() {
        let raw = r#"{"type":"send","receiver":"bob","plaintext":"hi","sender":"mallory"}"#;
        let frame: ClientFrame = serde_json::from_str(raw).unwrap();
        assert_eq!(
            frame,
            ClientFrame::Send {
                receiver: Identity::parse("bob").unwrap(),
                plaintext: "hi".to_string(),
            }
        );
    }

    #[test]
    fn test_hello_without_token() {
        let frame: ClientFrame = serde_json::from_str(r#"{"type":"hello"}"#).unwrap();
        assert_eq!(frame, ClientFrame::Hello { token: None });
    }

    #[test]
    fn test_too_large() {
        let codec = FrameCodec::new(16);
        let frame = ServerFrame::Error {
            message: "x".repeat(64),
        };
        assert!(matches!(codec.encode(&frame), Err(FramingError::TooLarge(_, 16))));
    }

    #[test]
    fn test_streaming_decoder() {
        let codec = FrameCodec::default();
        let encoded = codec.encode(&ServerFrame::KeyRegistered).unwrap();

        let mut buf = BytesMut::from(&encoded[..2]);
        assert!(codec.decode_stream::<ServerFrame>(&mut buf).unwrap().is_none());

        buf.extend_from_slice(&encoded[2..]);
        let decoded: ServerFrame = codec.decode_stream(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, ServerFrame::KeyRegistered);
        assert!(buf.is_empty());
    }

    #[tokio::test]
    async fn test_async_read_write() {
        let codec = FrameCodec::default();
        let (mut a, mut b) = tokio::io::duplex(1024);

        let frames = vec![
            ClientFrame::Hello { token: Some("t".into()) },
            ClientFrame::History { peer: Identity::parse("bob").unwrap() },
        ];
        for f in &frames {
            codec.write_frame(&mut a, f).await.unwrap();
        }
        drop(a);

        let mut got = Vec::new();
        while let Some(frame) = codec.read_frame::<_, ClientFrame>(&mut b).await.unwrap() {
            got.push(frame);
        }
        assert_eq!(got, frames);
    }

    #[tokio::test]
    async fn test_oversized_length_prefix_rejected() {
        let codec = FrameCodec::new(8);
        let (mut a, mut b) = tokio::io::duplex(64);
        a.write_all(&1000u32.to_be_bytes()).await.unwrap();
        let err = codec.read_frame::<_, ClientFrame>(&mut b).await.unwrap_err();
        assert!(matches!(err, FramingError::TooLarge(1000, 8)));
    }

    fn record(id: usize, payload_len: usize) -> EnvelopeRecord {
        EnvelopeRecord {
            id: format!("00000000-0000-4000-8000-{id:012}"),
            sender: "alice".to_string(),
            receiver: "bob".to_string(),
            receiver_ciphertext_kem: "k".repeat(64),
            receiver_ciphertext_aead: "a".repeat(payload_len),
            sender_ciphertext_kem: "k".repeat(64),
            sender_ciphertext_aead: "a".repeat(payload_len),
            nonce: "AAAAAAAAAAAAAAAA".to_string(),
            timestamp: "2026-01-01T00:00:00.000Z".to_string(),
        }
    }

    #[test]
    fn test_history_pages_fit_the_frame_limit() {
        let codec = FrameCodec::new(MIN_FRAME_SIZE);
        let bob = Identity::parse("bob").unwrap();
        let records: Vec<_> = (0..150).map(|i| record(i, 1500)).collect();

        let frames = history_frames(&bob, records.clone(), codec.max_frame_size());
        assert!(frames.len() > 1);

        let mut collected = Vec::new();
        for (i, frame) in frames.iter().enumerate() {
            codec.encode(frame).unwrap();
            match frame {
                ServerFrame::History { peer, envelopes, more } => {
                    assert_eq!(peer, &bob);
                    assert_eq!(*more, i + 1 < frames.len());
                    collected.extend(envelopes.iter().cloned());
                }
                other => panic!("unexpected frame {other:?}"),
            }
        }
        assert_eq!(collected, records);
    }

    #[test]
    fn test_empty_history_is_one_final_page() {
        let bob = Identity::parse("bob").unwrap();
        let frames = history_frames(&bob, Vec::new(), MAX_FRAME_SIZE);
        assert_eq!(
            frames,
            vec![ServerFrame::History {
                peer: bob,
                envelopes: Vec::new(),
                more: false,
            }]
        );
    }

    #[test]
    fn test_oversized_history_record_is_omitted() {
        let bob = Identity::parse("bob").unwrap();
        let records = vec![record(1, 10), record(2, MIN_FRAME_SIZE), record(3, 10)];
        let frames = history_frames(&bob, records, MIN_FRAME_SIZE);
        match frames.as_slice() {
            [ServerFrame::History { envelopes, more: false, .. }] => {
                let ids: Vec<_> = envelopes.iter().map(|r| r.id.clone()).collect();
                assert_eq!(ids, vec![record(1, 0).id, record(3, 0).id]);
            }
            other => panic!("unexpected frames {other:?}"),
        }
    }

    #[test]
    fn test_history_without_more_field_is_final() {
        let raw = r#"{"type":"history","peer":"bob","envelopes":[]}"#;
        let frame: ServerFrame = serde_json::from_str(raw).unwrap();
        assert!(matches!(frame, ServerFrame::History { more: false, .. }));
    }

    #[test]
    fn test_blank_identity_in_frame_is_rejected() {
        let raw = r#"{"type":"send","receiver":"  ","plaintext":"hi"}"#;
        assert!(serde_json::from_str::<ClientFrame>(raw).is_err());
    }

    proptest! {
        #[test]
        fn prop_framing_round_trip(text in "\\PC{0,512}", name in "[a-z]{1,16}") {
            let codec = FrameCodec::default();
            let frame = ClientFrame::Send {
                receiver: Identity::parse(name).unwrap(),
                plaintext: text,
            };
            let encoded = codec.encode(&frame).unwrap();
            let mut buf = BytesMut::from(&encoded[..]);
            let decoded: ClientFrame = codec.decode_stream(&mut buf).unwrap().unwrap();
            prop_assert_eq!(decoded, frame);
        }
    }
}
