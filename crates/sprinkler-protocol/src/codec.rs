//! Datagram codec.
//!
//! Wire format (big endian):
//!
//! ```text
//! magic:u32 | kind:u8 | body
//! Control body: version:u32 | total_blocks:u32 | block_size:u16 | file_len:u64 | summary:[u8;32] | status:u8
//! Data body:    version:u32 | symbol_id:u32 | payload:rest
//! ```
//!
//! One message per datagram, so the decoder consumes the whole buffer.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::messages::{Announcement, Message, MessageKind, PeerStatus, SymbolPacket};
use crate::{ContentSummary, ProtocolError, MAX_DATAGRAM_BYTES, PROTOCOL_MAGIC};

/// magic + kind.
const HEADER_SIZE: usize = 5;

const CONTROL_BODY_SIZE: usize = 4 + 4 + 2 + 8 + 32 + 1;

const DATA_BODY_HEADER_SIZE: usize = 4 + 4;

/// Bytes a data datagram spends on framing; the rest is symbol payload.
pub const DATA_OVERHEAD: usize = HEADER_SIZE + DATA_BODY_HEADER_SIZE;

/// Codec for framing Message values into single datagrams.
#[derive(Debug, Clone, Copy)]
pub struct DatagramCodec {
    max_datagram: usize,
}

impl DatagramCodec {
    pub fn new(max_datagram: usize) -> Self {
        Self { max_datagram }
    }
}

impl Default for DatagramCodec {
    fn default() -> Self {
        Self::new(MAX_DATAGRAM_BYTES)
    }
}

fn ensure(src: &BytesMut, need: usize) -> Result<(), ProtocolError> {
    if src.len() < need {
        return Err(ProtocolError::Truncated {
            need,
            have: src.len(),
        });
    }
    Ok(())
}

impl Decoder for DatagramCodec {
    type Item = Message;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.is_empty() {
            return Ok(None);
        }

        if src.len() > self.max_datagram {
            let size = src.len();
            src.clear();
            return Err(ProtocolError::DatagramTooLarge {
                size,
                max: self.max_datagram,
            });
        }

        ensure(src, HEADER_SIZE)?;
        let magic = src.get_u32();
        if magic != PROTOCOL_MAGIC {
            src.clear();
            return Err(ProtocolError::InvalidMagic {
                expected: PROTOCOL_MAGIC,
                got: magic,
            });
        }

        let message = match MessageKind::from_u8(src.get_u8())? {
            MessageKind::Control => {
                ensure(src, CONTROL_BODY_SIZE)?;
                let version = src.get_u32();
                let total_blocks = src.get_u32();
                let block_size = src.get_u16();
                let file_len = src.get_u64();
                let mut summary = [0u8; 32];
                src.copy_to_slice(&mut summary);
                let status = PeerStatus::from_u8(src.get_u8())?;
                Message::Control(Announcement {
                    version,
                    total_blocks,
                    block_size,
                    file_len,
                    summary: ContentSummary(summary),
                    status,
                })
            }
            MessageKind::Data => {
                ensure(src, DATA_BODY_HEADER_SIZE)?;
                let version = src.get_u32();
                let symbol_id = src.get_u32();
                let payload = src.split_to(src.len()).freeze();
                Message::Data(SymbolPacket {
                    version,
                    symbol_id,
                    payload,
                })
            }
        };

        // Anything trailing a control body is ignored.
        src.clear();
        Ok(Some(message))
    }
}

impl Encoder<Message> for DatagramCodec {
    type Error = ProtocolError;

    fn encode(&mut self, item: Message, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let size = match &item {
            Message::Control(_) => HEADER_SIZE + CONTROL_BODY_SIZE,
            Message::Data(d) => DATA_OVERHEAD + d.payload.len(),
        };
        if size > self.max_datagram {
            return Err(ProtocolError::DatagramTooLarge {
                size,
                max: self.max_datagram,
            });
        }

        dst.reserve(size);
        dst.put_u32(PROTOCOL_MAGIC);
        dst.put_u8(item.kind() as u8);
        match item {
            Message::Control(a) => {
                dst.put_u32(a.version);
                dst.put_u32(a.total_blocks);
                dst.put_u16(a.block_size);
                dst.put_u64(a.file_len);
                dst.put_slice(&a.summary.0);
                dst.put_u8(a.status.as_u8());
            }
            Message::Data(d) => {
                dst.put_u32(d.version);
                dst.put_u32(d.symbol_id);
                dst.put_slice(&d.payload);
            }
        }
        Ok(())
    }
}

/// Encode a message into a standalone datagram.
pub fn encode_datagram(message: Message, max_datagram: usize) -> Result<Bytes, ProtocolError> {
    let mut buf = BytesMut::new();
    DatagramCodec::new(max_datagram).encode(message, &mut buf)?;
    Ok(buf.freeze())
}

/// Decode one received datagram.
pub fn decode_datagram(datagram: &[u8], max_datagram: usize) -> Result<Message, ProtocolError> {
    let mut buf = BytesMut::from(datagram);
    DatagramCodec::new(max_datagram)
        .decode(&mut buf)
        .and_then(|m| {
            m.ok_or(ProtocolError::Truncated {
                need: HEADER_SIZE,
                have: 0,
            })
        })
        .map_err(|e| {
            tracing::trace!(len = datagram.len(), error = %e, "rejected datagram");
            e
        })
}
