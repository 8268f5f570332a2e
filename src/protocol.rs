use std::fmt::Display;

use anyhow::anyhow;
use bytes::{BufMut, Bytes, BytesMut};

use crate::chunked_buffer::ChunkedBuffer;

/// BEP 3 transfer unit. Pieces are requested in blocks of this size; only
/// the tail block of a piece may be shorter.
pub const BLOCK_LENGTH: u32 = 16 * 1024;

/// Largest frame we accept. PIECE frames are bounded by the block size;
/// everything else is far smaller except BITFIELD, which is bounded by the
/// piece count a torrent can realistically have.
const MAX_FRAME: usize = 1 << 17;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Block {
    pub piece: u32,
    pub offset: u32,
    pub length: u32,
}

impl Display for Block {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Block in piece {} with offset {} and length {}",
            self.piece, self.offset, self.length
        )
    }
}

/// A full protocol message as we send it, or as parsed for everything but
/// PIECE payloads (those stay in the receive buffer, see [`Frame`]).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerMessage {
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have { index: u32 },
    Bitfield { payload: Bytes },
    Request(Block),
    Piece { index: u32, begin: u32, block: Bytes },
    Cancel(Block),
    Port { port: u16 },
}

impl Display for PeerMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PeerMessage::KeepAlive => write!(f, "KeepAlive"),
            PeerMessage::Choke => write!(f, "Choke"),
            PeerMessage::Unchoke => write!(f, "Unchoke"),
            PeerMessage::Interested => write!(f, "Interested"),
            PeerMessage::NotInterested => write!(f, "NotInterested"),
            PeerMessage::Have { index } => write!(f, "Have {index}"),
            PeerMessage::Bitfield { payload } => {
                write!(f, "Bitfield with length {}", payload.len())
            }
            PeerMessage::Request(block) => write!(f, "Request for {block}"),
            PeerMessage::Piece { index, begin, block } => write!(
                f,
                "Block for piece {index} with offset {begin} and length {}",
                block.len()
            ),
            PeerMessage::Cancel(block) => write!(f, "Cancel for {block}"),
            PeerMessage::Port { port } => write!(f, "Port {port}"),
        }
    }
}

const CHOKE: u8 = 0;
const UNCHOKE: u8 = 1;
const INTERESTED: u8 = 2;
const NOT_INTERESTED: u8 = 3;
const HAVE: u8 = 4;
const BITFIELD: u8 = 5;
const REQUEST: u8 = 6;
const PIECE: u8 = 7;
const CANCEL: u8 = 8;
const PORT: u8 = 9;

impl PeerMessage {
    /// Append the framed message (length prefix + id + payload) to `dst`.
    pub fn write_frame(&self, dst: &mut BytesMut) {
        match self {
            PeerMessage::KeepAlive => dst.put_u32(0),
            PeerMessage::Choke => Self::write_plain(dst, CHOKE),
            PeerMessage::Unchoke => Self::write_plain(dst, UNCHOKE),
            PeerMessage::Interested => Self::write_plain(dst, INTERESTED),
            PeerMessage::NotInterested => Self::write_plain(dst, NOT_INTERESTED),
            PeerMessage::Have { index } => {
                dst.put_u32(1 + 4);
                dst.put_u8(HAVE);
                dst.put_u32(*index);
            }
            PeerMessage::Bitfield { payload } => {
                dst.put_u32(1 + payload.len() as u32);
                dst.put_u8(BITFIELD);
                dst.extend_from_slice(payload);
            }
            PeerMessage::Request(block) => Self::write_block(dst, REQUEST, block),
            PeerMessage::Piece { index, begin, block } => {
                dst.put_u32(1 + 4 + 4 + block.len() as u32);
                dst.put_u8(PIECE);
                dst.put_u32(*index);
                dst.put_u32(*begin);
                dst.extend_from_slice(block);
            }
            PeerMessage::Cancel(block) => Self::write_block(dst, CANCEL, block),
            PeerMessage::Port { port } => {
                dst.put_u32(1 + 2);
                dst.put_u8(PORT);
                dst.put_u16(*port);
            }
        }
    }

    fn write_plain(dst: &mut BytesMut, id: u8) {
        dst.put_u32(1);
        dst.put_u8(id);
    }

    fn write_block(dst: &mut BytesMut, id: u8, block: &Block) {
        dst.put_u32(1 + 4 + 4 + 4);
        dst.put_u8(id);
        dst.put_u32(block.piece);
        dst.put_u32(block.offset);
        dst.put_u32(block.length);
    }
}

/// One parsed frame from a receive buffer. PIECE payloads are not copied:
/// the handler reads them straight out of the buffer via `data_offset` and
/// discards `frame_len` afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Message(PeerMessage),
    PieceBlock {
        index: u32,
        begin: u32,
        data_offset: usize,
        data_len: usize,
    },
}

/// Peek the next frame without consuming it. `Ok(None)` means the frame is
/// not fully buffered yet; the caller discards `frame_len` on success.
pub fn peek_frame(buf: &ChunkedBuffer) -> anyhow::Result<Option<(Frame, usize)>> {
    let Some(length) = buf.peek_u32_be(0) else {
        return Ok(None);
    };
    let length = length as usize;
    if length == 0 {
        return Ok(Some((Frame::Message(PeerMessage::KeepAlive), 4)));
    }
    if length > MAX_FRAME {
        return Err(anyhow!("frame length {length} is higher than allowed {MAX_FRAME}"));
    }
    let frame_len = 4 + length;
    if buf.len() < frame_len {
        return Ok(None);
    }
    let id = buf.peek_byte(4).expect("length was checked");
    let payload_len = length - 1;
    let read_u32 = |offset: usize| -> anyhow::Result<u32> {
        buf.peek_u32_be(5 + offset)
            .ok_or_else(|| anyhow!("frame payload is truncated"))
    };
    let read_block = || -> anyhow::Result<Block> {
        anyhow::ensure!(payload_len == 12, "expected 12 payload bytes, got {payload_len}");
        Ok(Block {
            piece: read_u32(0)?,
            offset: read_u32(4)?,
            length: read_u32(8)?,
        })
    };
    let expect_empty = |message: PeerMessage| -> anyhow::Result<Frame> {
        anyhow::ensure!(payload_len == 0, "{message} must carry no payload");
        Ok(Frame::Message(message))
    };
    let frame = match id {
        CHOKE => expect_empty(PeerMessage::Choke)?,
        UNCHOKE => expect_empty(PeerMessage::Unchoke)?,
        INTERESTED => expect_empty(PeerMessage::Interested)?,
        NOT_INTERESTED => expect_empty(PeerMessage::NotInterested)?,
        HAVE => {
            anyhow::ensure!(payload_len == 4, "HAVE must carry 4 payload bytes");
            Frame::Message(PeerMessage::Have { index: read_u32(0)? })
        }
        BITFIELD => {
            let payload = buf
                .peek_bytes(5, payload_len)
                .ok_or_else(|| anyhow!("bitfield payload is truncated"))?;
            Frame::Message(PeerMessage::Bitfield { payload })
        }
        REQUEST => Frame::Message(PeerMessage::Request(read_block()?)),
        PIECE => {
            anyhow::ensure!(payload_len >= 8, "PIECE must carry index and begin");
            Frame::PieceBlock {
                index: read_u32(0)?,
                begin: read_u32(4)?,
                data_offset: 13,
                data_len: payload_len - 8,
            }
        }
        CANCEL => Frame::Message(PeerMessage::Cancel(read_block()?)),
        PORT => {
            anyhow::ensure!(payload_len == 2, "PORT must carry 2 payload bytes");
            let port = ((buf.peek_byte(5).unwrap() as u16) << 8) | buf.peek_byte(6).unwrap() as u16;
            Frame::Message(PeerMessage::Port { port })
        }
        t => return Err(anyhow!("unsupported message id: {t}")),
    };
    Ok(Some((frame, frame_len)))
}

#[cfg(test)]
mod tests {
    use bytes::{Bytes, BytesMut};

    use crate::chunked_buffer::ChunkedBuffer;

    use super::{peek_frame, Block, Frame, PeerMessage};

    fn frame_of(msg: &PeerMessage) -> ChunkedBuffer {
        let mut bytes = BytesMut::new();
        msg.write_frame(&mut bytes);
        let mut buf = ChunkedBuffer::new();
        buf.push(bytes.freeze());
        buf
    }

    #[test]
    fn encode_then_parse_control_messages() {
        let messages = [
            PeerMessage::KeepAlive,
            PeerMessage::Choke,
            PeerMessage::Unchoke,
            PeerMessage::Interested,
            PeerMessage::NotInterested,
            PeerMessage::Have { index: 123 },
            PeerMessage::Bitfield {
                payload: Bytes::from_static(&[0b10100000]),
            },
            PeerMessage::Request(Block {
                piece: 22,
                offset: 100,
                length: 200,
            }),
            PeerMessage::Cancel(Block {
                piece: 22,
                offset: 100,
                length: 200,
            }),
            PeerMessage::Port { port: 6881 },
        ];
        for msg in messages {
            let buf = frame_of(&msg);
            let (frame, frame_len) = peek_frame(&buf).unwrap().unwrap();
            assert_eq!(frame_len, buf.len());
            assert_eq!(frame, Frame::Message(msg));
        }
    }

    #[test]
    fn piece_payload_stays_in_buffer() {
        let block = Bytes::from_static(&[9, 8, 7, 6]);
        let buf = frame_of(&PeerMessage::Piece {
            index: 3,
            begin: 16384,
            block: block.clone(),
        });
        let (frame, frame_len) = peek_frame(&buf).unwrap().unwrap();
        let Frame::PieceBlock {
            index,
            begin,
            data_offset,
            data_len,
        } = frame
        else {
            panic!("expected a piece block");
        };
        assert_eq!((index, begin, data_len), (3, 16384, 4));
        assert_eq!(frame_len, 4 + 9 + 4);
        let mut out = [0u8; 4];
        buf.copy_out(data_offset, &mut out).unwrap();
        assert_eq!(&out, block.as_ref());
    }

    #[test]
    fn incomplete_frames_wait_for_more_bytes() {
        let mut full = BytesMut::new();
        PeerMessage::Have { index: 9 }.write_frame(&mut full);
        let full = full.freeze();
        for cut in 0..full.len() {
            let mut buf = ChunkedBuffer::new();
            buf.push(full.slice(..cut));
            assert!(peek_frame(&buf).unwrap().is_none(), "cut at {cut}");
        }
    }

    #[test]
    fn malformed_frames_are_rejected() {
        // CHOKE with a stray payload byte
        let mut buf = ChunkedBuffer::new();
        buf.push(Bytes::from_static(&[0, 0, 0, 2, 0, 0xaa]));
        assert!(peek_frame(&buf).is_err());
        // absurd length prefix
        let mut buf = ChunkedBuffer::new();
        buf.push(Bytes::from_static(&[0xff, 0xff, 0xff, 0xff]));
        assert!(peek_frame(&buf).is_err());
        // unknown id
        let mut buf = ChunkedBuffer::new();
        buf.push(Bytes::from_static(&[0, 0, 0, 1, 42]));
        assert!(peek_frame(&buf).is_err());
    }

    #[test]
    fn parses_frames_split_across_segments() {
        let mut bytes = BytesMut::new();
        PeerMessage::Request(Block {
            piece: 1,
            offset: 2,
            length: 3,
        })
        .write_frame(&mut bytes);
        let bytes = bytes.freeze();
        let mut buf = ChunkedBuffer::new();
        for chunk in bytes.chunks(3) {
            buf.push(Bytes::copy_from_slice(chunk));
        }
        let (frame, _) = peek_frame(&buf).unwrap().unwrap();
        assert_eq!(
            frame,
            Frame::Message(PeerMessage::Request(Block {
                piece: 1,
                offset: 2,
                length: 3,
            }))
        );
    }
}
