//! Frame header parsing and serialization (RFC 6455).
//!
//! Only the header travels through this module; payload bytes stay on the
//! wire and are drained by whichever handle owns the frame, so a slow
//! reader never buffers more than one frame's payload.

use bytes::{BufMut, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::{Error, Result};
use crate::protocol::OpCode;

/// Maximum payload size for control frames (RFC 6455).
pub const MAX_CONTROL_PAYLOAD: u64 = 125;

/// Maximum encoded header size: 2 base bytes, 8 extended-length bytes,
/// 4 mask-key bytes.
pub const MAX_HEADER_SIZE: usize = 14;

/// A WebSocket frame header.
///
/// ## Wire layout
///
/// ```text
///  0                   1                   2                   3
///  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
/// +-+-+-+-+-------+-+-------------+-------------------------------+
/// |F|R|R|R| opcode |M| Payload len |    Extended payload length    |
/// |I|S|S|S|  (4)   |A|     (7)     |             (16/64)           |
/// |N|V|V|V|       |S|             |   (if payload len==126/127)   |
/// | |1|2|3|       |K|             |                               |
/// +-+-+-+-+-------+-+-------------+-------------------------------+
/// |                         Masking key (if MASK set)             |
/// +---------------------------------------------------------------+
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Final fragment flag.
    pub fin: bool,
    /// Reserved bit 1. Must be 0 unless an extension is negotiated.
    pub rsv1: bool,
    /// Reserved bit 2. Must be 0 unless an extension is negotiated.
    pub rsv2: bool,
    /// Reserved bit 3. Must be 0 unless an extension is negotiated.
    pub rsv3: bool,
    /// Frame opcode.
    pub opcode: OpCode,
    /// Whether the payload is masked.
    pub masked: bool,
    /// Masking key; meaningful only when `masked` is set.
    pub mask_key: [u8; 4],
    /// Payload length in bytes.
    pub payload_len: u64,
}

impl FrameHeader {
    /// Create a data-direction header with everything but `fin` and
    /// `opcode` zeroed; the write path fills in masking and length.
    #[must_use]
    pub const fn new(fin: bool, opcode: OpCode) -> Self {
        Self {
            fin,
            rsv1: false,
            rsv2: false,
            rsv3: false,
            opcode,
            masked: false,
            mask_key: [0; 4],
            payload_len: 0,
        }
    }

    /// Read exactly one header from the stream.
    ///
    /// The reader is expected to be buffered so the 2-14 header bytes do
    /// not cost one syscall each.
    ///
    /// # Errors
    ///
    /// - `Error::ReservedOpcode` for a reserved opcode nibble
    /// - `Error::Protocol` for a 64-bit length with the top bit set
    /// - `Error::Io` for stream failures, including EOF mid-header
    pub async fn read<R>(r: &mut R) -> Result<Self>
    where
        R: AsyncRead + Unpin,
    {
        let mut base = [0u8; 2];
        r.read_exact(&mut base).await?;

        let fin = base[0] & 0x80 != 0;
        let rsv1 = base[0] & 0x40 != 0;
        let rsv2 = base[0] & 0x20 != 0;
        let rsv3 = base[0] & 0x10 != 0;
        let opcode = OpCode::from_u8(base[0] & 0x0F)?;
        let masked = base[1] & 0x80 != 0;

        let payload_len = match base[1] & 0x7F {
            126 => {
                let mut ext = [0u8; 2];
                r.read_exact(&mut ext).await?;
                u64::from(u16::from_be_bytes(ext))
            }
            127 => {
                let mut ext = [0u8; 8];
                r.read_exact(&mut ext).await?;
                let len = u64::from_be_bytes(ext);
                if len & (1 << 63) != 0 {
                    return Err(Error::Protocol(
                        "64-bit payload length with high bit set".to_owned(),
                    ));
                }
                len
            }
            short => u64::from(short),
        };

        let mut mask_key = [0u8; 4];
        if masked {
            r.read_exact(&mut mask_key).await?;
        }

        Ok(Self {
            fin,
            rsv1,
            rsv2,
            rsv3,
            opcode,
            masked,
            mask_key,
            payload_len,
        })
    }

    /// Append the encoded header to `buf`.
    pub fn marshal(&self, buf: &mut BytesMut) {
        buf.reserve(MAX_HEADER_SIZE);

        let mut byte0 = self.opcode.as_u8();
        if self.fin {
            byte0 |= 0x80;
        }
        if self.rsv1 {
            byte0 |= 0x40;
        }
        if self.rsv2 {
            byte0 |= 0x20;
        }
        if self.rsv3 {
            byte0 |= 0x10;
        }
        buf.put_u8(byte0);

        let mask_bit = if self.masked { 0x80 } else { 0 };
        if self.payload_len <= 125 {
            buf.put_u8(mask_bit | self.payload_len as u8);
        } else if self.payload_len <= u64::from(u16::MAX) {
            buf.put_u8(mask_bit | 126);
            buf.put_u16(self.payload_len as u16);
        } else {
            buf.put_u8(mask_bit | 127);
            buf.put_u64(self.payload_len);
        }

        if self.masked {
            buf.put_slice(&self.mask_key);
        }
    }

    /// Size of the encoded header in bytes.
    #[must_use]
    pub const fn wire_size(&self) -> usize {
        let extended = if self.payload_len <= 125 {
            0
        } else if self.payload_len <= u16::MAX as u64 {
            2
        } else {
            8
        };
        let mask = if self.masked { 4 } else { 0 };
        2 + extended + mask
    }
}
