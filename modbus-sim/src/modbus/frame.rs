//! MBAP framing for Modbus/TCP.
//!
//! Every frame on the wire is a 7 byte MBAP header followed by the PDU:
//!
//! ```text
//! transaction id (2, BE) | protocol id (2, BE) | length (2, BE) | unit id (1) | function code (1) | payload
//! ```
//!
//! `length` counts the unit id, the function code and the payload.

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};

use super::{FunctionCode, TransactionId, UnitId};

pub const HEADER_LENGTH: usize = 7;
pub const MAX_FRAME_LENGTH: usize = 260;

/// Largest payload (excluding function code) a single frame can carry.
pub const MAX_PAYLOAD_LENGTH: usize = MAX_FRAME_LENGTH - HEADER_LENGTH - 1;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Frame {
    pub transaction_id: TransactionId,
    pub protocol_id: u16,
    pub unit_id: UnitId,
    pub function_code: FunctionCode,
    pub payload: Bytes,
}

#[derive(Error, Debug)]
pub enum FrameError {
    #[error("short read: connection closed mid-frame")]
    ShortRead,

    #[error(transparent)]
    Transport(std::io::Error),

    #[error("protocol error: invalid MBAP length {length}")]
    Protocol { length: u16 },

    #[error("unknown protocol identifier 0x{0:04x}")]
    UnknownProtocolId(u16),
}

impl FrameError {
    /// Whether the underlying transport is gone, as opposed to a single bad frame.
    pub fn is_fatal(&self) -> bool {
        matches!(self, FrameError::ShortRead | FrameError::Transport(_))
    }
}

impl From<std::io::Error> for FrameError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::UnexpectedEof => FrameError::ShortRead,
            _ => FrameError::Transport(err),
        }
    }
}

/// Reads exactly one frame from `reader`.
///
/// Never reads past the end of the frame, so a stream stays aligned on the next frame even when
/// this one is rejected for an invalid length or protocol id.
pub async fn decode<R>(reader: &mut R) -> Result<Frame, FrameError>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; HEADER_LENGTH];
    reader.read_exact(&mut header).await?;

    let transaction_id = u16::from_be_bytes([header[0], header[1]]);
    let protocol_id = u16::from_be_bytes([header[2], header[3]]);
    let length = u16::from_be_bytes([header[4], header[5]]);
    let unit_id = header[6];

    // The length includes the unit id, which is already part of the header.
    let pdu_length = length as usize;
    if pdu_length <= 1 || HEADER_LENGTH + (pdu_length - 1) > MAX_FRAME_LENGTH {
        return Err(FrameError::Protocol { length });
    }

    let mut pdu = BytesMut::zeroed(pdu_length - 1);
    reader.read_exact(&mut pdu).await?;

    if protocol_id != 0 {
        return Err(FrameError::UnknownProtocolId(protocol_id));
    }

    let function_code = pdu[0];
    let payload = pdu.freeze().slice(1..);

    Ok(Frame {
        transaction_id,
        protocol_id,
        unit_id,
        function_code,
        payload,
    })
}

/// Lays out a response frame. `payload` must fit in [`MAX_PAYLOAD_LENGTH`].
pub fn encode(
    transaction_id: TransactionId,
    unit_id: UnitId,
    function_code: FunctionCode,
    payload: &[u8],
) -> Bytes {
    debug_assert!(payload.len() <= MAX_PAYLOAD_LENGTH);

    let mut buf = BytesMut::with_capacity(HEADER_LENGTH + 1 + payload.len());
    buf.put_u16(transaction_id);
    buf.put_u16(0x0000);
    buf.put_u16((2 + payload.len()) as u16);
    buf.put_u8(unit_id);
    buf.put_u8(function_code);
    buf.put_slice(payload);
    buf.freeze()
}

impl Frame {
    pub fn encode(&self) -> Bytes {
        encode(
            self.transaction_id,
            self.unit_id,
            self.function_code,
            &self.payload,
        )
    }
}
