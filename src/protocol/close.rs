//! Close payload codec: two-byte big-endian status code plus UTF-8 reason.

use crate::error::{Error, Result};
use crate::message::{CloseCode, CloseFrame};

/// Maximum reason length so the whole close payload fits in a control frame.
pub const MAX_CLOSE_REASON: usize = 123;

/// Encode a close payload.
///
/// # Errors
///
/// - `Error::ReasonTooLong` when the reason exceeds 123 bytes
/// - `Error::CloseCodeForbidden` for codes that must never appear on the
///   wire (1005, 1006, 1015, and the reserved ranges)
///
/// The close path rewrites either failure to `{1011, ""}` before sending.
pub fn encode_close_payload(frame: &CloseFrame) -> Result<Vec<u8>> {
    if frame.reason.len() > MAX_CLOSE_REASON {
        return Err(Error::ReasonTooLong(frame.reason.len()));
    }
    if !frame.code.permitted_on_wire() {
        return Err(Error::CloseCodeForbidden(frame.code.as_u16()));
    }

    let mut payload = Vec::with_capacity(2 + frame.reason.len());
    payload.extend_from_slice(&frame.code.as_u16().to_be_bytes());
    payload.extend_from_slice(frame.reason.as_bytes());
    Ok(payload)
}

/// Decode a close payload.
///
/// An empty payload decodes to code 1005 ("no status received"); a single
/// byte cannot hold a status code and is a protocol error, as is a reason
/// that is not valid UTF-8.
pub fn parse_close_payload(payload: &[u8]) -> Result<CloseFrame> {
    match payload.len() {
        0 => Ok(CloseFrame::new(CloseCode::NoStatusRcvd, "")),
        1 => Err(Error::InvalidClosePayload),
        _ => {
            let code = CloseCode::from_u16(u16::from_be_bytes([payload[0], payload[1]]));
            let reason = std::str::from_utf8(&payload[2..])
                .map_err(|_| Error::InvalidClosePayload)?;
            Ok(CloseFrame::new(code, reason))
        }
    }
}
