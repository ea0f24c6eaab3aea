//! WebSocket wire protocol pieces (RFC 6455).

pub mod close;
pub mod frame;
pub mod mask;
pub mod opcode;

pub use close::{encode_close_payload, parse_close_payload, MAX_CLOSE_REASON};
pub use frame::{FrameHeader, MAX_CONTROL_PAYLOAD, MAX_HEADER_SIZE};
pub use mask::apply_mask;
pub use opcode::OpCode;
