//! The caller-facing message writer.

use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::sync::CancellationToken;

use crate::connection::conn::ConnInner;
use crate::error::{Error, Result};
use crate::protocol::{FrameHeader, OpCode};

/// Streams one outgoing message as a sequence of frames.
///
/// Returned by [`Conn::writer`](crate::Conn::writer) while holding the
/// write-message slot. Every [`write`](MessageWriter::write) emits one
/// non-final frame; [`finish`](MessageWriter::finish) emits the closing
/// empty FIN frame, flushes, and frees the slot. Control frames from
/// other tasks may interleave between fragments without corrupting the
/// message.
pub struct MessageWriter<'a, S> {
    conn: &'a ConnInner<S>,
    scope: CancellationToken,
    /// Opcode for the next frame: the message type for the first, then
    /// continuation.
    opcode: OpCode,
    finished: bool,
}

impl<'a, S> MessageWriter<'a, S>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    pub(crate) fn new(conn: &'a ConnInner<S>, scope: CancellationToken, opcode: OpCode) -> Self {
        Self {
            conn,
            scope,
            opcode,
            finished: false,
        }
    }

    /// Emit `payload` as one non-final frame of the message.
    pub async fn write(&mut self, payload: &[u8]) -> Result<usize> {
        if self.finished {
            return Err(Error::WriterFinished);
        }
        self.conn
            .write_frame(&self.scope, FrameHeader::new(false, self.opcode), payload)
            .await?;
        self.opcode = OpCode::Continuation;
        Ok(payload.len())
    }

    /// Close the message with an empty FIN frame and release the
    /// write-message slot. Using the writer afterwards is
    /// [`Error::WriterFinished`].
    pub async fn finish(&mut self) -> Result<()> {
        if self.finished {
            return Err(Error::WriterFinished);
        }
        self.finished = true;

        self.conn
            .write_frame(&self.scope, FrameHeader::new(true, self.opcode), &[])
            .await?;
        self.conn.write_msg_slot.release();
        Ok(())
    }
}

impl<S> std::fmt::Debug for MessageWriter<'_, S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageWriter")
            .field("opcode", &self.opcode)
            .field("finished", &self.finished)
            .finish()
    }
}
