//! The caller-facing message reader.

use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::sync::CancellationToken;

use crate::connection::conn::ConnInner;
use crate::connection::deadline::DeadlineGuard;
use crate::error::{Error, Result};
use crate::message::CloseCode;
use crate::protocol::{apply_mask, FrameHeader, OpCode};

/// Streams one received message frame by frame.
///
/// Returned by [`Conn::reader`](crate::Conn::reader) while holding the
/// read-message slot; the slot frees when the final frame is consumed or
/// the connection closes. End of message is signalled by a single `Ok(0)`
/// read; reading past it is [`Error::ReaderExhausted`].
pub struct MessageReader<'a, S> {
    conn: &'a ConnInner<S>,
    scope: CancellationToken,
    /// Header of the frame currently being drained; `None` between
    /// fragments.
    header: Option<FrameHeader>,
    /// Unread payload bytes of the current frame.
    remaining: u64,
    /// Rolling unmask position within the current frame.
    mask_pos: usize,
    /// Read limit this message was opened under, for the error message.
    limit: u64,
    /// Limit bytes still available to this message.
    left: u64,
    eofed: bool,
    exhausted: bool,
}

impl<'a, S> MessageReader<'a, S>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    pub(crate) fn new(
        conn: &'a ConnInner<S>,
        scope: CancellationToken,
        header: FrameHeader,
        limit: u64,
    ) -> Self {
        let remaining = header.payload_len;
        Self {
            conn,
            scope,
            header: Some(header),
            remaining,
            mask_pos: 0,
            limit,
            left: limit,
            eofed: false,
            exhausted: false,
        }
    }

    /// Read up to `buf.len()` payload bytes.
    ///
    /// Returns `Ok(0)` exactly once at end of message. A read that would
    /// push the message past the connection's read limit closes the
    /// connection with status 1008 and returns [`Error::ReadLimited`].
    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        if self.exhausted {
            return Err(Error::ReaderExhausted);
        }
        if self.eofed {
            self.exhausted = true;
            return Ok(0);
        }
        if buf.is_empty() {
            return Ok(0);
        }
        if self.left == 0 {
            self.conn
                .start_close(
                    CloseCode::PolicyViolation,
                    &format!("read limited at {} bytes", self.limit),
                )
                .await;
            return Err(Error::ReadLimited(self.limit));
        }

        loop {
            let header = match self.header {
                Some(header) => header,
                None => {
                    let header = self.conn.next_header(&self.scope).await?;
                    if header.opcode != OpCode::Continuation {
                        self.conn
                            .start_close(
                                CloseCode::ProtocolError,
                                "new data frame before previous message finished",
                            )
                            .await;
                        return Err(Error::InterleavedDataFrame);
                    }
                    self.remaining = header.payload_len;
                    self.header = Some(header);
                    header
                }
            };

            let want = (buf.len() as u64).min(self.remaining).min(self.left) as usize;
            let chunk = &mut buf[..want];

            let n = {
                let _deadline = DeadlineGuard::arm(&self.conn.read_deadline, &self.scope);
                self.conn
                    .read_frame_slot
                    .acquire(&self.scope, &self.conn.closed)
                    .await
                    .map_err(|kind| self.conn.slot_error(kind))?;
                let res = self.conn.read_payload(chunk).await;
                self.conn.read_frame_slot.release();
                match res {
                    Ok(n) => n,
                    Err(err) => {
                        self.conn.close_with(err);
                        return Err(self.conn.terminal_error());
                    }
                }
            };

            self.remaining -= n as u64;
            self.left -= n as u64;
            if header.masked {
                self.mask_pos = apply_mask(header.mask_key, self.mask_pos, chunk);
            }

            if self.remaining == 0 {
                // Let the pump read the next header.
                tokio::select! {
                    biased;
                    _ = self.conn.closed.cancelled() => return Err(self.conn.terminal_error()),
                    res = self.conn.read_done_tx.send(()) => {
                        if res.is_err() {
                            return Err(self.conn.terminal_error());
                        }
                    }
                }
                if header.fin {
                    self.eofed = true;
                    self.conn.read_msg_slot.release();
                    if n == 0 {
                        // This read is itself the end-of-stream sentinel.
                        self.exhausted = true;
                    }
                    return Ok(n);
                }
                self.mask_pos = 0;
                self.header = None;
                if n == 0 {
                    // An empty non-final fragment yields no bytes; keep
                    // going so `Ok(0)` stays reserved for end of message.
                    continue;
                }
            }

            return Ok(n);
        }
    }

    /// Read the rest of the message into `out`, returning the number of
    /// bytes appended.
    pub async fn read_to_end(&mut self, out: &mut Vec<u8>) -> Result<usize> {
        let start = out.len();
        let mut chunk = [0u8; 4096];
        loop {
            let n = self.read(&mut chunk).await?;
            if n == 0 {
                return Ok(out.len() - start);
            }
            out.extend_from_slice(&chunk[..n]);
        }
    }
}

impl<S> std::fmt::Debug for MessageReader<'_, S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageReader")
            .field("remaining", &self.remaining)
            .field("left", &self.left)
            .field("eofed", &self.eofed)
            .finish()
    }
}
