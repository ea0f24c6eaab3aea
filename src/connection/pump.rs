//! The reader pump.
//!
//! One long-lived task per connection reads frame headers off the
//! stream, polices RSV bits and opcodes, answers control frames inline,
//! and hands data headers one at a time to whichever caller holds the
//! read-message slot. The pump never buffers payload bytes (the active
//! reader drains them under the read-frame slot), so a slow reader costs
//! at most one frame's payload plus a header.

use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::connection::conn::{ConnInner, CONTROL_WRITE_TIMEOUT};
use crate::connection::deadline::deadline_scope;
use crate::error::{Error, Result};
use crate::message::CloseCode;
use crate::protocol::{
    apply_mask, parse_close_payload, FrameHeader, OpCode, MAX_CONTROL_PAYLOAD,
};

pub(crate) async fn read_loop<S>(
    conn: Arc<ConnInner<S>>,
    hdr_tx: mpsc::Sender<FrameHeader>,
    mut done_rx: mpsc::Receiver<()>,
) where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    loop {
        let header = match conn.read_data_header().await {
            Ok(header) => header,
            Err(err) => {
                conn.close_with(err);
                break;
            }
        };

        if header.opcode == OpCode::Continuation && header.fin && header.payload_len == 0 {
            // A reader that consumed exactly to the previous fragment
            // boundary never sees this frame; free the message slot on
            // its behalf.
            conn.read_msg_slot.release();
        }

        tokio::select! {
            biased;
            _ = conn.closed.cancelled() => break,
            res = hdr_tx.send(header) => {
                if res.is_err() {
                    break;
                }
            }
        }

        tokio::select! {
            biased;
            _ = conn.closed.cancelled() => break,
            ack = done_rx.recv() => {
                if ack.is_none() {
                    break;
                }
            }
        }
    }

    debug!("reader pump exiting");
    // Tear the write half down so the peer observes the closure promptly.
    let mut writer = conn.writer_io.lock().await;
    let _ = writer.shutdown().await;
}

impl<S> ConnInner<S>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    /// Read headers until the next data frame, handling control frames
    /// inline.
    pub(crate) async fn read_data_header(&self) -> Result<FrameHeader> {
        loop {
            let header = match self.read_header().await {
                Ok(header) => header,
                Err(err @ Error::ReservedOpcode(_)) => {
                    self.start_close(CloseCode::ProtocolError, "unknown opcode")
                        .await;
                    return Err(err);
                }
                Err(err) => return Err(err),
            };

            if header.rsv1 || header.rsv2 || header.rsv3 {
                self.start_close(
                    CloseCode::ProtocolError,
                    "reserved bits set without negotiated extension",
                )
                .await;
                return Err(Error::ReservedBitsSet);
            }

            if header.opcode.is_control() {
                self.handle_control(header).await?;
                continue;
            }

            return Ok(header);
        }
    }

    async fn read_header(&self) -> Result<FrameHeader> {
        // Header reads are bounded by connection close only.
        let idle = CancellationToken::new();
        self.read_frame_slot
            .acquire(&idle, &self.closed)
            .await
            .map_err(|kind| self.slot_error(kind))?;

        let res = self.read_header_locked().await;
        self.read_frame_slot.release();
        res
    }

    async fn read_header_locked(&self) -> Result<FrameHeader> {
        let mut io = tokio::select! {
            biased;
            _ = self.closed.cancelled() => return Err(self.terminal_error()),
            guard = self.reader_io.lock() => guard,
        };
        tokio::select! {
            biased;
            _ = self.closed.cancelled() => Err(self.terminal_error()),
            res = FrameHeader::read(&mut *io) => res.map_err(|err| match err {
                Error::Io(io_err) => Error::Io(format!("failed to read header: {io_err}")),
                other => other,
            }),
        }
    }

    /// Handle one control frame inline. Runs between rendezvous, so no
    /// reader handle is inside a frame and the read half is free.
    async fn handle_control(&self, header: FrameHeader) -> Result<()> {
        if header.payload_len > MAX_CONTROL_PAYLOAD {
            self.start_close(CloseCode::ProtocolError, "control frame too large")
                .await;
            return Err(Error::ControlFrameTooLarge(header.payload_len));
        }
        if !header.fin {
            self.start_close(CloseCode::ProtocolError, "control frame cannot be fragmented")
                .await;
            return Err(Error::FragmentedControlFrame);
        }

        let mut payload = vec![0u8; header.payload_len as usize];
        if let Err(err) = self.read_payload(&mut payload).await {
            self.close_with(err.clone());
            return Err(err);
        }
        if header.masked {
            apply_mask(header.mask_key, 0, &mut payload);
        }

        match header.opcode {
            OpCode::Ping => {
                let scope = deadline_scope(CONTROL_WRITE_TIMEOUT);
                if let Err(err) = self.write_message(&scope, OpCode::Pong, &payload).await {
                    debug!(%err, "failed to write pong");
                }
            }
            OpCode::Pong => {
                let id = String::from_utf8_lossy(&payload).into_owned();
                let waiter = self.pings().remove(&id);
                if let Some(waiter) = waiter {
                    let _ = waiter.send(());
                }
            }
            OpCode::Close => match parse_close_payload(&payload) {
                Ok(frame) if frame.code == CloseCode::NoStatusRcvd => {
                    // Bare close from the peer: echo an empty payload back.
                    let _ = self.write_close(Vec::new(), frame).await;
                }
                Ok(frame) => {
                    let _ = self.close_handshake(frame).await;
                }
                Err(err) => {
                    self.close_with(err.clone());
                    return Err(err);
                }
            },
            OpCode::Continuation | OpCode::Text | OpCode::Binary => {
                unreachable!("data opcode dispatched to control handler")
            }
        }
        Ok(())
    }
}
