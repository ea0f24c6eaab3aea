//! The connection: state, write path, close coordination, ping registry.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, OnceLock};
use std::time::Duration;

use bytes::BytesMut;
use tokio::io::{
    AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader, BufWriter, ReadHalf, WriteHalf,
};
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::Config;
use crate::connection::deadline::{self, deadline_scope, DeadlineGuard, ParentRegistration};
use crate::connection::pump;
use crate::connection::reader::MessageReader;
use crate::connection::role::Role;
use crate::connection::slot::{AcquireError, Slot};
use crate::connection::writer::MessageWriter;
use crate::error::{Error, Result};
use crate::message::{CloseCode, CloseFrame, MessageType};
use crate::protocol::{encode_close_payload, FrameHeader, OpCode, MAX_HEADER_SIZE};

/// Bound on internally initiated control writes: the close frame and the
/// pong reply.
pub(crate) const CONTROL_WRITE_TIMEOUT: Duration = Duration::from_secs(5);

/// A WebSocket connection over an established byte stream.
///
/// One `Conn` represents one connection after the opening handshake. All
/// methods take `&self` and may be called from any task concurrently; the
/// core serializes message boundaries internally, so two tasks writing at
/// once produce two whole messages, never interleaved bytes.
///
/// Dropping the connection without [`close`](Conn::close) tears it down
/// with [`Error::ConnectionDropped`] as the terminal cause.
///
/// Must be created inside a tokio runtime: the constructor spawns the
/// per-connection reader pump and deadline coordinator.
pub struct Conn<S> {
    inner: Arc<ConnInner<S>>,
}

pub(crate) struct ConnInner<S> {
    role: Role,
    subprotocol: String,
    read_limit: AtomicU64,

    /// One-shot closed latch; fires exactly once at teardown.
    pub(crate) closed: CancellationToken,
    /// Write-once terminal cause, stored pre-wrapped as
    /// [`Error::ConnectionClosed`].
    terminal: OnceLock<Error>,

    pub(crate) write_msg_slot: Slot,
    pub(crate) write_frame_slot: Slot,
    pub(crate) read_msg_slot: Slot,
    pub(crate) read_frame_slot: Slot,

    /// Read half. Locked only by the pump between rendezvous or under the
    /// read-frame slot, so the lock itself never carries contention.
    pub(crate) reader_io: Mutex<BufReader<ReadHalf<S>>>,
    /// Write half, gated by the write-frame slot the same way.
    pub(crate) writer_io: Mutex<BufWriter<WriteHalf<S>>>,

    /// Pump-to-reader rendezvous delivering one data header at a time.
    read_hdr_rx: Mutex<mpsc::Receiver<FrameHeader>>,
    /// Reader-to-pump acknowledgement that a frame's payload is consumed.
    pub(crate) read_done_tx: mpsc::Sender<()>,

    pub(crate) read_deadline: watch::Sender<CancellationToken>,
    write_deadline: watch::Sender<CancellationToken>,
    parent_tx: mpsc::Sender<ParentRegistration>,

    active_pings: StdMutex<HashMap<String, oneshot::Sender<()>>>,
}

impl<S> ConnInner<S> {
    /// Tear the connection down. Only the first caller's cause is
    /// recorded; everyone else is a no-op.
    pub(crate) fn close_with(&self, cause: Error) {
        let wrapped = Error::ConnectionClosed(Arc::new(cause));
        if self.terminal.set(wrapped.clone()).is_err() {
            return;
        }
        debug!(err = %wrapped, "closing connection");
        self.closed.cancel();
        self.read_frame_slot.poison();
        self.write_frame_slot.poison();
    }

    /// The terminal error handed to every blocked and subsequent caller.
    pub(crate) fn terminal_error(&self) -> Error {
        match self.terminal.get() {
            Some(err) => err.clone(),
            None => Error::ConnectionClosed(Arc::new(Error::ConnectionDropped)),
        }
    }

    pub(crate) fn slot_error(&self, kind: AcquireError) -> Error {
        match kind {
            AcquireError::Cancelled => Error::Cancelled,
            AcquireError::Closed => self.terminal_error(),
        }
    }

    pub(crate) fn pings(&self) -> MutexGuard<'_, HashMap<String, oneshot::Sender<()>>> {
        match self.active_pings.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl<S> ConnInner<S>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    /// Write a single frame under the write-frame slot.
    ///
    /// Once the write deadline is armed, any failure leaves the outbound
    /// stream at an arbitrary byte boundary and is connection-fatal.
    pub(crate) async fn write_frame(
        &self,
        scope: &CancellationToken,
        mut header: FrameHeader,
        payload: &[u8],
    ) -> Result<()> {
        self.write_frame_slot
            .acquire(scope, &self.closed)
            .await
            .map_err(|kind| self.slot_error(kind))?;

        header.masked = self.role.must_mask();
        header.payload_len = payload.len() as u64;

        let res = self.write_frame_armed(scope, &header, payload).await;
        self.write_frame_slot.release();
        if let Err(err) = &res {
            self.close_with(err.clone());
        }
        res
    }

    async fn write_frame_armed(
        &self,
        scope: &CancellationToken,
        header: &FrameHeader,
        payload: &[u8],
    ) -> Result<()> {
        let _deadline = DeadlineGuard::arm(&self.write_deadline, scope);

        let mut io = tokio::select! {
            biased;
            _ = self.closed.cancelled() => return Err(self.terminal_error()),
            guard = self.writer_io.lock() => guard,
        };

        let mut head = BytesMut::with_capacity(MAX_HEADER_SIZE);
        header.marshal(&mut head);

        // The client mask key is always zero, so masking the outbound
        // payload is the identity transform; only the header carries the
        // mask bit and key bytes.
        let io_res = tokio::select! {
            biased;
            _ = self.closed.cancelled() => return Err(self.terminal_error()),
            res = write_frame_bytes(&mut *io, &head, payload, header.fin) => res,
        };
        io_res.map_err(|err| Error::Io(format!("failed to write to connection: {err}")))
    }

    /// Write one whole message. Data opcodes serialize on the
    /// write-message slot; control frames may interleave between a
    /// streaming writer's fragments.
    pub(crate) async fn write_message(
        &self,
        scope: &CancellationToken,
        opcode: OpCode,
        payload: &[u8],
    ) -> Result<()> {
        let data = opcode.is_data();
        if data {
            self.write_msg_slot
                .acquire(scope, &self.closed)
                .await
                .map_err(|kind| self.slot_error(kind))?;
        }

        let res = self
            .write_frame(scope, FrameHeader::new(true, opcode), payload)
            .await;
        if data {
            self.write_msg_slot.release();
        }
        res
    }

    /// Read exactly `buf.len()` payload bytes from the stream.
    pub(crate) async fn read_payload(&self, buf: &mut [u8]) -> Result<usize> {
        let mut io = tokio::select! {
            biased;
            _ = self.closed.cancelled() => return Err(self.terminal_error()),
            guard = self.reader_io.lock() => guard,
        };
        tokio::select! {
            biased;
            _ = self.closed.cancelled() => Err(self.terminal_error()),
            res = io.read_exact(buf) => match res {
                Ok(n) => Ok(n),
                Err(err) => Err(Error::Io(format!("failed to read frame payload: {err}"))),
            },
        }
    }

    /// Receive the next data header from the reader pump.
    pub(crate) async fn next_header(&self, scope: &CancellationToken) -> Result<FrameHeader> {
        let mut rx = tokio::select! {
            biased;
            _ = self.closed.cancelled() => return Err(self.terminal_error()),
            _ = scope.cancelled() => return Err(Error::Cancelled),
            guard = self.read_hdr_rx.lock() => guard,
        };
        tokio::select! {
            biased;
            _ = self.closed.cancelled() => Err(self.terminal_error()),
            _ = scope.cancelled() => Err(Error::Cancelled),
            header = rx.recv() => header.ok_or_else(|| self.terminal_error()),
        }
    }

    /// Close with a status code and reason, ignoring the outcome. Used on
    /// protocol violations where the error is surfaced separately.
    pub(crate) async fn start_close(&self, code: CloseCode, reason: &str) {
        let _ = self.close_handshake(CloseFrame::new(code, reason)).await;
    }

    /// The full close path: marshal the payload (rewriting unmarshalable
    /// frames to 1011), send the close frame, and tear down.
    pub(crate) async fn close_handshake(&self, frame: CloseFrame) -> Result<()> {
        match encode_close_payload(&frame) {
            Ok(payload) => self.write_close(payload, frame).await,
            Err(err) => {
                warn!(code = frame.code.as_u16(), %err, "failed to marshal close frame");
                let fallback = CloseFrame::new(CloseCode::InternalError, "");
                let payload = encode_close_payload(&fallback).unwrap_or_default();
                self.write_close(payload, fallback).await
            }
        }
    }

    /// Write a close frame bounded by the internal deadline, then tear
    /// down regardless of the write outcome. The peer's close echo is not
    /// awaited: peers are unreliable about sending one, and hanging on it
    /// is worse than missing the confirmation.
    pub(crate) async fn write_close(&self, payload: Vec<u8>, frame: CloseFrame) -> Result<()> {
        let scope = deadline_scope(CONTROL_WRITE_TIMEOUT);
        let write_res = self.write_message(&scope, OpCode::Close, &payload).await;

        let cause = Error::Close(frame);
        self.close_with(cause.clone());

        write_res?;

        match self.terminal_error() {
            Error::ConnectionClosed(recorded) if *recorded == cause => Ok(()),
            other => Err(other),
        }
    }

    pub(crate) async fn ping(&self, scope: &CancellationToken) -> Result<()> {
        let mut nonce = [0u8; 8];
        getrandom::getrandom(&mut nonce)
            .map_err(|err| Error::Io(format!("failed to source ping nonce: {err}")))?;
        let id = u64::from_ne_bytes(nonce).to_string();

        let (tx, rx) = oneshot::channel();
        self.pings().insert(id.clone(), tx);

        let res = self.ping_wait(scope, &id, rx).await;
        self.pings().remove(&id);
        res
    }

    async fn ping_wait(
        &self,
        scope: &CancellationToken,
        id: &str,
        pong: oneshot::Receiver<()>,
    ) -> Result<()> {
        self.write_message(scope, OpCode::Ping, id.as_bytes())
            .await?;

        tokio::select! {
            biased;
            _ = self.closed.cancelled() => Err(self.terminal_error()),
            _ = scope.cancelled() => Err(Error::Cancelled),
            reply = pong => match reply {
                Ok(()) => Ok(()),
                // The registry entry was displaced by a colliding nonce;
                // this ping can no longer be matched.
                Err(_) => {
                    tokio::select! {
                        biased;
                        _ = self.closed.cancelled() => Err(self.terminal_error()),
                        _ = scope.cancelled() => Err(Error::Cancelled),
                    }
                }
            },
        }
    }
}

impl<S> Conn<S>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    /// Wrap an established, handshake-complete byte stream.
    ///
    /// `role` controls outbound masking, `subprotocol` is whatever the
    /// handshake negotiated (empty for the default protocol).
    pub fn new(stream: S, role: Role, subprotocol: impl Into<String>, config: Config) -> Self {
        let (read_half, write_half) = tokio::io::split(stream);

        let (hdr_tx, hdr_rx) = mpsc::channel(1);
        let (done_tx, done_rx) = mpsc::channel(1);
        let (read_dl_tx, read_dl_rx) = watch::channel(CancellationToken::new());
        let (write_dl_tx, write_dl_rx) = watch::channel(CancellationToken::new());
        let (parent_tx, parent_rx) = mpsc::channel(1);

        let inner = Arc::new(ConnInner {
            role,
            subprotocol: subprotocol.into(),
            read_limit: AtomicU64::new(config.read_limit),
            closed: CancellationToken::new(),
            terminal: OnceLock::new(),
            write_msg_slot: Slot::new(),
            write_frame_slot: Slot::new(),
            read_msg_slot: Slot::new(),
            read_frame_slot: Slot::new(),
            reader_io: Mutex::new(BufReader::with_capacity(config.read_buffer_size, read_half)),
            writer_io: Mutex::new(BufWriter::with_capacity(
                config.write_buffer_size,
                write_half,
            )),
            read_hdr_rx: Mutex::new(hdr_rx),
            read_done_tx: done_tx,
            read_deadline: read_dl_tx,
            write_deadline: write_dl_tx,
            parent_tx,
            active_pings: StdMutex::new(HashMap::new()),
        });

        tokio::spawn(deadline::run(
            inner.clone(),
            read_dl_rx,
            write_dl_rx,
            parent_rx,
        ));
        tokio::spawn(pump::read_loop(inner.clone(), hdr_tx, done_rx));

        Conn { inner }
    }

    /// The negotiated subprotocol. Empty means the default protocol.
    #[must_use]
    pub fn subprotocol(&self) -> &str {
        &self.inner.subprotocol
    }

    /// Set the maximum number of bytes a single received message may
    /// carry. When the limit is hit the connection closes with status
    /// 1008 (policy violation). The default is 32 KiB.
    pub fn set_read_limit(&self, n: u64) {
        self.inner.read_limit.store(n, Ordering::Relaxed);
    }

    /// Return a scope derived from `parent` that is cancelled when the
    /// connection closes. Cancelling `parent` closes the connection.
    pub async fn context(&self, parent: &CancellationToken) -> CancellationToken {
        let inner = &self.inner;
        let (reply_tx, reply_rx) = oneshot::channel();
        let registration = ParentRegistration {
            parent: parent.clone(),
            reply: reply_tx,
        };

        tokio::select! {
            biased;
            _ = inner.closed.cancelled() => return cancelled_child(parent),
            res = inner.parent_tx.send(registration) => {
                if res.is_err() {
                    return cancelled_child(parent);
                }
            }
        }

        tokio::select! {
            biased;
            _ = inner.closed.cancelled() => cancelled_child(parent),
            reply = reply_rx => reply.unwrap_or_else(|_| cancelled_child(parent)),
        }
    }

    /// Wait for the next data message and return its type plus a handle
    /// streaming its payload.
    ///
    /// Only one message reader is live at a time; concurrent callers
    /// queue on the read-message slot. Drain the reader to end-of-message
    /// or the connection will stall on the unconsumed frame.
    pub async fn reader(
        &self,
        scope: &CancellationToken,
    ) -> Result<(MessageType, MessageReader<'_, S>)> {
        let inner = &self.inner;
        inner
            .read_msg_slot
            .acquire(scope, &inner.closed)
            .await
            .map_err(|kind| inner.slot_error(kind))?;

        let header = match inner.next_header(scope).await {
            Ok(header) => header,
            Err(err) => {
                inner.read_msg_slot.release();
                return Err(err);
            }
        };

        if header.opcode == OpCode::Continuation {
            inner
                .start_close(
                    CloseCode::ProtocolError,
                    "continuation frame without initiating data frame",
                )
                .await;
            inner.read_msg_slot.release();
            return Err(Error::UnexpectedContinuation);
        }

        let Some(typ) = MessageType::from_opcode(header.opcode) else {
            // The pump forwards only data headers.
            inner.read_msg_slot.release();
            return Err(Error::Protocol(format!(
                "unexpected {} header at message start",
                header.opcode
            )));
        };

        let limit = inner.read_limit.load(Ordering::Relaxed);
        Ok((typ, MessageReader::new(inner, scope.clone(), header, limit)))
    }

    /// Read one whole message.
    pub async fn read(&self, scope: &CancellationToken) -> Result<(MessageType, Vec<u8>)> {
        let (typ, mut reader) = self.reader(scope).await?;
        let mut payload = Vec::new();
        reader.read_to_end(&mut payload).await?;
        Ok((typ, payload))
    }

    /// Open a streaming writer for one message of type `typ`.
    ///
    /// Only one writer is open at a time; concurrent callers queue on the
    /// write-message slot. [`MessageWriter::finish`] must be called to
    /// close the message; an abandoned writer leaves the message open
    /// and blocks later writers until the connection closes.
    pub async fn writer(
        &self,
        scope: &CancellationToken,
        typ: MessageType,
    ) -> Result<MessageWriter<'_, S>> {
        let inner = &self.inner;
        inner
            .write_msg_slot
            .acquire(scope, &inner.closed)
            .await
            .map_err(|kind| inner.slot_error(kind))?;
        Ok(MessageWriter::new(inner, scope.clone(), typ.opcode()))
    }

    /// Write one whole message as a single frame.
    pub async fn write(
        &self,
        scope: &CancellationToken,
        typ: MessageType,
        payload: &[u8],
    ) -> Result<()> {
        self.inner.write_message(scope, typ.opcode(), payload).await
    }

    /// Send a ping and wait for the matching pong.
    pub async fn ping(&self, scope: &CancellationToken) -> Result<()> {
        self.inner.ping(scope).await
    }

    /// Close the connection with the given status code and reason.
    ///
    /// The close frame write is bounded by an internal five-second
    /// deadline; teardown happens regardless of its outcome, and every
    /// blocked caller unblocks with the same terminal error. The reason
    /// must fit in 123 bytes or the peer receives status 1011 instead.
    pub async fn close(&self, code: CloseCode, reason: &str) -> Result<()> {
        self.inner
            .close_handshake(CloseFrame::new(code, reason))
            .await
    }
}

impl<S> Drop for Conn<S> {
    fn drop(&mut self) {
        self.inner.close_with(Error::ConnectionDropped);
    }
}

impl<S> std::fmt::Debug for Conn<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Conn")
            .field("role", &self.inner.role)
            .field("subprotocol", &self.inner.subprotocol)
            .field("closed", &self.inner.closed.is_cancelled())
            .finish()
    }
}

fn cancelled_child(parent: &CancellationToken) -> CancellationToken {
    let child = parent.child_token();
    child.cancel();
    child
}

async fn write_frame_bytes<W>(
    io: &mut W,
    head: &[u8],
    payload: &[u8],
    fin: bool,
) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    io.write_all(head).await?;
    io.write_all(payload).await?;
    if fin {
        io.flush().await?;
    }
    Ok(())
}
