//! Deadline coordination.
//!
//! A single long-lived task is the sole arbiter of I/O deadlines. The
//! read and write paths arm a deadline by publishing the caller's scope
//! on a watch channel before blocking I/O and disarm it after; the
//! coordinator closes the connection when an armed scope cancels. Keeping
//! this in one task avoids racy interaction between the caller's scope,
//! an inflight I/O call, and close.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::connection::conn::ConnInner;
use crate::error::Error;

/// A parent scope handed to [`Conn::context`](crate::Conn::context),
/// paired with the reply channel for the derived scope.
pub(crate) struct ParentRegistration {
    pub(crate) parent: CancellationToken,
    pub(crate) reply: oneshot::Sender<CancellationToken>,
}

/// Disarms a read or write deadline when dropped, so an abandoned
/// operation future can never leave a stale deadline armed.
pub(crate) struct DeadlineGuard<'a> {
    tx: &'a watch::Sender<CancellationToken>,
}

impl<'a> DeadlineGuard<'a> {
    pub(crate) fn arm(tx: &'a watch::Sender<CancellationToken>, scope: &CancellationToken) -> Self {
        // Send fails only after the coordinator exited, i.e. the
        // connection is already closed.
        let _ = tx.send(scope.clone());
        Self { tx }
    }
}

impl Drop for DeadlineGuard<'_> {
    fn drop(&mut self) {
        let _ = self.tx.send(CancellationToken::new());
    }
}

/// A scope that cancels itself after `timeout`, for internal bounds like
/// the close-frame write and the pong reply.
pub(crate) fn deadline_scope(timeout: Duration) -> CancellationToken {
    let scope = CancellationToken::new();
    let timer = scope.clone();
    tokio::spawn(async move {
        tokio::time::sleep(timeout).await;
        timer.cancel();
    });
    scope
}

/// The coordinator task.
///
/// Scope updates are drained before cancellations are honored (the select
/// is biased), so a disarm racing an already-cancelled old scope never
/// tears the connection down.
pub(crate) async fn run<S>(
    conn: Arc<ConnInner<S>>,
    mut read_rx: watch::Receiver<CancellationToken>,
    mut write_rx: watch::Receiver<CancellationToken>,
    mut parent_rx: mpsc::Receiver<ParentRegistration>,
) {
    let mut read_scope = CancellationToken::new();
    let mut write_scope = CancellationToken::new();
    let mut parent_scope = CancellationToken::new();
    let mut derived: Vec<CancellationToken> = Vec::new();

    loop {
        tokio::select! {
            biased;
            _ = conn.closed.cancelled() => break,
            changed = read_rx.changed() => match changed {
                Ok(()) => read_scope = read_rx.borrow_and_update().clone(),
                Err(_) => break,
            },
            changed = write_rx.changed() => match changed {
                Ok(()) => write_scope = write_rx.borrow_and_update().clone(),
                Err(_) => break,
            },
            registration = parent_rx.recv() => match registration {
                Some(registration) => {
                    let child = registration.parent.child_token();
                    derived.push(child.clone());
                    parent_scope = registration.parent;
                    let _ = registration.reply.send(child);
                }
                None => break,
            },
            _ = read_scope.cancelled() => conn.close_with(Error::ReadTimedOut),
            _ = write_scope.cancelled() => conn.close_with(Error::WriteTimedOut),
            _ = parent_scope.cancelled() => {
                conn.close_with(Error::ParentCancelled);
                break;
            }
        }
    }

    debug!("deadline coordinator exiting");
    for token in derived {
        token.cancel();
    }
}
