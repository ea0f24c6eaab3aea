//! # wscore - WebSocket connection core
//!
//! `wscore` is the post-handshake core of a WebSocket connection: it
//! turns an established, ordered byte stream into a concurrent-safe,
//! message-oriented duplex channel with RFC 6455 framing, control-frame
//! handling, masking, and the close lifecycle.
//!
//! The opening HTTP upgrade, transport, and TLS are external
//! collaborators: hand [`Conn::new`] the stream once the handshake is
//! done, together with the role bit and the negotiated subprotocol.
//!
//! ## Quick start
//!
//! ```rust,ignore
//! use tokio_util::sync::CancellationToken;
//! use wscore::{Config, Conn, MessageType, Role};
//!
//! let conn = Conn::new(stream, Role::Client, "", Config::default());
//! let scope = CancellationToken::new();
//!
//! conn.write(&scope, MessageType::Text, b"hello").await?;
//! let (typ, payload) = conn.read(&scope).await?;
//! ```
//!
//! All operations take a [`CancellationToken`] scope; cancelling it
//! unblocks the call promptly. Deadlines are scopes a timer cancels.
//!
//! [`CancellationToken`]: tokio_util::sync::CancellationToken

pub mod config;
pub mod connection;
pub mod error;
pub mod message;
pub mod protocol;

pub use config::Config;
pub use connection::{Conn, MessageReader, MessageWriter, Role};
pub use error::{Error, Result};
pub use message::{CloseCode, CloseFrame, MessageType};
pub use protocol::OpCode;
