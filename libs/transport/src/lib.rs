//! Message-Oriented TCP Transport
//!
//! Framed, tagged messages over TCP between one server and many clients.
//!
//! ## Architecture
//!
//! - [`message`]: frame header and the LIFO body codec
//! - [`queue`]: thread-safe double-ended queue used as mailbox
//! - [`connection`]: per-socket state machine with handshake and pumps
//! - [`client`] / [`server`]: façades owning an execution context
//!
//! Each façade runs its sockets on a single dedicated I/O thread
//! ([`context::IoContext`]). Inbound messages are queued there and handed to
//! the application on whichever thread calls `update`.
//!
//! ## Wire format
//!
//! Every frame is a header (`id` in the tag's own width, then a `u32` body
//! size, host byte order, no padding) followed by `size` body bytes. A new
//! connection first exchanges one 8 byte handshake value in each direction.
//!
//! ```no_run
//! use num_enum::{IntoPrimitive, TryFromPrimitive};
//! use transport::{Client, Message};
//!
//! #[repr(u32)]
//! #[derive(Debug, Clone, Copy, IntoPrimitive, TryFromPrimitive)]
//! enum Tag {
//!     Ping = 2,
//! }
//!
//! let mut client: Client<Tag> = Client::new();
//! client.connect("127.0.0.1", transport::DEFAULT_PORT)?;
//! let mut ping = Message::new(Tag::Ping);
//! ping.push(&42u64);
//! client.send(ping);
//! # Ok::<(), transport::TransportError>(())
//! ```

pub mod client;
pub mod connection;
pub mod context;
pub mod error;
pub mod handshake;
pub mod message;
pub mod queue;
pub mod server;
pub mod settings;

pub use client::Client;
pub use connection::{Connection, ConnectionState, Owner};
pub use context::IoContext;
pub use error::{Result, TransportError};
pub use handshake::{scramble, Handshake};
pub use message::{Message, MessageHeader, MessageTag, OwnedMessage};
pub use queue::TsQueue;
pub use server::{Server, ServerHandler};
pub use settings::{ClientSettings, ServerSettings, TransportSettings};

/// Port used when none is configured
pub const DEFAULT_PORT: u16 = 60000;

/// Id assigned to the first client a server admits
pub const DEFAULT_FIRST_CLIENT_ID: u32 = 10000;
