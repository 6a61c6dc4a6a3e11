//! # disservice-client
//!
//! Rust client SDK for the DisService dissemination proxy protocol.
//!
//! DisService is a peer-to-peer publish/subscribe system; applications talk
//! to a local proxy server over two TCP connections:
//!
//! - **Command channel**: framed request/response exchanges initiated by
//!   the client (publish, subscribe, retrieve, search, ...)
//! - **Callback channel**: events pushed by the server (data arrived,
//!   chunk arrived, searches from other nodes, ...), acknowledged one at
//!   a time
//!
//! A background supervisor keeps the session alive: when either channel
//! drops it reconnects forever, replays the callback registrations and
//! unblocks any operations that were waiting.
//!
//! ## Example
//!
//! ```ignore
//! use disservice_client::ProxyBuilder;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let proxy = ProxyBuilder::new().port(56487).start();
//!     proxy
//!         .on_data_arrived(|event| {
//!             println!("{} -> {} bytes", event.msg_id, event.data.len());
//!         })
//!         .await?;
//!     proxy.wait_connected().await?;
//!     proxy.subscribe("chat", 0, false, false, false).await?;
//!     Ok(())
//! }
//! ```

pub mod callback;
pub mod error;
pub mod events;
pub mod msgid;
pub mod protocol;
pub mod transport;

mod client;
mod connection;

pub use callback::HandlerId;
pub use client::{
    DisServiceProxy, ProxyBuilder, DEFAULT_HOST, DEFAULT_PORT, DEFAULT_RECONNECT_INTERVAL,
};
pub use error::{DisServiceError, Result};
pub use events::{
    ChunkArrivedEvent, ConnectionEvent, DataArrivedEvent, DataAvailableEvent, EventKind,
    MetadataArrivedEvent, SearchEvent,
};
pub use msgid::{chunk_message_id, message_id, MessageId};
