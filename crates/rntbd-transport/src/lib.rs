//! # RNTBD Transport
//!
//! Connection management for the RNTBD direct-connectivity protocol.
//!
//! This crate provides:
//! - TCP connections with a dedicated reader and writer task
//! - Context negotiation gating every data request
//! - A pending-request table keyed by activity id
//! - Fan-out of connection failures to every waiting request
//! - TOML-backed connection configuration
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                         Connection                               │
//! │   (socket, reader task, writer task, request timeouts)          │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                       RequestManager                             │
//! │   (negotiation gate, pending table, close fan-out)              │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                        rntbd-core                                │
//! │   (frames, token streams, status mapping)                       │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```no_run
//! use rntbd_core::{Operation, OperationType, RequestHeader, ResourceType};
//! use rntbd_transport::{Connection, ConnectionConfig};
//!
//! # async fn run() -> rntbd_transport::Result<()> {
//! let connection = Connection::open("10.0.0.4:10253", ConnectionConfig::default()).await?;
//! connection.negotiated().await?;
//!
//! let read = Operation::new(OperationType::Read, ResourceType::Document)
//!     .with_header(RequestHeader::DocumentName, "order-1138")?;
//! let response = connection.send(read).await?;
//! println!("{} bytes", response.payload.map_or(0, |p| p.len()));
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod connection;
pub mod error;
pub mod request_manager;
pub mod stats;

pub use config::ConnectionConfig;
pub use connection::Connection;
pub use error::{Result, TransportError};
pub use request_manager::{
    Completion, ConnectionState, PendingHandle, RequestManager, StoreResponse,
};
pub use stats::ConnectionStats;
