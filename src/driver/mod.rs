//! Connection layer of the driver
//!
//! Every socket carries framed messages:
//! - **Header**: 8-byte little-endian token, 4-byte little-endian body length
//! - **Query body**: `[type, term, opts]` JSON followed by a newline
//! - **Response body**: `{"t": type, "r": [docs], ...}` JSON
//!
//! A [`Connection`] multiplexes concurrent queries over one socket, a
//! [`Cursor`] streams the batches of one query, and a [`Pool`] spreads
//! queries over a fixed number of connections to the same server.

pub use docdb_proto::{
    ErrorType, Query, QueryType, Response, ResponseNote, ResponseType, ServerResponse,
};

pub mod connection;
pub mod cursor;
mod dispatch;
pub mod handshake;
pub mod pool;

pub use connection::Connection;
pub use cursor::{Cursor, CursorKind};
pub use pool::Pool;
