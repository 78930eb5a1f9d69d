//! Cluster-aware client driver for a distributed JSON document database
//!
//! Queries are pre-built term trees in their JSON wire form. A [`Session`]
//! connects to one or more seed servers, optionally discovers the rest of the
//! cluster, and routes every query to a healthy node, retrying on another
//! node when a connection fails.

pub mod cluster;
pub mod context;
pub mod driver;
pub mod error;
pub mod executor;
pub mod mock;
pub mod session;

pub use cluster::{Cluster, ConnectOpts, HandshakeVersion, Host, HostPool, Node};
pub use context::Context;
pub use driver::{Connection, Cursor, CursorKind, Pool};
pub use error::{DriverError, DriverResult, ServerError};
pub use executor::QueryExecutor;
pub use session::Session;

pub use docdb_proto::{ErrorType, Query, QueryType, Response, ServerResponse};
