//! Wire protocol definitions for the docdb driver
//!
//! Every message on the socket is a 12-byte header followed by a JSON body:
//! - **Token**: 8 bytes, little-endian `u64`, echoed back by the server
//! - **Length**: 4 bytes, little-endian `u32`, size of the body
//! - **Body**: UTF-8 JSON (`[type, term, opts]` outbound, `{"t": .., "r": ..}` inbound)
//!
//! Before the first frame the client runs a handshake, either the V1
//! SCRAM-SHA-256 exchange or the legacy V0_4 auth-key prelude.

pub mod codec;
pub mod error;
pub mod handshake;
pub mod query;
pub mod response;
pub mod scram;
pub mod types;

pub use codec::{
    decode_response, encode_frame, encode_query, read_frame, write_frame, Frame, HEADER_SIZE,
    MAX_MESSAGE_SIZE,
};
pub use error::ProtocolError;
pub use query::Query;
pub use response::{Response, ServerResponse};
pub use scram::ScramClient;
pub use types::{ErrorType, QueryType, ResponseNote, ResponseType};
