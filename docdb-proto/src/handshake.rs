//! Handshake messages exchanged before the first frame
//!
//! V1 messages are NUL-terminated JSON objects; the legacy V0_4 prelude is a
//! fixed binary header answered by a NUL-terminated ASCII status line.

use serde::{Deserialize, Serialize};

use super::error::ProtocolError;

/// Magic number opening a legacy (auth key) handshake
pub const V0_4_MAGIC: u32 = 0x400c_2d20;
/// Magic number opening a SCRAM handshake
pub const V1_0_MAGIC: u32 = 0x34c2_bdc3;
/// Selects the JSON query protocol in the legacy handshake
pub const JSON_PROTOCOL_MAGIC: u32 = 0x7e69_70c7;

pub const PROTOCOL_VERSION: i64 = 0;
pub const AUTHENTICATION_METHOD: &str = "SCRAM-SHA-256";
pub const LEGACY_SUCCESS: &str = "SUCCESS";

/// Longest NUL-terminated handshake message accepted from the server
pub const MAX_HANDSHAKE_MESSAGE: usize = 64 * 1024;

/// First message of a V1 handshake, sent by the server after the magic number
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerVersion {
    pub success: bool,
    #[serde(default)]
    pub min_protocol_version: i64,
    #[serde(default)]
    pub max_protocol_version: i64,
    #[serde(default)]
    pub server_version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientFirst {
    pub protocol_version: i64,
    pub authentication_method: String,
    pub authentication: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientFinal {
    pub authentication: String,
}

/// Server answer to either client message
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthReply {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authentication: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<i64>,
}

impl AuthReply {
    /// The `authentication` payload of a successful reply
    pub fn into_authentication(self) -> Result<String, ProtocolError> {
        if !self.success {
            let message = self.error.unwrap_or_else(|| "unknown error".to_string());
            return Err(match self.error_code {
                Some(code) if (10..=20).contains(&code) => ProtocolError::Auth(message),
                _ => ProtocolError::Handshake(message),
            });
        }

        self.authentication
            .ok_or_else(|| ProtocolError::Handshake("missing authentication payload".to_string()))
    }
}

impl ServerVersion {
    /// Reject servers that cannot speak protocol version 0
    pub fn check(&self) -> Result<(), ProtocolError> {
        if !self.success {
            return Err(ProtocolError::Handshake(
                self.error
                    .clone()
                    .unwrap_or_else(|| "server refused the connection".to_string()),
            ));
        }
        if PROTOCOL_VERSION < self.min_protocol_version
            || PROTOCOL_VERSION > self.max_protocol_version
        {
            return Err(ProtocolError::Handshake(format!(
                "unsupported protocol version {}, server supports {}..={}",
                PROTOCOL_VERSION, self.min_protocol_version, self.max_protocol_version
            )));
        }
        Ok(())
    }
}

/// Serialize a V1 message followed by the NUL terminator
pub fn encode_message<T: Serialize>(msg: &T) -> Result<Vec<u8>, ProtocolError> {
    let mut buf = serde_json::to_vec(msg)?;
    buf.push(0);
    Ok(buf)
}

/// Legacy prelude: magic, key length, key, protocol magic
pub fn encode_legacy(auth_key: &str) -> Vec<u8> {
    let key = auth_key.as_bytes();
    let mut buf = Vec::with_capacity(12 + key.len());
    buf.extend_from_slice(&V0_4_MAGIC.to_le_bytes());
    buf.extend_from_slice(&(key.len() as u32).to_le_bytes());
    buf.extend_from_slice(key);
    buf.extend_from_slice(&JSON_PROTOCOL_MAGIC.to_le_bytes());
    buf
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_legacy_prelude() {
        let buf = encode_legacy("key");
        assert_eq!(&buf[..4], &[0x20, 0x2d, 0x0c, 0x40]);
        assert_eq!(&buf[4..8], &[3, 0, 0, 0]);
        assert_eq!(&buf[8..11], b"key");
        assert_eq!(&buf[11..], &[0xc7, 0x70, 0x69, 0x7e]);
    }

    #[test]
    fn test_message_is_nul_terminated() {
        let buf = encode_message(&ClientFinal {
            authentication: "c=biws".to_string(),
        })
        .unwrap();
        assert_eq!(buf.last(), Some(&0));
        assert_eq!(&buf[..buf.len() - 1], br#"{"authentication":"c=biws"}"#);
    }

    #[test]
    fn test_version_range() {
        let version = ServerVersion {
            success: true,
            min_protocol_version: 1,
            max_protocol_version: 2,
            server_version: "2.4.0".to_string(),
            error: None,
        };
        assert!(matches!(version.check(), Err(ProtocolError::Handshake(_))));
    }

    #[test]
    fn test_auth_error_codes() {
        let reply = AuthReply {
            success: false,
            authentication: None,
            error: Some("Wrong password".to_string()),
            error_code: Some(12),
        };
        assert!(matches!(
            reply.into_authentication(),
            Err(ProtocolError::Auth(msg)) if msg == "Wrong password"
        ));
    }
}
