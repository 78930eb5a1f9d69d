//! Client side of SCRAM-SHA-256 (RFC 5802 / RFC 7677)

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::{Digest, Sha256};

use super::error::ProtocolError;

type HmacSha256 = Hmac<Sha256>;

const NONCE_LEN: usize = 18;
/// Base64 of the `n,,` GS2 header
const CHANNEL_BINDING: &str = "biws";

/// SCRAM exchange state for one handshake
pub struct ScramClient {
    username: String,
    password: String,
    nonce: String,
    client_first_bare: String,
    expected_server_signature: Option<Vec<u8>>,
}

impl ScramClient {
    pub fn new(username: &str, password: &str) -> Self {
        let mut bytes = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self::with_nonce(username, password, &BASE64.encode(bytes))
    }

    /// Fixed client nonce, for reproducible exchanges
    pub fn with_nonce(username: &str, password: &str, nonce: &str) -> Self {
        let client_first_bare = format!("n={},r={}", escape_username(username), nonce);
        Self {
            username: username.to_string(),
            password: password.to_string(),
            nonce: nonce.to_string(),
            client_first_bare,
            expected_server_signature: None,
        }
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn client_first_message(&self) -> String {
        format!("n,,{}", self.client_first_bare)
    }

    /// Consume `r=..,s=..,i=..` and produce the client-final message with its proof
    pub fn handle_server_first(&mut self, server_first: &str) -> Result<String, ProtocolError> {
        let mut server_nonce = None;
        let mut salt = None;
        let mut iterations = None;

        for attr in server_first.split(',') {
            match attr.split_once('=') {
                Some(("r", v)) => server_nonce = Some(v),
                Some(("s", v)) => salt = Some(v),
                Some(("i", v)) => iterations = Some(v),
                _ => {}
            }
        }

        let server_nonce = server_nonce.ok_or_else(|| malformed("missing nonce"))?;
        let salt = salt.ok_or_else(|| malformed("missing salt"))?;
        let iterations: u32 = iterations
            .ok_or_else(|| malformed("missing iteration count"))?
            .parse()
            .map_err(|_| malformed("invalid iteration count"))?;

        if !server_nonce.starts_with(&self.nonce) {
            return Err(ProtocolError::Auth(
                "server nonce does not extend client nonce".to_string(),
            ));
        }
        if iterations == 0 {
            return Err(malformed("iteration count must be positive"));
        }

        let salt = BASE64
            .decode(salt)
            .map_err(|e| malformed(&format!("invalid salt: {}", e)))?;
        let salted = salted_password(self.password.as_bytes(), &salt, iterations)?;

        let client_key = hmac(&salted, b"Client Key")?;
        let stored_key = Sha256::digest(client_key);
        let without_proof = format!("c={},r={}", CHANNEL_BINDING, server_nonce);
        let auth_message = format!(
            "{},{},{}",
            self.client_first_bare, server_first, without_proof
        );

        let client_signature = hmac(&stored_key, auth_message.as_bytes())?;
        let proof: Vec<u8> = client_key
            .iter()
            .zip(client_signature.iter())
            .map(|(k, s)| k ^ s)
            .collect();

        let server_key = hmac(&salted, b"Server Key")?;
        self.expected_server_signature = Some(hmac(&server_key, auth_message.as_bytes())?.to_vec());

        Ok(format!("{},p={}", without_proof, BASE64.encode(proof)))
    }

    /// Check the `v=..` server signature
    pub fn verify_server_final(&self, server_final: &str) -> Result<(), ProtocolError> {
        let expected = self
            .expected_server_signature
            .as_ref()
            .ok_or_else(|| ProtocolError::Handshake("server-final before server-first".to_string()))?;

        let signature = server_final
            .split(',')
            .find_map(|attr| attr.strip_prefix("v="))
            .ok_or_else(|| malformed("missing server signature"))?;
        let signature = BASE64
            .decode(signature)
            .map_err(|e| malformed(&format!("invalid server signature: {}", e)))?;

        if &signature != expected {
            return Err(ProtocolError::Auth("invalid server signature".to_string()));
        }
        Ok(())
    }
}

fn escape_username(username: &str) -> String {
    username.replace('=', "=3D").replace(',', "=2C")
}

fn malformed(msg: &str) -> ProtocolError {
    ProtocolError::Handshake(format!("malformed SCRAM message: {}", msg))
}

fn hmac(key: &[u8], data: &[u8]) -> Result<[u8; 32], ProtocolError> {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(key)
        .map_err(|e| ProtocolError::Handshake(e.to_string()))?;
    mac.update(data);
    let mut out = [0u8; 32];
    out.copy_from_slice(&mac.finalize().into_bytes());
    Ok(out)
}

/// PBKDF2-HMAC-SHA256 with a single output block (`Hi` in RFC 5802)
fn salted_password(password: &[u8], salt: &[u8], iterations: u32) -> Result<[u8; 32], ProtocolError> {
    let mut block = Vec::with_capacity(salt.len() + 4);
    block.extend_from_slice(salt);
    block.extend_from_slice(&1u32.to_be_bytes());

    let mut u = hmac(password, &block)?;
    let mut result = u;
    for _ in 1..iterations {
        u = hmac(password, &u)?;
        for (r, b) in result.iter_mut().zip(u.iter()) {
            *r ^= b;
        }
    }
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;

    // RFC 7677 section 3
    const NONCE: &str = "rOprNGfwEbeRWgbNEkqO";
    const SERVER_FIRST: &str =
        "r=rOprNGfwEbeRWgbNEkqO%hvYDpWUa2RaTCAfuxFIlj)hNlF$k0,s=W22ZaJ0SNY7soEsUEjb6gQ==,i=4096";
    const CLIENT_FINAL: &str = "c=biws,r=rOprNGfwEbeRWgbNEkqO%hvYDpWUa2RaTCAfuxFIlj)hNlF$k0,p=dHzbZapWIk4jUhN+Ute9ytag9zjfMHgsqmmiz7AndVQ=";
    const SERVER_FINAL: &str = "v=6rriTRBi23WpRR/wtup+mMhUZUn/dB5nLTJRsjl95G4=";

    #[test]
    fn test_rfc7677_exchange() {
        let mut scram = ScramClient::with_nonce("user", "pencil", NONCE);
        assert_eq!(scram.client_first_message(), "n,,n=user,r=rOprNGfwEbeRWgbNEkqO");

        let client_final = scram.handle_server_first(SERVER_FIRST).unwrap();
        assert_eq!(client_final, CLIENT_FINAL);
        scram.verify_server_final(SERVER_FINAL).unwrap();
    }

    #[test]
    fn test_wrong_server_signature() {
        let mut scram = ScramClient::with_nonce("user", "pencil", NONCE);
        scram.handle_server_first(SERVER_FIRST).unwrap();
        let err = scram
            .verify_server_final("v=AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA=")
            .unwrap_err();
        assert!(matches!(err, ProtocolError::Auth(_)));
    }

    #[test]
    fn test_foreign_nonce_rejected() {
        let mut scram = ScramClient::with_nonce("user", "pencil", "abc");
        let err = scram
            .handle_server_first("r=xyz123,s=W22ZaJ0SNY7soEsUEjb6gQ==,i=4096")
            .unwrap_err();
        assert!(matches!(err, ProtocolError::Auth(_)));
    }

    #[test]
    fn test_username_escaping() {
        let scram = ScramClient::with_nonce("a=b,c", "pw", "n");
        assert_eq!(scram.client_first_message(), "n,,n=a=3Db=2Cc,r=n");
    }

    #[test]
    fn test_random_nonces_differ() {
        let a = ScramClient::new("admin", "");
        let b = ScramClient::new("admin", "");
        assert_ne!(a.client_first_message(), b.client_first_message());
    }
}
