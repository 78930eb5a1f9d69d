use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::error::ProtocolError;
use super::query::Query;
use super::response::Response;

/// Token (8 bytes) + body length (4 bytes)
pub const HEADER_SIZE: usize = 12;
pub const MAX_MESSAGE_SIZE: usize = 64 * 1024 * 1024;

/// One message read off the socket
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub token: u64,
    pub body: Vec<u8>,
}

pub fn encode_header(token: u64, len: usize) -> Result<[u8; HEADER_SIZE], ProtocolError> {
    if len > MAX_MESSAGE_SIZE {
        return Err(ProtocolError::MessageTooLarge(len));
    }

    let mut header = [0u8; HEADER_SIZE];
    header[..8].copy_from_slice(&token.to_le_bytes());
    header[8..].copy_from_slice(&(len as u32).to_le_bytes());
    Ok(header)
}

pub fn decode_header(header: &[u8; HEADER_SIZE]) -> (u64, usize) {
    let mut token = [0u8; 8];
    token.copy_from_slice(&header[..8]);
    let mut len = [0u8; 4];
    len.copy_from_slice(&header[8..]);
    (u64::from_le_bytes(token), u32::from_le_bytes(len) as usize)
}

/// Header and body in one buffer, so a frame goes out in a single write
pub fn encode_frame(token: u64, body: &[u8]) -> Result<Vec<u8>, ProtocolError> {
    let header = encode_header(token, body.len())?;
    let mut buf = Vec::with_capacity(HEADER_SIZE + body.len());
    buf.extend_from_slice(&header);
    buf.extend_from_slice(body);
    Ok(buf)
}

/// Serialize a query into a complete frame. Bodies carry a trailing newline.
pub fn encode_query(query: &Query) -> Result<Vec<u8>, ProtocolError> {
    let mut body = serde_json::to_vec(&query.body())?;
    body.push(b'\n');
    encode_frame(query.token, &body)
}

pub fn decode_response(token: u64, body: &[u8]) -> Result<Response, ProtocolError> {
    let mut response: Response = serde_json::from_slice(body)?;
    response.token = token;
    Ok(response)
}

pub async fn read_frame<R>(reader: &mut R) -> Result<Frame, ProtocolError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut header = [0u8; HEADER_SIZE];
    reader.read_exact(&mut header).await?;

    let (token, len) = decode_header(&header);
    if len > MAX_MESSAGE_SIZE {
        return Err(ProtocolError::MessageTooLarge(len));
    }

    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    Ok(Frame { token, body })
}

pub async fn write_frame<W>(writer: &mut W, token: u64, body: &[u8]) -> Result<(), ProtocolError>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let frame = encode_frame(token, body)?;
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}
