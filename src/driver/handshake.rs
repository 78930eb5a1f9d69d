//! Client side of the connection handshake
//!
//! Runs once on a freshly dialed stream, before any frame is exchanged.

use docdb_proto::handshake::{
    encode_legacy, encode_message, AuthReply, ClientFinal, ClientFirst, ServerVersion,
    AUTHENTICATION_METHOD, LEGACY_SUCCESS, MAX_HANDSHAKE_MESSAGE, PROTOCOL_VERSION, V1_0_MAGIC,
};
use docdb_proto::{ProtocolError, ScramClient};
use serde::de::DeserializeOwned;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::cluster::config::{ConnectOpts, HandshakeVersion};
use crate::error::{DriverError, DriverResult};

/// Authenticate `stream` with the flavour selected in `opts`
pub async fn perform<S>(stream: &mut S, opts: &ConnectOpts) -> DriverResult<()>
where
    S: AsyncRead + AsyncWrite + Unpin + ?Sized,
{
    match opts.handshake_version {
        HandshakeVersion::V1_0 => v1(stream, &opts.username, &opts.password).await,
        HandshakeVersion::V0_4 => legacy(stream, &opts.auth_key).await,
    }
}

pub async fn v1<S>(stream: &mut S, username: &str, password: &str) -> DriverResult<()>
where
    S: AsyncRead + AsyncWrite + Unpin + ?Sized,
{
    v1_with(stream, ScramClient::new(username, password)).await
}

/// SCRAM exchange with a caller-supplied client state
pub async fn v1_with<S>(stream: &mut S, mut scram: ScramClient) -> DriverResult<()>
where
    S: AsyncRead + AsyncWrite + Unpin + ?Sized,
{
    send(stream, &V1_0_MAGIC.to_le_bytes()).await?;

    let version: ServerVersion = read_message(stream).await?;
    version.check()?;

    let first = ClientFirst {
        protocol_version: PROTOCOL_VERSION,
        authentication_method: AUTHENTICATION_METHOD.to_string(),
        authentication: scram.client_first_message(),
    };
    send(stream, &encode_message(&first)?).await?;

    let server_first = read_message::<_, AuthReply>(stream)
        .await?
        .into_authentication()?;
    let client_final = ClientFinal {
        authentication: scram.handle_server_first(&server_first)?,
    };
    send(stream, &encode_message(&client_final)?).await?;

    let server_final = read_message::<_, AuthReply>(stream)
        .await?
        .into_authentication()?;
    scram.verify_server_final(&server_final)?;
    Ok(())
}

/// Auth-key prelude answered by a NUL-terminated status line
pub async fn legacy<S>(stream: &mut S, auth_key: &str) -> DriverResult<()>
where
    S: AsyncRead + AsyncWrite + Unpin + ?Sized,
{
    send(stream, &encode_legacy(auth_key)).await?;

    let status = read_nul_terminated(stream).await?;
    let status = String::from_utf8_lossy(&status);
    if status.trim() != LEGACY_SUCCESS {
        return Err(DriverError::Handshake(format!(
            "server dropped connection with message: {}",
            status.trim()
        )));
    }
    Ok(())
}

async fn send<S>(stream: &mut S, bytes: &[u8]) -> DriverResult<()>
where
    S: AsyncWrite + Unpin + ?Sized,
{
    stream.write_all(bytes).await?;
    stream.flush().await?;
    Ok(())
}

async fn read_message<S, T>(stream: &mut S) -> DriverResult<T>
where
    S: AsyncRead + Unpin + ?Sized,
    T: DeserializeOwned,
{
    let bytes = read_nul_terminated(stream).await?;
    serde_json::from_slice(&bytes).map_err(|e| {
        DriverError::Handshake(format!(
            "unexpected handshake message {:?}: {}",
            String::from_utf8_lossy(&bytes),
            e
        ))
    })
}

/// Read up to the NUL terminator, one byte at a time so nothing past it is consumed
async fn read_nul_terminated<S>(stream: &mut S) -> DriverResult<Vec<u8>>
where
    S: AsyncRead + Unpin + ?Sized,
{
    let mut buf = Vec::new();
    loop {
        let byte = stream.read_u8().await?;
        if byte == 0 {
            return Ok(buf);
        }
        if buf.len() >= MAX_HANDSHAKE_MESSAGE {
            return Err(ProtocolError::Handshake("handshake message too long".to_string()).into());
        }
        buf.push(byte);
    }
}
