use hmac::{Hmac, Mac};
use rand::RngCore;
use serde_json::Value;
use sha2::Sha256;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::MessageBusError;

type HmacSha256 = Hmac<Sha256>;

/// Which side of the socket runs which half of the challenge-response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

/// Run the shared-token handshake for `role` before handing the stream to the
/// Connection Engine. The exchange is two newline-delimited JSON lines, sent
/// before any framed message: a server-issued nonce, then the client's
/// `HMAC-SHA256(token, nonce)` over it. Either side closes the socket on
/// mismatch rather than proceeding.
pub async fn handshake<S>(stream: &mut S, role: Role, token: &[u8]) -> Result<(), MessageBusError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    match role {
        Role::Server => server_handshake(stream, token).await,
        Role::Client => client_handshake(stream, token).await,
    }
}

async fn server_handshake<S>(stream: &mut S, token: &[u8]) -> Result<(), MessageBusError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut nonce = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut nonce);
    write_line(stream, &serde_json::json!({ "nonce": hex::encode(nonce) })).await?;

    let response = read_line(stream).await?;
    let provided = response
        .get("hmac")
        .and_then(Value::as_str)
        .ok_or_else(|| MessageBusError::AuthFailed("missing hmac field".into()))?;
    let provided = hex::decode(provided)
        .map_err(|_| MessageBusError::AuthFailed("hmac field is not hex".into()))?;

    let mut mac = mac_for(token);
    mac.update(&nonce);
    mac.verify_slice(&provided)
        .map_err(|_| MessageBusError::AuthFailed("hmac mismatch".into()))
}

async fn client_handshake<S>(stream: &mut S, token: &[u8]) -> Result<(), MessageBusError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let challenge = read_line(stream).await?;
    let nonce = challenge
        .get("nonce")
        .and_then(Value::as_str)
        .ok_or_else(|| MessageBusError::AuthFailed("missing nonce field".into()))?;
    let nonce = hex::decode(nonce).map_err(|_| MessageBusError::AuthFailed("nonce is not hex".into()))?;

    let mut mac = mac_for(token);
    mac.update(&nonce);
    let tag = mac.finalize().into_bytes();
    write_line(stream, &serde_json::json!({ "hmac": hex::encode(tag) })).await
}

fn mac_for(token: &[u8]) -> HmacSha256 {
    HmacSha256::new_from_slice(token).expect("HMAC accepts a key of any length")
}

async fn write_line<S: AsyncWrite + Unpin>(stream: &mut S, value: &Value) -> Result<(), MessageBusError> {
    let mut line = serde_json::to_string(value)
        .map_err(|e| MessageBusError::InvalidEnvelope(e.to_string()))?;
    line.push('\n');
    stream.write_all(line.as_bytes()).await?;
    Ok(())
}

/// Read one newline-delimited JSON value. Byte-at-a-time so the handshake
/// never over-reads past the delimiter into bytes that belong to the first
/// framed message the Connection Engine will see next.
async fn read_line<S: AsyncRead + Unpin>(stream: &mut S) -> Result<Value, MessageBusError> {
    let mut buf = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        let n = stream.read(&mut byte).await?;
        if n == 0 {
            return Err(MessageBusError::AuthFailed("peer closed during handshake".into()));
        }
        if byte[0] == b'\n' {
            break;
        }
        buf.push(byte[0]);
    }
    serde_json::from_slice(&buf).map_err(|e| MessageBusError::InvalidEnvelope(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn matching_tokens_authenticate() {
        let (mut server_side, mut client_side) = tokio::io::duplex(256);
        let token = b"shared-secret".to_vec();

        let server_token = token.clone();
        let server = tokio::spawn(async move { server_handshake(&mut server_side, &server_token).await });
        let client_token = token.clone();
        let client = tokio::spawn(async move { client_handshake(&mut client_side, &client_token).await });

        assert!(server.await.unwrap().is_ok());
        assert!(client.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn mismatched_tokens_fail_on_the_server_side() {
        let (mut server_side, mut client_side) = tokio::io::duplex(256);

        let server = tokio::spawn(async move { server_handshake(&mut server_side, b"correct").await });
        let client = tokio::spawn(async move { client_handshake(&mut client_side, b"wrong").await });

        assert!(matches!(server.await.unwrap(), Err(MessageBusError::AuthFailed(_))));
        let _ = client.await.unwrap();
    }
}
