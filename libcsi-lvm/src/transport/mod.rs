//! Unix-socket transport for CSI messages.
//!
//! [`CsiClient`](client::CsiClient) and [`CsiServer`](server::CsiServer)
//! exchange JSON-encoded [`CsiMessage`](crate::CsiMessage) values.  Every
//! connection carries one request and one response: the client writes the
//! request and shuts down its write half, the server answers and closes.

pub mod client;
pub mod server;

/// Upper bound for a single encoded message.
pub const MAX_MESSAGE_BYTES: u64 = 16 * 1024 * 1024;

/// Read one message until EOF, refusing anything larger than
/// [`MAX_MESSAGE_BYTES`].
pub(crate) async fn read_message<R>(reader: R) -> Result<Vec<u8>, crate::CsiError>
where
    R: tokio::io::AsyncRead + Unpin,
{
    use tokio::io::AsyncReadExt;

    let mut buf = Vec::new();
    reader
        .take(MAX_MESSAGE_BYTES + 1)
        .read_to_end(&mut buf)
        .await
        .map_err(crate::CsiError::transport)?;
    if buf.len() as u64 > MAX_MESSAGE_BYTES {
        return Err(crate::CsiError::TransportError(format!(
            "message exceeds {MAX_MESSAGE_BYTES} bytes"
        )));
    }
    Ok(buf)
}
