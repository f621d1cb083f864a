//! WebSocket connection to a Murmur server.
//!
//! [`open`] dials the server with the credential in an `Authorization`
//! header and waits for the `connected` greeting. The returned halves are
//! owned by the client supervisor for the lifetime of the connection.

use std::time::Duration;

use futures_util::StreamExt;
use futures_util::stream::{SplitSink, SplitStream};
use murmur_proto::codec;
use murmur_proto::event::ServerEvent;
use murmur_proto::message::UserProfile;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

use crate::error::ClientError;

type WsStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

/// Write half of the WebSocket.
pub type WsSender = SplitSink<WsStream, Message>;

/// Read half of the WebSocket.
pub type WsReader = SplitStream<WsStream>;

/// An authenticated connection.
pub struct Connection {
    /// Write half.
    pub sender: WsSender,
    /// Read half.
    pub reader: WsReader,
    /// The identity the server verified.
    pub user: UserProfile,
}

/// Connect to `url`, authenticate with `token` and wait for `connected`.
///
/// `timeout` bounds the dial and the greeting separately.
///
/// # Errors
///
/// - [`ClientError::Timeout`] if either step times out.
/// - [`ClientError::Transport`] if the socket cannot be opened or closes early.
/// - [`ClientError::Server`] if the server rejects the credential.
pub async fn open(url: &str, token: &str, timeout: Duration) -> Result<Connection, ClientError> {
    let mut request = url
        .into_client_request()
        .map_err(|e| ClientError::Transport(format!("invalid server url: {e}")))?;
    let bearer = HeaderValue::from_str(&format!("Bearer {token}"))
        .map_err(|_| ClientError::Transport("token is not a valid header value".into()))?;
    request.headers_mut().insert("Authorization", bearer);

    let (ws_stream, _response) = tokio::time::timeout(timeout, connect_async(request))
        .await
        .map_err(|_| {
            tracing::warn!(url, "WebSocket connect timed out");
            ClientError::Timeout
        })?
        .map_err(|e| {
            tracing::warn!(url, err = %e, "WebSocket connect failed");
            map_ws_connect_error(&e)
        })?;

    let (sender, mut reader) = ws_stream.split();

    let greeting = tokio::time::timeout(timeout, next_text(&mut reader))
        .await
        .map_err(|_| {
            tracing::warn!(url, "no greeting from server");
            ClientError::Timeout
        })??;

    match codec::decode_server(&greeting)?.event {
        ServerEvent::Connected { user } => {
            tracing::info!(url, user_id = %user.id, "connected to murmur server");
            Ok(Connection {
                sender,
                reader,
                user,
            })
        }
        ServerEvent::Error { code, message } => {
            tracing::warn!(%code, reason = %message, "server rejected connection");
            Err(ClientError::Server { code, message })
        }
        other => {
            tracing::warn!(event = other.name(), "unexpected greeting");
            Err(ClientError::UnexpectedReply(other.name()))
        }
    }
}

/// Read until the next text frame, skipping control frames.
async fn next_text(reader: &mut WsReader) -> Result<String, ClientError> {
    while let Some(msg) = reader.next().await {
        match msg {
            Ok(Message::Text(text)) => return Ok(text.as_str().to_owned()),
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => return Err(ClientError::Transport(e.to_string())),
        }
    }
    Err(ClientError::Transport("connection closed during handshake".into()))
}

/// Map a `tokio_tungstenite` connection error to a [`ClientError`].
fn map_ws_connect_error(err: &tokio_tungstenite::tungstenite::Error) -> ClientError {
    use tokio_tungstenite::tungstenite::Error as WsError;
    match err {
        WsError::Http(response) => ClientError::Transport(format!(
            "server HTTP error: status {}",
            response.status()
        )),
        WsError::Tls(_) => ClientError::Transport(format!("TLS error: {err}")),
        other => ClientError::Transport(other.to_string()),
    }
}
