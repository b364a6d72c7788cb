//! Socket seam. A [`Connector`] opens one socket and hands back a pair of
//! channels; the connection actor never touches the websocket directly.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tracing::{debug, warn};

use super::auth::ConnectRequest;
use crate::error::TransportError;

/// Close code used when the stream ended without a close frame.
pub const CLOSE_ABNORMAL: u16 = 1006;
/// Close code for a close frame that carried no status.
pub const CLOSE_NO_STATUS: u16 = 1005;
pub const CLOSE_NORMAL: u16 = 1000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SocketEvent {
    Text(String),
    Error(String),
    /// Always the last event of a socket.
    Closed { code: Option<u16>, reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SocketCommand {
    Text(String),
    Close,
}

pub struct SocketHandle {
    pub outbound: mpsc::UnboundedSender<SocketCommand>,
    pub inbound: mpsc::UnboundedReceiver<SocketEvent>,
}

#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, request: &ConnectRequest) -> Result<SocketHandle, TransportError>;
}

/// Production connector over tokio-tungstenite.
#[derive(Debug, Default, Clone)]
pub struct WsConnector;

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self, request: &ConnectRequest) -> Result<SocketHandle, TransportError> {
        let mut ws_request = request
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| TransportError::InvalidUrl(e.to_string()))?;
        if let Some(token) = &request.bearer {
            let value = HeaderValue::from_str(&format!("Bearer {token}"))
                .map_err(|e| TransportError::Token(e.to_string()))?;
            ws_request.headers_mut().insert(AUTHORIZATION, value);
        }

        let (stream, _) = tokio_tungstenite::connect_async(ws_request)
            .await
            .map_err(|e| match e {
                WsError::Http(response) if matches!(response.status().as_u16(), 401 | 403) => {
                    TransportError::AuthRejected(format!("HTTP {}", response.status()))
                }
                other => TransportError::Unreachable(other.to_string()),
            })?;

        let (mut writer, mut reader) = stream.split();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<SocketCommand>();
        let (in_tx, in_rx) = mpsc::unbounded_channel::<SocketEvent>();

        tokio::spawn(async move {
            while let Some(cmd) = out_rx.recv().await {
                match cmd {
                    SocketCommand::Text(text) => {
                        if let Err(e) = writer.send(Message::Text(text)).await {
                            warn!("websocket write failed: {}", e);
                            break;
                        }
                    }
                    SocketCommand::Close => break,
                }
            }
            // Handle dropped or close requested
            let _ = writer.send(Message::Close(None)).await;
            let _ = writer.close().await;
        });

        tokio::spawn(async move {
            loop {
                let event = match reader.next().await {
                    Some(Ok(Message::Text(text))) => SocketEvent::Text(text),
                    Some(Ok(Message::Close(frame))) => {
                        let (code, reason) = match frame {
                            Some(f) => (u16::from(f.code), f.reason.into_owned()),
                            None => (CLOSE_NO_STATUS, String::new()),
                        };
                        let _ = in_tx.send(SocketEvent::Closed {
                            code: Some(code),
                            reason,
                        });
                        return;
                    }
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => {
                        debug!("websocket read failed: {}", e);
                        let _ = in_tx.send(SocketEvent::Error(e.to_string()));
                        let _ = in_tx.send(SocketEvent::Closed {
                            code: Some(CLOSE_ABNORMAL),
                            reason: e.to_string(),
                        });
                        return;
                    }
                    None => {
                        let _ = in_tx.send(SocketEvent::Closed {
                            code: Some(CLOSE_ABNORMAL),
                            reason: "stream ended".into(),
                        });
                        return;
                    }
                };
                if in_tx.send(event).is_err() {
                    return;
                }
            }
        });

        Ok(SocketHandle {
            outbound: out_tx,
            inbound: in_rx,
        })
    }
}
