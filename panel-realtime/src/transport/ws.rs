//! WebSocket connector over tokio-tungstenite.
//!
//! Each session gets a writer task fed by an unbounded channel and a reader
//! task that forwards text frames; both run on the current `LocalSet`.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{header::AUTHORIZATION, HeaderValue};
use tokio_tungstenite::tungstenite::{self, Message};

use super::{Connector, Session, TransportError};

pub struct WsConnector {
    url: String,
}

impl WsConnector {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

#[async_trait(?Send)]
impl Connector for WsConnector {
    async fn connect(&self, credential: &str) -> Result<Session, TransportError> {
        let mut request = self
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| TransportError::Handshake(e.to_string()))?;
        let bearer = HeaderValue::from_str(&format!("Bearer {credential}"))
            .map_err(|e| TransportError::Handshake(format!("invalid credential: {e}")))?;
        request.headers_mut().insert(AUTHORIZATION, bearer);

        tracing::info!(url = %self.url, "Connecting to WebSocket");
        let (stream, _response) = tokio_tungstenite::connect_async(request)
            .await
            .map_err(classify_error)?;

        let (mut sink, mut reader) = stream.split();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();
        let (in_tx, in_rx) = mpsc::unbounded_channel::<String>();

        tokio::task::spawn_local(async move {
            while let Some(frame) = out_rx.recv().await {
                if let Err(e) = sink.send(Message::Text(frame)).await {
                    tracing::warn!(error = %e, "websocket send failed");
                    break;
                }
            }
            let _ = sink.close().await;
        });

        tokio::task::spawn_local(async move {
            while let Some(message) = reader.next().await {
                match message {
                    Ok(Message::Text(text)) => {
                        if in_tx.send(text).is_err() {
                            break;
                        }
                    }
                    Ok(Message::Close(frame)) => {
                        tracing::info!(?frame, "websocket closed by server");
                        break;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        tracing::warn!(error = %e, "websocket receive error");
                        break;
                    }
                }
            }
        });

        Ok(Session {
            outbound: out_tx,
            inbound: in_rx,
        })
    }
}

fn classify_error(error: tungstenite::Error) -> TransportError {
    match error {
        tungstenite::Error::Http(response) => {
            TransportError::Handshake(format!("server answered {}", response.status()))
        }
        tungstenite::Error::Io(e) => TransportError::Io(e.to_string()),
        other => TransportError::Handshake(other.to_string()),
    }
}
