//! Websocket connector built on tokio-tungstenite.
//!
//! Each link spawns one I/O task that pumps outbound frames into the socket
//! and inbound binary (protobuf) or text (JSON) frames out of it. When either
//! direction ends the task exits, dropping the inbound sender, which the
//! supervisor observes as a lost link.

use std::time::Duration;

use frames::Frame;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tracing::{debug, warn};

use super::{Connector, Link, TransportError};

pub struct WsConnector {
    url: String,
    auth_token: String,
    connect_timeout: Duration,
}

impl WsConnector {
    #[must_use]
    pub fn new(url: impl Into<String>, auth_token: impl Into<String>, connect_timeout: Duration) -> Self {
        Self { url: url.into(), auth_token: auth_token.into(), connect_timeout }
    }
}

#[async_trait::async_trait]
impl Connector for WsConnector {
    async fn connect(&self) -> Result<Link, TransportError> {
        let mut request = self
            .url
            .as_str()
            .into_client_request()
            .map_err(|error| TransportError::InvalidRequest(error.to_string()))?;
        let bearer = HeaderValue::from_str(&format!("Bearer {}", self.auth_token))
            .map_err(|error| TransportError::InvalidRequest(error.to_string()))?;
        request.headers_mut().insert(AUTHORIZATION, bearer);

        let (stream, _) = tokio::time::timeout(self.connect_timeout, connect_async(request))
            .await
            .map_err(|_| TransportError::Timeout(self.url.clone()))?
            .map_err(|error| TransportError::Connect(Box::new(error)))?;
        debug!(url = %self.url, "ws: connected");

        let (mut write, mut read) = stream.split();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Frame>();
        let (in_tx, in_rx) = mpsc::unbounded_channel::<Frame>();

        tokio::spawn(async move {
            let send_task = async move {
                while let Some(frame) = out_rx.recv().await {
                    let bytes = frames::encode_frame(&frame);
                    if write.send(Message::Binary(bytes.into())).await.is_err() {
                        break;
                    }
                }
                let _ = write.close().await;
            };

            let recv_task = async move {
                while let Some(message) = read.next().await {
                    let decoded = match message {
                        Ok(Message::Binary(bytes)) => frames::decode_frame(&bytes),
                        Ok(Message::Text(text)) => frames::decode_json_frame(text.as_str()),
                        Ok(Message::Close(_)) => break,
                        Ok(_) => continue,
                        Err(error) => {
                            warn!(%error, "ws: recv error");
                            break;
                        }
                    };
                    match decoded {
                        Ok(frame) => {
                            if in_tx.send(frame).is_err() {
                                break;
                            }
                        }
                        Err(error) => warn!(%error, "ws: dropping undecodable frame"),
                    }
                }
            };

            tokio::select! {
                () = send_task => {}
                () = recv_task => {}
            }
            debug!("ws: link closed");
        });

        Ok(Link { outbound: out_tx, inbound: in_rx })
    }
}
