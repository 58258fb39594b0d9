use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use pier_proto::WireMessage;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use super::{BackendConnector, BackendSocket, ConnectError};

/// Dials the backend over tokio-tungstenite.
#[derive(Clone, Debug)]
pub struct WebSocketConnector {
    url: String,
}

impl WebSocketConnector {
    pub fn new(url: impl Into<String>) -> Result<Self, ConnectError> {
        let url = url.into();
        if !(url.starts_with("ws://") || url.starts_with("wss://")) {
            return Err(ConnectError::InvalidUrl {
                url,
                reason: "expected a ws:// or wss:// url".into(),
            });
        }
        Ok(Self { url })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl BackendConnector for WebSocketConnector {
    async fn connect(&self, headers: &[(String, String)]) -> Result<BackendSocket, ConnectError> {
        let mut request =
            self.url
                .as_str()
                .into_client_request()
                .map_err(|err| ConnectError::InvalidUrl {
                    url: self.url.clone(),
                    reason: err.to_string(),
                })?;
        for (name, value) in headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|_| ConnectError::InvalidHeader(name.clone()))?;
            let value = HeaderValue::from_str(value)
                .map_err(|_| ConnectError::InvalidHeader(name.to_string()))?;
            request.headers_mut().append(name, value);
        }

        let (stream, response) = connect_async(request).await.map_err(Box::new)?;
        debug!(url = %self.url, status = %response.status(), "backend websocket established");

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        tokio::spawn(pump(stream, outbound_rx, inbound_tx));

        Ok(BackendSocket {
            outbound: outbound_tx,
            inbound: inbound_rx,
        })
    }
}

/// Moves frames between the socket and the pool until either side stops.
///
/// Returning drops both channel ends, which is how the pool learns the
/// socket is gone.
async fn pump(
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
    mut outbound: mpsc::UnboundedReceiver<WireMessage>,
    inbound: mpsc::UnboundedSender<WireMessage>,
) {
    let (mut sink, mut source) = stream.split();
    loop {
        tokio::select! {
            next = outbound.recv() => match next {
                Some(message) => {
                    let frame = match message {
                        WireMessage::Text(text) => Message::Text(text),
                        WireMessage::Binary(bytes) => Message::Binary(bytes.to_vec()),
                    };
                    if let Err(err) = sink.send(frame).await {
                        warn!(error = %err, "backend write failed");
                        break;
                    }
                }
                None => {
                    let _ = sink.send(Message::Close(None)).await;
                    break;
                }
            },
            incoming = source.next() => match incoming {
                Some(Ok(Message::Text(text))) => {
                    if inbound.send(WireMessage::Text(text)).is_err() {
                        break;
                    }
                }
                Some(Ok(Message::Binary(data))) => {
                    if inbound.send(WireMessage::Binary(Bytes::from(data))).is_err() {
                        break;
                    }
                }
                Some(Ok(Message::Close(frame))) => {
                    info!(
                        reason = ?frame.map(|f| f.reason.to_string()),
                        "backend closed websocket"
                    );
                    break;
                }
                Some(Ok(_)) => continue,
                Some(Err(err)) => {
                    warn!(error = %err, "backend read failed");
                    break;
                }
                None => break,
            },
        }
    }
}
