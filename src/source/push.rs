//! WebSocket push channel to the `canvas-store` service.
//!
//! A channel is opened against `/ws/:subject_id`; the service answers with the
//! subject's snapshot (or `not_found`) and then pushes every stored update.

use async_trait::async_trait;
use futures_util::{SinkExt, Stream, StreamExt};
use reqwest::Url;
use tokio::net::TcpStream;
use tokio_tungstenite::{tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use super::{DocumentUpdate, InFlightLoads, LoadError, Loader};
use crate::protocol::{ClientMessage, PushProtocol, ServerMessage};
use crate::scene::{Document, SubjectId};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Build the push URL for a subject from a `ws://` or `wss://` base
pub fn push_url(base_url: &str, subject: &SubjectId) -> Result<Url, LoadError> {
    let mut url = Url::parse(base_url)
        .map_err(|e| LoadError::Transport(format!("Invalid push URL {}: {}", base_url, e)))?;
    match url.path_segments_mut() {
        Ok(mut segments) => {
            segments.pop_if_empty().extend(["ws", subject.as_str()]);
        }
        Err(()) => {
            return Err(LoadError::Transport(format!(
                "Push URL cannot carry a path: {}",
                base_url
            )))
        }
    }
    Ok(url)
}

/// One open push connection
pub struct PushChannel {
    socket: Socket,
    subject: SubjectId,
}

impl PushChannel {
    pub async fn connect(base_url: &str, subject: &SubjectId) -> Result<Self, LoadError> {
        let url = push_url(base_url, subject)?;
        debug!("Connecting push channel to {}", url);

        let (socket, _) = tokio_tungstenite::connect_async(url.as_str())
            .await
            .map_err(|e| LoadError::Transport(e.to_string()))?;

        Ok(Self {
            socket,
            subject: subject.clone(),
        })
    }

    pub fn subject(&self) -> &SubjectId {
        &self.subject
    }

    /// Move this connection to another subject; a fresh snapshot follows
    pub async fn subscribe(&mut self, subject: &SubjectId) -> Result<(), LoadError> {
        self.send(&ClientMessage::Subscribe {
            subject_id: subject.clone(),
        })
        .await?;
        self.subject = subject.clone();
        Ok(())
    }

    pub async fn ping(&mut self) -> Result<(), LoadError> {
        let timestamp = chrono::Utc::now().timestamp_millis().max(0) as u64;
        self.send(&ClientMessage::Ping { timestamp }).await
    }

    async fn send(&mut self, msg: &ClientMessage) -> Result<(), LoadError> {
        let bytes =
            PushProtocol::encode_client(msg).map_err(|e| LoadError::Decode(e.to_string()))?;
        self.socket
            .send(Message::Binary(bytes.to_vec()))
            .await
            .map_err(|e| LoadError::Transport(e.to_string()))
    }

    /// Next decoded server message; `None` once the connection is closed
    pub async fn next_message(&mut self) -> Option<Result<ServerMessage, LoadError>> {
        while let Some(frame) = self.socket.next().await {
            let frame = match frame {
                Ok(frame) => frame,
                Err(e) => return Some(Err(LoadError::Transport(e.to_string()))),
            };

            match frame {
                Message::Binary(data) => {
                    return Some(
                        PushProtocol::decode_server(&data)
                            .map_err(|e| LoadError::Decode(e.to_string())),
                    );
                }
                // JSON text frames are accepted for debugging
                Message::Text(text) => {
                    return Some(
                        serde_json::from_str::<ServerMessage>(&text)
                            .map_err(|e| LoadError::Decode(e.to_string())),
                    );
                }
                Message::Close(_) => {
                    debug!("Push channel for {} closed by server", self.subject);
                    return None;
                }
                _ => {}
            }
        }
        None
    }

    /// Wait for the answer to the current subscription
    pub async fn initial_document(&mut self) -> Result<Option<Document>, LoadError> {
        loop {
            match self.next_message().await {
                Some(Ok(ServerMessage::Snapshot { document })) => return Ok(Some(document)),
                Some(Ok(ServerMessage::NotFound { .. })) => return Ok(None),
                Some(Ok(ServerMessage::Error { message, .. })) => {
                    return Err(LoadError::Transport(message))
                }
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Err(e),
                None => return Err(LoadError::Closed),
            }
        }
    }

    /// Stream of stored updates for the subscribed subject.
    ///
    /// Undecodable frames are logged and skipped; the stream ends when the
    /// connection does.
    pub fn into_updates(self) -> impl Stream<Item = DocumentUpdate> + Send + 'static {
        futures_util::stream::unfold(self, |mut channel| async move {
            loop {
                match channel.next_message().await? {
                    Ok(ServerMessage::DocumentUpdated { update }) => {
                        return Some((update, channel));
                    }
                    Ok(ServerMessage::Snapshot { document }) => {
                        let update = DocumentUpdate {
                            document,
                            origin: None,
                        };
                        return Some((update, channel));
                    }
                    Ok(_) => continue,
                    Err(e) => warn!("Dropping push frame for {}: {}", channel.subject, e),
                }
            }
        })
    }

    pub async fn close(mut self) {
        if let Err(e) = self.socket.close(None).await {
            debug!("Push channel close for {}: {}", self.subject, e);
        }
    }
}

/// [`Loader`] that opens a short-lived push channel per load
pub struct PushLoader {
    base_url: String,
    in_flight: InFlightLoads,
}

impl PushLoader {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            in_flight: InFlightLoads::default(),
        }
    }
}

#[async_trait]
impl Loader for PushLoader {
    async fn load(&self, subject: &SubjectId) -> Result<Option<Document>, LoadError> {
        let _guard = self.in_flight.begin(subject);

        let mut channel = PushChannel::connect(&self.base_url, subject).await?;
        let result = channel.initial_document().await;
        channel.close().await;

        if let Ok(document) = &result {
            info!(
                "Push load of {} answered ({})",
                subject,
                if document.is_some() { "snapshot" } else { "not found" }
            );
        }
        result
    }

    fn is_loading(&self, subject: &SubjectId) -> bool {
        self.in_flight.contains(subject)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::document;
    use tokio::net::TcpListener;

    async fn serve_once(reply: ServerMessage) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            let bytes = PushProtocol::encode_server(&reply).unwrap();
            ws.send(Message::Binary(bytes.to_vec())).await.unwrap();
            // Drain until the client hangs up
            while let Some(Ok(_)) = ws.next().await {}
        });

        format!("ws://{}", addr)
    }

    #[test]
    fn test_push_url() {
        let url = push_url("ws://localhost:5000", &SubjectId::new("201")).unwrap();
        assert_eq!(url.as_str(), "ws://localhost:5000/ws/201");

        assert!(push_url("nope", &SubjectId::new("201")).is_err());
    }

    #[tokio::test]
    async fn test_push_loader_snapshot() {
        let base = serve_once(ServerMessage::Snapshot {
            document: document("201", 2),
        })
        .await;

        let loader = PushLoader::new(base);
        let doc = loader.load(&SubjectId::new("201")).await.unwrap().unwrap();
        assert_eq!(doc.scene.elements.len(), 2);
        assert!(!loader.is_loading(&SubjectId::new("201")));
    }

    #[tokio::test]
    async fn test_push_loader_not_found() {
        let base = serve_once(ServerMessage::NotFound {
            subject_id: SubjectId::new("305"),
        })
        .await;

        let loader = PushLoader::new(base);
        assert!(loader.load(&SubjectId::new("305")).await.unwrap().is_none());
    }
}
