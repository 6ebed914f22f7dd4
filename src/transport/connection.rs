use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, info};

use crate::error::TransportError;
use crate::store::AccessToken;

/// One live text-message stream to the remote model
#[async_trait::async_trait]
pub trait Connection: Send {
    async fn send(&mut self, text: String) -> Result<(), TransportError>;

    /// Next inbound text message; `None` once the remote closed the stream
    async fn recv(&mut self) -> Option<Result<String, TransportError>>;

    async fn close(&mut self);
}

/// Opens connections; one per transport session
#[async_trait::async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, token: &AccessToken) -> Result<Box<dyn Connection>, TransportError>;
}

/// How the credential is presented during the WebSocket handshake
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AuthHeader {
    /// `api-key: <token>`
    #[default]
    ApiKey,
    /// `Authorization: Bearer <token>`
    Bearer,
}

/// WebSocket connector for the realtime endpoint
pub struct WebSocketConnector {
    url: String,
    auth: AuthHeader,
}

impl WebSocketConnector {
    pub fn new(url: impl Into<String>, auth: AuthHeader) -> Self {
        Self {
            url: url.into(),
            auth,
        }
    }
}

#[async_trait::async_trait]
impl Connector for WebSocketConnector {
    async fn connect(&self, token: &AccessToken) -> Result<Box<dyn Connection>, TransportError> {
        info!("Connecting to realtime endpoint {}", self.url);

        let mut request = self
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| TransportError::Connect(format!("Invalid endpoint URL: {}", e)))?;

        let (name, value) = match self.auth {
            AuthHeader::ApiKey => ("api-key", token.token.clone()),
            AuthHeader::Bearer => ("authorization", format!("Bearer {}", token.token)),
        };
        let value = HeaderValue::from_str(&value)
            .map_err(|e| TransportError::Connect(format!("Invalid credential header: {}", e)))?;

        let headers = request.headers_mut();
        headers.insert(name, value);
        headers.insert("openai-beta", HeaderValue::from_static("realtime=v1"));

        let (stream, response) = tokio_tungstenite::connect_async(request)
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;

        info!("Realtime WebSocket connected (HTTP {})", response.status());

        Ok(Box::new(WebSocketConnection { stream }))
    }
}

struct WebSocketConnection {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait::async_trait]
impl Connection for WebSocketConnection {
    async fn send(&mut self, text: String) -> Result<(), TransportError> {
        self.stream
            .send(Message::Text(text.into()))
            .await
            .map_err(|e| TransportError::Dropped(e.to_string()))
    }

    async fn recv(&mut self) -> Option<Result<String, TransportError>> {
        loop {
            match self.stream.next().await? {
                Ok(Message::Text(text)) => return Some(Ok(text.as_str().to_owned())),
                Ok(Message::Close(frame)) => {
                    debug!("Remote sent close frame: {:?}", frame);
                    return None;
                }
                Ok(Message::Binary(bytes)) => {
                    debug!("Ignoring {} byte binary message", bytes.len());
                }
                Ok(_) => {}
                Err(e) => return Some(Err(TransportError::Dropped(e.to_string()))),
            }
        }
    }

    async fn close(&mut self) {
        if let Err(e) = self.stream.close(None).await {
            debug!("WebSocket close failed: {}", e);
        }
    }
}
