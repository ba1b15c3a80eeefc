//! WebSocket [`Connector`] over `tokio-tungstenite`.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use log::{debug, warn};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{header, HeaderValue, StatusCode};
use tokio_tungstenite::tungstenite::{Error as WsError, Message};

use super::session::{ConnectError, Connector, Link};
use crate::auth::AUTH_ERROR_HEADER;
use crate::error::AuthError;
use crate::protocol::ServerEvent;

/// Dials `ws://host/ws` with the token as a bearer header.
#[derive(Debug, Clone)]
pub struct WsConnector {
    url: String,
}

impl WsConnector {
    pub fn new(url: impl Into<String>) -> Self {
        WsConnector { url: url.into() }
    }
}

fn refused(status: StatusCode, auth_error: Option<&str>) -> ConnectError {
    if status != StatusCode::UNAUTHORIZED {
        return ConnectError::Unreachable(format!("handshake refused with {status}"));
    }
    match auth_error {
        Some(code) if code == AuthError::Expired.code() => ConnectError::TokenExpired,
        Some(code) => ConnectError::Unauthorized(code.to_string()),
        None => ConnectError::Unauthorized(status.to_string()),
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self, token: &str) -> Result<Link, ConnectError> {
        let mut request = self
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| ConnectError::Unreachable(e.to_string()))?;
        let bearer = HeaderValue::from_str(&format!("Bearer {token}"))
            .map_err(|_| ConnectError::Unauthorized("token is not a valid header value".into()))?;
        request.headers_mut().insert(header::AUTHORIZATION, bearer);

        let stream = match tokio_tungstenite::connect_async(request).await {
            Ok((stream, _)) => stream,
            Err(WsError::Http(resp)) => {
                let code = resp
                    .headers()
                    .get(AUTH_ERROR_HEADER)
                    .and_then(|v| v.to_str().ok());
                return Err(refused(resp.status(), code));
            }
            Err(e) => return Err(ConnectError::Unreachable(e.to_string())),
        };
        let (mut sink, mut source) = stream.split();
        let (link, peer) = Link::pair();
        let mut frames = peer.frames;
        let events = peer.events;

        tokio::spawn(async move {
            while let Some(frame) = frames.recv().await {
                let text = match serde_json::to_string(&frame) {
                    Ok(text) => text,
                    Err(e) => {
                        warn!("dropping unencodable frame: {e}");
                        continue;
                    }
                };
                if let Err(e) = sink.send(Message::text(text)).await {
                    debug!("socket write failed: {e}");
                    break;
                }
            }
            let _ = sink.close().await;
        });

        tokio::spawn(async move {
            while let Some(msg) = source.next().await {
                match msg {
                    Ok(Message::Text(text)) => match serde_json::from_str::<ServerEvent>(text.as_str()) {
                        Ok(event) => {
                            if events.send(event).is_err() {
                                break;
                            }
                        }
                        Err(e) => warn!("ignoring unknown server frame: {e}"),
                    },
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(e) => {
                        debug!("socket read failed: {e}");
                        break;
                    }
                }
            }
        });

        Ok(link)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn refusals_are_classified() {
        assert_eq!(
            refused(StatusCode::UNAUTHORIZED, Some("TOKEN_EXPIRED")),
            ConnectError::TokenExpired
        );
        assert_eq!(
            refused(StatusCode::UNAUTHORIZED, Some("TOKEN_INVALID")),
            ConnectError::Unauthorized("TOKEN_INVALID".into())
        );
        assert!(matches!(
            refused(StatusCode::BAD_GATEWAY, None),
            ConnectError::Unreachable(_)
        ));
    }
}
