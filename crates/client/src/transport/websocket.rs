//! Websocket transport to the allocation exec endpoint.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tokio_tungstenite::{
    connect_async,
    tungstenite::{
        client::IntoClientRequest, http::HeaderValue, Error as WsError, Message as WsMessage,
    },
};

use super::{Connection, Dialer, Transport, TransportError, TransportEvent, EVENT_BUFFER_SIZE};
use crate::api::{exec_url, TOKEN_HEADER};
use crate::config::ApiConfig;
use crate::target::ExecutionTarget;

/// Time the server has to answer our close frame before the reader gives up.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

/// Dials exec sessions over a websocket.
#[derive(Debug, Clone)]
pub struct WebSocketDialer {
    config: ApiConfig,
}

impl WebSocketDialer {
    pub fn new(config: ApiConfig) -> Self {
        Self { config }
    }
}

impl Dialer for WebSocketDialer {
    fn dial<'a>(
        &'a self,
        target: &'a ExecutionTarget,
        command: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<Connection, TransportError>> + Send + 'a>> {
        Box::pin(async move {
            let url = exec_url(&self.config, target, command)
                .map_err(|e| TransportError::Endpoint(e.to_string()))?;

            let mut request = url
                .as_str()
                .into_client_request()
                .map_err(|e| TransportError::Endpoint(e.to_string()))?;
            if let Some(token) = &self.config.token {
                let value = HeaderValue::from_str(token)
                    .map_err(|e| TransportError::Endpoint(format!("invalid token: {}", e)))?;
                request.headers_mut().insert(TOKEN_HEADER, value);
            }

            tracing::info!(session = %target, command, "Connecting to exec endpoint");

            let (ws_stream, _) = connect_async(request).await.map_err(|e| match e {
                WsError::Io(io_err) => TransportError::Dial(io_err.to_string()),
                e => TransportError::Dial(format!("websocket connection failed: {}", e)),
            })?;

            let (mut ws_sink, mut ws_stream) = ws_stream.split();

            let (outgoing_tx, mut outgoing_rx) = mpsc::unbounded_channel::<WsMessage>();
            let (events_tx, events) = mpsc::channel(EVENT_BUFFER_SIZE);

            // Fresh channel, cannot be full.
            let _ = events_tx.try_send(TransportEvent::Open);

            let (closing_tx, mut closing_rx) = oneshot::channel::<()>();

            tokio::spawn(async move {
                while let Some(msg) = outgoing_rx.recv().await {
                    let closing = matches!(msg, WsMessage::Close(_));
                    if let Err(e) = ws_sink.send(msg).await {
                        tracing::error!("failed to send websocket message: {}", e);
                        break;
                    }
                    if closing {
                        break;
                    }
                }
                let _ = ws_sink.close().await;
                let _ = closing_tx.send(());
            });

            tokio::spawn(async move {
                let mut close_deadline: Option<Instant> = None;
                let reason = loop {
                    let next = tokio::select! {
                        next = ws_stream.next() => next,
                        _ = events_tx.closed() => {
                            tracing::debug!("Exec session dropped its events, stopping reader");
                            return;
                        }
                        _ = &mut closing_rx, if close_deadline.is_none() => {
                            close_deadline = Some(Instant::now() + CLOSE_TIMEOUT);
                            continue;
                        }
                        _ = sleep_until_deadline(close_deadline) => {
                            break Some("close handshake timed out".to_string());
                        }
                    };

                    let event = match next {
                        Some(Ok(WsMessage::Text(text))) => TransportEvent::Message(text),
                        Some(Ok(WsMessage::Binary(data))) => TransportEvent::Binary(data),
                        Some(Ok(WsMessage::Close(frame))) => {
                            break frame
                                .map(|f| f.reason.into_owned())
                                .filter(|reason| !reason.is_empty());
                        }
                        Some(Ok(_)) => continue,
                        Some(Err(e)) => break Some(e.to_string()),
                        None => break None,
                    };
                    if events_tx.send(event).await.is_err() {
                        return;
                    }
                };

                tracing::debug!(?reason, "Exec websocket closed");
                let _ = events_tx.send(TransportEvent::Closed { reason }).await;
            });

            Ok(Connection {
                transport: Box::new(WebSocketTransport {
                    outgoing: outgoing_tx,
                }),
                events,
            })
        })
    }
}

async fn sleep_until_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Sending half of a websocket session. Frames go through the writer task.
struct WebSocketTransport {
    outgoing: mpsc::UnboundedSender<WsMessage>,
}

impl Transport for WebSocketTransport {
    fn send(&mut self, text: String) -> Result<(), TransportError> {
        self.outgoing
            .send(WsMessage::Text(text))
            .map_err(|_| TransportError::Closed)
    }

    fn close(&mut self) {
        let _ = self.outgoing.send(WsMessage::Close(None));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_dial_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let dialer = WebSocketDialer::new(ApiConfig {
            address: format!("http://{}", addr),
            ..ApiConfig::default()
        });
        let target = ExecutionTarget::new("web", "web", "abc123");

        let result = dialer.dial(&target, "/bin/sh").await;
        assert!(matches!(result, Err(TransportError::Dial(_))));
    }

    #[tokio::test]
    async fn test_dial_bad_address() {
        let dialer = WebSocketDialer::new(ApiConfig {
            address: "not a url".to_string(),
            ..ApiConfig::default()
        });
        let target = ExecutionTarget::new("web", "web", "abc123");

        let result = dialer.dial(&target, "/bin/sh").await;
        assert!(matches!(result, Err(TransportError::Endpoint(_))));
    }

    #[tokio::test]
    async fn test_session_round_trip() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();

            let first = ws.next().await.unwrap().unwrap();
            ws.send(WsMessage::Text(r#"{"stdout":{"data":"aGk="}}"#.to_string()))
                .await
                .unwrap();
            ws.close(None).await.unwrap();
            first
        });

        let dialer = WebSocketDialer::new(ApiConfig {
            address: format!("http://{}", addr),
            ..ApiConfig::default()
        });
        let target = ExecutionTarget::new("web", "web", "abc123");
        let mut connection = dialer.dial(&target, "/bin/sh").await.unwrap();

        assert_eq!(connection.events.recv().await, Some(TransportEvent::Open));
        connection
            .transport
            .send(r#"{"stdin":{"data":"DQ=="}}"#.to_string())
            .unwrap();
        assert_eq!(
            connection.events.recv().await,
            Some(TransportEvent::Message(
                r#"{"stdout":{"data":"aGk="}}"#.to_string()
            ))
        );
        assert!(matches!(
            connection.events.recv().await,
            Some(TransportEvent::Closed { .. })
        ));

        let first = server.await.unwrap();
        assert_eq!(
            first,
            WsMessage::Text(r#"{"stdin":{"data":"DQ=="}}"#.to_string())
        );
    }

    async fn dial_local(addr: std::net::SocketAddr) -> Connection {
        let dialer = WebSocketDialer::new(ApiConfig {
            address: format!("http://{}", addr),
            ..ApiConfig::default()
        });
        let target = ExecutionTarget::new("web", "web", "abc123");
        dialer.dial(&target, "/bin/sh").await.unwrap()
    }

    #[tokio::test]
    async fn test_binary_message_is_passed_through() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            ws.send(WsMessage::Binary(vec![0xff, 0x00])).await.unwrap();
            ws.close(None).await.unwrap();
        });

        let mut connection = dial_local(addr).await;
        assert_eq!(connection.events.recv().await, Some(TransportEvent::Open));
        assert_eq!(
            connection.events.recv().await,
            Some(TransportEvent::Binary(vec![0xff, 0x00]))
        );
    }

    #[tokio::test]
    async fn test_close_without_server_answer_times_out() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (release_tx, release_rx) = oneshot::channel::<()>();

        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            // Hold the socket open without reading, so the close is never answered.
            let _ = release_rx.await;
            drop(ws);
        });

        let mut connection = dial_local(addr).await;
        assert_eq!(connection.events.recv().await, Some(TransportEvent::Open));
        connection.transport.close();

        let event = tokio::time::timeout(CLOSE_TIMEOUT * 3, connection.events.recv())
            .await
            .unwrap();
        assert_eq!(
            event,
            Some(TransportEvent::Closed {
                reason: Some("close handshake timed out".to_string())
            })
        );
        let _ = release_tx.send(());
    }
}
