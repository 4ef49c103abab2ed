//! Websocket transport for the XCM subscription service

use super::subscription::{NotificationStream, SubscriptionParams, SubscriptionTransport, WireNotification};
use crate::config::SubscriptionConfig;
use crate::error::{TrackerError, TrackerResult};

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, trace};

const STREAM_BUFFER: usize = 32;

#[derive(Serialize)]
struct SubscribeRequest<'a> {
    method: &'static str,
    params: &'a SubscriptionParams,
}

#[derive(Clone, Debug)]
pub struct WsTransport {
    url: String,
    api_key: Option<String>,
}

impl WsTransport {
    pub fn new(config: &SubscriptionConfig) -> Self {
        Self {
            url: config.ws_url.clone(),
            api_key: config.api_key.clone().filter(|k| !k.is_empty()),
        }
    }
}

#[async_trait]
impl SubscriptionTransport for WsTransport {
    async fn open(&self, params: SubscriptionParams) -> TrackerResult<NotificationStream> {
        let mut request = self.url.as_str().into_client_request()?;
        if let Some(key) = &self.api_key {
            let value = HeaderValue::from_str(&format!("Bearer {key}"))
                .map_err(|e| TrackerError::Config(format!("subscription api key: {e}")))?;
            request.headers_mut().insert("Authorization", value);
        }

        let (socket, _) = connect_async(request).await?;
        let (mut write, mut read) = socket.split();

        let subscribe = serde_json::to_string(&SubscribeRequest {
            method: "subscribe",
            params: &params,
        })
        .map_err(|e| TrackerError::Internal(format!("encode subscribe request: {e}")))?;
        write.send(Message::Text(subscribe)).await?;

        let subscription_id = params.subscription_id;
        debug!(%subscription_id, "Subscription socket open");

        let (tx, rx) = mpsc::channel(STREAM_BUFFER);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    // Consumer went away, closing the socket ends the subscription
                    _ = tx.closed() => {
                        let _ = write.send(Message::Close(None)).await;
                        break;
                    }

                    frame = read.next() => {
                        let item = match frame {
                            Some(Ok(Message::Text(text))) => {
                                serde_json::from_str::<WireNotification>(&text).map_err(|e| {
                                    TrackerError::Decode {
                                        what: "subscription notification",
                                        message: e.to_string(),
                                    }
                                })
                            }
                            Some(Ok(Message::Ping(payload))) => {
                                if let Err(e) = write.send(Message::Pong(payload)).await {
                                    let _ = tx.send(Err(e.into())).await;
                                    break;
                                }
                                continue;
                            }
                            Some(Ok(Message::Close(_))) | None => {
                                let _ = tx
                                    .send(Err(TrackerError::Websocket("connection closed".into())))
                                    .await;
                                break;
                            }
                            Some(Ok(other)) => {
                                trace!(%subscription_id, "Ignoring frame: {:?}", other);
                                continue;
                            }
                            Some(Err(e)) => {
                                let _ = tx.send(Err(e.into())).await;
                                break;
                            }
                        };

                        if tx.send(item).await.is_err() {
                            break;
                        }
                    }
                }
            }
            debug!(%subscription_id, "Subscription socket closed");
        });

        Ok(rx)
    }
}
