use std::pin::Pin;

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::{future, Sink, SinkExt, Stream, StreamExt};
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use tokio_tungstenite::{
    connect_async,
    tungstenite::{
        protocol::{frame::coding::CloseCode, CloseFrame},
        Message,
    },
};
use tracing::{debug, warn};
use url::Url;

pub const CLOSE_NORMAL: u16 = 1000;
pub const CLOSE_NO_STATUS: u16 = 1005;
pub const CLOSE_ABNORMAL: u16 = 1006;
pub const CLOSE_KEEPALIVE_TIMEOUT: u16 = 3000;
pub const CLOSE_SERVER_LOGOUT: u16 = 4000;

/// Text-level view of a websocket frame; binary and control frames never reach
/// the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireMessage {
    Text(String),
    Close { code: u16, reason: String },
}

pub type WireSink = Pin<Box<dyn Sink<WireMessage, Error = anyhow::Error> + Send>>;
pub type WireStream = Pin<Box<dyn Stream<Item = Result<WireMessage>> + Send>>;

#[async_trait]
pub trait SocketConnector: Send + Sync {
    async fn connect(&self, url: &Url) -> Result<(WireSink, WireStream)>;
}

pub struct TungsteniteConnector;

#[async_trait]
impl SocketConnector for TungsteniteConnector {
    async fn connect(&self, url: &Url) -> Result<(WireSink, WireStream)> {
        let (ws_stream, _) = connect_async(url.as_str())
            .await
            .with_context(|| format!("failed to connect websocket: {}", redact(url)))?;
        let (writer, reader) = ws_stream.split();

        let sink = writer
            .with(|message: WireMessage| {
                future::ready(Ok::<_, tokio_tungstenite::tungstenite::Error>(
                    match message {
                        WireMessage::Text(text) => Message::Text(text),
                        WireMessage::Close { code, reason } => Message::Close(Some(CloseFrame {
                            code: CloseCode::from(code),
                            reason: reason.into(),
                        })),
                    },
                ))
            })
            .sink_map_err(anyhow::Error::from);

        let stream = reader.filter_map(|message| {
            future::ready(match message {
                Ok(Message::Text(text)) => Some(Ok(WireMessage::Text(text))),
                Ok(Message::Close(frame)) => Some(Ok(match frame {
                    Some(frame) => WireMessage::Close {
                        code: u16::from(frame.code),
                        reason: frame.reason.into_owned(),
                    },
                    None => WireMessage::Close {
                        code: CLOSE_NO_STATUS,
                        reason: String::new(),
                    },
                })),
                Ok(_) => None,
                Err(err) => Some(Err(anyhow::Error::from(err))),
            })
        });

        Ok((Box::pin(sink), Box::pin(stream)))
    }
}

/// Query strings carry the bearer token; keep it out of logs.
pub fn redact(url: &Url) -> String {
    let mut shown = url.clone();
    shown.set_query(None);
    shown.to_string()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Opened,
    Text(String),
    Closed { code: u16, reason: String },
}

/// Owns one socket for its whole life: connects, forwards outbound frames, and
/// reports everything that happens through `report`. Always ends with exactly one
/// `Closed` event, unless the task is aborted first.
pub async fn drive_socket<F>(
    connector: std::sync::Arc<dyn SocketConnector>,
    url: Url,
    mut outbound: UnboundedReceiver<WireMessage>,
    report: F,
) where
    F: Fn(TransportEvent) + Send + 'static,
{
    let (mut sink, mut stream) = match connector.connect(&url).await {
        Ok(parts) => parts,
        Err(err) => {
            warn!(url = %redact(&url), "websocket connect failed: {err:#}");
            report(TransportEvent::Closed {
                code: CLOSE_ABNORMAL,
                reason: err.to_string(),
            });
            return;
        }
    };
    report(TransportEvent::Opened);

    let (code, reason) = loop {
        tokio::select! {
            outgoing = outbound.recv() => match outgoing {
                Some(WireMessage::Close { code, reason }) => {
                    let _ = sink.send(WireMessage::Close { code, reason: reason.clone() }).await;
                    break (code, reason);
                }
                Some(message) => {
                    if let Err(err) = sink.send(message).await {
                        warn!("websocket send failed: {err:#}");
                        break (CLOSE_ABNORMAL, err.to_string());
                    }
                }
                None => {
                    let _ = sink
                        .send(WireMessage::Close { code: CLOSE_NORMAL, reason: String::new() })
                        .await;
                    break (CLOSE_NORMAL, String::new());
                }
            },
            incoming = stream.next() => match incoming {
                Some(Ok(WireMessage::Text(text))) => report(TransportEvent::Text(text)),
                Some(Ok(WireMessage::Close { code, reason })) => break (code, reason),
                Some(Err(err)) => {
                    warn!("websocket receive failed: {err:#}");
                    break (CLOSE_ABNORMAL, err.to_string());
                }
                None => break (CLOSE_ABNORMAL, "stream ended".to_string()),
            },
        }
    };
    debug!(code, "socket task finished");
    report(TransportEvent::Closed { code, reason });
}

/// Sender half handed to the connection owner.
pub type OutboundSender = UnboundedSender<WireMessage>;

#[cfg(test)]
pub(crate) mod testing {
    //! In-process connector that hands the "server" side of each socket to tests.

    use std::sync::{Arc, Mutex};

    use anyhow::anyhow;
    use futures::channel::mpsc;

    use super::*;

    pub struct ServerSide {
        pub url: Url,
        pub to_client: mpsc::UnboundedSender<Result<WireMessage>>,
        pub from_client: mpsc::UnboundedReceiver<WireMessage>,
    }

    impl ServerSide {
        pub fn push_text(&self, text: impl Into<String>) {
            let _ = self.to_client.unbounded_send(Ok(WireMessage::Text(text.into())));
        }

        pub fn push_close(&self, code: u16) {
            let _ = self.to_client.unbounded_send(Ok(WireMessage::Close {
                code,
                reason: String::new(),
            }));
        }

        pub fn fail(&self) {
            let _ = self
                .to_client
                .unbounded_send(Err(anyhow!("connection reset")));
        }

        pub async fn next_from_client(&mut self) -> Option<WireMessage> {
            self.from_client.next().await
        }
    }

    #[derive(Default)]
    pub struct ChannelConnector {
        pub attempts: Mutex<Vec<Url>>,
        pub refuse: Mutex<bool>,
        accepted: Mutex<Option<tokio::sync::mpsc::UnboundedSender<ServerSide>>>,
    }

    impl ChannelConnector {
        pub fn new() -> (Arc<Self>, tokio::sync::mpsc::UnboundedReceiver<ServerSide>) {
            let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
            let connector = Self {
                accepted: Mutex::new(Some(tx)),
                ..Self::default()
            };
            (Arc::new(connector), rx)
        }

        pub fn attempt_count(&self) -> usize {
            self.attempts.lock().map(|a| a.len()).unwrap_or(0)
        }

        pub fn set_refuse(&self, refuse: bool) {
            if let Ok(mut guard) = self.refuse.lock() {
                *guard = refuse;
            }
        }
    }

    #[async_trait]
    impl SocketConnector for ChannelConnector {
        async fn connect(&self, url: &Url) -> Result<(WireSink, WireStream)> {
            self.attempts
                .lock()
                .map_err(|_| anyhow!("poisoned"))?
                .push(url.clone());
            if *self.refuse.lock().map_err(|_| anyhow!("poisoned"))? {
                return Err(anyhow!("connection refused"));
            }
            let (to_client, client_rx) = mpsc::unbounded();
            let (client_tx, from_client) = mpsc::unbounded();
            let server = ServerSide {
                url: url.clone(),
                to_client,
                from_client,
            };
            if let Some(accepted) = self.accepted.lock().map_err(|_| anyhow!("poisoned"))?.as_ref() {
                let _ = accepted.send(server);
            }
            let sink = client_tx.sink_map_err(anyhow::Error::from);
            Ok((Box::pin(sink), Box::pin(client_rx)))
        }
    }
}
