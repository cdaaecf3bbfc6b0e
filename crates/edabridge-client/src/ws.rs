//! Standard WebSocket binding.

use crate::channel::{Channel, ChannelEvent, Connector, EventSender};
use async_trait::async_trait;
use edabridge_core::{CloseReason, TransportError};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::{Message, Utf8Bytes};
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;

#[derive(Debug, Default)]
pub struct WebSocketConnector;

#[async_trait]
impl Connector for WebSocketConnector {
    fn kind(&self) -> &'static str {
        "websocket"
    }

    async fn open(&self, url: &str, events: EventSender) -> Result<Box<dyn Channel>, TransportError> {
        let (ws, _) = tokio_tungstenite::connect_async(url)
            .await
            .map_err(|e| TransportError::ConnectFailed(format!("{url}: {e}")))?;
        let (sink, stream) = ws.split();
        let reader = tokio::spawn(read_loop(stream, events));
        Ok(Box::new(WebSocketChannel { sink, reader }))
    }
}

async fn read_loop(
    mut stream: futures_util::stream::SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>,
    events: EventSender,
) {
    let last = loop {
        match stream.next().await {
            Some(Ok(Message::Text(text))) => {
                if events.send(ChannelEvent::Message(text.as_str().to_owned())).is_err() {
                    return;
                }
            }
            Some(Ok(Message::Close(frame))) => {
                break match frame {
                    Some(frame) => ChannelEvent::Closed {
                        code: Some(u16::from(frame.code)),
                        reason: frame.reason.as_str().to_owned(),
                    },
                    None => ChannelEvent::Closed {
                        code: None,
                        reason: String::new(),
                    },
                };
            }
            Some(Ok(_)) => {}
            Some(Err(e)) => break ChannelEvent::Error(e.to_string()),
            None => {
                break ChannelEvent::Closed {
                    code: None,
                    reason: "stream ended".into(),
                };
            }
        }
    };
    let _ = events.send(last);
}

pub struct WebSocketChannel {
    sink: WsSink,
    reader: JoinHandle<()>,
}

#[async_trait]
impl Channel for WebSocketChannel {
    async fn send(&mut self, text: String) -> Result<(), TransportError> {
        self.sink
            .send(Message::Text(text.into()))
            .await
            .map_err(|e| TransportError::SendFailure(e.to_string()))
    }

    async fn close(&mut self, reason: CloseReason) {
        let frame = CloseFrame {
            code: CloseCode::from(reason.code()),
            reason: Utf8Bytes::from_static(reason.reason()),
        };
        if let Err(e) = self.sink.send(Message::Close(Some(frame))).await {
            tracing::debug!("Close frame not sent: {}", e);
        }
        self.reader.abort();
    }
}

impl Drop for WebSocketChannel {
    fn drop(&mut self) {
        self.reader.abort();
    }
}
