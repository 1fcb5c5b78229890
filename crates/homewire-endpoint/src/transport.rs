//! [`TransportEndpoint`] – one websocket connection as an endpoint.
//!
//! One text frame is one message.  Close frames, end-of-stream and read
//! errors all end the output sequence; errors are additionally logged.

use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, trace};

use crate::endpoint::{Endpoint, OutputChannel, lock};

/// Endpoint backed by a websocket connection over any async byte stream.
pub struct TransportEndpoint<S> {
    sink: tokio::sync::Mutex<SplitSink<WebSocketStream<S>, Message>>,
    stream: Mutex<Option<SplitStream<WebSocketStream<S>>>>,
    output: OutputChannel,
    closed: AtomicBool,
}

impl<S> TransportEndpoint<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    /// Wrap an upgraded websocket.
    pub fn new(ws: WebSocketStream<S>) -> Self {
        let (sink, stream) = ws.split();
        Self {
            sink: tokio::sync::Mutex::new(sink),
            stream: Mutex::new(Some(stream)),
            output: OutputChannel::new(),
            closed: AtomicBool::new(false),
        }
    }

    /// `true` once [`Endpoint::terminate`] has run.
    pub fn is_terminated(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl<S> Endpoint for TransportEndpoint<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    fn start_reading(&self) {
        let Some(mut stream) = lock(&self.stream).take() else {
            return;
        };
        self.output.start(move |tx| async move {
            while let Some(frame) = stream.next().await {
                let text = match frame {
                    Ok(Message::Text(text)) => text.as_str().to_owned(),
                    Ok(Message::Binary(bytes)) => match String::from_utf8(bytes.to_vec()) {
                        Ok(text) => text,
                        Err(_) => {
                            debug!("websocket: dropping non-UTF-8 binary frame");
                            continue;
                        }
                    },
                    Ok(Message::Close(frame)) => {
                        debug!(?frame, "websocket: peer closed");
                        break;
                    }
                    Ok(_) => continue,
                    Err(e) => {
                        debug!(error = %e, "websocket: cannot receive");
                        break;
                    }
                };
                if tx.send(text).await.is_err() {
                    break;
                }
            }
        });
    }

    async fn recv(&self) -> Option<String> {
        self.output.recv().await
    }

    async fn send(&self, message: &str) -> bool {
        if self.is_terminated() {
            return false;
        }
        let mut sink = self.sink.lock().await;
        match sink.send(Message::Text(message.to_owned().into())).await {
            Ok(()) => true,
            Err(e) => {
                trace!(error = %e, "websocket: cannot send");
                false
            }
        }
    }

    async fn terminate(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.output.close();
        let mut sink = self.sink.lock().await;
        if let Err(e) = sink.close().await {
            trace!(error = %e, "websocket: close handshake failed");
        }
    }
}
