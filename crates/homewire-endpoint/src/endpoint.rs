//! The [`Endpoint`] capability trait and the [`pipe_endpoints`] relay.
//!
//! An endpoint is a duplex stream of text messages over some transport.  The
//! relay never looks at the transport: it only starts both sides, copies
//! messages across, and tears both down when either side goes away.

use std::future::Future;
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

/// Messages a reader task may buffer ahead of the consumer.
pub(crate) const OUTPUT_CAPACITY: usize = 16;

/// A duplex message stream.
///
/// # Contract
///
/// * `start_reading` – begins producing messages for [`Endpoint::recv`].
///   Only the first call has any effect.
/// * `recv` – the next inbound message, or `None` once the transport reached
///   end-of-stream, failed, or was terminated.  Never yields again after the
///   first `None`.
/// * `send` – writes one message.  Returns `false` on any write failure and
///   never panics.
/// * `terminate` – releases the transport.  Safe to call any number of times.
#[async_trait]
pub trait Endpoint: Send + Sync {
    fn start_reading(&self);

    async fn recv(&self) -> Option<String>;

    async fn send(&self, message: &str) -> bool;

    async fn terminate(&self);
}

/// Pair two endpoints until either side closes.
///
/// Every message produced by `a` is sent to `b` and vice versa, FIFO per
/// direction.  The loop ends the moment an output closes or a send is
/// rejected; both endpoints are then terminated.  There is no retry.
pub async fn pipe_endpoints(a: &dyn Endpoint, b: &dyn Endpoint) {
    a.start_reading();
    b.start_reading();

    loop {
        tokio::select! {
            msg = a.recv() => {
                let Some(msg) = msg else {
                    debug!("relay: first endpoint closed");
                    break;
                };
                debug!(message = %msg, "relay: a -> b");
                if !b.send(&msg).await {
                    debug!("relay: second endpoint rejected send");
                    break;
                }
            }
            msg = b.recv() => {
                let Some(msg) = msg else {
                    debug!("relay: second endpoint closed");
                    break;
                };
                debug!(message = %msg, "relay: b -> a");
                if !a.send(&msg).await {
                    debug!("relay: first endpoint rejected send");
                    break;
                }
            }
        }
    }

    a.terminate().await;
    b.terminate().await;
}

// ────────────────────────────────────────────────────────────────────────────
// Output channel shared by the concrete endpoints
// ────────────────────────────────────────────────────────────────────────────

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// The inbound half of an endpoint: a reader task feeding a bounded channel.
pub(crate) struct OutputChannel {
    rx: tokio::sync::Mutex<mpsc::Receiver<String>>,
    tx: Mutex<Option<mpsc::Sender<String>>>,
    readers: Mutex<Vec<JoinHandle<()>>>,
}

impl OutputChannel {
    pub(crate) fn new() -> Self {
        let (tx, rx) = mpsc::channel(OUTPUT_CAPACITY);
        Self {
            rx: tokio::sync::Mutex::new(rx),
            tx: Mutex::new(Some(tx)),
            readers: Mutex::new(Vec::new()),
        }
    }

    /// Spawn `reader` with the sending half.  Returns `false` when the
    /// channel was already started or closed.
    pub(crate) fn start<F, Fut>(&self, reader: F) -> bool
    where
        F: FnOnce(mpsc::Sender<String>) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let Some(tx) = lock(&self.tx).take() else {
            return false;
        };
        let handle = tokio::spawn(reader(tx));
        lock(&self.readers).push(handle);
        true
    }

    /// Track an auxiliary task that must stop when the endpoint closes.
    pub(crate) fn attach(&self, handle: JoinHandle<()>) {
        lock(&self.readers).push(handle);
    }

    pub(crate) async fn recv(&self) -> Option<String> {
        self.rx.lock().await.recv().await
    }

    /// Stop all reader tasks.  The sending halves drop with them, so
    /// [`OutputChannel::recv`] drains what is buffered and then yields `None`.
    pub(crate) fn close(&self) {
        lock(&self.tx).take();
        for handle in lock(&self.readers).drain(..) {
            handle.abort();
        }
    }
}
