//! Fan-out of one encoder's output to every listener of a channel.
//!
//! The encoder writes a single continuous stream to stdout. A pump task
//! reads it and publishes each chunk on a broadcast channel; every listener
//! holds its own receiver. The same feed is also served on the channel's
//! own endpoint for clients that connect to it directly.
//!
//! Listener accounting lives here too. A feed is active for exactly one
//! encoder run: admissions and disconnects only touch the stored count while
//! the run is active, so bodies that outlive a stop never decrement the
//! count of the next run.

use super::{probe, ChannelError, ListenerCount, StreamType};
use crate::store::ChannelStore;
use axum::body::{Body, Bytes};
use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use futures::stream::Stream;
use futures::StreamExt;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::task::{Context, Poll};
use tokio::net::TcpListener;
use tokio::process::ChildStdout;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::io::ReaderStream;
use tracing::{debug, info, warn};

/// Chunks a slow listener may fall behind before it starts skipping.
const RELAY_BUFFER_CHUNKS: usize = 256;

/// Bind the channel endpoint the relay serves on.
pub(crate) async fn bind(interface: &str, port: u16) -> io::Result<TcpListener> {
    TcpListener::bind((probe::bind_host(interface), port)).await
}

/// The live output of one encoder run.
pub struct RelayFeed {
    channel_id: i64,
    stream_type: StreamType,
    store: Arc<dyn ChannelStore>,
    sender: Mutex<Option<broadcast::Sender<Bytes>>>,
    /// Whether this run still owns the channel's listener count.
    active: RwLock<bool>,
    produced: AtomicBool,
}

impl RelayFeed {
    pub(crate) fn new(
        channel_id: i64,
        stream_type: StreamType,
        store: Arc<dyn ChannelStore>,
    ) -> Arc<Self> {
        let (sender, _) = broadcast::channel(RELAY_BUFFER_CHUNKS);
        Arc::new(Self {
            channel_id,
            stream_type,
            store,
            sender: Mutex::new(Some(sender)),
            active: RwLock::new(true),
            produced: AtomicBool::new(false),
        })
    }

    /// Whether the encoder has written anything yet.
    pub fn has_output(&self) -> bool {
        self.produced.load(Ordering::Acquire)
    }

    pub fn is_active(&self) -> bool {
        *self.active.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish(&self, chunk: Bytes) {
        self.produced.store(true, Ordering::Release);
        let sender = self.sender.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(sender) = sender.as_ref() {
            // No receivers is the normal state of an idle channel.
            let _ = sender.send(chunk);
        }
    }

    /// End every listener's stream.
    fn close(&self) {
        self.sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }

    /// Stop counting listeners for this run. Once this returns, no guard of
    /// this run touches the stored count again.
    fn deactivate(&self) {
        *self.active.write().unwrap_or_else(PoisonError::into_inner) = false;
    }

    /// Count a new listener and subscribe it to the feed.
    ///
    /// The connect is counted first and refused afterwards if it pushed the
    /// channel over `max_listeners`, so concurrent connects cannot both slip
    /// under the limit.
    pub fn admit(self: &Arc<Self>, max_listeners: u32) -> Result<Listener, ChannelError> {
        let active = self.active.read().unwrap_or_else(PoisonError::into_inner);
        if !*active {
            return Err(ChannelError::NotRunning(self.channel_id));
        }
        let receiver = self
            .sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(broadcast::Sender::subscribe)
            .ok_or(ChannelError::NotRunning(self.channel_id))?;

        let count = self.apply_delta(1)?;
        if max_listeners > 0 && count.listeners > max_listeners {
            self.apply_delta(-1)?;
            return Err(ChannelError::Full(self.channel_id));
        }
        drop(active);

        info!(
            channel_id = self.channel_id,
            listeners = count.listeners,
            "listener connected"
        );
        Ok(Listener {
            receiver,
            count,
            guard: ListenerGuard { feed: self.clone() },
        })
    }

    fn apply_delta(&self, delta: i32) -> Result<ListenerCount, ChannelError> {
        let count = self
            .store
            .apply_listener_delta(self.channel_id, delta)?
            .ok_or(ChannelError::NotFound(self.channel_id))?;
        debug!(
            channel_id = self.channel_id,
            delta,
            listeners = count.listeners,
            peak = count.peak_listeners,
            "listener count changed"
        );
        Ok(count)
    }

    /// Disconnect accounting; skipped once the run is over.
    fn release(&self) {
        let active = self.active.read().unwrap_or_else(PoisonError::into_inner);
        if !*active {
            return;
        }
        if let Err(e) = self.apply_delta(-1) {
            warn!(channel_id = self.channel_id, error = %e, "failed to record listener disconnect");
        }
    }
}

/// Keeps one listener counted while alive.
struct ListenerGuard {
    feed: Arc<RelayFeed>,
}

impl Drop for ListenerGuard {
    fn drop(&mut self) {
        let feed = self.feed.clone();
        match tokio::runtime::Handle::try_current() {
            // The store write is blocking; keep it off the runtime workers.
            Ok(runtime) => {
                runtime.spawn_blocking(move || feed.release());
            }
            Err(_) => feed.release(),
        }
    }
}

/// An admitted listener, not yet turned into a response body.
pub struct Listener {
    receiver: broadcast::Receiver<Bytes>,
    count: ListenerCount,
    guard: ListenerGuard,
}

impl Listener {
    /// Listener counters right after this listener was counted.
    pub fn count(&self) -> ListenerCount {
        self.count
    }

    pub fn into_stream(self) -> ListenerStream {
        let channel_id = self.guard.feed.channel_id;
        let chunks = futures::stream::unfold(self.receiver, move |mut rx| async move {
            loop {
                match rx.recv().await {
                    Ok(chunk) => return Some((Ok::<_, io::Error>(chunk), rx)),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(channel_id, skipped, "listener lagged behind the encoder");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        debug!(channel_id, "relay feed closed");
                        return None;
                    }
                }
            }
        });
        ListenerStream {
            _guard: self.guard,
            inner: Box::pin(chunks),
        }
    }
}

/// Response body of one listener. Dropping it disconnects the listener.
pub struct ListenerStream {
    _guard: ListenerGuard,
    inner: Pin<Box<dyn Stream<Item = Result<Bytes, io::Error>> + Send>>,
}

impl Stream for ListenerStream {
    type Item = Result<Bytes, io::Error>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner.as_mut().poll_next(cx)
    }
}

/// Audio response for an admitted listener.
pub fn listener_response(stream_type: StreamType, listener: Listener) -> Response {
    (
        [
            (header::CONTENT_TYPE, stream_type.mime()),
            (header::CACHE_CONTROL, "no-cache, no-store"),
        ],
        Body::from_stream(listener.into_stream()),
    )
        .into_response()
}

/// The tasks behind one encoder run.
pub(crate) struct Relay {
    feed: Arc<RelayFeed>,
    pump: JoinHandle<()>,
    endpoint: JoinHandle<()>,
}

impl Relay {
    /// Start pumping `stdout` into `feed` and serving the feed on `listener`.
    pub(crate) fn start(feed: Arc<RelayFeed>, listener: TcpListener, stdout: ChildStdout) -> Self {
        let pump = tokio::spawn(pump(feed.clone(), stdout));

        let app = Router::new()
            .route("/:file", get(direct_stream))
            .with_state(feed.clone());
        let channel_id = feed.channel_id;
        let endpoint = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app).await {
                warn!(channel_id, error = %e, "channel endpoint stopped");
            }
        });

        Self {
            feed,
            pump,
            endpoint,
        }
    }

    pub(crate) fn feed(&self) -> &Arc<RelayFeed> {
        &self.feed
    }

    /// End the run: stop accounting, end every listener stream and release
    /// the endpoint. The endpoint is unbound when this returns.
    pub(crate) async fn shutdown(self) {
        self.feed.deactivate();
        self.feed.close();
        for task in [self.pump, self.endpoint] {
            task.abort();
            if let Err(e) = task.await {
                if e.is_panic() {
                    warn!(channel_id = self.feed.channel_id, error = %e, "relay task panicked");
                }
            }
        }
    }
}

async fn pump(feed: Arc<RelayFeed>, stdout: ChildStdout) {
    let mut chunks = ReaderStream::new(stdout);
    while let Some(chunk) = chunks.next().await {
        match chunk {
            Ok(chunk) => feed.publish(chunk),
            Err(e) => {
                warn!(channel_id = feed.channel_id, error = %e, "failed to read encoder output");
                break;
            }
        }
    }
    info!(channel_id = feed.channel_id, "encoder output ended");
    feed.close();
}

/// Direct client on the channel endpoint. Capacity comes from the stored
/// record so admin edits apply without a restart.
async fn direct_stream(State(feed): State<Arc<RelayFeed>>, Path(file): Path<String>) -> Response {
    if file != format!("stream.{}", feed.stream_type.extension()) {
        return StatusCode::NOT_FOUND.into_response();
    }
    let max_listeners = match feed.store.channel(feed.channel_id) {
        Ok(Some(channel)) => channel.max_listeners,
        Ok(None) => return StatusCode::NOT_FOUND.into_response(),
        Err(e) => {
            warn!(channel_id = feed.channel_id, error = %e, "failed to load channel");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };
    match feed.admit(max_listeners) {
        Ok(listener) => listener_response(feed.stream_type, listener),
        Err(e) => (StatusCode::SERVICE_UNAVAILABLE, e.to_string()).into_response(),
    }
}
