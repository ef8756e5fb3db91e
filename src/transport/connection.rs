// MIT License - Copyright (c) 2026 Peter Wright
// LEAP bridge

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, ReadHalf, WriteHalf};
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::{BoxedStream, Connector};
use crate::error::{LeapError, Result};
use crate::protocol::{CommuniqueType, Request, Response};

/// What a connection reports to its owner besides request answers.
#[derive(Debug)]
pub enum ConnectionEvent {
    /// A message that did not answer an outstanding request.
    Message(Response),
    /// The underlying stream closed or failed.
    Disconnected,
}

type Pending = Arc<Mutex<HashMap<String, oneshot::Sender<Result<Response>>>>>;

/// One live stream: the write half, the reader task, and the requests
/// waiting on it.
struct Link {
    writer: Mutex<WriteHalf<BoxedStream>>,
    pending: Pending,
    alive: Arc<AtomicBool>,
    reader: JoinHandle<()>,
}

impl Link {
    fn start(stream: BoxedStream, events: mpsc::UnboundedSender<ConnectionEvent>) -> Self {
        let (read_half, write_half) = tokio::io::split(stream);
        let pending: Pending = Arc::new(Mutex::new(HashMap::new()));
        let alive = Arc::new(AtomicBool::new(true));
        let reader = spawn_reader_task(read_half, pending.clone(), alive.clone(), events);
        Self {
            writer: Mutex::new(write_half),
            pending,
            alive,
            reader,
        }
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    async fn send(&self, request: &Request) -> Result<()> {
        let line = request.to_line()?;
        let mut writer = self.writer.lock().await;
        writer.write_all(&line).await.map_err(|e| {
            error!("Failed to write {} {}: {}", request.communique_type, request.url(), e);
            self.alive.store(false, Ordering::SeqCst);
            LeapError::Io(e)
        })?;
        writer.flush().await?;
        Ok(())
    }

    /// Stop reading and fail everything still waiting.
    async fn shut_down(&self) {
        self.alive.store(false, Ordering::SeqCst);
        self.reader.abort();
        let _ = self.writer.lock().await.shutdown().await;
        fail_pending(&self.pending).await;
    }
}

impl Drop for Link {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

async fn fail_pending(pending: &Pending) {
    for (_, tx) in pending.lock().await.drain() {
        let _ = tx.send(Err(LeapError::ConnectionLost));
    }
}

/// A request/response channel to one controller.
///
/// Requests are correlated with their answers by `ClientTag`, so any number
/// may be outstanding at once. The stream is opened lazily and reopened on
/// the next request after it dies. Anything that is not an answer goes to
/// the event receiver handed out by [`take_events`](Self::take_events).
pub struct LeapConnection {
    connector: Arc<dyn Connector>,
    request_timeout: Duration,
    link: Mutex<Option<Arc<Link>>>,
    events_tx: mpsc::UnboundedSender<ConnectionEvent>,
    events_rx: std::sync::Mutex<Option<mpsc::UnboundedReceiver<ConnectionEvent>>>,
    retired: AtomicBool,
}

impl LeapConnection {
    pub fn new(connector: Arc<dyn Connector>, request_timeout: Duration) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            connector,
            request_timeout,
            link: Mutex::new(None),
            events_tx,
            events_rx: std::sync::Mutex::new(Some(events_rx)),
            retired: AtomicBool::new(false),
        }
    }

    /// Take the event receiver. Only the first caller gets it.
    pub fn take_events(&self) -> Option<mpsc::UnboundedReceiver<ConnectionEvent>> {
        self.events_rx
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take()
    }

    pub fn describe(&self) -> String {
        self.connector.describe()
    }

    /// Open the stream if it is not already open.
    pub async fn connect(&self) -> Result<()> {
        self.live_link().await.map(|_| ())
    }

    pub async fn is_connected(&self) -> bool {
        self.link.lock().await.as_ref().is_some_and(|l| l.is_alive())
    }

    /// Whether this connection has been drained and can no longer be used.
    pub fn is_retired(&self) -> bool {
        self.retired.load(Ordering::SeqCst)
    }

    async fn live_link(&self) -> Result<Arc<Link>> {
        if self.is_retired() {
            return Err(LeapError::ConnectionLost);
        }
        let mut slot = self.link.lock().await;
        if let Some(link) = slot.as_ref()
            && link.is_alive()
        {
            return Ok(link.clone());
        }
        if slot.take().is_some() {
            info!("Reopening connection to {}", self.connector.describe());
        }
        let stream = self.connector.connect().await?;
        let link = Arc::new(Link::start(stream, self.events_tx.clone()));
        *slot = Some(link.clone());
        Ok(link)
    }

    /// Send a request with a fresh tag and wait for its answer.
    pub async fn request(
        &self,
        communique_type: CommuniqueType,
        url: &str,
        body: Option<Value>,
    ) -> Result<Response> {
        let tag = Uuid::new_v4().to_string();
        self.request_tagged(communique_type, url, body, &tag, self.request_timeout)
            .await
    }

    /// As [`request`](Self::request) with a caller-chosen deadline.
    pub async fn request_within(
        &self,
        deadline: Duration,
        communique_type: CommuniqueType,
        url: &str,
        body: Option<Value>,
    ) -> Result<Response> {
        let tag = Uuid::new_v4().to_string();
        self.request_tagged(communique_type, url, body, &tag, deadline)
            .await
    }

    /// Send a request under a caller-chosen tag. Used for subscriptions,
    /// whose later pushes echo the same tag.
    pub async fn request_tagged(
        &self,
        communique_type: CommuniqueType,
        url: &str,
        body: Option<Value>,
        tag: &str,
        deadline: Duration,
    ) -> Result<Response> {
        let link = self.live_link().await?;
        let request = Request::new(communique_type, url, tag, body);

        let (tx, rx) = oneshot::channel();
        link.pending.lock().await.insert(tag.to_string(), tx);
        if !link.is_alive() {
            link.pending.lock().await.remove(tag);
            return Err(LeapError::ConnectionLost);
        }

        debug!("-> {} {} [{}]", request.communique_type, url, tag);
        if let Err(e) = link.send(&request).await {
            link.pending.lock().await.remove(tag);
            return Err(e);
        }

        match timeout(deadline, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(LeapError::ConnectionLost),
            Err(_) => {
                link.pending.lock().await.remove(tag);
                debug!("Request timeout: {} {}", url, tag);
                Err(LeapError::RequestTimeout {
                    url: url.to_string(),
                })
            }
        }
    }

    /// Close the stream. The connection stays usable and reopens on demand.
    pub async fn close(&self) {
        if let Some(link) = self.link.lock().await.take() {
            debug!("Closing connection to {}", self.connector.describe());
            link.shut_down().await;
        }
    }

    /// Retire the connection for good: outstanding requests fail with
    /// `ConnectionLost` and later requests are refused.
    pub async fn drain(&self) {
        self.retired.store(true, Ordering::SeqCst);
        self.close().await;
    }
}

fn spawn_reader_task(
    read_half: ReadHalf<BoxedStream>,
    pending: Pending,
    alive: Arc<AtomicBool>,
    events: mpsc::UnboundedSender<ConnectionEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut lines = BufReader::new(read_half).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    if line.trim().is_empty() {
                        continue;
                    }
                    let response = match Response::from_line(&line) {
                        Ok(r) => r,
                        Err(e) => {
                            warn!("Discarding unparseable message: {}", e);
                            continue;
                        }
                    };
                    let waiter = match response.tag() {
                        Some(tag) => pending.lock().await.remove(tag),
                        None => None,
                    };
                    match waiter {
                        Some(tx) => {
                            debug!(
                                "<- {} {} [{}]",
                                response.communique_type,
                                response.url().unwrap_or("?"),
                                response.tag().unwrap_or_default()
                            );
                            let _ = tx.send(Ok(response));
                        }
                        None => {
                            let _ = events.send(ConnectionEvent::Message(response));
                        }
                    }
                }
                Ok(None) => {
                    info!("Controller closed the connection");
                    break;
                }
                Err(e) => {
                    error!("Read error: {}", e);
                    break;
                }
            }
        }
        alive.store(false, Ordering::SeqCst);
        fail_pending(&pending).await;
        let _ = events.send(ConnectionEvent::Disconnected);
    })
}
