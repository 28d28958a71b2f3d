//! Event publishing to the control plane.
//!
//! Sinks are pluggable: HTTP POST (one request per event, bounded
//! retries), a persistent WebSocket (one text frame per event, lazy
//! reconnect), an in-process queue, or a composite that fans out to
//! several sinks and succeeds iff at least one child succeeded.
//!
//! [`EventPublisher`] wraps a sink with buffer-on-failure semantics:
//! failed events land in a FIFO (drop-oldest when full) and a periodic
//! flush retries from the head, stopping at the first failure so order
//! is never broken. Optional batching holds events until `batch_size`
//! is reached, then flushes in order.

use std::collections::VecDeque;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

/// Result of one publish attempt.
#[derive(Debug, Clone)]
pub struct PublishResult {
    pub success: bool,
    pub target: String,
    pub message: String,
}

impl PublishResult {
    fn ok(target: &str, message: impl Into<String>) -> Self {
        Self {
            success: true,
            target: target.into(),
            message: message.into(),
        }
    }

    fn failed(target: &str, message: impl Into<String>) -> Self {
        Self {
            success: false,
            target: target.into(),
            message: message.into(),
        }
    }
}

/// HTTP POST sink with bounded retries.
pub struct HttpSink {
    url: String,
    client: reqwest::Client,
    retry_count: u32,
    retry_delay: Duration,
}

impl HttpSink {
    pub fn new(url: impl Into<String>, timeout: Duration, retry_count: u32, retry_delay: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .expect("reqwest client");
        Self {
            url: url.into(),
            client,
            retry_count: retry_count.max(1),
            retry_delay,
        }
    }

    async fn publish(&self, event: &serde_json::Value) -> PublishResult {
        for attempt in 1..=self.retry_count {
            match self.client.post(&self.url).json(event).send().await {
                Ok(resp) if resp.status().as_u16() < 300 => {
                    return PublishResult::ok(&self.url, format!("HTTP {}", resp.status()));
                }
                Ok(resp) => {
                    // Application-level rejection is terminal, no retry
                    return PublishResult::failed(&self.url, format!("HTTP {}", resp.status()));
                }
                Err(e) => {
                    tracing::warn!(
                        attempt,
                        retries = self.retry_count,
                        error = %e,
                        "HTTP publish error"
                    );
                }
            }
            if attempt < self.retry_count {
                tokio::time::sleep(self.retry_delay).await;
            }
        }
        PublishResult::failed(&self.url, format!("failed after {} attempts", self.retry_count))
    }
}

/// Persistent WebSocket sink; reconnects lazily on the next publish.
pub struct WsSink {
    url: String,
    conn: Option<WebSocketStream<MaybeTlsStream<TcpStream>>>,
}

impl WsSink {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            conn: None,
        }
    }

    async fn ensure_connected(&mut self) -> Result<(), String> {
        if self.conn.is_some() {
            return Ok(());
        }
        match tokio_tungstenite::connect_async(&self.url).await {
            Ok((ws, _response)) => {
                tracing::info!(url = %self.url, "WebSocket sink connected");
                self.conn = Some(ws);
                Ok(())
            }
            Err(e) => Err(format!("connect failed: {e}")),
        }
    }

    async fn publish(&mut self, event: &serde_json::Value) -> PublishResult {
        if let Err(msg) = self.ensure_connected().await {
            return PublishResult::failed(&self.url, msg);
        }

        let json = match serde_json::to_string(event) {
            Ok(j) => j,
            Err(e) => return PublishResult::failed(&self.url, format!("serialize: {e}")),
        };

        let ws = self.conn.as_mut().expect("connected above");
        match ws.send(Message::Text(json.into())).await {
            Ok(()) => {
                // Drain any ack the server pushed back so the read buffer
                // does not grow unbounded
                if let Ok(Some(_)) =
                    tokio::time::timeout(Duration::from_millis(10), ws.next()).await
                {
                }
                PublishResult::ok(&self.url, "sent")
            }
            Err(e) => {
                self.conn = None;
                PublishResult::failed(&self.url, format!("send failed: {e}"))
            }
        }
    }
}

/// A pluggable publishing target.
pub enum EventSink {
    Http(HttpSink),
    WebSocket(WsSink),
    /// In-process bounded queue; a full queue fails the publish.
    Memory(mpsc::Sender<serde_json::Value>),
    /// Fan-out to several sinks; succeeds iff at least one child did.
    Multi(Vec<EventSink>),
}

impl EventSink {
    pub async fn publish(&mut self, event: &serde_json::Value) -> PublishResult {
        match self {
            EventSink::Http(sink) => sink.publish(event).await,
            EventSink::WebSocket(sink) => sink.publish(event).await,
            EventSink::Memory(tx) => match tx.try_send(event.clone()) {
                Ok(()) => PublishResult::ok("memory", "queued"),
                Err(e) => PublishResult::failed("memory", e.to_string()),
            },
            EventSink::Multi(sinks) => {
                let results = futures::future::join_all(
                    sinks
                        .iter_mut()
                        .map(|sink| Box::pin(sink.publish(event))),
                )
                .await;
                let ok = results.iter().filter(|r| r.success).count();
                let message = format!("{ok}/{} succeeded", results.len());
                if ok > 0 {
                    PublishResult::ok("multi", message)
                } else {
                    PublishResult::failed("multi", message)
                }
            }
        }
    }
}

/// Buffering/batching wrapper around a sink.
pub struct EventPublisher {
    sink: EventSink,
    buffer: VecDeque<serde_json::Value>,
    buffer_size: usize,
    batch_size: usize,
}

impl EventPublisher {
    pub fn new(sink: EventSink, buffer_size: usize, batch_size: usize) -> Self {
        Self {
            sink,
            buffer: VecDeque::new(),
            buffer_size: buffer_size.max(1),
            batch_size: batch_size.max(1),
        }
    }

    /// Publish one event, buffering it on failure.
    pub async fn publish(&mut self, event: serde_json::Value) -> PublishResult {
        if self.batch_size <= 1 {
            let result = self.sink.publish(&event).await;
            if !result.success {
                tracing::warn!(target = %result.target, message = %result.message, "publish failed, buffering");
                self.buffer_event(event);
            }
            return result;
        }

        // Batching: hold until the batch fills, then flush in order
        self.buffer_event(event);
        if self.buffer.len() >= self.batch_size {
            self.flush().await;
        }
        PublishResult::ok("buffered", "queued for batch")
    }

    /// Retry buffered events from the head; stop at the first failure.
    pub async fn flush(&mut self) {
        while let Some(event) = self.buffer.front() {
            let result = self.sink.publish(event).await;
            if result.success {
                self.buffer.pop_front();
            } else {
                tracing::warn!(
                    buffered = self.buffer.len(),
                    "flush stalled, will retry later"
                );
                break;
            }
        }
    }

    fn buffer_event(&mut self, event: serde_json::Value) {
        if self.buffer.len() >= self.buffer_size {
            self.buffer.pop_front();
            tracing::warn!("event buffer full, dropping oldest event");
        }
        self.buffer.push_back(event);
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }
}

/// Publisher task: drains an event channel into the sink, flushing the
/// retry buffer periodically and once more on shutdown.
pub async fn run(
    mut publisher: EventPublisher,
    mut events: mpsc::Receiver<serde_json::Value>,
    flush_interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut flush_timer = tokio::time::interval(flush_interval);
    flush_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            event = events.recv() => {
                match event {
                    Some(event) => {
                        let _ = publisher.publish(event).await;
                    }
                    None => break,
                }
            }
            _ = flush_timer.tick() => {
                if publisher.buffered() > 0 {
                    publisher.flush().await;
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
        }
    }

    // Final best-effort flush; whatever cannot be delivered is lost
    publisher.flush().await;
    if publisher.buffered() > 0 {
        tracing::warn!(
            dropped = publisher.buffered(),
            "undeliverable events discarded at shutdown"
        );
    }
}
