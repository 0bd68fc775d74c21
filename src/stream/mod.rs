use dashmap::DashMap;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;


/// Outbound buffer depth per subscriber. A subscriber whose buffer fills up
/// is disconnected rather than ever stalling the publisher.
const SUBSCRIBER_BUFFER: usize = 16;

/// The named broadcast streams within one environment.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Channel {
    All,
    Flags,
    Ping,
}

impl Channel {
    pub fn name(&self) -> &'static str {
        match self {
            Channel::All => "all",
            Channel::Flags => "flags",
            Channel::Ping => "ping",
        }
    }
}

/// One server-sent event: name, pre-rendered JSON data, optional event id.
#[derive(Clone, Debug, PartialEq)]
pub struct StreamEvent {
    pub name: &'static str,
    pub data: String,
    pub id: Option<String>,
}

impl StreamEvent {
    pub fn put(data: String) -> Self {
        Self {
            name: "put",
            data,
            id: None,
        }
    }

    pub fn patch(data: String) -> Self {
        Self {
            name: "patch",
            data,
            id: None,
        }
    }

    pub fn delete(data: String) -> Self {
        Self {
            name: "delete",
            data,
            id: None,
        }
    }

    pub fn ping() -> Self {
        Self {
            name: "ping",
            data: String::new(),
            id: None,
        }
    }

    pub fn with_id(mut self, id: String) -> Self {
        self.id = Some(id);
        self
    }
}

type SubscriberMap = Arc<DashMap<Uuid, mpsc::Sender<StreamEvent>>>;

/// Per-environment fan-out hub: three channels, each with any number of
/// attached subscribers.
///
/// Publishing never blocks: events are enqueued onto each subscriber's
/// bounded buffer with `try_send`, and a subscriber that cannot keep up is
/// dropped so the rest continue to receive events in order.
pub struct EnvStreams {
    all: SubscriberMap,
    flags: SubscriberMap,
    ping: SubscriberMap,
    keepalive: Duration,
    closed: AtomicBool,
}

impl EnvStreams {
    pub fn new(keepalive: Duration) -> Self {
        Self {
            all: Arc::new(DashMap::new()),
            flags: Arc::new(DashMap::new()),
            ping: Arc::new(DashMap::new()),
            keepalive,
            closed: AtomicBool::new(false),
        }
    }

    fn channel(&self, channel: Channel) -> &SubscriberMap {
        match channel {
            Channel::All => &self.all,
            Channel::Flags => &self.flags,
            Channel::Ping => &self.ping,
        }
    }

    /// Interval for SSE keepalive comments on attached connections.
    pub fn keepalive_interval(&self) -> Duration {
        self.keepalive
    }

    /// Broadcasts an event to every subscriber of a channel.
    ///
    /// Slow subscribers (full buffer) and defunct subscribers (receiver
    /// dropped) are removed; their response streams end, which closes the
    /// connection.
    pub fn publish(&self, channel: Channel, event: StreamEvent) {
        let subscribers = self.channel(channel);
        let mut dead = Vec::new();
        for entry in subscribers.iter() {
            match entry.value().try_send(event.clone()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    debug!(
                        channel = channel.name(),
                        subscriber = %entry.key(),
                        "Disconnecting slow stream subscriber"
                    );
                    dead.push(*entry.key());
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    dead.push(*entry.key());
                }
            }
        }
        for id in dead {
            subscribers.remove(&id);
        }
    }

    /// Attaches a new subscriber to a channel.
    ///
    /// The replay event is enqueued before registration, so it is always the
    /// first event the subscriber observes; every event published after
    /// registration follows in publication order.
    pub fn subscribe(
        &self,
        channel: Channel,
        replay: StreamEvent,
    ) -> Result<StreamSubscription, StreamsClosed> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(StreamsClosed);
        }
        let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER);
        // A fresh channel always has room for the replay.
        let _ = tx.try_send(replay);
        let id = Uuid::new_v4();
        let subscribers = self.channel(channel);
        subscribers.insert(id, tx);
        Ok(StreamSubscription {
            id,
            rx,
            subscribers: Arc::clone(subscribers),
        })
    }

    pub fn subscriber_count(&self, channel: Channel) -> usize {
        self.channel(channel).len()
    }

    /// Disconnects all subscribers and rejects future subscriptions.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.all.clear();
        self.flags.clear();
        self.ping.clear();
    }
}

/// Returned by `subscribe` after the hub has been closed.
#[derive(Debug, PartialEq)]
pub struct StreamsClosed;

impl std::fmt::Display for StreamsClosed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "environment streams are closed")
    }
}

impl std::error::Error for StreamsClosed {}

/// A live subscription; yields events in publication order and unregisters
/// itself from the hub when dropped.
pub struct StreamSubscription {
    id: Uuid,
    rx: mpsc::Receiver<StreamEvent>,
    subscribers: SubscriberMap,
}

impl StreamSubscription {
    /// Receives the next event; `None` once disconnected by the hub.
    pub async fn recv(&mut self) -> Option<StreamEvent> {
        self.rx.recv().await
    }

    /// Non-blocking receive; `None` when the buffer is currently empty.
    pub fn try_recv(&mut self) -> Option<StreamEvent> {
        self.rx.try_recv().ok()
    }
}

impl futures::Stream for StreamSubscription {
    type Item = StreamEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<StreamEvent>> {
        self.rx.poll_recv(cx)
    }
}

impl Drop for StreamSubscription {
    fn drop(&mut self) {
        self.subscribers.remove(&self.id);
    }
}
