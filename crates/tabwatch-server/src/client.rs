use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use axum::extract::ws::{Message as WsMessage, WebSocket};
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use tabwatch_core::events::SubscriberMessage;
use tabwatch_core::ids::SubscriberId;

/// A connected real-time subscriber.
pub struct Subscriber {
    pub id: SubscriberId,
    tx: mpsc::Sender<String>,
    connected: AtomicBool,
    last_pong: Mutex<Instant>,
}

impl Subscriber {
    fn new(id: SubscriberId, tx: mpsc::Sender<String>) -> Self {
        Self {
            id,
            tx,
            connected: AtomicBool::new(true),
            last_pong: Mutex::new(Instant::now()),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed) && !self.tx.is_closed()
    }

    pub fn record_pong(&self) {
        *self.last_pong.lock() = Instant::now();
    }

    pub fn last_pong(&self) -> Instant {
        *self.last_pong.lock()
    }

    /// Queue a message; a full queue drops it.
    pub fn send(&self, message: String) -> bool {
        match self.tx.try_send(message) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(msg)) => {
                warn!(subscriber_id = %self.id, msg_len = msg.len(), "send queue full, dropping message");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }
}

/// Registry of connected subscribers.
pub struct SubscriberRegistry {
    subscribers: DashMap<SubscriberId, Arc<Subscriber>>,
    max_send_queue: usize,
}

impl SubscriberRegistry {
    pub fn new(max_send_queue: usize) -> Self {
        Self {
            subscribers: DashMap::new(),
            max_send_queue: max_send_queue.max(1),
        }
    }

    /// Register a new subscriber. Its pong clock starts now.
    pub fn register(&self) -> (SubscriberId, mpsc::Receiver<String>) {
        let id = SubscriberId::new();
        let (tx, rx) = mpsc::channel(self.max_send_queue);
        self.subscribers
            .insert(id.clone(), Arc::new(Subscriber::new(id.clone(), tx)));
        (id, rx)
    }

    pub fn unregister(&self, id: &SubscriberId) {
        if let Some((_, subscriber)) = self.subscribers.remove(id) {
            subscriber.connected.store(false, Ordering::Relaxed);
        }
    }

    pub fn get(&self, id: &SubscriberId) -> Option<Arc<Subscriber>> {
        self.subscribers.get(id).map(|s| Arc::clone(s.value()))
    }

    pub fn record_pong(&self, id: &SubscriberId) {
        if let Some(subscriber) = self.subscribers.get(id) {
            subscriber.record_pong();
        }
    }

    pub fn send_to(&self, id: &SubscriberId, message: String) -> bool {
        self.get(id).is_some_and(|s| s.send(message))
    }

    /// Send to every connected subscriber. Returns how many accepted it.
    pub fn broadcast(&self, message: &str) -> usize {
        self.connected()
            .iter()
            .filter(|s| s.send(message.to_string()))
            .count()
    }

    pub fn connected(&self) -> Vec<Arc<Subscriber>> {
        self.subscribers
            .iter()
            .filter(|e| e.value().is_connected())
            .map(|e| Arc::clone(e.value()))
            .collect()
    }

    pub fn count(&self) -> usize {
        self.subscribers.len()
    }
}

/// Pump one WebSocket: outbound messages from the subscriber's queue, inbound
/// pongs into the registry. Unregisters the subscriber when either side ends.
pub async fn handle_ws_connection(
    socket: WebSocket,
    subscriber_id: SubscriberId,
    mut rx: mpsc::Receiver<String>,
    registry: Arc<SubscriberRegistry>,
) {
    let (mut ws_tx, mut ws_rx) = socket.split();

    let writer_id = subscriber_id.clone();
    let writer = tokio::spawn(async move {
        while let Some(text) = rx.recv().await {
            if ws_tx.send(WsMessage::Text(text.into())).await.is_err() {
                break;
            }
        }
        trace!(subscriber_id = %writer_id, "writer finished");
    });

    let reader_id = subscriber_id.clone();
    let reader_registry = Arc::clone(&registry);
    let reader = tokio::spawn(async move {
        while let Some(Ok(msg)) = ws_rx.next().await {
            match msg {
                WsMessage::Text(text) => match serde_json::from_str::<SubscriberMessage>(text.as_str()) {
                    Ok(SubscriberMessage::Pong) => reader_registry.record_pong(&reader_id),
                    Err(_) => debug!(subscriber_id = %reader_id, "ignoring unknown subscriber message"),
                },
                WsMessage::Pong(_) => reader_registry.record_pong(&reader_id),
                WsMessage::Close(_) => break,
                _ => {}
            }
        }
    });

    tokio::select! {
        _ = writer => {},
        _ = reader => {},
    }

    registry.unregister(&subscriber_id);
    debug!(subscriber_id = %subscriber_id, "subscriber disconnected");
}
