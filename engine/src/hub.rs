use crate::settings::HubSettings;
use futures::Stream;
use serde::Serialize;
use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// A named, already serialised event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HubEvent {
    pub name: String,
    pub data: String,
}

impl HubEvent {
    pub fn new<T: Serialize + ?Sized>(name: &str, payload: &T) -> Self {
        let data = serde_json::to_string(payload).unwrap_or_else(|e| {
            warn!("Failed to serialize {} event: {}", name, e);
            "null".to_string()
        });
        Self {
            name: name.to_string(),
            data,
        }
    }

    /// Server-sent-events wire form.
    pub fn to_frame(&self) -> String {
        format!("event: {}\ndata: {}\n\n", self.name, self.data)
    }
}

enum Command {
    Register {
        id: u64,
        tx: mpsc::Sender<HubEvent>,
    },
    Unregister(u64),
    Broadcast(HubEvent),
    Count(oneshot::Sender<usize>),
}

/// Fan-out of events to live subscribers.
///
/// The subscriber set is owned by a single actor task. A subscriber whose
/// queue is full is dropped instead of slowing down the broadcaster.
#[derive(Clone)]
pub struct BroadcastHub {
    tx: mpsc::UnboundedSender<Command>,
    next_id: Arc<AtomicU64>,
    capacity: usize,
}

impl BroadcastHub {
    /// Starts the actor. It stops when `shutdown` fires or every handle is gone.
    pub fn spawn(settings: &HubSettings, shutdown: CancellationToken) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let keepalive = Duration::from_secs(settings.keepalive_secs);
        tokio::spawn(run_actor(rx, keepalive, shutdown));
        Self {
            tx,
            next_id: Arc::new(AtomicU64::new(1)),
            capacity: settings.subscriber_capacity.max(1),
        }
    }

    pub fn register(&self) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(self.capacity);
        let _ = self.tx.send(Command::Register { id, tx });
        Subscription {
            id,
            rx,
            hub: self.tx.clone(),
        }
    }

    pub fn unregister(&self, subscription: &Subscription) {
        let _ = self.tx.send(Command::Unregister(subscription.id));
    }

    pub fn broadcast<T: Serialize + ?Sized>(&self, name: &str, payload: &T) {
        let _ = self.tx.send(Command::Broadcast(HubEvent::new(name, payload)));
    }

    pub async fn subscriber_count(&self) -> usize {
        let (tx, rx) = oneshot::channel();
        if self.tx.send(Command::Count(tx)).is_err() {
            return 0;
        }
        rx.await.unwrap_or_default()
    }
}

async fn run_actor(
    mut rx: mpsc::UnboundedReceiver<Command>,
    keepalive: Duration,
    shutdown: CancellationToken,
) {
    let mut subscribers: HashMap<u64, mpsc::Sender<HubEvent>> = HashMap::new();
    // a zero period disables the keep-alive
    let mut ping = (!keepalive.is_zero()).then(|| {
        let mut interval = tokio::time::interval_at(Instant::now() + keepalive, keepalive);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        interval
    });

    loop {
        let command = tokio::select! {
            _ = shutdown.cancelled() => break,
            command = rx.recv() => match command {
                Some(command) => command,
                None => break,
            },
            _ = next_ping(ping.as_mut()) => Command::Broadcast(HubEvent::new("ping", "pong")),
        };

        match command {
            Command::Register { id, tx } => {
                subscribers.insert(id, tx);
                debug!("Hub subscriber {} registered, {} total", id, subscribers.len());
            }
            Command::Unregister(id) => {
                if subscribers.remove(&id).is_some() {
                    debug!("Hub subscriber {} unregistered", id);
                }
            }
            Command::Broadcast(event) => {
                subscribers.retain(|id, tx| match tx.try_send(event.clone()) {
                    Ok(()) => true,
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        warn!("Dropping hub subscriber {}: queue full", id);
                        false
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => false,
                });
            }
            Command::Count(reply) => {
                let _ = reply.send(subscribers.len());
            }
        }
    }
    debug!("Hub actor stopped");
}

async fn next_ping(interval: Option<&mut Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

/// An ordered stream of hub events. Dropping it unregisters.
pub struct Subscription {
    id: u64,
    rx: mpsc::Receiver<HubEvent>,
    hub: mpsc::UnboundedSender<Command>,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Next event, `None` once the hub has dropped this subscriber.
    pub async fn recv(&mut self) -> Option<HubEvent> {
        self.rx.recv().await
    }
}

impl Stream for Subscription {
    type Item = HubEvent;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<HubEvent>> {
        self.get_mut().rx.poll_recv(cx)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        let _ = self.hub.send(Command::Unregister(self.id));
    }
}
