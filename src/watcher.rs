use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;

use crate::model::{ControllerInfo, Credentials, Entity};

/// Buffered events per consumer. Consumers that fall further behind lose
/// events; reconcilers re-derive desired state each tick, so lost change
/// notifications are tolerable.
const CONSUMER_BUFFER: usize = 16;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChangeOperation {
    Create,
    Update,
    Delete,
}

#[derive(Clone, Debug)]
pub enum ChangePayload {
    Entity(Entity),
    Credentials(Credentials),
    Controller(ControllerInfo),
}

#[derive(Clone, Debug)]
pub struct ChangeEvent {
    pub operation: ChangeOperation,
    pub payload: ChangePayload,
}

pub type ChangeFilter = Box<dyn Fn(&ChangeEvent) -> bool + Send + Sync>;

struct Consumer {
    name: String,
    filter: ChangeFilter,
    tx: mpsc::Sender<ChangeEvent>,
}

/// Fan-out point for database mutations. The store publishes every entity,
/// credentials and controller mutation here; pool managers subscribe with a
/// filter and receive matching events on a bounded channel.
#[derive(Clone, Default)]
pub struct WatcherHub {
    consumers: Arc<Mutex<Vec<Consumer>>>,
}

impl WatcherHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, name: &str, filter: ChangeFilter) -> ChangeConsumer {
        let (tx, rx) = mpsc::channel(CONSUMER_BUFFER);
        let mut consumers = self.consumers.lock().expect("watcher hub poisoned");
        consumers.push(Consumer {
            name: name.to_string(),
            filter,
            tx,
        });
        ChangeConsumer { rx }
    }

    pub fn publish(&self, event: ChangeEvent) {
        let mut consumers = self.consumers.lock().expect("watcher hub poisoned");
        consumers.retain(|consumer| {
            if !(consumer.filter)(&event) {
                return true;
            }
            match consumer.tx.try_send(event.clone()) {
                Ok(()) => true,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    tracing::warn!(
                        consumer = %consumer.name,
                        "consumer buffer full, dropping change event"
                    );
                    true
                }
                // Receiver dropped; forget the consumer.
                Err(mpsc::error::TrySendError::Closed(_)) => false,
            }
        });
    }
}

/// Receiving side of a filtered subscription. Dropping it deregisters the
/// consumer on the next publish.
pub struct ChangeConsumer {
    rx: mpsc::Receiver<ChangeEvent>,
}

impl ChangeConsumer {
    pub async fn recv(&mut self) -> Option<ChangeEvent> {
        self.rx.recv().await
    }

    pub fn close(&mut self) {
        self.rx.close();
    }
}

/// Filter matching everything a single pool manager cares about: the entity
/// itself, the credentials it references, and the controller record.
pub fn entity_scope_filter(entity: &Entity) -> ChangeFilter {
    let entity_id = entity.id;
    let credentials_name = entity.credentials_name.clone();
    Box::new(move |event| match &event.payload {
        ChangePayload::Entity(changed) => changed.id == entity_id,
        ChangePayload::Credentials(creds) => creds.name == credentials_name,
        ChangePayload::Controller(_) => true,
    })
}
