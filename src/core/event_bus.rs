use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use crossbeam_channel::{Receiver, Sender, TrySendError, bounded};
use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

use crate::domain::models::Car;
use crate::domain::state::VehicleState;

const DEFAULT_BUFFER: usize = 16;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum BusError {
    #[error("event bus lock poisoned")]
    LockPoisoned,
}

/// First frame every new subscriber receives: the vehicle list plus the
/// current snapshot of every known state.
#[derive(Debug, Clone, Default, Serialize)]
pub struct InitData {
    pub cars: Vec<Car>,
    pub states: Vec<VehicleState>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum BusMessage {
    Init(InitData),
    StateUpdate(VehicleState),
}

pub struct Subscription {
    pub id: Uuid,
    pub receiver: Receiver<BusMessage>,
}

type InitProvider = Box<dyn Fn() -> InitData + Send + Sync + 'static>;

/// Fan-out of state snapshots to UI subscribers. Each subscriber owns a
/// bounded buffer; a full buffer drops the incoming message for that
/// subscriber and bumps its drop counter. Delivered messages stay FIFO.
pub struct EventBus {
    buffer: usize,
    subscribers: Mutex<HashMap<Uuid, Sender<BusMessage>>>,
    dropped: Mutex<HashMap<Uuid, u64>>,
    init_provider: Mutex<Option<InitProvider>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_buffer(DEFAULT_BUFFER)
    }

    pub fn with_buffer(buffer: usize) -> Self {
        Self {
            buffer: buffer.max(1),
            subscribers: Mutex::new(HashMap::new()),
            dropped: Mutex::new(HashMap::new()),
            init_provider: Mutex::new(None),
        }
    }

    fn subscribers_guard(
        &self,
    ) -> Result<MutexGuard<'_, HashMap<Uuid, Sender<BusMessage>>>, BusError> {
        self.subscribers.lock().map_err(|_| BusError::LockPoisoned)
    }

    fn dropped_guard(&self) -> Result<MutexGuard<'_, HashMap<Uuid, u64>>, BusError> {
        self.dropped.lock().map_err(|_| BusError::LockPoisoned)
    }

    /// The bus cannot know the vehicle list itself; the service installs a
    /// provider after wiring.
    pub fn set_init_provider(
        &self,
        provider: impl Fn() -> InitData + Send + Sync + 'static,
    ) -> Result<(), BusError> {
        *self
            .init_provider
            .lock()
            .map_err(|_| BusError::LockPoisoned)? = Some(Box::new(provider));
        Ok(())
    }

    pub fn subscribe(&self) -> Result<Subscription, BusError> {
        let (sender, receiver) = bounded(self.buffer);

        let init = self
            .init_provider
            .lock()
            .map_err(|_| BusError::LockPoisoned)?
            .as_ref()
            .map(|provider| provider())
            .unwrap_or_default();
        let _ = sender.try_send(BusMessage::Init(init));

        let id = Uuid::new_v4();
        self.subscribers_guard()?.insert(id, sender);
        Ok(Subscription { id, receiver })
    }

    pub fn unsubscribe(&self, id: Uuid) -> Result<(), BusError> {
        let dropped = self.dropped_count(id)?;
        if dropped > 0 {
            tracing::debug!(subscriber = %id, dropped, "subscriber left with dropped messages");
        }
        self.subscribers_guard()?.remove(&id);
        self.dropped_guard()?.remove(&id);
        Ok(())
    }

    pub fn publish(&self, state: VehicleState) -> Result<(), BusError> {
        let mut gone = Vec::new();
        {
            let subscribers = self.subscribers_guard()?;
            for (id, sender) in subscribers.iter() {
                match sender.try_send(BusMessage::StateUpdate(state.clone())) {
                    Ok(()) => {}
                    Err(TrySendError::Full(_)) => {
                        *self.dropped_guard()?.entry(*id).or_insert(0) += 1;
                    }
                    Err(TrySendError::Disconnected(_)) => gone.push(*id),
                }
            }
        }
        for id in gone {
            self.unsubscribe(id)?;
        }
        Ok(())
    }

    pub fn dropped_count(&self, id: Uuid) -> Result<u64, BusError> {
        Ok(self.dropped_guard()?.get(&id).copied().unwrap_or(0))
    }

    pub fn subscriber_count(&self) -> Result<usize, BusError> {
        Ok(self.subscribers_guard()?.len())
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
