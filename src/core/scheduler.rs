use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::domain::state::VehicleStateKind;

/// Per-state cadence plus the backoff envelope for asleep/offline vehicles.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub interval_online: Duration,
    pub interval_driving: Duration,
    pub interval_charging: Duration,
    pub interval_asleep: Duration,
    pub backoff_initial: Duration,
    pub backoff_max: Duration,
    pub backoff_factor: f64,
    pub suspend_interval: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            interval_online: Duration::from_secs(15),
            interval_driving: Duration::from_secs(3),
            interval_charging: Duration::from_secs(5),
            interval_asleep: Duration::from_secs(30),
            backoff_initial: Duration::from_secs(1),
            backoff_max: Duration::from_secs(30),
            backoff_factor: 2.0,
            suspend_interval: Duration::from_secs(21 * 60),
        }
    }
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerError {
    #[error("scheduler lock poisoned")]
    LockPoisoned,
}

#[derive(Debug, Clone, Copy)]
struct Slot {
    next_interval: Duration,
    last_poll: Option<DateTime<Utc>>,
}

/// Decides, per vehicle, whether a tick should poll it and how long to
/// wait after each attempt. A zeroed slot makes the next tick fire
/// immediately.
pub struct Scheduler {
    config: SchedulerConfig,
    slots: Mutex<HashMap<i64, Slot>>,
}

impl Scheduler {
    pub fn new(config: SchedulerConfig) -> Self {
        Self {
            config,
            slots: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    fn with_slots<T>(
        &self,
        op: impl FnOnce(&mut HashMap<i64, Slot>) -> T,
    ) -> Result<T, SchedulerError> {
        let mut slots = self
            .slots
            .lock()
            .map_err(|_| SchedulerError::LockPoisoned)?;
        Ok(op(&mut slots))
    }

    /// Whether `now - last_poll >= next_interval`. Unknown vehicles are
    /// due immediately.
    pub fn is_due(&self, car_id: i64, now: DateTime<Utc>) -> Result<bool, SchedulerError> {
        self.with_slots(|slots| {
            let Some(slot) = slots.get(&car_id) else {
                return true;
            };
            let Some(last_poll) = slot.last_poll else {
                return true;
            };
            let elapsed = now.signed_duration_since(last_poll);
            elapsed >= chrono::Duration::from_std(slot.next_interval).unwrap_or_default()
        })
    }

    pub fn current_interval(&self, car_id: i64) -> Result<Duration, SchedulerError> {
        self.with_slots(|slots| {
            slots
                .get(&car_id)
                .map(|slot| slot.next_interval)
                .unwrap_or(self.config.interval_online)
        })
    }

    /// Recomputes the interval from the post-poll machine state.
    pub fn record_poll(
        &self,
        car_id: i64,
        state: VehicleStateKind,
        now: DateTime<Utc>,
    ) -> Result<(), SchedulerError> {
        self.with_slots(|slots| {
            let previous = slots.get(&car_id).map(|slot| slot.next_interval);

            let next_interval = match state {
                VehicleStateKind::Driving => self.config.interval_driving,
                VehicleStateKind::Charging => self.config.interval_charging,
                VehicleStateKind::Suspended => self.config.suspend_interval,
                // Backoff ladder, additionally capped by the configured asleep
                // cadence when that is tighter than the backoff ceiling.
                VehicleStateKind::Asleep | VehicleStateKind::Offline => self
                    .grow_backoff(previous)
                    .min(self.config.interval_asleep.max(self.config.backoff_initial)),
                VehicleStateKind::Online | VehicleStateKind::Updating => {
                    self.config.interval_online
                }
            };

            slots.insert(
                car_id,
                Slot {
                    next_interval,
                    last_poll: Some(now),
                },
            );
        })
    }

    /// Poll errors back off regardless of machine state.
    pub fn record_error(&self, car_id: i64, now: DateTime<Utc>) -> Result<(), SchedulerError> {
        self.with_slots(|slots| {
            let previous = slots.get(&car_id).map(|slot| slot.next_interval);
            let next_interval = self.grow_backoff(previous);
            slots.insert(
                car_id,
                Slot {
                    next_interval,
                    last_poll: Some(now),
                },
            );
        })
    }

    /// Observed wake: the backoff ladder restarts from the floor.
    pub fn reset_backoff(&self, car_id: i64) -> Result<(), SchedulerError> {
        self.with_slots(|slots| {
            let slot = slots.entry(car_id).or_insert(Slot {
                next_interval: self.config.backoff_initial,
                last_poll: None,
            });
            slot.next_interval = self.config.backoff_initial;
        })
    }

    /// Forces the next tick to poll this vehicle.
    pub fn request_immediate(&self, car_id: i64) -> Result<(), SchedulerError> {
        self.with_slots(|slots| {
            slots.insert(
                car_id,
                Slot {
                    next_interval: Duration::ZERO,
                    last_poll: None,
                },
            );
        })
    }

    /// Pins the interval directly (manual suspend/resume paths).
    pub fn set_interval(&self, car_id: i64, interval: Duration) -> Result<(), SchedulerError> {
        self.with_slots(|slots| {
            let slot = slots.entry(car_id).or_insert(Slot {
                next_interval: interval,
                last_poll: None,
            });
            slot.next_interval = interval;
        })
    }

    fn grow_backoff(&self, previous: Option<Duration>) -> Duration {
        let previous = match previous {
            Some(previous) if previous >= self.config.backoff_initial => previous,
            _ => return self.config.backoff_initial,
        };
        let grown = previous.mul_f64(self.config.backoff_factor.max(1.0));
        grown.min(self.config.backoff_max)
    }
}
