use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use thiserror::Error;

use crate::adapters::cloud::{CloudApi, CloudError};
use crate::app::services::CarRepository;
use crate::core::reconciler::{IngestError, Reconciler};
use crate::core::scheduler::{Scheduler, SchedulerError};
use crate::domain::clock::Clock;
use crate::domain::models::Car;
use crate::domain::state::{StateError, StateManager, VehicleEvent, VehicleStateKind};

/// Notified when a vehicle's polling is halted for bad credentials, so
/// its stream can be shut down too.
pub type AuthHaltSink = Box<dyn Fn(i64) + Send + Sync + 'static>;

/// Per-vehicle poll failures the tick loop logs and moves past. Every
/// variant except the cloud policy fallout means a poisoned lock below.
#[derive(Debug, Error)]
pub enum PollError {
    #[error(transparent)]
    State(#[from] StateError),
    #[error(transparent)]
    Scheduler(#[from] SchedulerError),
    #[error(transparent)]
    Ingest(#[from] IngestError),
    #[error("auth-halt set lock poisoned")]
    HaltLockPoisoned,
}

/// The single acquisition driver. Ticks at the base interval, asks the
/// scheduler which vehicles are due, and performs either a full
/// acquisition or a lightweight probe per vehicle. Sequential within a
/// tick; one vehicle's failure never aborts its siblings.
pub struct PollLoop {
    cloud: Arc<dyn CloudApi>,
    cars: Arc<dyn CarRepository>,
    machines: Arc<StateManager>,
    scheduler: Arc<Scheduler>,
    reconciler: Arc<Reconciler>,
    clock: Arc<dyn Clock>,
    stop: Arc<AtomicBool>,
    auth_halted: Mutex<HashSet<i64>>,
    auth_halt_sink: Mutex<Option<AuthHaltSink>>,
}

impl PollLoop {
    pub fn new(
        cloud: Arc<dyn CloudApi>,
        cars: Arc<dyn CarRepository>,
        machines: Arc<StateManager>,
        scheduler: Arc<Scheduler>,
        reconciler: Arc<Reconciler>,
        clock: Arc<dyn Clock>,
        stop: Arc<AtomicBool>,
    ) -> Self {
        Self {
            cloud,
            cars,
            machines,
            scheduler,
            reconciler,
            clock,
            stop,
            auth_halted: Mutex::new(HashSet::new()),
            auth_halt_sink: Mutex::new(None),
        }
    }

    pub fn set_auth_halt_sink(&self, sink: AuthHaltSink) -> Result<(), PollError> {
        *self
            .auth_halt_sink
            .lock()
            .map_err(|_| PollError::HaltLockPoisoned)? = Some(sink);
        Ok(())
    }

    pub fn is_auth_halted(&self, car_id: i64) -> Result<bool, PollError> {
        Ok(self
            .auth_halted
            .lock()
            .map_err(|_| PollError::HaltLockPoisoned)?
            .contains(&car_id))
    }

    /// Blocks until the stop flag fires. Boot performs one immediate poll
    /// before the base ticker starts.
    pub fn run(&self) {
        tracing::info!("performing initial poll");
        self.tick();

        let base_tick = self.scheduler.config().backoff_initial;
        while !self.stop.load(Ordering::SeqCst) {
            std::thread::sleep(base_tick);
            if self.stop.load(Ordering::SeqCst) {
                break;
            }
            self.tick();
        }
        tracing::info!("poll loop stopped");
    }

    /// One pass over the fleet. Per-vehicle failures are logged here so a
    /// wedged vehicle never starves its siblings.
    pub fn tick(&self) {
        let cars = match self.cars.list() {
            Ok(cars) => cars,
            Err(err) => {
                tracing::error!(error = %err, "failed to list cars");
                return;
            }
        };

        let now = self.clock.now();
        for car in cars {
            if self.stop.load(Ordering::SeqCst) {
                return;
            }
            let due = match self.scheduler.is_due(car.id, now) {
                Ok(due) => due,
                Err(err) => {
                    tracing::error!(car_id = car.id, error = %err, "scheduler unavailable");
                    continue;
                }
            };
            let halted = match self.is_auth_halted(car.id) {
                Ok(halted) => halted,
                Err(err) => {
                    tracing::error!(car_id = car.id, error = %err, "halt set unavailable");
                    continue;
                }
            };
            if !due || halted {
                continue;
            }
            if let Err(err) = self.poll_vehicle(&car) {
                tracing::error!(car_id = car.id, error = %err, "poll failed");
            }
        }
    }

    fn poll_vehicle(&self, car: &Car) -> Result<(), PollError> {
        let machine = self
            .machines
            .get_or_create(car.id, VehicleStateKind::Offline, self.clock.now())?;
        let state = machine.current_state()?;

        tracing::debug!(
            car_id = car.id,
            state = %state,
            interval_ms = self.scheduler.current_interval(car.id)?.as_millis() as u64,
            "polling vehicle"
        );

        if state.uses_full_poll() {
            self.poll_full(car)
        } else {
            self.poll_probe(car)
        }
    }

    /// Full data acquisition (may wake the vehicle).
    fn poll_full(&self, car: &Car) -> Result<(), PollError> {
        match self.cloud.get_vehicle_data(car.cloud_id) {
            Ok(data) => {
                self.reconciler.ingest_poll(car, &data)?;
                let state = match self.machines.get(car.id)? {
                    Some(machine) => machine.current_state()?,
                    None => VehicleStateKind::Offline,
                };
                self.scheduler.record_poll(car.id, state, self.clock.now())?;
                Ok(())
            }
            Err(err) => self.handle_poll_error(car, err),
        }
    }

    /// State-only probe; never wakes the vehicle. A vehicle found online
    /// is promoted to a full acquisition within the same tick.
    fn poll_probe(&self, car: &Car) -> Result<(), PollError> {
        match self.cloud.get_vehicle(car.cloud_id) {
            Ok(vehicle) => {
                if vehicle.state == "online" {
                    tracing::info!(car_id = car.id, "vehicle woke up, promoting to full poll");
                    return self.poll_full(car);
                }
                self.reconciler.ingest_probe(car.id, &vehicle.state)?;
                let state = match self.machines.get(car.id)? {
                    Some(machine) => machine.current_state()?,
                    None => VehicleStateKind::Offline,
                };
                self.scheduler.record_poll(car.id, state, self.clock.now())?;
                Ok(())
            }
            Err(err) => self.handle_poll_error(car, err),
        }
    }

    fn handle_poll_error(&self, car: &Car, err: CloudError) -> Result<(), PollError> {
        let now = self.clock.now();
        match err {
            // The vehicle dropped off mid-poll, most likely falling
            // asleep. Not user-visible; the backoff ladder takes over.
            CloudError::VehicleUnavailable => {
                if let Some(machine) = self.machines.get(car.id)? {
                    machine.trigger_if_legal(VehicleEvent::FallAsleep, now)?;
                    self.scheduler
                        .record_poll(car.id, machine.current_state()?, now)?;
                } else {
                    self.scheduler.record_error(car.id, now)?;
                }
            }
            CloudError::Unauthorized => {
                tracing::warn!(car_id = car.id, "unauthorized, attempting token refresh");
                match self.cloud.refresh_token() {
                    Ok(()) => self.scheduler.record_error(car.id, now)?,
                    Err(refresh_err) => {
                        tracing::error!(
                            car_id = car.id,
                            error = %refresh_err,
                            "token refresh failed, halting polling for vehicle; re-authentication required"
                        );
                        self.auth_halted
                            .lock()
                            .map_err(|_| PollError::HaltLockPoisoned)?
                            .insert(car.id);
                        let sink_guard = self
                            .auth_halt_sink
                            .lock()
                            .map_err(|_| PollError::HaltLockPoisoned)?;
                        if let Some(sink) = sink_guard.as_ref() {
                            sink(car.id);
                        }
                    }
                }
            }
            CloudError::RateLimited => {
                tracing::warn!(car_id = car.id, "rate limited, backing off");
                self.scheduler.record_error(car.id, now)?;
            }
            other => {
                tracing::error!(car_id = car.id, error = %other, "poll failed");
                self.scheduler.record_error(car.id, now)?;
            }
        }
        Ok(())
    }
}
