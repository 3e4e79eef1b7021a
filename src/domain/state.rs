use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;

/// Discrete machine states. The set is closed; every transition goes
/// through [`StateMachine::trigger`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum VehicleStateKind {
    Offline,
    Asleep,
    Online,
    Driving,
    Charging,
    Updating,
    Suspended,
}

impl VehicleStateKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Offline => "offline",
            Self::Asleep => "asleep",
            Self::Online => "online",
            Self::Driving => "driving",
            Self::Charging => "charging",
            Self::Updating => "updating",
            Self::Suspended => "suspended",
        }
    }

    /// Maps an upstream state string; anything unknown reads as offline.
    pub fn from_cloud(raw: &str) -> Self {
        match raw {
            "online" => Self::Online,
            "asleep" => Self::Asleep,
            _ => Self::Offline,
        }
    }

    /// States in which the poll loop performs a full data acquisition.
    pub fn uses_full_poll(self) -> bool {
        matches!(
            self,
            Self::Online | Self::Driving | Self::Charging | Self::Updating
        )
    }
}

impl fmt::Display for VehicleStateKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VehicleEvent {
    WakeUp,
    FallAsleep,
    GoOffline,
    StartDriving,
    StopDriving,
    StartCharging,
    StopCharging,
    StartUpdating,
    StopUpdating,
    Suspend,
    Resume,
}

impl VehicleEvent {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::WakeUp => "wake_up",
            Self::FallAsleep => "fall_asleep",
            Self::GoOffline => "go_offline",
            Self::StartDriving => "start_driving",
            Self::StopDriving => "stop_driving",
            Self::StartCharging => "start_charging",
            Self::StopCharging => "stop_charging",
            Self::StartUpdating => "start_updating",
            Self::StopUpdating => "stop_updating",
            Self::Suspend => "suspend",
            Self::Resume => "resume",
        }
    }
}

impl fmt::Display for VehicleEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The closed transition table. Returns the destination state when `event`
/// is legal from `from`.
fn transition_target(from: VehicleStateKind, event: VehicleEvent) -> Option<VehicleStateKind> {
    use VehicleEvent as E;
    use VehicleStateKind as S;

    let target = match (event, from) {
        (E::WakeUp, S::Offline | S::Asleep) => S::Online,
        (E::FallAsleep, S::Online | S::Suspended) => S::Asleep,
        (E::GoOffline, S::Online | S::Asleep | S::Suspended) => S::Offline,
        (E::StartDriving, S::Online | S::Suspended) => S::Driving,
        (E::StopDriving, S::Driving) => S::Online,
        (E::StartCharging, S::Online | S::Suspended) => S::Charging,
        (E::StopCharging, S::Charging) => S::Online,
        (E::StartUpdating, S::Online) => S::Updating,
        (E::StopUpdating, S::Updating) => S::Online,
        (E::Suspend, S::Online) => S::Suspended,
        (E::Resume, S::Suspended) => S::Online,
        _ => return None,
    };
    Some(target)
}

/// Failures of the state layer. An illegal event is expected traffic (the
/// caller logs and moves on); a poisoned lock means a writer panicked
/// mid-update and must be surfaced, never swallowed by a panic cascade.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum StateError {
    #[error("event {event} is not legal from state {from}")]
    IllegalTransition {
        event: VehicleEvent,
        from: VehicleStateKind,
    },
    #[error("vehicle state lock poisoned")]
    LockPoisoned,
}

/// In-memory snapshot of the latest observed state of one vehicle. All
/// units are metric; power follows the wire sign convention (positive =
/// discharge, negative = charging/regen).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VehicleState {
    pub car_id: i64,
    pub state: VehicleStateKind,
    pub state_since: DateTime<Utc>,
    pub last_active: DateTime<Utc>,

    pub battery_level: i64,
    pub usable_battery_level: i64,
    pub range_km: f64,
    pub ideal_range_km: f64,
    pub charging_state: String,
    pub plugged_in: bool,
    pub charger_power: i64,
    pub charger_voltage: i64,
    pub charger_current: i64,
    pub charge_limit_soc: i64,
    pub charge_energy_added_kwh: f64,
    pub time_to_full_charge_hours: f64,

    pub latitude: f64,
    pub longitude: f64,
    pub heading: i64,
    pub elevation_m: Option<i64>,
    pub speed_kmh: Option<f64>,
    pub power_kw: i64,
    pub shift_state: String,
    pub odometer_km: f64,

    pub inside_temp: Option<f64>,
    pub outside_temp: Option<f64>,
    pub is_climate_on: bool,
    pub is_preconditioning: bool,

    pub locked: bool,
    pub sentry_mode: bool,
    pub doors_open: bool,
    pub windows_open: bool,
    pub frunk_open: bool,
    pub trunk_open: bool,
    pub is_user_present: bool,

    pub tpms_pressure_fl: Option<f64>,
    pub tpms_pressure_fr: Option<f64>,
    pub tpms_pressure_rl: Option<f64>,
    pub tpms_pressure_rr: Option<f64>,

    pub car_version: String,
    pub software_update_status: String,
    pub software_update_download_perc: i64,

    pub can_sleep: bool,
    pub sleep_block_reason: String,
}

impl VehicleState {
    pub fn new(car_id: i64, state: VehicleStateKind, now: DateTime<Utc>) -> Self {
        Self {
            car_id,
            state,
            state_since: now,
            last_active: now,
            battery_level: 0,
            usable_battery_level: 0,
            range_km: 0.0,
            ideal_range_km: 0.0,
            charging_state: String::new(),
            plugged_in: false,
            charger_power: 0,
            charger_voltage: 0,
            charger_current: 0,
            charge_limit_soc: 0,
            charge_energy_added_kwh: 0.0,
            time_to_full_charge_hours: 0.0,
            latitude: 0.0,
            longitude: 0.0,
            heading: 0,
            elevation_m: None,
            speed_kmh: None,
            power_kw: 0,
            shift_state: String::new(),
            odometer_km: 0.0,
            inside_temp: None,
            outside_temp: None,
            is_climate_on: false,
            is_preconditioning: false,
            locked: false,
            sentry_mode: false,
            doors_open: false,
            windows_open: false,
            frunk_open: false,
            trunk_open: false,
            is_user_present: false,
            tpms_pressure_fl: None,
            tpms_pressure_fr: None,
            tpms_pressure_rl: None,
            tpms_pressure_rr: None,
            car_version: String::new(),
            software_update_status: String::new(),
            software_update_download_perc: 0,
            can_sleep: true,
            sleep_block_reason: String::new(),
        }
    }
}

/// Sink invoked after every actual transition with (car_id, from, to).
pub type TransitionSink =
    Arc<dyn Fn(i64, VehicleStateKind, VehicleStateKind) + Send + Sync + 'static>;

/// One vehicle's state record behind a mutex. Exactly one writer path at a
/// time; readers only ever get copies.
pub struct StateMachine {
    car_id: i64,
    inner: Mutex<VehicleState>,
    sink: Option<TransitionSink>,
}

impl StateMachine {
    pub fn new(
        car_id: i64,
        initial: VehicleStateKind,
        now: DateTime<Utc>,
        sink: Option<TransitionSink>,
    ) -> Self {
        Self {
            car_id,
            inner: Mutex::new(VehicleState::new(car_id, initial, now)),
            sink,
        }
    }

    fn guard(&self) -> Result<MutexGuard<'_, VehicleState>, StateError> {
        self.inner.lock().map_err(|_| StateError::LockPoisoned)
    }

    pub fn current_state(&self) -> Result<VehicleStateKind, StateError> {
        Ok(self.guard()?.state)
    }

    /// Deep copy of the record; callers never retain references inside.
    pub fn snapshot(&self) -> Result<VehicleState, StateError> {
        Ok(self.guard()?.clone())
    }

    pub fn update(&self, apply: impl FnOnce(&mut VehicleState)) -> Result<(), StateError> {
        let mut guard = self.guard()?;
        apply(&mut guard);
        Ok(())
    }

    pub fn can(&self, event: VehicleEvent) -> Result<bool, StateError> {
        Ok(transition_target(self.current_state()?, event).is_some())
    }

    /// Fires `event`; on a legal edge the state flips, `state_since` resets
    /// and the sink observes (car_id, from, to).
    pub fn trigger(
        &self,
        event: VehicleEvent,
        now: DateTime<Utc>,
    ) -> Result<(VehicleStateKind, VehicleStateKind), StateError> {
        let (from, to) = {
            let mut guard = self.guard()?;
            let from = guard.state;
            let Some(to) = transition_target(from, event) else {
                return Err(StateError::IllegalTransition { event, from });
            };
            guard.state = to;
            guard.state_since = now;
            (from, to)
        };

        if let Some(sink) = &self.sink {
            sink(self.car_id, from, to);
        }
        Ok((from, to))
    }

    /// `trigger` for the caller that treats an illegal edge as a logged
    /// no-op. Ok(true) means the transition fired; lock poisoning still
    /// propagates.
    pub fn trigger_if_legal(
        &self,
        event: VehicleEvent,
        now: DateTime<Utc>,
    ) -> Result<bool, StateError> {
        match self.trigger(event, now) {
            Ok(_) => Ok(true),
            Err(StateError::IllegalTransition { .. }) => Ok(false),
            Err(err) => Err(err),
        }
    }

    /// Resets the idle timer. `last_active` never moves backwards.
    pub fn mark_active(&self, now: DateTime<Utc>) -> Result<(), StateError> {
        let mut guard = self.guard()?;
        if now > guard.last_active {
            guard.last_active = now;
        }
        Ok(())
    }
}

/// Owns one machine per discovered car.
pub struct StateManager {
    machines: Mutex<HashMap<i64, Arc<StateMachine>>>,
    sink: Option<TransitionSink>,
}

impl StateManager {
    pub fn new(sink: Option<TransitionSink>) -> Self {
        Self {
            machines: Mutex::new(HashMap::new()),
            sink,
        }
    }

    fn guard(&self) -> Result<MutexGuard<'_, HashMap<i64, Arc<StateMachine>>>, StateError> {
        self.machines.lock().map_err(|_| StateError::LockPoisoned)
    }

    pub fn get_or_create(
        &self,
        car_id: i64,
        initial: VehicleStateKind,
        now: DateTime<Utc>,
    ) -> Result<Arc<StateMachine>, StateError> {
        let mut guard = self.guard()?;
        let machine = guard
            .entry(car_id)
            .or_insert_with(|| Arc::new(StateMachine::new(car_id, initial, now, self.sink.clone())))
            .clone();
        Ok(machine)
    }

    pub fn get(&self, car_id: i64) -> Result<Option<Arc<StateMachine>>, StateError> {
        Ok(self.guard()?.get(&car_id).cloned())
    }

    pub fn all_snapshots(&self) -> Result<Vec<VehicleState>, StateError> {
        let machines: Vec<Arc<StateMachine>> = self.guard()?.values().cloned().collect();
        let mut snapshots = Vec::with_capacity(machines.len());
        for machine in &machines {
            snapshots.push(machine.snapshot()?);
        }
        snapshots.sort_by_key(|snapshot| snapshot.car_id);
        Ok(snapshots)
    }
}
