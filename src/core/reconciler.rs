use std::sync::{Arc, Mutex};

use thiserror::Error;

use crate::adapters::cloud::VehicleData;
use crate::app::services::{CarRepository, PositionRepository};
use crate::core::event_bus::{BusError, EventBus};
use crate::core::scheduler::{Scheduler, SchedulerError};
use crate::core::segmenter::{SegmenterError, SessionSegmenter};
use crate::domain::clock::Clock;
use crate::domain::models::{Car, Position};
use crate::domain::sleep;
use crate::domain::state::{
    StateError, StateMachine, StateManager, VehicleEvent, VehicleState, VehicleStateKind,
};
use crate::domain::stream_frame::StreamFrame;
use crate::domain::units::{miles_to_km, mph_to_kmh};

/// Notified when a vehicle is observed back online (the poll loop uses
/// this to clear the stream client's offline latch).
pub type WakeSink = Box<dyn Fn(i64) + Send + Sync + 'static>;

/// Hard ingress failures. Everything here means a lock was poisoned
/// somewhere below; ordinary upstream noise never surfaces this way.
#[derive(Debug, Error)]
pub enum IngestError {
    #[error(transparent)]
    State(#[from] StateError),
    #[error(transparent)]
    Scheduler(#[from] SchedulerError),
    #[error(transparent)]
    Bus(#[from] BusError),
    #[error(transparent)]
    Segmenter(#[from] SegmenterError),
    #[error("wake sink lock poisoned")]
    SinkLockPoisoned,
}

/// The sole writer to `VehicleState`. Merges poll bundles and stream
/// tuples, drives the machine, hands session boundaries to the segmenter
/// and runs the sleep gate.
pub struct Reconciler {
    machines: Arc<StateManager>,
    scheduler: Arc<Scheduler>,
    segmenter: Arc<SessionSegmenter>,
    bus: Arc<EventBus>,
    cars: Arc<dyn CarRepository>,
    positions: Arc<dyn PositionRepository>,
    clock: Arc<dyn Clock>,
    require_not_unlocked: bool,
    suspend_after_idle: chrono::Duration,
    wake_sink: Mutex<Option<WakeSink>>,
}

impl Reconciler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        machines: Arc<StateManager>,
        scheduler: Arc<Scheduler>,
        segmenter: Arc<SessionSegmenter>,
        bus: Arc<EventBus>,
        cars: Arc<dyn CarRepository>,
        positions: Arc<dyn PositionRepository>,
        clock: Arc<dyn Clock>,
        require_not_unlocked: bool,
        suspend_after_idle: chrono::Duration,
    ) -> Self {
        Self {
            machines,
            scheduler,
            segmenter,
            bus,
            cars,
            positions,
            clock,
            require_not_unlocked,
            suspend_after_idle,
            wake_sink: Mutex::new(None),
        }
    }

    pub fn set_wake_sink(&self, sink: WakeSink) -> Result<(), IngestError> {
        *self
            .wake_sink
            .lock()
            .map_err(|_| IngestError::SinkLockPoisoned)? = Some(sink);
        Ok(())
    }

    fn notify_wake(&self, car_id: i64) -> Result<(), IngestError> {
        let guard = self
            .wake_sink
            .lock()
            .map_err(|_| IngestError::SinkLockPoisoned)?;
        if let Some(sink) = guard.as_ref() {
            sink(car_id);
        }
        Ok(())
    }

    // ---- poll ingress ----

    /// Full-acquisition ingress: merges every present sub-record, syncs
    /// the machine with the reported state, segments drives/charges/parks
    /// and finally runs the sleep gate.
    pub fn ingest_poll(&self, car: &Car, data: &VehicleData) -> Result<(), IngestError> {
        let now = self.clock.now();
        let machine =
            self.machines
                .get_or_create(car.id, VehicleStateKind::from_cloud(&data.state), now)?;

        self.sync_machine_with_cloud_state(car.id, &machine, &data.state)?;
        self.refresh_car_config(car, data);
        merge_poll_fields(&machine, data)?;
        self.apply_poll_transitions(car.id, &machine, data)?;

        let state = machine.current_state()?;

        // Open-session live refresh.
        if state == VehicleStateKind::Online && data.state == "online" {
            self.segmenter.update_park(car.id, &machine.snapshot()?)?;
        }
        if state == VehicleStateKind::Charging {
            self.segmenter.update_charge(car.id, &machine.snapshot()?);
        }

        // Trajectory sample; linked to the open drive while driving.
        if data.state == "online" && data.drive_state.is_some() {
            let drive_id = if state == VehicleStateKind::Driving {
                self.segmenter.active_drive_id(car.id)
            } else {
                None
            };
            let position = position_from_poll(car.id, drive_id, &machine.snapshot()?, now);
            if let Err(err) = self.positions.create(&position) {
                tracing::error!(car_id = car.id, error = %err, "failed to record position");
            }
        }

        if machine.current_state()? == VehicleStateKind::Online {
            self.run_sleep_gate(car.id, &machine)?;
        }

        self.bus.publish(machine.snapshot()?)?;
        Ok(())
    }

    /// Lightweight-probe ingress for the asleep/offline/suspended states.
    /// Online promotion is the poll loop's job.
    pub fn ingest_probe(&self, car_id: i64, reported_state: &str) -> Result<(), IngestError> {
        let now = self.clock.now();
        let machine =
            self.machines
                .get_or_create(car_id, VehicleStateKind::from_cloud(reported_state), now)?;

        match reported_state {
            "asleep" => self.transition_down(car_id, &machine, VehicleEvent::FallAsleep)?,
            "offline" => self.transition_down(car_id, &machine, VehicleEvent::GoOffline)?,
            _ => {}
        }

        self.bus.publish(machine.snapshot()?)?;
        Ok(())
    }

    fn sync_machine_with_cloud_state(
        &self,
        car_id: i64,
        machine: &StateMachine,
        state: &str,
    ) -> Result<(), IngestError> {
        match state {
            "asleep" => self.transition_down(car_id, machine, VehicleEvent::FallAsleep)?,
            "offline" => self.transition_down(car_id, machine, VehicleEvent::GoOffline)?,
            "online" => {
                let current = machine.current_state()?;
                if matches!(
                    current,
                    VehicleStateKind::Asleep | VehicleStateKind::Offline
                ) {
                    let now = self.clock.now();
                    if machine.trigger_if_legal(VehicleEvent::WakeUp, now)? {
                        machine.mark_active(now)?;
                        self.scheduler.reset_backoff(car_id)?;
                        self.notify_wake(car_id)?;
                    }
                }
            }
            _ => {}
        }
        Ok(())
    }

    /// Drops to asleep/offline when legal; anything else (e.g. driving)
    /// is logged and left alone.
    fn transition_down(
        &self,
        car_id: i64,
        machine: &StateMachine,
        event: VehicleEvent,
    ) -> Result<(), StateError> {
        let current = machine.current_state()?;
        let target_reached = matches!(
            (event, current),
            (VehicleEvent::FallAsleep, VehicleStateKind::Asleep)
                | (VehicleEvent::GoOffline, VehicleStateKind::Offline)
        );
        if target_reached {
            return Ok(());
        }
        if !machine.trigger_if_legal(event, self.clock.now())? {
            tracing::warn!(
                car_id,
                from = %current,
                event = %event,
                "cannot transition to sleep/offline from current state"
            );
        }
        Ok(())
    }

    fn refresh_car_config(&self, car: &Car, data: &VehicleData) {
        let Some(config) = &data.vehicle_config else {
            return;
        };

        let mut updated = car.clone();
        let mut changed = false;
        if !config.car_type.is_empty() && updated.model != config.car_type {
            updated.model = config.car_type.clone();
            changed = true;
        }
        if !config.exterior_color.is_empty() && updated.exterior_color != config.exterior_color {
            updated.exterior_color = config.exterior_color.clone();
            changed = true;
        }
        if !config.trim_badging.is_empty() && updated.trim_badging != config.trim_badging {
            updated.trim_badging = config.trim_badging.clone();
            changed = true;
        }
        if !config.wheel_type.is_empty() && updated.wheel_type != config.wheel_type {
            updated.wheel_type = config.wheel_type.clone();
            changed = true;
        }

        if changed && let Err(err) = self.cars.update_config(&updated, self.clock.now()) {
            tracing::error!(car_id = car.id, error = %err, "failed to update car config");
        }
    }

    fn apply_poll_transitions(
        &self,
        car_id: i64,
        machine: &StateMachine,
        data: &VehicleData,
    ) -> Result<(), IngestError> {
        let now = self.clock.now();
        let current = machine.current_state()?;

        let is_driving = data
            .drive_state
            .as_ref()
            .and_then(|drive| drive.shift_state.as_deref())
            .is_some_and(|shift| shift != "P");

        if is_driving && current != VehicleStateKind::Driving {
            if machine.can(VehicleEvent::StartDriving)? {
                // Close the parking first so the drive never coexists with
                // an open park row.
                self.segmenter.close_park(car_id, &machine.snapshot()?)?;
                if machine.trigger_if_legal(VehicleEvent::StartDriving, now)? {
                    self.segmenter.open_drive(car_id, &machine.snapshot()?);
                    machine.mark_active(now)?;
                }
            }
        } else if !is_driving
            && current == VehicleStateKind::Driving
            && machine.trigger_if_legal(VehicleEvent::StopDriving, now)?
        {
            let snapshot = machine.snapshot()?;
            self.segmenter.close_drive(car_id, &snapshot);
            self.segmenter.open_park(car_id, &snapshot)?;
        }

        let current = machine.current_state()?;
        let is_charging = data
            .charge_state
            .as_ref()
            .is_some_and(|charge| charge.charging_state == "Charging");

        if is_charging && current != VehicleStateKind::Charging {
            if machine.trigger_if_legal(VehicleEvent::StartCharging, now)? {
                self.segmenter.open_charge(car_id, &machine.snapshot()?);
                machine.mark_active(now)?;
            }
        } else if !is_charging
            && current == VehicleStateKind::Charging
            && machine.trigger_if_legal(VehicleEvent::StopCharging, now)?
        {
            self.segmenter.close_charge(car_id, &machine.snapshot()?);
        }

        // Software installs hold the machine in `updating` so the sleep
        // gate never suspends mid-install.
        let current = machine.current_state()?;
        let is_installing = data
            .body_state
            .as_ref()
            .and_then(|body| body.software_update.as_ref())
            .is_some_and(|update| update.status == "installing");
        if is_installing && current == VehicleStateKind::Online {
            machine.trigger_if_legal(VehicleEvent::StartUpdating, now)?;
        } else if !is_installing && current == VehicleStateKind::Updating {
            machine.trigger_if_legal(VehicleEvent::StopUpdating, now)?;
        }
        Ok(())
    }

    fn run_sleep_gate(&self, car_id: i64, machine: &StateMachine) -> Result<(), IngestError> {
        let now = self.clock.now();
        let snapshot = machine.snapshot()?;

        match sleep::evaluate(&snapshot, self.require_not_unlocked) {
            Some(reason) => {
                machine.mark_active(now)?;
                machine.update(|state| {
                    state.can_sleep = false;
                    state.sleep_block_reason = reason.as_str().to_string();
                })?;
                let idle = now.signed_duration_since(snapshot.last_active);
                if idle >= self.suspend_after_idle {
                    tracing::info!(car_id, reason = %reason, "cannot suspend logging");
                }
            }
            None => {
                machine.update(|state| {
                    state.can_sleep = true;
                    state.sleep_block_reason.clear();
                })?;
                let idle = now.signed_duration_since(snapshot.last_active);
                if idle >= self.suspend_after_idle
                    && machine.trigger_if_legal(VehicleEvent::Suspend, now)?
                {
                    tracing::info!(
                        car_id,
                        idle_min = idle.num_minutes(),
                        "suspending logging to allow vehicle sleep"
                    );
                    self.scheduler
                        .set_interval(car_id, self.scheduler.config().suspend_interval)?;
                }
            }
        }
        Ok(())
    }

    // ---- stream ingress ----

    /// Push-tuple ingress. Tuple fields land in the snapshot first so a
    /// transition opened by this very tuple sees them.
    pub fn ingest_stream(&self, car_id: i64, frame: &StreamFrame) -> Result<(), IngestError> {
        let Some(machine) = self.machines.get(car_id)? else {
            tracing::warn!(car_id, "stream tuple for unknown vehicle");
            return Ok(());
        };
        let now = self.clock.now();

        merge_stream_fields(&machine, frame)?;

        let current = machine.current_state()?;

        if frame.is_driving_shift() && current != VehicleStateKind::Driving {
            tracing::info!(
                car_id,
                shift_state = %frame.shift_state,
                from = %current,
                "driving detected on stream"
            );
            machine.mark_active(now)?;
            self.wake_through_stream(car_id, &machine)?;
            if machine.can(VehicleEvent::StartDriving)? {
                self.segmenter.close_park(car_id, &machine.snapshot()?)?;
                if machine.trigger_if_legal(VehicleEvent::StartDriving, now)? {
                    self.segmenter.open_drive(car_id, &machine.snapshot()?);
                }
            }
            self.scheduler.request_immediate(car_id)?;
        } else if frame.power_kw < 0 && current != VehicleStateKind::Charging {
            tracing::info!(
                car_id,
                power = frame.power_kw,
                from = %current,
                "charging detected on stream"
            );
            machine.mark_active(now)?;
            self.wake_through_stream(car_id, &machine)?;
            if machine.trigger_if_legal(VehicleEvent::StartCharging, now)? {
                self.segmenter.open_charge(car_id, &machine.snapshot()?);
            }
            self.scheduler.request_immediate(car_id)?;
        } else if frame.power_kw > 0 {
            machine.mark_active(now)?;
            if machine.current_state()? == VehicleStateKind::Suspended {
                machine.trigger_if_legal(VehicleEvent::Resume, now)?;
            }
        }

        // High-frequency trajectory recording straight off the push link.
        if machine.current_state()? == VehicleStateKind::Driving && frame.has_fix() {
            let drive_id = self.segmenter.active_drive_id(car_id);
            let position =
                position_from_frame(car_id, drive_id, frame, &machine.snapshot()?, now);
            if let Err(err) = self.positions.create(&position) {
                tracing::error!(car_id, error = %err, "failed to persist stream position");
            }
        }

        self.bus.publish(machine.snapshot()?)?;
        Ok(())
    }

    /// Rules 1 and 2 can fire from deep states: wake first, resume second,
    /// then the caller starts the session.
    fn wake_through_stream(
        &self,
        car_id: i64,
        machine: &StateMachine,
    ) -> Result<(), IngestError> {
        let now = self.clock.now();
        match machine.current_state()? {
            VehicleStateKind::Asleep | VehicleStateKind::Offline => {
                if machine.trigger_if_legal(VehicleEvent::WakeUp, now)? {
                    self.scheduler.reset_backoff(car_id)?;
                    self.notify_wake(car_id)?;
                }
            }
            VehicleStateKind::Suspended => {
                machine.trigger_if_legal(VehicleEvent::Resume, now)?;
            }
            _ => {}
        }
        Ok(())
    }
}

/// Field merge for a full poll bundle. Aggregate booleans are derived from
/// the per-door and per-window flags here, at the boundary.
fn merge_poll_fields(machine: &StateMachine, data: &VehicleData) -> Result<(), StateError> {
    machine.update(|state| {
        if let Some(charge) = &data.charge_state {
            state.battery_level = charge.battery_level;
            state.usable_battery_level = charge.usable_battery_level;
            state.range_km = miles_to_km(charge.est_battery_range);
            state.ideal_range_km = miles_to_km(charge.ideal_battery_range);
            state.charging_state = charge.charging_state.clone();
            state.plugged_in = charge.charging_state != "Disconnected";
            state.charger_power = charge.charger_power;
            state.charger_voltage = charge.charger_voltage;
            state.charger_current = charge.charger_actual_current;
            state.charge_limit_soc = charge.charge_limit_soc;
            state.charge_energy_added_kwh = charge.charge_energy_added;
            state.time_to_full_charge_hours = charge.time_to_full_charge;
        }
        if let Some(drive) = &data.drive_state {
            state.latitude = drive.latitude;
            state.longitude = drive.longitude;
            state.heading = drive.heading;
            state.speed_kmh = drive.speed.map(mph_to_kmh);
            state.power_kw = drive.power;
            state.shift_state = drive.shift_state.clone().unwrap_or_default();
        }
        if let Some(climate) = &data.climate_state {
            state.inside_temp = Some(climate.inside_temp);
            state.outside_temp = Some(climate.outside_temp);
            state.is_climate_on = climate.is_climate_on;
            state.is_preconditioning = climate.is_preconditioning;
        }
        if let Some(body) = &data.body_state {
            state.odometer_km = miles_to_km(body.odometer);
            state.locked = body.locked;
            state.sentry_mode = body.sentry_mode;
            state.is_user_present = body.is_user_present;
            state.car_version = body.car_version.clone();
            state.doors_open = body.any_door_open();
            state.windows_open = body.any_window_open();
            state.frunk_open = body.ft != 0;
            state.trunk_open = body.rt != 0;
            state.tpms_pressure_fl = body.tpms_pressure_fl;
            state.tpms_pressure_fr = body.tpms_pressure_fr;
            state.tpms_pressure_rl = body.tpms_pressure_rl;
            state.tpms_pressure_rr = body.tpms_pressure_rr;
            match &body.software_update {
                Some(update) => {
                    state.software_update_status = update.status.clone();
                    state.software_update_download_perc = update.download_perc;
                }
                None => {
                    state.software_update_status.clear();
                    state.software_update_download_perc = 0;
                }
            }
        }
    })
}

/// Field merge for a stream tuple; zero-valued fields keep the cached
/// values instead of clobbering them.
fn merge_stream_fields(machine: &StateMachine, frame: &StreamFrame) -> Result<(), StateError> {
    machine.update(|state| {
        if frame.soc > 0 {
            state.battery_level = frame.soc;
        }
        if frame.has_fix() {
            state.latitude = frame.est_lat;
            state.longitude = frame.est_lng;
        }
        if let Some(speed) = frame.speed_mph {
            state.speed_kmh = Some(mph_to_kmh(speed as f64));
        }
        state.power_kw = frame.power_kw;
        state.shift_state = frame.shift_state.clone();
        if frame.heading > 0 {
            state.heading = frame.heading;
        }
        if frame.odometer_miles > 0.0 {
            state.odometer_km = miles_to_km(frame.odometer_miles);
        }
        if frame.range_miles > 0 {
            state.range_km = miles_to_km(frame.range_miles as f64);
        }
        if frame.elevation_m > 0 {
            state.elevation_m = Some(frame.elevation_m);
        }
    })
}

fn position_from_poll(
    car_id: i64,
    drive_id: Option<i64>,
    snapshot: &VehicleState,
    now: chrono::DateTime<chrono::Utc>,
) -> Position {
    Position {
        car_id,
        drive_id,
        latitude: snapshot.latitude,
        longitude: snapshot.longitude,
        heading: snapshot.heading,
        speed_kmh: snapshot.speed_kmh,
        power_kw: snapshot.power_kw,
        odometer_km: snapshot.odometer_km,
        battery_level: snapshot.battery_level,
        range_km: snapshot.range_km,
        inside_temp: snapshot.inside_temp,
        outside_temp: snapshot.outside_temp,
        elevation_m: snapshot.elevation_m,
        tpms_pressure_fl: snapshot.tpms_pressure_fl,
        tpms_pressure_fr: snapshot.tpms_pressure_fr,
        tpms_pressure_rl: snapshot.tpms_pressure_rl,
        tpms_pressure_rr: snapshot.tpms_pressure_rr,
        recorded_at: now,
        ..Position::default()
    }
}

/// Stream tuples are sparse; missing fields are filled from the snapshot
/// so trajectory samples never jump to zero.
fn position_from_frame(
    car_id: i64,
    drive_id: Option<i64>,
    frame: &StreamFrame,
    snapshot: &VehicleState,
    now: chrono::DateTime<chrono::Utc>,
) -> Position {
    let battery_level = if frame.soc > 0 {
        frame.soc
    } else {
        snapshot.battery_level
    };
    let range_km = if frame.range_miles > 0 {
        miles_to_km(frame.range_miles as f64)
    } else {
        snapshot.range_km
    };
    let odometer_km = if frame.odometer_miles > 0.0 {
        miles_to_km(frame.odometer_miles)
    } else {
        snapshot.odometer_km
    };
    let heading = if frame.heading > 0 {
        frame.heading
    } else {
        snapshot.heading
    };

    Position {
        car_id,
        drive_id,
        latitude: frame.est_lat,
        longitude: frame.est_lng,
        heading,
        speed_kmh: frame.speed_mph.map(|speed| mph_to_kmh(speed as f64)),
        power_kw: frame.power_kw,
        odometer_km,
        battery_level,
        range_km,
        inside_temp: snapshot.inside_temp,
        outside_temp: snapshot.outside_temp,
        elevation_m: if frame.elevation_m > 0 {
            Some(frame.elevation_m)
        } else {
            snapshot.elevation_m
        },
        recorded_at: now,
        ..Position::default()
    }
}
