use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Duration, Utc};
use thiserror::Error;

use crate::adapters::geocoder::Geocoder;
use crate::app::services::{
    ChargeRepository, DriveRepository, ParkingRepository, PositionRepository,
};
use crate::domain::clock::Clock;
use crate::domain::models::{
    Charge, ChargingProcess, Drive, Parking, ParkingEvent, ParkingEventKind, ParkingFlags,
};
use crate::domain::state::VehicleState;

/// Accumulated side-state for one open parking session. Cleared on both
/// open and close so nothing leaks across parking cycles.
struct ParkAccumulator {
    climate_used: Duration,
    sentry_used: Duration,
    last_check: DateTime<Utc>,
    temp_samples: Vec<(Option<f64>, Option<f64>)>,
    prev_flags: ParkingFlags,
}

/// Hard failures of the segmenter itself. Repository problems stay
/// best-effort (logged, session persisted without the detail); a poisoned
/// accumulator lock is propagated so the ingress layer can surface it.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum SegmenterError {
    #[error("parking accumulator lock poisoned")]
    AccumulatorLockPoisoned,
}

/// Opens and closes drive/charge/park records on machine transitions and
/// keeps the open rows' live fields fresh. The only writer to session rows.
pub struct SessionSegmenter {
    drives: Arc<dyn DriveRepository>,
    positions: Arc<dyn PositionRepository>,
    charges: Arc<dyn ChargeRepository>,
    parkings: Arc<dyn ParkingRepository>,
    geocoder: Option<Arc<Geocoder>>,
    clock: Arc<dyn Clock>,
    nominal_capacity_kwh: f64,
    accumulators: Mutex<HashMap<i64, ParkAccumulator>>,
}

fn flags_from_snapshot(snapshot: &VehicleState) -> ParkingFlags {
    ParkingFlags {
        locked: snapshot.locked,
        sentry_mode: snapshot.sentry_mode,
        doors_open: snapshot.doors_open,
        windows_open: snapshot.windows_open,
        frunk_open: snapshot.frunk_open,
        trunk_open: snapshot.trunk_open,
        climate_on: snapshot.is_climate_on,
        user_present: snapshot.is_user_present,
    }
}

impl SessionSegmenter {
    pub fn new(
        drives: Arc<dyn DriveRepository>,
        positions: Arc<dyn PositionRepository>,
        charges: Arc<dyn ChargeRepository>,
        parkings: Arc<dyn ParkingRepository>,
        geocoder: Option<Arc<Geocoder>>,
        clock: Arc<dyn Clock>,
        nominal_capacity_kwh: f64,
    ) -> Self {
        Self {
            drives,
            positions,
            charges,
            parkings,
            geocoder,
            clock,
            nominal_capacity_kwh,
            accumulators: Mutex::new(HashMap::new()),
        }
    }

    // ---- drives ----

    /// Opens a drive from the snapshot. The start address is resolved on a
    /// detached thread so the drive record never waits on the geocoder.
    pub fn open_drive(&self, car_id: i64, snapshot: &VehicleState) -> Option<i64> {
        let now = self.clock.now();
        let drive = Drive {
            car_id,
            start_time: now,
            start_battery_level: snapshot.battery_level,
            start_range_km: snapshot.range_km,
            start_odometer_km: snapshot.odometer_km,
            start_latitude: Some(snapshot.latitude),
            start_longitude: Some(snapshot.longitude),
            ..Drive::default()
        };

        let drive_id = match self.drives.create(&drive) {
            Ok(drive_id) => drive_id,
            Err(err) => {
                tracing::error!(car_id, error = %err, "failed to create drive");
                return None;
            }
        };
        tracing::info!(
            car_id,
            drive_id,
            start_odometer_km = snapshot.odometer_km,
            "drive started"
        );

        if let Some(geocoder) = self.geocoder.clone() {
            let drives = Arc::clone(&self.drives);
            let (lat, lng) = (snapshot.latitude, snapshot.longitude);
            std::thread::spawn(move || match geocoder.reverse_geocode(lat, lng) {
                Ok(address) => {
                    if let Err(err) = drives.set_start_address(drive_id, &address) {
                        tracing::warn!(drive_id, error = %err, "failed to store start address");
                    }
                }
                Err(err) => {
                    tracing::warn!(drive_id, lat, lng, error = %err, "start geocode failed");
                }
            });
        }

        Some(drive_id)
    }

    pub fn close_drive(&self, car_id: i64, snapshot: &VehicleState) {
        let mut drive = match self.drives.get_active(car_id) {
            Ok(Some(drive)) => drive,
            Ok(None) => {
                tracing::warn!(car_id, "no active drive to close");
                return;
            }
            Err(err) => {
                tracing::error!(car_id, error = %err, "failed to load active drive");
                return;
            }
        };

        let now = self.clock.now();
        drive.end_time = Some(now);
        drive.duration_min =
            now.signed_duration_since(drive.start_time).num_milliseconds() as f64 / 60_000.0;
        drive.end_battery_level = Some(snapshot.battery_level);
        drive.end_range_km = Some(snapshot.range_km);
        drive.end_odometer_km = Some(snapshot.odometer_km);
        drive.end_latitude = Some(snapshot.latitude);
        drive.end_longitude = Some(snapshot.longitude);

        if drive.start_odometer_km > 0.0 && snapshot.odometer_km > drive.start_odometer_km {
            drive.distance_km = snapshot.odometer_km - drive.start_odometer_km;
        }

        match self.positions.get_drive_stats(drive.id) {
            Ok(stats) => {
                drive.speed_max = stats.speed_max;
                drive.power_max = stats.power_max;
                drive.power_min = stats.power_min;
                drive.inside_temp_avg = stats.inside_temp_avg;
                drive.outside_temp_avg = stats.outside_temp_avg;
                drive.energy_used_kwh = Some(stats.energy_used_kwh);
                drive.energy_regen_kwh = Some(stats.energy_regen_kwh);
            }
            Err(err) => {
                tracing::warn!(drive_id = drive.id, error = %err, "drive stats unavailable");
            }
        }

        if let Some(geocoder) = &self.geocoder {
            match geocoder.reverse_geocode(snapshot.latitude, snapshot.longitude) {
                Ok(address) => drive.end_address = Some(address),
                Err(err) => {
                    tracing::warn!(drive_id = drive.id, error = %err, "end geocode failed");
                }
            }
            // The start geocode was dispatched in the background at open;
            // retry synchronously if it never landed.
            if drive.start_address.is_none()
                && let (Some(lat), Some(lng)) = (drive.start_latitude, drive.start_longitude)
            {
                match geocoder.reverse_geocode(lat, lng) {
                    Ok(address) => drive.start_address = Some(address),
                    Err(err) => {
                        tracing::warn!(drive_id = drive.id, error = %err, "start geocode retry failed");
                    }
                }
            }
        }

        match self.drives.complete(&drive) {
            Ok(true) => {
                tracing::info!(
                    car_id,
                    drive_id = drive.id,
                    distance_km = drive.distance_km,
                    duration_min = drive.duration_min,
                    "drive completed"
                );
            }
            Ok(false) => {
                tracing::warn!(drive_id = drive.id, "drive was already closed, skipping write");
            }
            Err(err) => {
                tracing::error!(drive_id = drive.id, error = %err, "failed to complete drive");
            }
        }
    }

    pub fn active_drive_id(&self, car_id: i64) -> Option<i64> {
        self.drives
            .get_active(car_id)
            .ok()
            .flatten()
            .map(|drive| drive.id)
    }

    // ---- charging ----

    pub fn open_charge(&self, car_id: i64, snapshot: &VehicleState) -> Option<i64> {
        let now = self.clock.now();
        let mut process = ChargingProcess {
            car_id,
            start_time: now,
            start_battery_level: snapshot.battery_level,
            start_range_km: snapshot.range_km,
            ..ChargingProcess::default()
        };

        if let Some(geocoder) = &self.geocoder {
            match geocoder.reverse_geocode(snapshot.latitude, snapshot.longitude) {
                Ok(address) => process.address = Some(address),
                Err(err) => {
                    tracing::warn!(car_id, error = %err, "charge geocode failed");
                }
            }
        }

        match self.charges.create_process(&process) {
            Ok(process_id) => {
                tracing::info!(car_id, process_id, "charging started");
                Some(process_id)
            }
            Err(err) => {
                tracing::error!(car_id, error = %err, "failed to create charging process");
                None
            }
        }
    }

    /// Per-poll refresh while charging: live end-side fields, running
    /// maxima and a charge sample row. The energy counter keeps the max
    /// ever observed; the vendor sometimes resets it mid-session.
    pub fn update_charge(&self, car_id: i64, snapshot: &VehicleState) {
        let mut process = match self.charges.get_active_process(car_id) {
            Ok(Some(process)) => process,
            Ok(None) => return,
            Err(err) => {
                tracing::error!(car_id, error = %err, "failed to load active charging process");
                return;
            }
        };

        let now = self.clock.now();
        process.end_battery_level = Some(snapshot.battery_level);
        process.end_range_km = Some(snapshot.range_km);
        process.charge_energy_added_kwh = process
            .charge_energy_added_kwh
            .max(snapshot.charge_energy_added_kwh);
        if process.charger_power_max.unwrap_or(i64::MIN) < snapshot.charger_power {
            process.charger_power_max = Some(snapshot.charger_power);
        }
        process.duration_min =
            now.signed_duration_since(process.start_time).num_milliseconds() as f64 / 60_000.0;
        process.outside_temp_avg = snapshot.outside_temp;

        if let Err(err) = self.charges.update_snapshot(&process) {
            tracing::warn!(process_id = process.id, error = %err, "failed to refresh charging snapshot");
        }

        let sample = Charge {
            charging_process_id: process.id,
            battery_level: snapshot.battery_level,
            usable_battery_level: snapshot.usable_battery_level,
            range_km: snapshot.range_km,
            charger_power: snapshot.charger_power,
            charger_voltage: snapshot.charger_voltage,
            charger_current: snapshot.charger_current,
            charge_energy_added_kwh: snapshot.charge_energy_added_kwh,
            outside_temp: snapshot.outside_temp,
            recorded_at: now,
            ..Charge::default()
        };
        if let Err(err) = self.charges.create_charge_sample(&sample) {
            tracing::warn!(process_id = process.id, error = %err, "failed to record charge sample");
        }
    }

    pub fn close_charge(&self, car_id: i64, snapshot: &VehicleState) {
        let mut process = match self.charges.get_active_process(car_id) {
            Ok(Some(process)) => process,
            Ok(None) => {
                tracing::warn!(car_id, "no active charging process to close");
                return;
            }
            Err(err) => {
                tracing::error!(car_id, error = %err, "failed to load active charging process");
                return;
            }
        };

        let now = self.clock.now();
        process.end_time = Some(now);
        process.duration_min =
            now.signed_duration_since(process.start_time).num_milliseconds() as f64 / 60_000.0;
        process.end_battery_level = Some(snapshot.battery_level);
        process.end_range_km = Some(snapshot.range_km);
        process.charge_energy_added_kwh = process
            .charge_energy_added_kwh
            .max(snapshot.charge_energy_added_kwh);

        match self.charges.complete_process(&process) {
            Ok(true) => {
                tracing::info!(
                    car_id,
                    process_id = process.id,
                    energy_added_kwh = process.charge_energy_added_kwh,
                    "charging completed"
                );
            }
            Ok(false) => {
                tracing::warn!(
                    process_id = process.id,
                    "charging process was already closed, skipping write"
                );
            }
            Err(err) => {
                tracing::error!(process_id = process.id, error = %err, "failed to complete charging process");
            }
        }
    }

    // ---- parking ----

    fn accumulators_guard(
        &self,
    ) -> Result<MutexGuard<'_, HashMap<i64, ParkAccumulator>>, SegmenterError> {
        self.accumulators
            .lock()
            .map_err(|_| SegmenterError::AccumulatorLockPoisoned)
    }

    pub fn open_park(
        &self,
        car_id: i64,
        snapshot: &VehicleState,
    ) -> Result<Option<i64>, SegmenterError> {
        let now = self.clock.now();

        // At most one open parking per car; anything left over is closed
        // before the new one starts.
        match self.parkings.force_close_open(car_id, now) {
            Ok(0) => {}
            Ok(closed) => {
                tracing::warn!(car_id, closed, "force-closed stale open parkings");
            }
            Err(err) => {
                tracing::error!(car_id, error = %err, "failed to force-close open parkings");
            }
        }

        let flags = flags_from_snapshot(snapshot);
        let mut parking = Parking {
            car_id,
            start_time: now,
            latitude: snapshot.latitude,
            longitude: snapshot.longitude,
            start_battery_level: snapshot.battery_level,
            start_range_km: snapshot.range_km,
            start_odometer_km: snapshot.odometer_km,
            start_inside_temp: snapshot.inside_temp,
            start_outside_temp: snapshot.outside_temp,
            start_flags: flags,
            start_tpms_pressure_fl: snapshot.tpms_pressure_fl,
            start_tpms_pressure_fr: snapshot.tpms_pressure_fr,
            start_tpms_pressure_rl: snapshot.tpms_pressure_rl,
            start_tpms_pressure_rr: snapshot.tpms_pressure_rr,
            car_version: snapshot.car_version.clone(),
            ..Parking::default()
        };

        if let Some(geocoder) = &self.geocoder {
            match geocoder.reverse_geocode(snapshot.latitude, snapshot.longitude) {
                Ok(address) => parking.address = Some(address),
                Err(err) => {
                    tracing::warn!(car_id, error = %err, "parking geocode failed");
                }
            }
        }

        let parking_id = match self.parkings.create(&parking) {
            Ok(parking_id) => parking_id,
            Err(err) => {
                tracing::error!(car_id, error = %err, "failed to create parking");
                return Ok(None);
            }
        };
        tracing::info!(car_id, parking_id, "parking started");

        self.accumulators_guard()?.insert(
            car_id,
            ParkAccumulator {
                climate_used: Duration::zero(),
                sentry_used: Duration::zero(),
                last_check: now,
                temp_samples: vec![(snapshot.inside_temp, snapshot.outside_temp)],
                prev_flags: flags,
            },
        );

        Ok(Some(parking_id))
    }

    /// Per-poll refresh while parked: usage accumulators, temperature
    /// samples, flag-edge events and the live row snapshot.
    pub fn update_park(&self, car_id: i64, snapshot: &VehicleState) -> Result<(), SegmenterError> {
        let mut parking = match self.parkings.get_active(car_id) {
            Ok(Some(parking)) => parking,
            Ok(None) => return Ok(()),
            Err(err) => {
                tracing::error!(car_id, error = %err, "failed to load active parking");
                return Ok(());
            }
        };

        let now = self.clock.now();
        let flags = flags_from_snapshot(snapshot);

        let (climate_min, sentry_min) = {
            let mut accumulators = self.accumulators_guard()?;
            let accumulator = accumulators.entry(car_id).or_insert(ParkAccumulator {
                climate_used: Duration::zero(),
                sentry_used: Duration::zero(),
                last_check: now,
                temp_samples: Vec::new(),
                prev_flags: flags,
            });

            let edges = detect_edges(accumulator.prev_flags, flags);
            for kind in &edges {
                self.record_event(parking.id, *kind, now);
            }
            accumulator.prev_flags = flags;

            let elapsed = now.signed_duration_since(accumulator.last_check);
            accumulator.last_check = now;
            if elapsed > Duration::zero() {
                if snapshot.is_climate_on {
                    accumulator.climate_used += elapsed;
                }
                if snapshot.sentry_mode {
                    accumulator.sentry_used += elapsed;
                }
            }

            accumulator
                .temp_samples
                .push((snapshot.inside_temp, snapshot.outside_temp));

            (
                accumulator.climate_used.num_milliseconds() as f64 / 60_000.0,
                accumulator.sentry_used.num_milliseconds() as f64 / 60_000.0,
            )
        };

        parking.end_battery_level = Some(snapshot.battery_level);
        parking.end_range_km = Some(snapshot.range_km);
        parking.end_inside_temp = snapshot.inside_temp;
        parking.end_outside_temp = snapshot.outside_temp;
        parking.climate_used_min = Some(climate_min);
        parking.sentry_mode_used_min = Some(sentry_min);
        parking.end_flags = Some(flags);

        if let Err(err) = self.parkings.update_snapshot(&parking) {
            tracing::warn!(parking_id = parking.id, error = %err, "failed to refresh parking snapshot");
        }
        Ok(())
    }

    pub fn close_park(&self, car_id: i64, snapshot: &VehicleState) -> Result<(), SegmenterError> {
        let mut parking = match self.parkings.get_active(car_id) {
            Ok(Some(parking)) => parking,
            Ok(None) => {
                tracing::debug!(car_id, "no active parking to close");
                self.accumulators_guard()?.remove(&car_id);
                return Ok(());
            }
            Err(err) => {
                tracing::error!(car_id, error = %err, "failed to load active parking");
                return Ok(());
            }
        };

        let now = self.clock.now();
        parking.end_time = Some(now);
        parking.duration_min =
            now.signed_duration_since(parking.start_time).num_milliseconds() as f64 / 60_000.0;
        parking.end_battery_level = Some(snapshot.battery_level);
        parking.end_range_km = Some(snapshot.range_km);
        parking.end_odometer_km = Some(snapshot.odometer_km);
        parking.end_inside_temp = snapshot.inside_temp;
        parking.end_outside_temp = snapshot.outside_temp;
        parking.end_flags = Some(flags_from_snapshot(snapshot));
        parking.end_tpms_pressure_fl = snapshot.tpms_pressure_fl;
        parking.end_tpms_pressure_fr = snapshot.tpms_pressure_fr;
        parking.end_tpms_pressure_rl = snapshot.tpms_pressure_rl;
        parking.end_tpms_pressure_rr = snapshot.tpms_pressure_rr;

        // Vampire drain from the battery-level delta against the nominal
        // pack capacity; clamped, a level gain reads as zero.
        let delta_level = parking.start_battery_level - snapshot.battery_level;
        parking.energy_used_kwh =
            Some((delta_level as f64 / 100.0 * self.nominal_capacity_kwh).max(0.0));

        if let Some(accumulator) = self.accumulators_guard()?.remove(&car_id) {
            let inside: Vec<f64> = accumulator
                .temp_samples
                .iter()
                .filter_map(|(inside, _)| *inside)
                .collect();
            let outside: Vec<f64> = accumulator
                .temp_samples
                .iter()
                .filter_map(|(_, outside)| *outside)
                .collect();
            if !inside.is_empty() {
                parking.inside_temp_avg = Some(inside.iter().sum::<f64>() / inside.len() as f64);
            }
            if !outside.is_empty() {
                parking.outside_temp_avg = Some(outside.iter().sum::<f64>() / outside.len() as f64);
            }
            parking.climate_used_min =
                Some(accumulator.climate_used.num_milliseconds() as f64 / 60_000.0);
            parking.sentry_mode_used_min =
                Some(accumulator.sentry_used.num_milliseconds() as f64 / 60_000.0);
        }

        match self.parkings.complete(&parking) {
            Ok(true) => {
                tracing::info!(
                    car_id,
                    parking_id = parking.id,
                    duration_min = parking.duration_min,
                    energy_used_kwh = parking.energy_used_kwh,
                    "parking completed"
                );
            }
            Ok(false) => {
                tracing::warn!(
                    parking_id = parking.id,
                    "parking was already closed, skipping write"
                );
            }
            Err(err) => {
                tracing::error!(parking_id = parking.id, error = %err, "failed to complete parking");
            }
        }
        Ok(())
    }

    fn record_event(&self, parking_id: i64, kind: ParkingEventKind, now: DateTime<Utc>) {
        let event = ParkingEvent {
            id: 0,
            parking_id,
            kind,
            event_time: now,
            details: None,
        };
        if let Err(err) = self.parkings.create_event(&event) {
            tracing::error!(parking_id, kind = kind.as_str(), error = %err, "failed to record parking event");
        } else {
            tracing::info!(parking_id, kind = kind.as_str(), "parking event recorded");
        }
    }
}

/// One event per rising or falling edge of each tracked flag, in a fixed
/// evaluation order.
fn detect_edges(prev: ParkingFlags, curr: ParkingFlags) -> Vec<ParkingEventKind> {
    let mut events = Vec::new();

    if !prev.doors_open && curr.doors_open {
        events.push(ParkingEventKind::DoorsOpened);
    } else if prev.doors_open && !curr.doors_open {
        events.push(ParkingEventKind::DoorsClosed);
    }

    if !prev.windows_open && curr.windows_open {
        events.push(ParkingEventKind::WindowsOpened);
    } else if prev.windows_open && !curr.windows_open {
        events.push(ParkingEventKind::WindowsClosed);
    }

    if !prev.trunk_open && curr.trunk_open {
        events.push(ParkingEventKind::TrunkOpened);
    } else if prev.trunk_open && !curr.trunk_open {
        events.push(ParkingEventKind::TrunkClosed);
    }

    if !prev.frunk_open && curr.frunk_open {
        events.push(ParkingEventKind::FrunkOpened);
    } else if prev.frunk_open && !curr.frunk_open {
        events.push(ParkingEventKind::FrunkClosed);
    }

    if prev.locked && !curr.locked {
        events.push(ParkingEventKind::Unlocked);
    } else if !prev.locked && curr.locked {
        events.push(ParkingEventKind::Locked);
    }

    if !prev.sentry_mode && curr.sentry_mode {
        events.push(ParkingEventKind::SentryEnabled);
    } else if prev.sentry_mode && !curr.sentry_mode {
        events.push(ParkingEventKind::SentryDisabled);
    }

    if !prev.climate_on && curr.climate_on {
        events.push(ParkingEventKind::ClimateOn);
    } else if prev.climate_on && !curr.climate_on {
        events.push(ParkingEventKind::ClimateOff);
    }

    if !prev.user_present && curr.user_present {
        events.push(ParkingEventKind::UserPresent);
    } else if prev.user_present && !curr.user_present {
        events.push(ParkingEventKind::UserLeft);
    }

    events
}
