use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use thiserror::Error;

use crate::adapters::cloud::{CloudApi, CloudError};
use crate::adapters::geocoder::Geocoder;
use crate::adapters::stream::{StreamClient, StreamConfig, StreamHandler};
use crate::app::services::{self, SqliteRepositories};
use crate::core::event_bus::{BusError, EventBus, InitData, Subscription};
use crate::core::poller::PollLoop;
use crate::core::reconciler::Reconciler;
use crate::core::scheduler::{Scheduler, SchedulerConfig, SchedulerError};
use crate::core::segmenter::SessionSegmenter;
use crate::domain::clock::Clock;
use crate::domain::state::{
    StateError, StateManager, VehicleEvent, VehicleState, VehicleStateKind,
};
use crate::domain::stream_frame::StreamFrame;

#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub scheduler: SchedulerConfig,
    pub suspend_after_idle: chrono::Duration,
    pub require_not_unlocked: bool,
    pub nominal_capacity_kwh: f64,
    pub use_streaming_api: bool,
    pub stream: StreamConfig,
}

#[derive(Debug, Error)]
pub enum VehicleServiceError {
    #[error("upstream request failed: {0}")]
    Cloud(#[from] CloudError),
    #[error("repository operation failed: {0}")]
    Repository(#[from] services::ServiceError),
    #[error(transparent)]
    State(#[from] StateError),
    #[error(transparent)]
    Scheduler(#[from] SchedulerError),
    #[error(transparent)]
    Bus(#[from] BusError),
    #[error("service lock poisoned")]
    LockPoisoned,
    #[error("failed to spawn worker thread: {0}")]
    Spawn(String),
}

/// Typed refusals for the manual control surface.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum ControlError {
    #[error("vehicle not found")]
    UnknownVehicle,
    #[error("cannot_suspend:{0}")]
    CannotSuspend(VehicleStateKind),
    #[error("vehicle state unavailable")]
    Internal,
}

impl From<StateError> for ControlError {
    fn from(_: StateError) -> Self {
        Self::Internal
    }
}

impl From<SchedulerError> for ControlError {
    fn from(_: SchedulerError) -> Self {
        Self::Internal
    }
}

/// Routes stream callbacks into the reconciler. Holds no reference back to
/// the service, so the stream clients never form a cycle.
struct StreamIngest {
    reconciler: Arc<Reconciler>,
    car_ids_by_vehicle: Arc<Mutex<HashMap<i64, i64>>>,
}

impl StreamHandler for StreamIngest {
    fn on_frame(&self, vehicle_id: i64, frame: StreamFrame) {
        let Ok(index) = self.car_ids_by_vehicle.lock() else {
            tracing::error!(vehicle_id, "vehicle index lock poisoned, dropping frame");
            return;
        };
        let car_id = index.get(&vehicle_id).copied();
        drop(index);

        match car_id {
            Some(car_id) => {
                if let Err(err) = self.reconciler.ingest_stream(car_id, &frame) {
                    tracing::error!(car_id, error = %err, "stream ingest failed");
                }
            }
            None => {
                tracing::warn!(vehicle_id, "stream frame for unmapped vehicle");
            }
        }
    }

    fn on_connect(&self, vehicle_id: i64) {
        tracing::info!(vehicle_id, "stream connected");
    }

    fn on_disconnect(&self, vehicle_id: i64, error: Option<String>) {
        match error {
            Some(error) => tracing::warn!(vehicle_id, %error, "stream disconnected"),
            None => tracing::debug!(vehicle_id, "stream disconnected"),
        }
    }

    fn on_vehicle_offline(&self, vehicle_id: i64) {
        tracing::info!(
            vehicle_id,
            "vehicle offline on stream; waiting for the poll loop to observe it online"
        );
    }
}

/// Process-scoped container that owns every core component and wires them
/// together. Components hold handles to each other; the container is the
/// single owner.
pub struct VehicleService {
    config: ServiceConfig,
    clock: Arc<dyn Clock>,
    cloud: Arc<dyn CloudApi>,
    repos: SqliteRepositories,
    machines: Arc<StateManager>,
    scheduler: Arc<Scheduler>,
    bus: Arc<EventBus>,
    reconciler: Arc<Reconciler>,
    poller: Arc<PollLoop>,
    stop: Arc<AtomicBool>,
    poller_handle: Mutex<Option<JoinHandle<()>>>,
    streams: Arc<Mutex<HashMap<i64, Arc<StreamClient>>>>,
    car_ids_by_vehicle: Arc<Mutex<HashMap<i64, i64>>>,
}

/// Reverse lookup in the vehicle-id index; the closures below run without
/// a service handle.
fn vehicle_id_for_car(
    index: &Mutex<HashMap<i64, i64>>,
    car_id: i64,
) -> Result<Option<i64>, VehicleServiceError> {
    let index = index.lock().map_err(|_| VehicleServiceError::LockPoisoned)?;
    Ok(index
        .iter()
        .find(|(_, mapped)| **mapped == car_id)
        .map(|(vehicle_id, _)| *vehicle_id))
}

impl VehicleService {
    pub fn new(
        config: ServiceConfig,
        clock: Arc<dyn Clock>,
        cloud: Arc<dyn CloudApi>,
        repos: SqliteRepositories,
        geocoder: Option<Arc<Geocoder>>,
    ) -> Result<Arc<Self>, VehicleServiceError> {
        let machines = Arc::new(StateManager::new(Some(Arc::new(
            |car_id, from, to| {
                tracing::info!(car_id, from = %from, to = %to, "vehicle state changed");
            },
        ))));
        let scheduler = Arc::new(Scheduler::new(config.scheduler.clone()));
        let bus = Arc::new(EventBus::new());

        let segmenter = Arc::new(SessionSegmenter::new(
            Arc::new(repos.clone()),
            Arc::new(repos.clone()),
            Arc::new(repos.clone()),
            Arc::new(repos.clone()),
            geocoder,
            Arc::clone(&clock),
            config.nominal_capacity_kwh,
        ));
        let reconciler = Arc::new(Reconciler::new(
            Arc::clone(&machines),
            Arc::clone(&scheduler),
            segmenter,
            Arc::clone(&bus),
            Arc::new(repos.clone()),
            Arc::new(repos.clone()),
            Arc::clone(&clock),
            config.require_not_unlocked,
            config.suspend_after_idle,
        ));

        let stop = Arc::new(AtomicBool::new(false));
        let poller = Arc::new(PollLoop::new(
            Arc::clone(&cloud),
            Arc::new(repos.clone()),
            Arc::clone(&machines),
            Arc::clone(&scheduler),
            Arc::clone(&reconciler),
            Arc::clone(&clock),
            Arc::clone(&stop),
        ));

        let streams: Arc<Mutex<HashMap<i64, Arc<StreamClient>>>> =
            Arc::new(Mutex::new(HashMap::new()));
        let car_ids_by_vehicle: Arc<Mutex<HashMap<i64, i64>>> =
            Arc::new(Mutex::new(HashMap::new()));

        {
            let init_repos = repos.clone();
            let init_machines = Arc::clone(&machines);
            bus.set_init_provider(move || InitData {
                cars: services::CarRepository::list(&init_repos).unwrap_or_default(),
                states: init_machines.all_snapshots().unwrap_or_default(),
            })?;
        }

        // The poll loop clears the stream offline latch when it sees the
        // vehicle back online.
        if config.use_streaming_api {
            let wake_streams = Arc::clone(&streams);
            let wake_index = Arc::clone(&car_ids_by_vehicle);
            reconciler
                .set_wake_sink(Box::new(move |car_id| {
                    let vehicle_id = match vehicle_id_for_car(&wake_index, car_id) {
                        Ok(vehicle_id) => vehicle_id,
                        Err(err) => {
                            tracing::error!(car_id, error = %err, "cannot map wake to a stream");
                            return;
                        }
                    };
                    let Some(vehicle_id) = vehicle_id else {
                        return;
                    };
                    let Ok(registry) = wake_streams.lock() else {
                        tracing::error!(vehicle_id, "stream registry lock poisoned");
                        return;
                    };
                    if let Some(client) = registry.get(&vehicle_id)
                        && client.is_vehicle_offline()
                    {
                        tracing::info!(
                            car_id,
                            vehicle_id,
                            "restarting stream after observed wake"
                        );
                        client.reset_and_restart();
                    }
                }))
                .map_err(|_| VehicleServiceError::LockPoisoned)?;
        }

        // Bad credentials halt polling; the stream for that vehicle stops
        // with it.
        {
            let halt_streams = Arc::clone(&streams);
            let halt_index = Arc::clone(&car_ids_by_vehicle);
            poller
                .set_auth_halt_sink(Box::new(move |car_id| {
                    let vehicle_id = match vehicle_id_for_car(&halt_index, car_id) {
                        Ok(vehicle_id) => vehicle_id,
                        Err(err) => {
                            tracing::error!(car_id, error = %err, "cannot map halt to a stream");
                            return;
                        }
                    };
                    let Some(vehicle_id) = vehicle_id else {
                        return;
                    };
                    let Ok(registry) = halt_streams.lock() else {
                        tracing::error!(vehicle_id, "stream registry lock poisoned");
                        return;
                    };
                    if let Some(client) = registry.get(&vehicle_id) {
                        client.stop();
                    }
                }))
                .map_err(|_| VehicleServiceError::LockPoisoned)?;
        }

        Ok(Arc::new(Self {
            config,
            clock,
            cloud,
            repos,
            machines,
            scheduler,
            bus,
            reconciler,
            poller,
            stop,
            poller_handle: Mutex::new(None),
            streams,
            car_ids_by_vehicle,
        }))
    }

    /// Discovers the fleet and seeds a machine per vehicle from the
    /// reported coarse state.
    pub fn sync_vehicles(&self) -> Result<(), VehicleServiceError> {
        let vehicles = self.cloud.list_products()?;
        let now = self.clock.now();

        for vehicle in vehicles {
            let car_id = services::CarRepository::upsert(
                &self.repos,
                vehicle.id,
                vehicle.vehicle_id,
                &vehicle.vin,
                &vehicle.display_name,
                now,
            )?;
            self.car_ids_by_vehicle
                .lock()
                .map_err(|_| VehicleServiceError::LockPoisoned)?
                .insert(vehicle.vehicle_id, car_id);
            self.machines
                .get_or_create(car_id, VehicleStateKind::from_cloud(&vehicle.state), now)?;
            tracing::info!(
                car_id,
                vin = %vehicle.vin,
                name = %vehicle.display_name,
                state = %vehicle.state,
                "synced vehicle"
            );
        }
        Ok(())
    }

    /// Syncs the fleet, then starts the poll loop and the per-vehicle
    /// stream links.
    pub fn start(self: &Arc<Self>) -> Result<(), VehicleServiceError> {
        self.sync_vehicles()?;
        self.stop.store(false, Ordering::SeqCst);

        let poller = Arc::clone(&self.poller);
        let handle = std::thread::Builder::new()
            .name("poll-loop".to_string())
            .spawn(move || poller.run())
            .map_err(|err| VehicleServiceError::Spawn(err.to_string()))?;
        *self
            .poller_handle
            .lock()
            .map_err(|_| VehicleServiceError::LockPoisoned)? = Some(handle);

        if self.config.use_streaming_api {
            self.start_all_streams()?;
        }

        tracing::info!("vehicle service started");
        Ok(())
    }

    fn start_all_streams(&self) -> Result<(), VehicleServiceError> {
        let cars = services::CarRepository::list(&self.repos)?;
        let handler: Arc<dyn StreamHandler> = Arc::new(StreamIngest {
            reconciler: Arc::clone(&self.reconciler),
            car_ids_by_vehicle: Arc::clone(&self.car_ids_by_vehicle),
        });

        for car in cars {
            let cloud = Arc::clone(&self.cloud);
            let client = Arc::new(StreamClient::new(
                car.cloud_vehicle_id,
                self.config.stream.clone(),
                Arc::new(move || cloud.access_token()),
                Arc::clone(&handler),
            ));
            client.start();
            self.streams
                .lock()
                .map_err(|_| VehicleServiceError::LockPoisoned)?
                .insert(car.cloud_vehicle_id, client);
            tracing::info!(
                car_id = car.id,
                vehicle_id = car.cloud_vehicle_id,
                "started stream"
            );
        }
        Ok(())
    }

    /// Shutdown order: streams first, then the poll loop. Best-effort; a
    /// poisoned lock is logged and skipped so the rest still winds down.
    pub fn stop(&self) {
        match self.streams.lock() {
            Ok(registry) => {
                for client in registry.values() {
                    client.stop();
                }
            }
            Err(_) => {
                tracing::error!("stream registry lock poisoned, skipping stream shutdown");
            }
        }

        self.stop.store(true, Ordering::SeqCst);
        match self.poller_handle.lock() {
            Ok(mut handle) => {
                if let Some(handle) = handle.take()
                    && handle.join().is_err()
                {
                    tracing::error!("poll loop thread panicked");
                }
            }
            Err(_) => {
                tracing::error!("poller handle lock poisoned, cannot join poll loop");
            }
        }
        tracing::info!(
            subscribers = self.bus.subscriber_count().unwrap_or(0),
            "vehicle service stopped"
        );
    }

    // ---- read surface ----

    pub fn get_state(&self, car_id: i64) -> Result<Option<VehicleState>, VehicleServiceError> {
        match self.machines.get(car_id)? {
            Some(machine) => Ok(Some(machine.snapshot()?)),
            None => Ok(None),
        }
    }

    pub fn get_all_states(&self) -> Result<Vec<VehicleState>, VehicleServiceError> {
        Ok(self.machines.all_snapshots()?)
    }

    pub fn subscribe(&self) -> Result<Subscription, VehicleServiceError> {
        Ok(self.bus.subscribe()?)
    }

    pub fn unsubscribe(&self, id: uuid::Uuid) -> Result<(), VehicleServiceError> {
        Ok(self.bus.unsubscribe(id)?)
    }

    #[cfg(test)]
    pub(crate) fn machine_for_tests(
        &self,
        car_id: i64,
    ) -> Arc<crate::domain::state::StateMachine> {
        self.machines
            .get(car_id)
            .expect("manager should be healthy")
            .expect("machine should exist")
    }

    // ---- manual control ----

    /// Manual suspend. Refused while driving/charging/updating, a no-op
    /// when the vehicle is already suspended or deeper.
    pub fn suspend_logging(&self, car_id: i64) -> Result<(), ControlError> {
        let machine = self
            .machines
            .get(car_id)?
            .ok_or(ControlError::UnknownVehicle)?;

        let state = machine.current_state()?;
        match state {
            VehicleStateKind::Suspended
            | VehicleStateKind::Asleep
            | VehicleStateKind::Offline => Ok(()),
            VehicleStateKind::Driving
            | VehicleStateKind::Charging
            | VehicleStateKind::Updating => Err(ControlError::CannotSuspend(state)),
            VehicleStateKind::Online => {
                if machine.trigger_if_legal(VehicleEvent::Suspend, self.clock.now())? {
                    self.scheduler
                        .set_interval(car_id, self.config.scheduler.suspend_interval)?;
                    tracing::info!(car_id, "manually suspended logging");
                }
                Ok(())
            }
        }
    }

    /// Manual resume. Fires `resume` from suspended, otherwise a no-op;
    /// always bumps the idle timer and restores the online cadence.
    pub fn resume_logging(&self, car_id: i64) -> Result<(), ControlError> {
        let machine = self
            .machines
            .get(car_id)?
            .ok_or(ControlError::UnknownVehicle)?;

        let now = self.clock.now();
        if machine.current_state()? == VehicleStateKind::Suspended {
            machine.trigger_if_legal(VehicleEvent::Resume, now)?;
            tracing::info!(car_id, "manually resumed logging");
        }
        machine.mark_active(now)?;
        self.scheduler
            .set_interval(car_id, self.config.scheduler.interval_online)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use chrono::{TimeZone, Utc};

    use crate::adapters::cloud::{CloudApi, CloudError, CloudVehicle, VehicleData};
    use crate::adapters::stream::StreamConfig;
    use crate::app::services::SqliteRepositories;
    use crate::core::event_bus::BusMessage;
    use crate::core::scheduler::SchedulerConfig;
    use crate::domain::clock::testing::ManualClock;
    use crate::domain::state::VehicleStateKind;
    use crate::test_support::open_shared_migrated_connection;

    use super::{ControlError, ServiceConfig, VehicleService};

    fn t0() -> chrono::DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 8, 0, 0).unwrap()
    }

    struct ListingCloud {
        vehicles: Mutex<Vec<CloudVehicle>>,
    }

    impl CloudApi for ListingCloud {
        fn list_products(&self) -> Result<Vec<CloudVehicle>, CloudError> {
            Ok(self.vehicles.lock().unwrap().clone())
        }

        fn get_vehicle(&self, _cloud_id: i64) -> Result<CloudVehicle, CloudError> {
            Err(CloudError::Transport("not scripted".to_string()))
        }

        fn get_vehicle_data(&self, _cloud_id: i64) -> Result<VehicleData, CloudError> {
            Err(CloudError::Transport("not scripted".to_string()))
        }

        fn refresh_token(&self) -> Result<(), CloudError> {
            Ok(())
        }

        fn access_token(&self) -> Option<String> {
            Some("token".to_string())
        }
    }

    fn service_config() -> ServiceConfig {
        ServiceConfig {
            scheduler: SchedulerConfig::default(),
            suspend_after_idle: chrono::Duration::minutes(15),
            require_not_unlocked: false,
            nominal_capacity_kwh: 75.0,
            use_streaming_api: false,
            stream: StreamConfig {
                host: "ws://127.0.0.1:1".to_string(),
                reconnect_initial: Duration::from_secs(1),
                reconnect_max: Duration::from_secs(30),
            },
        }
    }

    fn fixture() -> (Arc<VehicleService>, tempfile::TempDir) {
        let (connection, dir) = open_shared_migrated_connection();
        let repos = SqliteRepositories::new(connection);
        let cloud = Arc::new(ListingCloud {
            vehicles: Mutex::new(vec![
                CloudVehicle {
                    id: 1001,
                    vehicle_id: 2001,
                    vin: "5YJ3E1EA".to_string(),
                    display_name: "Daily".to_string(),
                    state: "online".to_string(),
                },
                CloudVehicle {
                    id: 1002,
                    vehicle_id: 2002,
                    vin: "5YJ3E1EB".to_string(),
                    display_name: "Track".to_string(),
                    state: "asleep".to_string(),
                },
            ]),
        });
        let clock = Arc::new(ManualClock::new(t0()));
        let service = VehicleService::new(service_config(), clock, cloud, repos, None)
            .expect("service should build");
        service.sync_vehicles().expect("sync should succeed");
        (service, dir)
    }

    fn states(service: &VehicleService) -> Vec<crate::domain::state::VehicleState> {
        service
            .get_all_states()
            .expect("states should be readable")
    }

    fn state_of(service: &VehicleService, car_id: i64) -> VehicleStateKind {
        service
            .get_state(car_id)
            .expect("state should be readable")
            .expect("vehicle should exist")
            .state
    }

    #[test]
    fn sync_seeds_machines_from_the_reported_state() {
        let (service, _dir) = fixture();
        let states = states(&service);
        assert_eq!(states.len(), 2);
        assert_eq!(states[0].state, VehicleStateKind::Online);
        assert_eq!(states[1].state, VehicleStateKind::Asleep);
    }

    #[test]
    fn subscription_starts_with_an_init_frame_of_the_fleet() {
        let (service, _dir) = fixture();
        let subscription = service.subscribe().expect("subscribe should succeed");
        match subscription.receiver.try_recv().expect("init should arrive") {
            BusMessage::Init(init) => {
                assert_eq!(init.cars.len(), 2);
                assert_eq!(init.states.len(), 2);
            }
            BusMessage::StateUpdate(_) => panic!("expected init frame"),
        }
    }

    #[test]
    fn manual_suspend_obeys_the_state_rules() {
        let (service, _dir) = fixture();
        let online_id = states(&service)[0].car_id;
        let asleep_id = states(&service)[1].car_id;

        // Online suspends.
        service
            .suspend_logging(online_id)
            .expect("suspend from online should succeed");
        assert_eq!(state_of(&service, online_id), VehicleStateKind::Suspended);

        // Suspended again: no-op.
        service
            .suspend_logging(online_id)
            .expect("suspend from suspended should be a no-op");

        // Asleep: no-op.
        service
            .suspend_logging(asleep_id)
            .expect("suspend from asleep should be a no-op");
        assert_eq!(state_of(&service, asleep_id), VehicleStateKind::Asleep);

        // Unknown vehicle.
        assert_eq!(
            service.suspend_logging(999),
            Err(ControlError::UnknownVehicle)
        );
    }

    #[test]
    fn manual_suspend_is_refused_while_a_session_is_active() {
        let (service, _dir) = fixture();
        let car_id = states(&service)[0].car_id;
        service
            .machine_for_tests(car_id)
            .trigger(crate::domain::state::VehicleEvent::StartDriving, t0())
            .expect("start driving should be legal");

        assert_eq!(
            service.suspend_logging(car_id),
            Err(ControlError::CannotSuspend(VehicleStateKind::Driving))
        );
    }

    #[test]
    fn resume_is_idempotent_and_restores_the_online_cadence() {
        let (service, _dir) = fixture();
        let car_id = states(&service)[0].car_id;

        service.suspend_logging(car_id).expect("suspend should succeed");
        service.resume_logging(car_id).expect("resume should succeed");
        assert_eq!(state_of(&service, car_id), VehicleStateKind::Online);
        assert_eq!(
            service
                .scheduler
                .current_interval(car_id)
                .expect("interval should be readable"),
            Duration::from_secs(15)
        );

        // Resume from online: no-op, still bumps activity.
        service.resume_logging(car_id).expect("resume should be a no-op");
        assert_eq!(state_of(&service, car_id), VehicleStateKind::Online);

        // Resume followed by suspend lands back in the same observable
        // state as before the pair.
        service.suspend_logging(car_id).expect("suspend should succeed");
        let before = state_of(&service, car_id);
        service.resume_logging(car_id).expect("resume should succeed");
        service.suspend_logging(car_id).expect("suspend should succeed");
        assert_eq!(state_of(&service, car_id), before);
    }
}
