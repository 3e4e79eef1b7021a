use std::net::TcpStream;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use serde::Deserialize;
use tungstenite::stream::MaybeTlsStream;
use tungstenite::{Message, WebSocket, connect};

use crate::domain::stream_frame::StreamFrame;

const READ_DEADLINE: Duration = Duration::from_secs(60);
const STOP_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// The constant field list sent with the subscribe message.
pub const SUBSCRIBED_FIELDS: &str =
    "speed,odometer,soc,elevation,est_heading,est_lat,est_lng,power,shift_state,range,est_range,heading";

/// Callbacks surfaced by the per-vehicle stream client. Implementations
/// must be cheap; they run on the reader thread.
pub trait StreamHandler: Send + Sync + 'static {
    fn on_frame(&self, vehicle_id: i64, frame: StreamFrame);
    fn on_connect(&self, vehicle_id: i64);
    fn on_disconnect(&self, vehicle_id: i64, error: Option<String>);
    /// The vendor reported the vehicle offline; reconnecting is pointless
    /// until the poll loop observes it back online.
    fn on_vehicle_offline(&self, vehicle_id: i64);
}

/// Access token supplier, read at (re)connect time so refreshed tokens are
/// picked up.
pub type TokenProvider = Arc<dyn Fn() -> Option<String> + Send + Sync + 'static>;

#[derive(Debug, Clone)]
pub struct StreamConfig {
    pub host: String,
    pub reconnect_initial: Duration,
    pub reconnect_max: Duration,
}

#[derive(Debug, Deserialize)]
struct StreamMessage {
    #[serde(default)]
    msg_type: String,
    #[serde(default)]
    value: String,
    #[serde(default)]
    error_type: String,
    #[serde(default)]
    connection_timeout: Option<u64>,
}

enum SessionEnd {
    Stopped,
    Reconnect(Option<String>),
    VehicleOffline,
}

struct Shared {
    stop: AtomicBool,
    vehicle_offline: AtomicBool,
    running: AtomicBool,
}

/// Long-lived push connection for one vehicle. Owns a reader thread that
/// reconnects with exponential backoff until stopped or the vehicle goes
/// offline.
pub struct StreamClient {
    vehicle_id: i64,
    config: StreamConfig,
    token_provider: TokenProvider,
    handler: Arc<dyn StreamHandler>,
    shared: Arc<Shared>,
}

impl StreamClient {
    pub fn new(
        vehicle_id: i64,
        config: StreamConfig,
        token_provider: TokenProvider,
        handler: Arc<dyn StreamHandler>,
    ) -> Self {
        Self {
            vehicle_id,
            config,
            token_provider,
            handler,
            shared: Arc::new(Shared {
                stop: AtomicBool::new(false),
                vehicle_offline: AtomicBool::new(false),
                running: AtomicBool::new(false),
            }),
        }
    }

    pub fn is_vehicle_offline(&self) -> bool {
        self.shared.vehicle_offline.load(Ordering::SeqCst)
    }

    /// Spawns the reconnect loop. A second call while the loop is live is a
    /// no-op.
    pub fn start(&self) {
        if self.shared.running.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shared.stop.store(false, Ordering::SeqCst);

        let worker = Worker {
            vehicle_id: self.vehicle_id,
            config: self.config.clone(),
            token_provider: Arc::clone(&self.token_provider),
            handler: Arc::clone(&self.handler),
            shared: Arc::clone(&self.shared),
        };
        if let Err(err) = thread::Builder::new()
            .name(format!("stream-{}", self.vehicle_id))
            .spawn(move || worker.run())
        {
            self.shared.running.store(false, Ordering::SeqCst);
            tracing::error!(
                vehicle_id = self.vehicle_id,
                error = %err,
                "failed to spawn stream thread"
            );
        }
    }

    pub fn stop(&self) {
        self.shared.stop.store(true, Ordering::SeqCst);
    }

    /// Clears the offline latch and restarts the loop. Called by the poll
    /// loop once it observes the vehicle back online.
    pub fn reset_and_restart(&self) {
        self.shared.vehicle_offline.store(false, Ordering::SeqCst);
        self.start();
    }
}

struct Worker {
    vehicle_id: i64,
    config: StreamConfig,
    token_provider: TokenProvider,
    handler: Arc<dyn StreamHandler>,
    shared: Arc<Shared>,
}

impl Worker {
    fn run(self) {
        let mut delay = self.config.reconnect_initial;

        loop {
            if self.shared.stop.load(Ordering::SeqCst)
                || self.shared.vehicle_offline.load(Ordering::SeqCst)
            {
                break;
            }

            match self.connect_once() {
                Ok(mut socket) => {
                    delay = self.config.reconnect_initial;
                    self.handler.on_connect(self.vehicle_id);

                    match self.read_session(&mut socket) {
                        SessionEnd::Stopped => {
                            let _ = socket.close(None);
                            break;
                        }
                        SessionEnd::VehicleOffline => {
                            let _ = socket.close(None);
                            self.handler.on_vehicle_offline(self.vehicle_id);
                            break;
                        }
                        SessionEnd::Reconnect(error) => {
                            let _ = socket.close(None);
                            self.handler.on_disconnect(self.vehicle_id, error);
                        }
                    }
                }
                Err(err) => {
                    tracing::warn!(
                        vehicle_id = self.vehicle_id,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "stream connect failed, backing off"
                    );
                }
            }

            if !self.sleep_unless_stopped(delay) {
                break;
            }
            delay = (delay * 2).min(self.config.reconnect_max);
        }

        self.shared.running.store(false, Ordering::SeqCst);
    }

    fn connect_once(&self) -> Result<WebSocket<MaybeTlsStream<TcpStream>>, String> {
        let token = (self.token_provider)().ok_or_else(|| "no access token".to_string())?;

        let (mut socket, _response) =
            connect(self.config.host.as_str()).map_err(|err| err.to_string())?;

        set_read_deadline(&mut socket);

        let subscribe = serde_json::json!({
            "msg_type": "data:subscribe_oauth",
            "token": token,
            "value": SUBSCRIBED_FIELDS,
            "tag": self.vehicle_id.to_string(),
        });
        socket
            .send(Message::Text(subscribe.to_string().into()))
            .map_err(|err| err.to_string())?;

        Ok(socket)
    }

    fn read_session(&self, socket: &mut WebSocket<MaybeTlsStream<TcpStream>>) -> SessionEnd {
        loop {
            if self.shared.stop.load(Ordering::SeqCst) {
                return SessionEnd::Stopped;
            }

            let message = match socket.read() {
                Ok(message) => message,
                Err(err) => return SessionEnd::Reconnect(Some(err.to_string())),
            };

            match message {
                Message::Text(text) => {
                    if let Some(end) = self.handle_text(text.as_str()) {
                        return end;
                    }
                }
                Message::Ping(payload) => {
                    if let Err(err) = socket.send(Message::Pong(payload)) {
                        return SessionEnd::Reconnect(Some(err.to_string()));
                    }
                }
                Message::Close(_) => return SessionEnd::Reconnect(None),
                _ => {}
            }
        }
    }

    fn handle_text(&self, text: &str) -> Option<SessionEnd> {
        let message: StreamMessage = match serde_json::from_str(text) {
            Ok(message) => message,
            Err(err) => {
                tracing::warn!(
                    vehicle_id = self.vehicle_id,
                    error = %err,
                    "unparseable stream message"
                );
                return None;
            }
        };

        match message.msg_type.as_str() {
            "data:update" => {
                match StreamFrame::parse(&message.value) {
                    Ok(frame) => self.handler.on_frame(self.vehicle_id, frame),
                    Err(err) => {
                        tracing::warn!(
                            vehicle_id = self.vehicle_id,
                            error = %err,
                            "dropping malformed stream tuple"
                        );
                    }
                }
                None
            }
            "data:error" => {
                tracing::warn!(
                    vehicle_id = self.vehicle_id,
                    error_type = %message.error_type,
                    value = %message.value,
                    "stream error message"
                );
                if message.error_type == "vehicle_error" && message.value.contains("offline") {
                    self.shared.vehicle_offline.store(true, Ordering::SeqCst);
                    return Some(SessionEnd::VehicleOffline);
                }
                if message.error_type == "vehicle_disconnected"
                    || message.error_type == "vehicle_error"
                {
                    return Some(SessionEnd::Reconnect(Some(message.error_type)));
                }
                None
            }
            "control:hello" => {
                tracing::debug!(
                    vehicle_id = self.vehicle_id,
                    timeout = message.connection_timeout,
                    "stream hello"
                );
                None
            }
            other => {
                tracing::debug!(
                    vehicle_id = self.vehicle_id,
                    msg_type = %other,
                    "unknown stream message type"
                );
                None
            }
        }
    }

    /// Returns false when the stop flag fired during the wait.
    fn sleep_unless_stopped(&self, duration: Duration) -> bool {
        let mut remaining = duration;
        while !remaining.is_zero() {
            if self.shared.stop.load(Ordering::SeqCst)
                || self.shared.vehicle_offline.load(Ordering::SeqCst)
            {
                return false;
            }
            let step = remaining.min(STOP_POLL_INTERVAL);
            thread::sleep(step);
            remaining -= step;
        }
        !self.shared.stop.load(Ordering::SeqCst)
    }
}

fn set_read_deadline(socket: &mut WebSocket<MaybeTlsStream<TcpStream>>) {
    let stream = match socket.get_mut() {
        MaybeTlsStream::Plain(stream) => stream,
        MaybeTlsStream::NativeTls(tls) => tls.get_mut(),
        _ => return,
    };
    if let Err(err) = stream.set_read_timeout(Some(READ_DEADLINE)) {
        tracing::warn!(error = %err, "failed to set stream read deadline");
    }
}
