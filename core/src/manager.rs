// Session manager: the single task that owns every device session
//
// Commands from handles, platform events and timer fires all arrive on this
// task, so admission, sessions and listener dispatch are never touched
// concurrently. Platform requests run on spawned tasks; a refused request is
// fed back to the session that issued it.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::admission::{Admission, AdmissionController};
use crate::config::{ConfigError, EpdConfig};
use crate::listener::{ConnectEvent, ConnectListener, ConnectionState, DisconnectReason, ScanListener};
use crate::protocol::{Frame, LedState};
use crate::session::{
    DeviceSession, GattRequest, HandshakeState, SessionAction, SessionError, SessionTiming,
    TimerKind, Timers,
};
use crate::transport::ble::{
    BlePlatform, BleScanner, ConnectionHandle, ConnectionId, DeviceAddress, GattStatus,
    PlatformError, PlatformEvent,
};

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ManagerError {
    #[error("Session manager not running")]
    NotRunning,
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error("Platform error: {0}")]
    Platform(#[from] PlatformError),
}

// ============================================================================
// COMMANDS
// ============================================================================

/// Commands that can be sent to the manager task
pub enum ManagerCommand {
    Connect {
        address: DeviceAddress,
        reply: mpsc::Sender<Admission>,
    },
    Disconnect {
        address: DeviceAddress,
        reply: mpsc::Sender<bool>,
    },
    Reconnect {
        address: DeviceAddress,
        reply: mpsc::Sender<()>,
    },
    SendFrame {
        address: DeviceAddress,
        frame: Frame,
        reply: mpsc::Sender<Result<(), SessionError>>,
    },
    WriteLed {
        address: DeviceAddress,
        led: LedState,
        reply: mpsc::Sender<Result<(), SessionError>>,
    },
    ReadFirmware {
        address: DeviceAddress,
        reply: mpsc::Sender<Result<(), SessionError>>,
    },
    ReadLed {
        address: DeviceAddress,
        reply: mpsc::Sender<Result<(), SessionError>>,
    },
    IsConnectedOrQueued {
        address: DeviceAddress,
        reply: mpsc::Sender<bool>,
    },
    Snapshot {
        reply: mpsc::Sender<ManagerSnapshot>,
    },
    StartScan {
        duration: Option<Duration>,
        reply: mpsc::Sender<Result<(), PlatformError>>,
    },
    StopScan {
        reply: mpsc::Sender<bool>,
    },
    /// Register (or with `None` remove) the connect listener of an address
    SetConnectListener {
        address: DeviceAddress,
        listener: Option<Arc<dyn ConnectListener>>,
    },
    AddScanListener {
        listener: Arc<dyn ScanListener>,
    },
    RemoveScanListener {
        listener: Arc<dyn ScanListener>,
    },
    Shutdown {
        reply: mpsc::Sender<()>,
    },
}

/// Messages the manager sends itself
#[derive(Debug)]
enum Internal {
    TimerFired {
        key: TimerKey,
        generation: u64,
    },
    RequestFailed {
        connection: ConnectionHandle,
        request: GattRequest,
        status: GattStatus,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum TimerKey {
    Session(DeviceAddress, TimerKind),
    Redial(DeviceAddress),
    ScanStop,
}

/// One admitted session as seen from outside
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    pub address: DeviceAddress,
    pub state: HandshakeState,
    pub firmware: Option<String>,
    pub led: Option<LedState>,
    pub transfer_progress: Option<u8>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ManagerSnapshot {
    pub active: Vec<SessionInfo>,
    pub waiting: Vec<DeviceAddress>,
    pub scanning: bool,
}

// ============================================================================
// HANDLE
// ============================================================================

/// Handle to communicate with the running manager task
#[derive(Clone)]
pub struct ManagerHandle {
    command_tx: mpsc::Sender<ManagerCommand>,
}

impl ManagerHandle {
    /// Validate `config`, register on `platform` and start the manager task.
    /// Must be called inside a tokio runtime.
    pub fn spawn(platform: Arc<dyn BlePlatform>, config: EpdConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let scanner = BleScanner::new(config.scan.clone())?;

        let (command_tx, command_rx) = mpsc::channel(256);
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();

        platform.set_event_handler(Box::new(move |event| {
            let _ = event_tx.send(event);
        }));

        let manager = SessionManager {
            timing: SessionTiming::from(&config),
            admission: AdmissionController::new(config.max_sessions),
            timers: Timers::new(
                internal_tx.clone(),
                |key: TimerKey, generation: u64| Internal::TimerFired { key, generation },
            ),
            platform,
            config,
            scanner,
            sessions: HashMap::new(),
            connect_listeners: HashMap::new(),
            scan_listeners: Vec::new(),
            redial_on_release: HashSet::new(),
            next_connection_id: 0,
            internal_tx,
        };
        tokio::spawn(manager.run(command_rx, event_rx, internal_rx));

        Ok(Self { command_tx })
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(mpsc::Sender<T>) -> ManagerCommand,
    ) -> Result<T, ManagerError> {
        let (reply_tx, mut reply_rx) = mpsc::channel(1);
        self.command_tx
            .send(build(reply_tx))
            .await
            .map_err(|_| ManagerError::NotRunning)?;
        reply_rx.recv().await.ok_or(ManagerError::NotRunning)
    }

    async fn send(&self, command: ManagerCommand) -> Result<(), ManagerError> {
        self.command_tx
            .send(command)
            .await
            .map_err(|_| ManagerError::NotRunning)
    }

    /// Ask for a session; queued when every slot is busy
    pub async fn connect(&self, address: DeviceAddress) -> Result<Admission, ManagerError> {
        self.request(|reply| ManagerCommand::Connect { address, reply })
            .await
    }

    /// Tear down the session, or cancel a queued connect. False if the address is unknown.
    pub async fn disconnect(&self, address: DeviceAddress) -> Result<bool, ManagerError> {
        self.request(|reply| ManagerCommand::Disconnect { address, reply })
            .await
    }

    /// Disconnect if connected, then redial after the settle delay
    pub async fn reconnect(&self, address: DeviceAddress) -> Result<(), ManagerError> {
        self.request(|reply| ManagerCommand::Reconnect { address, reply })
            .await
    }

    pub async fn send_frame(&self, address: DeviceAddress, frame: Frame) -> Result<(), ManagerError> {
        self.request(|reply| ManagerCommand::SendFrame {
            address,
            frame,
            reply,
        })
        .await??;
        Ok(())
    }

    pub async fn write_led(&self, address: DeviceAddress, led: LedState) -> Result<(), ManagerError> {
        self.request(|reply| ManagerCommand::WriteLed {
            address,
            led,
            reply,
        })
        .await??;
        Ok(())
    }

    pub async fn read_firmware(&self, address: DeviceAddress) -> Result<(), ManagerError> {
        self.request(|reply| ManagerCommand::ReadFirmware { address, reply })
            .await??;
        Ok(())
    }

    pub async fn read_led(&self, address: DeviceAddress) -> Result<(), ManagerError> {
        self.request(|reply| ManagerCommand::ReadLed { address, reply })
            .await??;
        Ok(())
    }

    pub async fn is_connected_or_queued(&self, address: DeviceAddress) -> Result<bool, ManagerError> {
        self.request(|reply| ManagerCommand::IsConnectedOrQueued { address, reply })
            .await
    }

    pub async fn snapshot(&self) -> Result<ManagerSnapshot, ManagerError> {
        self.request(|reply| ManagerCommand::Snapshot { reply }).await
    }

    /// Scan for `duration`, or the configured default when `None`
    pub async fn start_scan(&self, duration: Option<Duration>) -> Result<(), ManagerError> {
        self.request(|reply| ManagerCommand::StartScan { duration, reply })
            .await??;
        Ok(())
    }

    /// False if no scan was running
    pub async fn stop_scan(&self) -> Result<bool, ManagerError> {
        self.request(|reply| ManagerCommand::StopScan { reply }).await
    }

    pub async fn set_connect_listener(
        &self,
        address: DeviceAddress,
        listener: Arc<dyn ConnectListener>,
    ) -> Result<(), ManagerError> {
        self.send(ManagerCommand::SetConnectListener {
            address,
            listener: Some(listener),
        })
        .await
    }

    pub async fn remove_connect_listener(&self, address: DeviceAddress) -> Result<(), ManagerError> {
        self.send(ManagerCommand::SetConnectListener {
            address,
            listener: None,
        })
        .await
    }

    pub async fn add_scan_listener(&self, listener: Arc<dyn ScanListener>) -> Result<(), ManagerError> {
        self.send(ManagerCommand::AddScanListener { listener }).await
    }

    /// Remove a listener added with `add_scan_listener`, matched by identity
    pub async fn remove_scan_listener(
        &self,
        listener: Arc<dyn ScanListener>,
    ) -> Result<(), ManagerError> {
        self.send(ManagerCommand::RemoveScanListener { listener }).await
    }

    /// Disconnect every session and stop the manager task
    pub async fn shutdown(&self) -> Result<(), ManagerError> {
        self.request(|reply| ManagerCommand::Shutdown { reply }).await
    }
}

// ============================================================================
// MANAGER TASK
// ============================================================================

struct SessionManager {
    platform: Arc<dyn BlePlatform>,
    config: EpdConfig,
    timing: SessionTiming,
    admission: AdmissionController,
    scanner: BleScanner,
    sessions: HashMap<DeviceAddress, DeviceSession>,
    timers: Timers<TimerKey, Internal>,
    connect_listeners: HashMap<DeviceAddress, Arc<dyn ConnectListener>>,
    scan_listeners: Vec<Arc<dyn ScanListener>>,
    /// Addresses to dial again once their session is released
    redial_on_release: HashSet<DeviceAddress>,
    next_connection_id: u64,
    internal_tx: mpsc::UnboundedSender<Internal>,
}

impl SessionManager {
    async fn run(
        mut self,
        mut command_rx: mpsc::Receiver<ManagerCommand>,
        mut event_rx: mpsc::UnboundedReceiver<PlatformEvent>,
        mut internal_rx: mpsc::UnboundedReceiver<Internal>,
    ) {
        info!("Session manager started, {} session slots", self.admission.limit());
        loop {
            tokio::select! {
                Some(event) = event_rx.recv() => self.on_platform_event(event),
                Some(internal) = internal_rx.recv() => self.on_internal(internal),
                command = command_rx.recv() => match command {
                    Some(ManagerCommand::Shutdown { reply }) => {
                        self.shutdown().await;
                        let _ = reply.send(()).await;
                        break;
                    }
                    Some(command) => self.on_command(command).await,
                    None => {
                        self.shutdown().await;
                        break;
                    }
                },
            }
        }
        info!("Session manager stopped");
    }

    async fn on_command(&mut self, command: ManagerCommand) {
        match command {
            ManagerCommand::Connect { address, reply } => {
                let admission = self.connect(address);
                let _ = reply.send(admission).await;
            }
            ManagerCommand::Disconnect { address, reply } => {
                let known = self.disconnect(&address);
                let _ = reply.send(known).await;
            }
            ManagerCommand::Reconnect { address, reply } => {
                self.reconnect(&address);
                let _ = reply.send(()).await;
            }
            ManagerCommand::SendFrame {
                address,
                frame,
                reply,
            } => {
                let result = self.with_session(&address, |session| {
                    session.send_frame(frame, Instant::now())
                });
                let _ = reply.send(result).await;
            }
            ManagerCommand::WriteLed {
                address,
                led,
                reply,
            } => {
                let result = self.with_session(&address, |session| session.write_led(led));
                let _ = reply.send(result).await;
            }
            ManagerCommand::ReadFirmware { address, reply } => {
                let result = self.with_session(&address, DeviceSession::read_firmware);
                let _ = reply.send(result).await;
            }
            ManagerCommand::ReadLed { address, reply } => {
                let result = self.with_session(&address, DeviceSession::read_led);
                let _ = reply.send(result).await;
            }
            ManagerCommand::IsConnectedOrQueued { address, reply } => {
                let _ = reply
                    .send(self.admission.is_connected_or_queued(&address))
                    .await;
            }
            ManagerCommand::Snapshot { reply } => {
                let _ = reply.send(self.snapshot()).await;
            }
            ManagerCommand::StartScan { duration, reply } => {
                let result = self.start_scan(duration).await;
                let _ = reply.send(result).await;
            }
            ManagerCommand::StopScan { reply } => {
                let stopped = self.stop_scan();
                let _ = reply.send(stopped).await;
            }
            ManagerCommand::SetConnectListener { address, listener } => match listener {
                Some(listener) => {
                    self.connect_listeners.insert(address, listener);
                }
                None => {
                    self.connect_listeners.remove(&address);
                }
            },
            ManagerCommand::AddScanListener { listener } => self.scan_listeners.push(listener),
            ManagerCommand::RemoveScanListener { listener } => {
                self.scan_listeners.retain(|l| !Arc::ptr_eq(l, &listener));
            }
            // handled by the run loop
            ManagerCommand::Shutdown { .. } => {}
        }
    }

    fn on_platform_event(&mut self, event: PlatformEvent) {
        match event {
            PlatformEvent::ScanResult {
                address,
                name,
                rssi,
                advertisement,
            } => {
                let Some(report) =
                    self.scanner
                        .filter(&address, name.as_deref(), rssi, &advertisement)
                else {
                    return;
                };
                for listener in &self.scan_listeners {
                    listener.on_device_seen(&report);
                }
            }
            PlatformEvent::Gatt { connection, event } => {
                let address = connection.address.clone();
                let Some(session) = self.current_session(&connection) else {
                    debug!("Dropping event for stale connection {}: {:?}", connection, event);
                    return;
                };
                let actions = session.handle_event(event, Instant::now());
                self.execute(&address, actions);
            }
        }
    }

    fn on_internal(&mut self, internal: Internal) {
        match internal {
            Internal::TimerFired { key, generation } => {
                if !self.timers.take_if_current(&key, generation) {
                    return;
                }
                match key {
                    TimerKey::Session(address, kind) => {
                        if let Some(session) = self.sessions.get_mut(&address) {
                            let actions = session.timer_fired(kind);
                            self.execute(&address, actions);
                        }
                    }
                    TimerKey::Redial(address) => {
                        info!("Redialing {}", address);
                        self.connect(address);
                    }
                    TimerKey::ScanStop => {
                        self.stop_scan();
                    }
                }
            }
            Internal::RequestFailed {
                connection,
                request,
                status,
            } => {
                let address = connection.address.clone();
                let Some(session) = self.current_session(&connection) else {
                    return;
                };
                let actions = session.request_failed(&request, status);
                self.execute(&address, actions);
            }
        }
    }

    fn current_session(&mut self, connection: &ConnectionHandle) -> Option<&mut DeviceSession> {
        self.sessions
            .get_mut(&connection.address)
            .filter(|session| session.connection() == connection)
    }

    fn with_session(
        &mut self,
        address: &DeviceAddress,
        f: impl FnOnce(&mut DeviceSession) -> Result<Vec<SessionAction>, SessionError>,
    ) -> Result<(), SessionError> {
        let session = self
            .sessions
            .get_mut(address)
            .ok_or(SessionError::NotConnected)?;
        let actions = f(session)?;
        self.execute(address, actions);
        Ok(())
    }

    fn connect(&mut self, address: DeviceAddress) -> Admission {
        self.timers.cancel(&TimerKey::Redial(address.clone()));
        let admission = self.admission.request_connect(&address);
        if admission == Admission::ConnectedImmediately {
            self.open_session(address);
        }
        admission
    }

    fn open_session(&mut self, address: DeviceAddress) {
        self.next_connection_id += 1;
        let connection = ConnectionHandle::new(address.clone(), ConnectionId(self.next_connection_id));
        let mut session = DeviceSession::new(connection, self.timing);
        let actions = session.open();
        self.sessions.insert(address.clone(), session);
        self.execute(&address, actions);
    }

    fn disconnect(&mut self, address: &DeviceAddress) -> bool {
        self.timers.cancel(&TimerKey::Redial(address.clone()));
        self.redial_on_release.remove(address);
        match self.sessions.get_mut(address) {
            Some(session) => {
                let actions = session.disconnect(DisconnectReason::Requested);
                self.execute(address, actions);
                true
            }
            None => self.admission.remove_waiting(address),
        }
    }

    fn reconnect(&mut self, address: &DeviceAddress) {
        if let Some(session) = self.sessions.get_mut(address) {
            let actions = session.disconnect(DisconnectReason::Requested);
            self.redial_on_release.insert(address.clone());
            self.execute(address, actions);
        } else if !self.admission.is_connected_or_queued(address) {
            debug!("Redial of {} in {:?}", address, self.timing.settle_delay);
            self.timers
                .arm(TimerKey::Redial(address.clone()), self.timing.settle_delay);
        }
    }

    fn execute(&mut self, address: &DeviceAddress, actions: Vec<SessionAction>) {
        for action in actions {
            match action {
                SessionAction::Request(request) => self.issue(address, request),
                SessionAction::ArmTimer(kind, after) => {
                    self.timers.arm(TimerKey::Session(address.clone(), kind), after)
                }
                SessionAction::CancelTimer(kind) => {
                    self.timers.cancel(&TimerKey::Session(address.clone(), kind));
                }
                SessionAction::Notify(event) => self.notify(address, &event),
                SessionAction::Release(reason) => self.release(address, reason),
            }
        }
    }

    /// Run one platform request off the manager task
    fn issue(&self, address: &DeviceAddress, request: GattRequest) {
        let Some(session) = self.sessions.get(address) else {
            return;
        };
        let connection = session.connection().clone();
        let platform = Arc::clone(&self.platform);
        let internal_tx = self.internal_tx.clone();
        tokio::spawn(async move {
            let result = match &request {
                GattRequest::Connect => platform.connect(&connection).await,
                GattRequest::Disconnect => platform.disconnect(&connection).await,
                GattRequest::Close => platform.close(&connection).await,
                GattRequest::DiscoverServices => platform.discover_services(&connection).await,
                GattRequest::RequestMtu(mtu) => platform.request_mtu(&connection, *mtu).await,
                GattRequest::Read(characteristic) => {
                    platform.read_characteristic(&connection, *characteristic).await
                }
                GattRequest::Write(characteristic, value) => {
                    platform
                        .write_characteristic(&connection, *characteristic, value.clone())
                        .await
                }
                GattRequest::EnableNotify(characteristic) => {
                    platform.enable_notify(&connection, *characteristic).await
                }
            };
            if let Err(e) = result {
                warn!("{:?} on {} failed: {}", request, connection, e);
                let _ = internal_tx.send(Internal::RequestFailed {
                    status: e.status(),
                    connection,
                    request,
                });
            }
        });
    }

    fn notify(&self, address: &DeviceAddress, event: &ConnectEvent) {
        debug!("{} -> {:?}", address, event);
        if let Some(listener) = self.connect_listeners.get(address) {
            event.dispatch(address, listener.as_ref());
        }
    }

    fn release(&mut self, address: &DeviceAddress, reason: DisconnectReason) {
        self.sessions.remove(address);
        self.timers
            .cancel_where(|key| matches!(key, TimerKey::Session(a, _) if a == address));
        info!("Released {} ({:?})", address, reason);
        if let Some(next) = self.admission.on_session_closed(address) {
            self.open_session(next);
        }
        if self.redial_on_release.remove(address) {
            self.connect(address.clone());
        }
    }

    fn snapshot(&self) -> ManagerSnapshot {
        let admission = self.admission.snapshot();
        ManagerSnapshot {
            active: admission
                .active
                .iter()
                .filter_map(|address| {
                    let session = self.sessions.get(address)?;
                    Some(SessionInfo {
                        address: address.clone(),
                        state: session.state(),
                        firmware: session.firmware().map(str::to_string),
                        led: session.led(),
                        transfer_progress: session.transfer_progress(),
                    })
                })
                .collect(),
            waiting: admission.waiting,
            scanning: self.scanner.is_scanning(),
        }
    }

    async fn start_scan(&mut self, duration: Option<Duration>) -> Result<(), PlatformError> {
        let duration = duration
            .unwrap_or_else(|| Duration::from_millis(self.config.scan.default_duration_ms));
        if self.scanner.start_scanning() {
            if let Err(e) = self.platform.start_scan().await {
                self.scanner.stop_scanning();
                return Err(e);
            }
            info!("Scanning for {:?}", duration);
            for listener in &self.scan_listeners {
                listener.on_scan_state_changed(true);
            }
        }
        self.timers.arm(TimerKey::ScanStop, duration);
        Ok(())
    }

    fn stop_scan(&mut self) -> bool {
        if !self.scanner.stop_scanning() {
            return false;
        }
        self.timers.cancel(&TimerKey::ScanStop);
        let platform = Arc::clone(&self.platform);
        tokio::spawn(async move {
            if let Err(e) = platform.stop_scan().await {
                warn!("Stopping the scan failed: {}", e);
            }
        });
        info!("Scan stopped");
        for listener in &self.scan_listeners {
            listener.on_scan_state_changed(false);
        }
        true
    }

    async fn shutdown(&mut self) {
        info!("Shutting down {} sessions", self.sessions.len());
        self.timers.cancel_all();
        if self.scanner.stop_scanning() {
            let _ = self.platform.stop_scan().await;
        }
        let sessions: Vec<(DeviceAddress, DeviceSession)> = self.sessions.drain().collect();
        for (address, session) in sessions {
            let connection = session.connection();
            if let Err(e) = self.platform.disconnect(connection).await {
                debug!("Disconnect of {} during shutdown failed: {}", connection, e);
            }
            let _ = self.platform.close(connection).await;
            self.notify(
                &address,
                &ConnectEvent::ConnectionState {
                    state: ConnectionState::Disconnected,
                    reason: Some(DisconnectReason::Requested),
                },
            );
        }
        self.admission.clear();
        self.redial_on_release.clear();
    }
}
