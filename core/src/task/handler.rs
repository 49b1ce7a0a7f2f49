// Per-device task handler
//
// Runs one task at a time against one address: connect, wait for the session
// to become Ready, run the job, report through `TaskHandlerCallback`. Lost
// connections are redialed until the retry budget is spent.
//
// The connect listener runs on the session manager task, so anything that
// calls back into the manager is spawned.

use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::{prepare, PreparedTask, Task};
use crate::admission::Admission;
use crate::config::EpdConfig;
use crate::listener::{
    ConnectEvent, ConnectListener, ConnectionState, DisconnectReason, ImageWritePhase,
    TaskError, TaskErrorKind, TaskHandlerCallback,
};
use crate::manager::{ManagerError, ManagerHandle};
use crate::protocol::{Frame, LedState};
use crate::session::SessionError;
use crate::transport::ble::{DeviceAddress, GattStatus};

pub const CONNECTED_MESSAGE: &str = "Connected!";
pub const SERVICE_DISCOVERED_MESSAGE: &str = "Service Discovered!";
pub const IDENTICAL_FIRMWARE_MESSAGE: &str = "Identical Firmware Version!";
pub const STATUS_READ_MESSAGE: &str = "Status Read!";
pub const DISCONNECTED_MESSAGE: &str = "Disconnected";

/// Behaviour knobs of a task handler
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskOptions {
    /// Disconnect once the task reaches Finish, Error or Timeout
    pub auto_disconnect: bool,
    /// Connection attempts before the task fails
    pub max_retries: u32,
}

impl Default for TaskOptions {
    fn default() -> Self {
        Self {
            auto_disconnect: false,
            max_retries: EpdConfig::default().max_retries,
        }
    }
}

impl From<&EpdConfig> for TaskOptions {
    fn from(config: &EpdConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            ..Default::default()
        }
    }
}

#[derive(Default)]
struct TaskState {
    running: bool,
    task: Option<PreparedTask>,
    retry: u32,
    firmware: Option<String>,
    led: Option<LedState>,
}

/// Shared between the handler and its registered connect listener
struct TaskRunner {
    address: DeviceAddress,
    manager: ManagerHandle,
    callback: Arc<dyn TaskHandlerCallback>,
    options: TaskOptions,
    state: Arc<Mutex<TaskState>>,
}

pub struct TaskHandler {
    runner: Arc<TaskRunner>,
}

impl TaskHandler {
    pub fn new(
        manager: ManagerHandle,
        address: DeviceAddress,
        callback: Arc<dyn TaskHandlerCallback>,
        options: TaskOptions,
    ) -> Self {
        Self {
            runner: Arc::new(TaskRunner {
                address,
                manager,
                callback,
                options,
                state: Arc::new(Mutex::new(TaskState::default())),
            }),
        }
    }

    pub fn address(&self) -> &DeviceAddress {
        &self.runner.address
    }

    pub fn is_running(&self) -> bool {
        self.runner.state.lock().running
    }

    /// Start `task` on a fresh connection.
    ///
    /// Returns false without side effects if a task is running, the input is
    /// invalid, or the address is already connected or queued.
    pub async fn start_task(&self, task: Task) -> bool {
        let runner = &self.runner;
        if self.is_running() {
            warn!("Task already executing on {}", runner.address);
            return false;
        }
        let prepared = match prepare(&task) {
            Ok(prepared) => prepared,
            Err(e) => {
                warn!("{:?} task for {} rejected: {}", task.task_type(), runner.address, e);
                return false;
            }
        };
        match runner.manager.is_connected_or_queued(runner.address.clone()).await {
            Ok(false) => {}
            Ok(true) => {
                warn!("{} is already connected or queued", runner.address);
                return false;
            }
            Err(e) => {
                warn!("Cannot start task on {}: {}", runner.address, e);
                return false;
            }
        }

        {
            let mut state = runner.state.lock();
            if state.running {
                return false;
            }
            state.running = true;
            state.task = Some(prepared);
            state.retry = 0;
            state.firmware = None;
            state.led = None;
        }

        let listener: Arc<dyn ConnectListener> = self.runner.clone();
        let admitted = match runner
            .manager
            .set_connect_listener(runner.address.clone(), listener)
            .await
        {
            Ok(()) => runner.manager.connect(runner.address.clone()).await,
            Err(e) => Err(e),
        };
        match admitted {
            Ok(Admission::ConnectedImmediately) | Ok(Admission::Queued) => {
                info!("{:?} task started on {}", task.task_type(), runner.address);
                true
            }
            Ok(Admission::Rejected(reason)) => {
                warn!("Connect to {} rejected: {:?}", runner.address, reason);
                runner.clear();
                false
            }
            Err(e) => {
                warn!("Connect to {} failed: {}", runner.address, e);
                runner.clear();
                false
            }
        }
    }

    /// Cancel the task, drop the listener and disconnect the device
    pub async fn disconnect(&self) -> Result<(), ManagerError> {
        let runner = &self.runner;
        runner.clear();
        runner
            .manager
            .remove_connect_listener(runner.address.clone())
            .await?;
        runner.manager.disconnect(runner.address.clone()).await?;
        Ok(())
    }
}

impl TaskRunner {
    fn clear(&self) {
        let mut state = self.state.lock();
        state.running = false;
        state.task = None;
    }

    fn is_running(&self) -> bool {
        self.state.lock().running
    }

    /// Session reached Ready: run the job
    fn execute(&self) {
        let (task, firmware, led) = {
            let state = self.state.lock();
            if !state.running {
                return;
            }
            (state.task.clone(), state.firmware.clone(), state.led)
        };
        debug!("Executing task on {}", self.address);
        match task {
            Some(PreparedTask::Send(frame)) => self.spawn_send(frame),
            Some(PreparedTask::Firmware { frame, version }) => {
                if firmware.as_deref() == Some(version.as_str()) {
                    info!("{} already runs firmware {}", self.address, version);
                    self.succeed(IDENTICAL_FIRMWARE_MESSAGE);
                } else {
                    self.spawn_send(frame);
                }
            }
            Some(PreparedTask::CheckStatus) => {
                self.callback
                    .on_firmware_read(firmware.as_deref().unwrap_or_default());
                if let Some(led) = led {
                    self.callback.on_led_read(led);
                }
                self.succeed(STATUS_READ_MESSAGE);
            }
            None => {}
        }
    }

    fn spawn_send(&self, frame: Frame) {
        let manager = self.manager.clone();
        let address = self.address.clone();
        let callback = Arc::clone(&self.callback);
        let state = Arc::clone(&self.state);
        let auto_disconnect = self.options.auto_disconnect;
        tokio::spawn(async move {
            match manager.send_frame(address.clone(), frame).await {
                Ok(()) => {}
                // the link went away first; the disconnect drives the retry
                Err(e) if send_error_kind(&e).is_none() => {
                    debug!("Send to {} raced a disconnect", address);
                }
                Err(e) => {
                    warn!("Send to {} failed: {}", address, e);
                    {
                        let mut state = state.lock();
                        state.running = false;
                        state.task = None;
                    }
                    let kind = send_error_kind(&e)
                        .unwrap_or(TaskErrorKind::Platform(GattStatus::FAILURE.0));
                    callback.on_error(&TaskError::new(kind, e.to_string()));
                    if auto_disconnect {
                        let _ = manager.disconnect(address).await;
                    }
                }
            }
        });
    }

    fn succeed(&self, message: &str) {
        self.finish();
        self.callback.on_success(message);
    }

    fn fail(&self, error: TaskError) {
        self.finish();
        self.callback.on_error(&error);
    }

    fn finish(&self) {
        self.clear();
        if self.options.auto_disconnect {
            let manager = self.manager.clone();
            let address = self.address.clone();
            tokio::spawn(async move {
                if let Err(e) = manager.disconnect(address).await {
                    debug!("Auto-disconnect failed: {}", e);
                }
            });
        }
    }

    fn on_image_write(
        &self,
        phase: ImageWritePhase,
        progress: u8,
        message: &str,
        failure: Option<TaskErrorKind>,
    ) {
        match phase {
            ImageWritePhase::Start => self.callback.on_ready(message),
            ImageWritePhase::InProgress => self.callback.on_progress(progress, message),
            ImageWritePhase::Finish => self.succeed(message),
            ImageWritePhase::Error => self.fail(TaskError::new(
                failure.unwrap_or(TaskErrorKind::Platform(GattStatus::FAILURE.0)),
                message,
            )),
            ImageWritePhase::Timeout => self.fail(TaskError::new(
                failure.unwrap_or(TaskErrorKind::TaskTimeout),
                message,
            )),
        }
    }

    fn on_disconnected(&self, reason: DisconnectReason) {
        let retry = {
            let mut state = self.state.lock();
            if !state.running {
                return;
            }
            if reason.is_retryable() {
                state.retry += 1;
            }
            state.retry
        };

        if !reason.is_retryable() {
            warn!("{} disconnected by request during the task", self.address);
            self.clear();
            self.callback.on_error(&TaskError::new(
                TaskErrorKind::ConnectionLost,
                DISCONNECTED_MESSAGE,
            ));
            return;
        }

        let message = format!("Lost Connection! {} times", retry);
        if retry < self.options.max_retries {
            info!("{} ({:?}), retry {}", self.address, reason, retry);
            self.callback.on_ready(&message);
            let manager = self.manager.clone();
            let address = self.address.clone();
            tokio::spawn(async move {
                if let Err(e) = manager.reconnect(address).await {
                    warn!("Reconnect failed: {}", e);
                }
            });
        } else {
            warn!("{} giving up after {} attempts", self.address, retry);
            self.clear();
            let kind = match reason {
                DisconnectReason::ConnectTimeout => TaskErrorKind::ConnectTimeout,
                _ => TaskErrorKind::ConnectionLost,
            };
            self.callback.on_error(&TaskError::new(kind, message));
        }
    }
}

impl ConnectListener for TaskRunner {
    fn on_event(&self, address: &DeviceAddress, event: &ConnectEvent) {
        match event {
            ConnectEvent::FirmwareRead { status, value } if status.is_success() => {
                self.state.lock().firmware = Some(String::from_utf8_lossy(value).into_owned());
                return;
            }
            ConnectEvent::LedRead { status, value } if status.is_success() => {
                self.state.lock().led = value.first().copied().map(LedState::from_byte);
                return;
            }
            _ => {}
        }
        if !self.is_running() {
            debug!("{}: no task running, ignoring {:?}", address, event);
            return;
        }
        match event {
            ConnectEvent::ConnectionState { state, reason } => match state {
                ConnectionState::Connected => self.callback.on_ready(CONNECTED_MESSAGE),
                ConnectionState::Ready => self.execute(),
                ConnectionState::Disconnected => {
                    self.on_disconnected(reason.unwrap_or(DisconnectReason::LinkLost))
                }
                ConnectionState::Connecting | ConnectionState::Disconnecting => {}
            },
            ConnectEvent::ServicesDiscovered(status) if status.is_success() => {
                self.callback.on_ready(SERVICE_DISCOVERED_MESSAGE)
            }
            ConnectEvent::ImageWrite {
                phase,
                progress,
                message,
                failure,
            } => self.on_image_write(*phase, *progress, message, *failure),
            ConnectEvent::ConnectionTimeout(message) => {
                debug!("{}: {}", address, message);
            }
            _ => {}
        }
    }
}

/// Error kind for a failed frame send; `None` when the link went away first
/// and the disconnect will drive the retry
fn send_error_kind(error: &ManagerError) -> Option<TaskErrorKind> {
    match error {
        ManagerError::Session(SessionError::NotReady | SessionError::NotConnected) => None,
        ManagerError::Session(SessionError::Busy) => Some(TaskErrorKind::Busy),
        _ => Some(TaskErrorKind::Platform(GattStatus::FAILURE.0)),
    }
}
