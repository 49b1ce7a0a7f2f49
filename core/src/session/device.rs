//! One peripheral's session: connection handle, handshake, timers and the
//! in-flight transfer or direct operation.

use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::handshake::{Handshake, HandshakeProgress, HandshakeState};
use super::timer::TimerKind;
use super::transfer::{Transfer, TransferStep};
use super::{GattRequest, SessionAction, SessionError};
use crate::config::EpdConfig;
use crate::listener::{ConnectEvent, ConnectionState, DisconnectReason};
use crate::protocol::status::CONNECT_TIMEOUT_MESSAGE;
use crate::protocol::{DeviceEvent, Frame, LedState};
use crate::transport::ble::{
    CharacteristicHandle, ConnectionHandle, GattEvent, GattRole, GattStatus,
};

/// Durations a session arms its timers with
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionTiming {
    pub mtu: u16,
    pub connect_timeout: Duration,
    pub task_timeout: Duration,
    pub settle_delay: Duration,
}

impl Default for SessionTiming {
    fn default() -> Self {
        Self::from(&EpdConfig::default())
    }
}

impl From<&EpdConfig> for SessionTiming {
    fn from(config: &EpdConfig) -> Self {
        Self {
            mtu: config.mtu,
            connect_timeout: Duration::from_millis(config.connect_timeout_ms),
            task_timeout: Duration::from_millis(config.task_timeout_ms),
            settle_delay: Duration::from_millis(config.settle_delay_ms),
        }
    }
}

/// Direct operation on a Ready session
#[derive(Debug, Clone, PartialEq, Eq)]
enum Pending {
    WriteLed(Vec<u8>),
    ReadFirmware,
    ReadLed,
}

pub struct DeviceSession {
    connection: ConnectionHandle,
    timing: SessionTiming,
    handshake: Handshake,
    transfer: Option<Transfer>,
    pending: Option<Pending>,
    /// Set once teardown started; holds the reason reported on release
    closing: Option<DisconnectReason>,
}

impl DeviceSession {
    pub fn new(connection: ConnectionHandle, timing: SessionTiming) -> Self {
        Self {
            connection,
            timing,
            handshake: Handshake::new(timing.mtu),
            transfer: None,
            pending: None,
            closing: None,
        }
    }

    pub fn connection(&self) -> &ConnectionHandle {
        &self.connection
    }

    pub fn state(&self) -> HandshakeState {
        self.handshake.state()
    }

    pub fn is_ready(&self) -> bool {
        self.closing.is_none() && self.handshake.is_ready()
    }

    pub fn is_closing(&self) -> bool {
        self.closing.is_some()
    }

    pub fn firmware(&self) -> Option<&str> {
        self.handshake.firmware()
    }

    pub fn led(&self) -> Option<LedState> {
        self.handshake.led().map(LedState::from_byte)
    }

    /// Progress of the in-flight transfer
    pub fn transfer_progress(&self) -> Option<u8> {
        self.transfer.as_ref().map(Transfer::progress)
    }

    /// Start connecting
    pub fn open(&mut self) -> Vec<SessionAction> {
        info!("Opening session {}", self.connection);
        let request = self.handshake.start();
        vec![
            SessionAction::Notify(ConnectEvent::state(ConnectionState::Connecting)),
            SessionAction::ArmTimer(TimerKind::Connection, self.timing.connect_timeout),
            SessionAction::Request(request),
        ]
    }

    /// Feed a platform completion or notification
    pub fn handle_event(&mut self, event: GattEvent, now: Instant) -> Vec<SessionAction> {
        if let GattEvent::ConnectionStateChanged {
            connected: false,
            status,
        } = &event
        {
            return self.link_down(*status);
        }
        if self.closing.is_some() {
            debug!("Session {} closing, dropping {:?}", self.connection, event);
            return Vec::new();
        }
        if self.handshake.state().is_handshaking() {
            return self.handshake_event(&event);
        }
        if self.handshake.is_ready() {
            return self.ready_event(event, now);
        }
        debug!("Session {} in {:?} ignoring {:?}", self.connection, self.state(), event);
        Vec::new()
    }

    /// The platform refused `request`
    pub fn request_failed(&mut self, request: &GattRequest, status: GattStatus) -> Vec<SessionAction> {
        if request.is_teardown() || self.closing.is_some() {
            debug!("Session {}: {:?} refused during teardown", self.connection, request);
            return Vec::new();
        }
        warn!("Session {}: {:?} refused with status {}", self.connection, request, status);
        if self.handshake.state().is_handshaking() {
            let progress = self.handshake.request_failed(status);
            let mut actions = Vec::new();
            self.apply_handshake(progress, &mut actions);
            return actions;
        }
        if let Some(pending) = self.pending.take() {
            return vec![SessionAction::Notify(Self::pending_failed(pending, status))];
        }
        match self.transfer.as_mut() {
            Some(transfer) => {
                let step = transfer.on_request_failed(status);
                self.apply_transfer(step)
            }
            None => Vec::new(),
        }
    }

    /// A session timer fired (already checked for staleness)
    pub fn timer_fired(&mut self, kind: TimerKind) -> Vec<SessionAction> {
        match kind {
            TimerKind::Connection if self.closing.is_none() && self.handshake.state().is_handshaking() => {
                warn!("Session {} connect timeout in {:?}", self.connection, self.state());
                let mut actions = vec![SessionAction::Notify(ConnectEvent::ConnectionTimeout(
                    CONNECT_TIMEOUT_MESSAGE.to_string(),
                ))];
                actions.extend(self.disconnect(DisconnectReason::ConnectTimeout));
                actions
            }
            TimerKind::Task if self.closing.is_none() => match self.transfer.as_mut() {
                Some(transfer) => {
                    let step = transfer.on_timeout();
                    self.apply_transfer(step)
                }
                None => Vec::new(),
            },
            TimerKind::Settle => match self.closing {
                Some(reason) => self.release(reason),
                None => Vec::new(),
            },
            _ => Vec::new(),
        }
    }

    /// Begin a transfer on a Ready session
    pub fn send_frame(&mut self, frame: Frame, now: Instant) -> Result<Vec<SessionAction>, SessionError> {
        self.check_idle()?;
        let table = self.handshake.table().ok_or(SessionError::NotReady)?;
        let identify = table.get(GattRole::ImageIdentify)?;
        let block = table.get(GattRole::ImageBlock)?;
        let mut transfer = Transfer::new(frame, identify, block, now);
        let step = transfer.start();
        self.transfer = Some(transfer);

        let mut actions = vec![SessionAction::ArmTimer(TimerKind::Task, self.timing.task_timeout)];
        actions.extend(self.apply_transfer(step));
        Ok(actions)
    }

    pub fn write_led(&mut self, led: LedState) -> Result<Vec<SessionAction>, SessionError> {
        self.check_idle()?;
        let handle = self.role_handle(GattRole::LedControl)?;
        let value = vec![led.to_byte()];
        debug!("Session {} writing LED {}", self.connection, led);
        self.pending = Some(Pending::WriteLed(value.clone()));
        Ok(vec![SessionAction::Request(GattRequest::Write(handle, value))])
    }

    pub fn read_firmware(&mut self) -> Result<Vec<SessionAction>, SessionError> {
        self.check_idle()?;
        let handle = self.role_handle(GattRole::FirmwareVersion)?;
        self.pending = Some(Pending::ReadFirmware);
        Ok(vec![SessionAction::Request(GattRequest::Read(handle))])
    }

    pub fn read_led(&mut self) -> Result<Vec<SessionAction>, SessionError> {
        self.check_idle()?;
        let handle = self.role_handle(GattRole::LedControl)?;
        self.pending = Some(Pending::ReadLed);
        Ok(vec![SessionAction::Request(GattRequest::Read(handle))])
    }

    /// Single cancellation path: stop timers, drop the transfer, ask the
    /// platform to disconnect and release after the settle delay.
    pub fn disconnect(&mut self, reason: DisconnectReason) -> Vec<SessionAction> {
        if self.closing.is_some() {
            return Vec::new();
        }
        info!("Disconnecting {} ({:?})", self.connection, reason);
        self.closing = Some(reason);
        self.handshake.mark_disconnected();
        if self.transfer.take().is_some() {
            debug!("Session {} discarding in-flight transfer", self.connection);
        }
        self.pending = None;
        vec![
            SessionAction::CancelTimer(TimerKind::Connection),
            SessionAction::CancelTimer(TimerKind::Task),
            SessionAction::Notify(ConnectEvent::state(ConnectionState::Disconnecting)),
            SessionAction::Request(GattRequest::Disconnect),
            SessionAction::ArmTimer(TimerKind::Settle, self.timing.settle_delay),
        ]
    }

    fn check_idle(&self) -> Result<(), SessionError> {
        if !self.is_ready() {
            return Err(SessionError::NotReady);
        }
        if self.transfer.is_some() || self.pending.is_some() {
            return Err(SessionError::Busy);
        }
        Ok(())
    }

    fn role_handle(&self, role: GattRole) -> Result<CharacteristicHandle, SessionError> {
        let table = self.handshake.table().ok_or(SessionError::NotReady)?;
        Ok(table.get(role)?)
    }

    fn link_down(&mut self, status: GattStatus) -> Vec<SessionAction> {
        if self.closing.is_some() {
            // requested disconnect completed; the settle timer releases
            debug!("Session {} link closed", self.connection);
            return Vec::new();
        }
        warn!("Session {} lost the link (status {}) in {:?}", self.connection, status, self.state());
        self.closing = Some(DisconnectReason::LinkLost);
        self.handshake.mark_disconnected();
        self.transfer = None;
        self.pending = None;
        let mut actions = vec![
            SessionAction::CancelTimer(TimerKind::Connection),
            SessionAction::CancelTimer(TimerKind::Task),
        ];
        actions.extend(self.release(DisconnectReason::LinkLost));
        actions
    }

    fn release(&mut self, reason: DisconnectReason) -> Vec<SessionAction> {
        vec![
            SessionAction::CancelTimer(TimerKind::Settle),
            SessionAction::Request(GattRequest::Close),
            SessionAction::Notify(ConnectEvent::ConnectionState {
                state: ConnectionState::Disconnected,
                reason: Some(reason),
            }),
            SessionAction::Release(reason),
        ]
    }

    fn handshake_event(&mut self, event: &GattEvent) -> Vec<SessionAction> {
        let mut events = Vec::new();
        let progress = self.handshake.on_event(event, &mut events);
        let mut actions: Vec<SessionAction> = events.into_iter().map(SessionAction::Notify).collect();
        self.apply_handshake(progress, &mut actions);
        actions
    }

    fn apply_handshake(&mut self, progress: HandshakeProgress, actions: &mut Vec<SessionAction>) {
        match progress {
            HandshakeProgress::Continue(request) => actions.push(SessionAction::Request(request)),
            HandshakeProgress::Ready => {
                info!("Session {} ready, firmware {:?}", self.connection, self.firmware());
                actions.insert(0, SessionAction::CancelTimer(TimerKind::Connection));
            }
            HandshakeProgress::Failed(e) => {
                warn!("Session {} handshake failed: {}", self.connection, e);
                actions.extend(self.disconnect(DisconnectReason::HandshakeFailed));
            }
            HandshakeProgress::Ignored => {}
        }
    }

    fn ready_event(&mut self, event: GattEvent, now: Instant) -> Vec<SessionAction> {
        let Some(table) = self.handshake.table() else {
            return Vec::new();
        };
        match event {
            GattEvent::Notification {
                characteristic,
                value,
            } => match table.role_of(characteristic) {
                Some(GattRole::DeviceEvent) => self.device_event(&value),
                Some(role @ (GattRole::ImageIdentify | GattRole::ImageBlock | GattRole::ImageStatus)) => {
                    let Some(transfer) = self.transfer.as_mut() else {
                        debug!("Session {}: {} notification without transfer", self.connection, role);
                        return Vec::new();
                    };
                    let step = match role {
                        GattRole::ImageIdentify => transfer.on_identify_notify(),
                        GattRole::ImageBlock => transfer.on_block_ack(&value),
                        _ => transfer.on_status(&value, now),
                    };
                    self.apply_transfer(step)
                }
                other => {
                    debug!("Session {}: notification on {:?} dropped", self.connection, other);
                    Vec::new()
                }
            },
            GattEvent::CharacteristicWritten {
                status,
                characteristic,
            } => {
                let role = table.role_of(characteristic);
                if role == Some(GattRole::LedControl)
                    && matches!(self.pending, Some(Pending::WriteLed(_)))
                {
                    if let Some(Pending::WriteLed(value)) = self.pending.take() {
                        return vec![SessionAction::Notify(ConnectEvent::LedWrite { status, value })];
                    }
                }
                match self.transfer.as_mut() {
                    Some(transfer) => {
                        let step = transfer.on_write_complete(characteristic, status);
                        self.apply_transfer(step)
                    }
                    None => Vec::new(),
                }
            }
            GattEvent::CharacteristicRead {
                status,
                characteristic,
                value,
            } => {
                let role = table.role_of(characteristic);
                match (role, self.pending.take()) {
                    (Some(GattRole::FirmwareVersion), Some(Pending::ReadFirmware)) => {
                        if status.is_success() {
                            self.handshake.set_firmware(&value);
                        }
                        vec![SessionAction::Notify(ConnectEvent::FirmwareRead { status, value })]
                    }
                    (Some(GattRole::LedControl), Some(Pending::ReadLed)) => {
                        if status.is_success() {
                            self.handshake.set_led(&value);
                        }
                        vec![SessionAction::Notify(ConnectEvent::LedRead { status, value })]
                    }
                    (_, pending) => {
                        self.pending = pending;
                        debug!("Session {}: unexpected read of {:?}", self.connection, role);
                        Vec::new()
                    }
                }
            }
            other => {
                debug!("Session {} ready, ignoring {:?}", self.connection, other);
                Vec::new()
            }
        }
    }

    fn device_event(&self, value: &[u8]) -> Vec<SessionAction> {
        match DeviceEvent::parse(value) {
            Some(DeviceEvent::Alarm(alarm)) => {
                vec![SessionAction::Notify(ConnectEvent::AlarmDetected(alarm))]
            }
            Some(DeviceEvent::Refresh { success, page }) => {
                vec![SessionAction::Notify(ConnectEvent::ImageRefresh { success, page })]
            }
            None => {
                debug!("Session {}: unknown device event {:02x?}", self.connection, value);
                Vec::new()
            }
        }
    }

    fn apply_transfer(&mut self, step: TransferStep) -> Vec<SessionAction> {
        let mut actions: Vec<SessionAction> = Vec::new();
        if step.outcome.is_some() {
            self.transfer = None;
            actions.push(SessionAction::CancelTimer(TimerKind::Task));
        }
        if let Some(request) = step.request {
            actions.push(SessionAction::Request(request));
        }
        actions.extend(step.events.into_iter().map(SessionAction::Notify));
        actions
    }

    fn pending_failed(pending: Pending, status: GattStatus) -> ConnectEvent {
        match pending {
            Pending::WriteLed(value) => ConnectEvent::LedWrite { status, value },
            Pending::ReadFirmware => ConnectEvent::FirmwareRead {
                status,
                value: Vec::new(),
            },
            Pending::ReadLed => ConnectEvent::LedRead {
                status,
                value: Vec::new(),
            },
        }
    }
}
