//! GATT handshake: turns a fresh link into a Ready session.
//!
//! One request is outstanding at a time and the order is fixed:
//! connect, discover services, request MTU, enable the four notifications,
//! read the firmware version, read the LED state.

use thiserror::Error;
use tracing::{debug, warn};

use super::GattRequest;
use crate::listener::{ConnectEvent, ConnectionState};
use crate::transport::ble::{
    CharacteristicHandle, CharacteristicTable, GattError, GattEvent, GattRole, GattStatus,
};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HandshakeError {
    #[error("Connect failed with status {0}")]
    ConnectFailed(GattStatus),
    #[error("Service discovery failed with status {0}")]
    DiscoveryFailed(GattStatus),
    #[error(transparent)]
    Characteristics(#[from] GattError),
    #[error("{state:?} failed with status {status}")]
    StepFailed {
        state: HandshakeState,
        status: GattStatus,
    },
    #[error("Platform refused the {state:?} request (status {status})")]
    Refused {
        state: HandshakeState,
        status: GattStatus,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HandshakeState {
    Idle,
    Connecting,
    ServiceDiscovery,
    MtuNegotiation,
    EnableImageIdNotify,
    EnableImageBlockNotify,
    EnableImageStatusNotify,
    EnableDeviceEventNotify,
    ReadFirmware,
    ReadLed,
    Ready,
    Disconnected,
}

impl HandshakeState {
    /// Between the connect request and Ready; the connection timer runs here
    pub fn is_handshaking(&self) -> bool {
        !matches!(
            self,
            HandshakeState::Idle | HandshakeState::Ready | HandshakeState::Disconnected
        )
    }

    fn notify_role(&self) -> Option<GattRole> {
        match self {
            HandshakeState::EnableImageIdNotify => Some(GattRole::ImageIdentify),
            HandshakeState::EnableImageBlockNotify => Some(GattRole::ImageBlock),
            HandshakeState::EnableImageStatusNotify => Some(GattRole::ImageStatus),
            HandshakeState::EnableDeviceEventNotify => Some(GattRole::DeviceEvent),
            _ => None,
        }
    }

    fn after_notify(&self) -> HandshakeState {
        match self {
            HandshakeState::EnableImageIdNotify => HandshakeState::EnableImageBlockNotify,
            HandshakeState::EnableImageBlockNotify => HandshakeState::EnableImageStatusNotify,
            HandshakeState::EnableImageStatusNotify => HandshakeState::EnableDeviceEventNotify,
            _ => HandshakeState::ReadFirmware,
        }
    }
}

/// What the session does after feeding an event to the handshake
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandshakeProgress {
    /// Issue the next request
    Continue(GattRequest),
    Ready,
    Failed(HandshakeError),
    /// Not the completion the current step waits for
    Ignored,
}

#[derive(Debug)]
pub struct Handshake {
    state: HandshakeState,
    mtu: u16,
    negotiated_mtu: Option<u16>,
    table: Option<CharacteristicTable>,
    firmware: Option<String>,
    led: Option<u8>,
}

impl Handshake {
    pub fn new(mtu: u16) -> Self {
        Self {
            state: HandshakeState::Idle,
            mtu,
            negotiated_mtu: None,
            table: None,
            firmware: None,
            led: None,
        }
    }

    pub fn state(&self) -> HandshakeState {
        self.state
    }

    pub fn is_ready(&self) -> bool {
        self.state == HandshakeState::Ready
    }

    pub fn table(&self) -> Option<&CharacteristicTable> {
        self.table.as_ref()
    }

    /// Firmware version read during the handshake (or re-read later)
    pub fn firmware(&self) -> Option<&str> {
        self.firmware.as_deref()
    }

    pub fn set_firmware(&mut self, value: &[u8]) {
        self.firmware = Some(String::from_utf8_lossy(value).into_owned());
    }

    pub fn led(&self) -> Option<u8> {
        self.led
    }

    pub fn set_led(&mut self, value: &[u8]) {
        if let Some(byte) = value.first() {
            self.led = Some(*byte);
        }
    }

    pub fn negotiated_mtu(&self) -> Option<u16> {
        self.negotiated_mtu
    }

    /// Leave Idle; the caller issues the connect request
    pub fn start(&mut self) -> GattRequest {
        self.state = HandshakeState::Connecting;
        GattRequest::Connect
    }

    pub fn mark_disconnected(&mut self) {
        self.state = HandshakeState::Disconnected;
    }

    /// The platform refused the request of the current step
    pub fn request_failed(&mut self, status: GattStatus) -> HandshakeProgress {
        if !self.state.is_handshaking() {
            return HandshakeProgress::Ignored;
        }
        HandshakeProgress::Failed(HandshakeError::Refused {
            state: self.state,
            status,
        })
    }

    /// Feed a completion; listener events are appended to `events`
    pub fn on_event(&mut self, event: &GattEvent, events: &mut Vec<ConnectEvent>) -> HandshakeProgress {
        match (self.state, event) {
            (HandshakeState::Connecting, GattEvent::ConnectionStateChanged { status, connected: true }) => {
                if !status.is_success() {
                    return HandshakeProgress::Failed(HandshakeError::ConnectFailed(*status));
                }
                events.push(ConnectEvent::state(ConnectionState::Connected));
                self.advance(HandshakeState::ServiceDiscovery, GattRequest::DiscoverServices)
            }
            (
                HandshakeState::ServiceDiscovery,
                GattEvent::ServicesDiscovered {
                    status,
                    characteristics,
                },
            ) => {
                events.push(ConnectEvent::ServicesDiscovered(*status));
                if !status.is_success() {
                    return HandshakeProgress::Failed(HandshakeError::DiscoveryFailed(*status));
                }
                match CharacteristicTable::from_discovered(characteristics) {
                    Ok(table) => self.table = Some(table),
                    Err(e) => return HandshakeProgress::Failed(e.into()),
                }
                self.advance(HandshakeState::MtuNegotiation, GattRequest::RequestMtu(self.mtu))
            }
            (HandshakeState::MtuNegotiation, GattEvent::MtuChanged { status, mtu }) => {
                if status.is_success() {
                    self.negotiated_mtu = Some(*mtu);
                } else {
                    // the device still works at the default MTU
                    warn!("MTU negotiation failed with status {}, continuing", status);
                }
                self.enable_notify(HandshakeState::EnableImageIdNotify)
            }
            (
                state,
                GattEvent::NotifyEnabled {
                    status,
                    characteristic,
                },
            ) if state.notify_role().is_some() => {
                let Some(role) = state.notify_role() else {
                    return HandshakeProgress::Ignored;
                };
                if self.handle(role).ok() != Some(*characteristic) {
                    return HandshakeProgress::Ignored;
                }
                if !status.is_success() {
                    return HandshakeProgress::Failed(HandshakeError::StepFailed {
                        state,
                        status: *status,
                    });
                }
                match state.after_notify() {
                    HandshakeState::ReadFirmware => {
                        self.read(HandshakeState::ReadFirmware, GattRole::FirmwareVersion)
                    }
                    next => self.enable_notify(next),
                }
            }
            (
                HandshakeState::ReadFirmware,
                GattEvent::CharacteristicRead {
                    status,
                    characteristic,
                    value,
                },
            ) if self.handle(GattRole::FirmwareVersion).ok() == Some(*characteristic) => {
                events.push(ConnectEvent::FirmwareRead {
                    status: *status,
                    value: value.clone(),
                });
                if !status.is_success() {
                    return HandshakeProgress::Failed(HandshakeError::StepFailed {
                        state: HandshakeState::ReadFirmware,
                        status: *status,
                    });
                }
                self.set_firmware(value);
                self.read(HandshakeState::ReadLed, GattRole::LedControl)
            }
            (
                HandshakeState::ReadLed,
                GattEvent::CharacteristicRead {
                    status,
                    characteristic,
                    value,
                },
            ) if self.handle(GattRole::LedControl).ok() == Some(*characteristic) => {
                events.push(ConnectEvent::LedRead {
                    status: *status,
                    value: value.clone(),
                });
                if !status.is_success() {
                    return HandshakeProgress::Failed(HandshakeError::StepFailed {
                        state: HandshakeState::ReadLed,
                        status: *status,
                    });
                }
                self.set_led(value);
                self.state = HandshakeState::Ready;
                events.push(ConnectEvent::state(ConnectionState::Ready));
                HandshakeProgress::Ready
            }
            (state, other) => {
                debug!("Handshake in {:?} ignoring {:?}", state, other);
                HandshakeProgress::Ignored
            }
        }
    }

    fn handle(&self, role: GattRole) -> Result<CharacteristicHandle, GattError> {
        match &self.table {
            Some(table) => table.get(role),
            None => Err(GattError::NotDiscovered(role)),
        }
    }

    fn advance(&mut self, next: HandshakeState, request: GattRequest) -> HandshakeProgress {
        self.state = next;
        HandshakeProgress::Continue(request)
    }

    fn enable_notify(&mut self, next: HandshakeState) -> HandshakeProgress {
        let Some(role) = next.notify_role() else {
            return HandshakeProgress::Ignored;
        };
        match self.handle(role) {
            Ok(handle) => self.advance(next, GattRequest::EnableNotify(handle)),
            Err(e) => HandshakeProgress::Failed(e.into()),
        }
    }

    fn read(&mut self, next: HandshakeState, role: GattRole) -> HandshakeProgress {
        match self.handle(role) {
            Ok(handle) => self.advance(next, GattRequest::Read(handle)),
            Err(e) => HandshakeProgress::Failed(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::ble::DiscoveredCharacteristic;

    fn handle_for(role: GattRole) -> CharacteristicHandle {
        CharacteristicHandle(GattRole::ALL.iter().position(|r| *r == role).expect("role") as u64)
    }

    fn discovered() -> GattEvent {
        GattEvent::ServicesDiscovered {
            status: GattStatus::SUCCESS,
            characteristics: GattRole::ALL
                .iter()
                .map(|role| DiscoveredCharacteristic {
                    uuid: role.uuid(),
                    handle: handle_for(*role),
                })
                .collect(),
        }
    }

    fn connected() -> GattEvent {
        GattEvent::ConnectionStateChanged {
            status: GattStatus::SUCCESS,
            connected: true,
        }
    }

    fn notify_enabled(role: GattRole) -> GattEvent {
        GattEvent::NotifyEnabled {
            status: GattStatus::SUCCESS,
            characteristic: handle_for(role),
        }
    }

    fn read(role: GattRole, value: &[u8]) -> GattEvent {
        GattEvent::CharacteristicRead {
            status: GattStatus::SUCCESS,
            characteristic: handle_for(role),
            value: value.to_vec(),
        }
    }

    #[test]
    fn test_full_sequence() {
        let mut hs = Handshake::new(251);
        let mut events = Vec::new();
        assert_eq!(hs.start(), GattRequest::Connect);
        assert!(hs.state().is_handshaking());

        assert_eq!(
            hs.on_event(&connected(), &mut events),
            HandshakeProgress::Continue(GattRequest::DiscoverServices)
        );
        assert_eq!(
            hs.on_event(&discovered(), &mut events),
            HandshakeProgress::Continue(GattRequest::RequestMtu(251))
        );
        assert_eq!(
            hs.on_event(
                &GattEvent::MtuChanged {
                    status: GattStatus::SUCCESS,
                    mtu: 247
                },
                &mut events
            ),
            HandshakeProgress::Continue(GattRequest::EnableNotify(handle_for(GattRole::ImageIdentify)))
        );
        assert_eq!(hs.negotiated_mtu(), Some(247));

        for (role, next) in [
            (GattRole::ImageIdentify, GattRequest::EnableNotify(handle_for(GattRole::ImageBlock))),
            (GattRole::ImageBlock, GattRequest::EnableNotify(handle_for(GattRole::ImageStatus))),
            (GattRole::ImageStatus, GattRequest::EnableNotify(handle_for(GattRole::DeviceEvent))),
            (GattRole::DeviceEvent, GattRequest::Read(handle_for(GattRole::FirmwareVersion))),
        ] {
            assert_eq!(hs.on_event(&notify_enabled(role), &mut events), HandshakeProgress::Continue(next));
        }

        assert_eq!(
            hs.on_event(&read(GattRole::FirmwareVersion, b"2.1.0"), &mut events),
            HandshakeProgress::Continue(GattRequest::Read(handle_for(GattRole::LedControl)))
        );
        assert_eq!(
            hs.on_event(&read(GattRole::LedControl, &[0x3B]), &mut events),
            HandshakeProgress::Ready
        );
        assert!(hs.is_ready());
        assert_eq!(hs.firmware(), Some("2.1.0"));
        assert_eq!(hs.led(), Some(0x3B));
        assert_eq!(events.first(), Some(&ConnectEvent::state(ConnectionState::Connected)));
        assert_eq!(events.last(), Some(&ConnectEvent::state(ConnectionState::Ready)));
    }

    #[test]
    fn test_out_of_order_completion_ignored() {
        let mut hs = Handshake::new(251);
        let mut events = Vec::new();
        hs.start();
        hs.on_event(&connected(), &mut events);
        // notify completion before discovery finished
        assert_eq!(
            hs.on_event(&notify_enabled(GattRole::ImageBlock), &mut events),
            HandshakeProgress::Ignored
        );
        assert_eq!(hs.state(), HandshakeState::ServiceDiscovery);
    }

    #[test]
    fn test_wrong_notify_handle_ignored() {
        let mut hs = Handshake::new(251);
        let mut events = Vec::new();
        hs.start();
        hs.on_event(&connected(), &mut events);
        hs.on_event(&discovered(), &mut events);
        hs.on_event(
            &GattEvent::MtuChanged {
                status: GattStatus::SUCCESS,
                mtu: 251,
            },
            &mut events,
        );
        assert_eq!(
            hs.on_event(&notify_enabled(GattRole::ImageStatus), &mut events),
            HandshakeProgress::Ignored
        );
        assert_eq!(hs.state(), HandshakeState::EnableImageIdNotify);
    }

    #[test]
    fn test_mtu_failure_tolerated() {
        let mut hs = Handshake::new(251);
        let mut events = Vec::new();
        hs.start();
        hs.on_event(&connected(), &mut events);
        hs.on_event(&discovered(), &mut events);
        let progress = hs.on_event(
            &GattEvent::MtuChanged {
                status: GattStatus::FAILURE,
                mtu: 23,
            },
            &mut events,
        );
        assert!(matches!(progress, HandshakeProgress::Continue(GattRequest::EnableNotify(_))));
        assert_eq!(hs.negotiated_mtu(), None);
    }

    #[test]
    fn test_missing_characteristic_fails() {
        let mut hs = Handshake::new(251);
        let mut events = Vec::new();
        hs.start();
        hs.on_event(&connected(), &mut events);
        let progress = hs.on_event(
            &GattEvent::ServicesDiscovered {
                status: GattStatus::SUCCESS,
                characteristics: Vec::new(),
            },
            &mut events,
        );
        assert!(matches!(
            progress,
            HandshakeProgress::Failed(HandshakeError::Characteristics(
                GattError::MissingCharacteristics(_)
            ))
        ));
        assert_eq!(events, vec![
            ConnectEvent::state(ConnectionState::Connected),
            ConnectEvent::ServicesDiscovered(GattStatus::SUCCESS),
        ]);
    }

    #[test]
    fn test_failed_read_fails_handshake() {
        let mut hs = Handshake::new(251);
        let mut events = Vec::new();
        hs.start();
        hs.on_event(&connected(), &mut events);
        hs.on_event(&discovered(), &mut events);
        hs.on_event(&GattEvent::MtuChanged { status: GattStatus::SUCCESS, mtu: 251 }, &mut events);
        for role in GattRole::NOTIFY_ORDER {
            hs.on_event(&notify_enabled(role), &mut events);
        }
        let progress = hs.on_event(
            &GattEvent::CharacteristicRead {
                status: GattStatus(5),
                characteristic: handle_for(GattRole::FirmwareVersion),
                value: Vec::new(),
            },
            &mut events,
        );
        assert!(matches!(progress, HandshakeProgress::Failed(HandshakeError::StepFailed { .. })));
    }

    #[test]
    fn test_refused_request() {
        let mut hs = Handshake::new(251);
        assert_eq!(hs.request_failed(GattStatus::FAILURE), HandshakeProgress::Ignored);
        hs.start();
        assert!(matches!(
            hs.request_failed(GattStatus::FAILURE),
            HandshakeProgress::Failed(HandshakeError::Refused { .. })
        ));
    }

    #[test]
    fn test_firmware_lossy_utf8() {
        let mut hs = Handshake::new(251);
        hs.set_firmware(&[b'v', 0xFF, b'1']);
        assert_eq!(hs.firmware(), Some("v\u{FFFD}1"));
    }
}
