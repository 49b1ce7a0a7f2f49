// Simulated EPD peripheral
//
// An in-process `BlePlatform` that behaves like a device of this family: it
// exposes the six characteristics, acknowledges the frame header and every
// block on Image-Block, checks the frame CRC and reports a status byte. Events
// are emitted synchronously from inside the request that causes them, the way a
// platform stack delivers completions.
//
// Used by the integration tests and by `epdlink simulate`.

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

use super::gatt::{CharacteristicHandle, DiscoveredCharacteristic, GattRole, GattStatus};
use super::platform::{
    BlePlatform, ConnectionHandle, DeviceAddress, GattEvent, PlatformError, PlatformEvent,
    PlatformEventHandler,
};
use crate::protocol::crc::crc16_ccitt;
use crate::protocol::frame::{BLOCK_LEN, HEADER_LEN};

/// Status used when the link drops
const STATUS_LINK_LOST: GattStatus = GattStatus(8);

/// Behaviour of one simulated device
#[derive(Debug, Clone)]
pub struct SimDevice {
    pub name: String,
    pub rssi: i16,
    pub alarm: bool,
    pub firmware_version: String,
    pub led: u8,
    /// Status byte reported after the last block; `None` never answers
    pub status: Option<u8>,
    /// Number of connections that lose the link during service discovery
    pub handshake_drops: u32,
    /// Number of transfers that lose the link right after the header write
    pub transfer_drops: u32,
    /// Accept connect requests but never complete them
    pub never_connect: bool,
    /// Answer the header write with an Image-Identify notification
    pub reject_identify: bool,
    /// Report the MTU request as failed
    pub fail_mtu: bool,
    /// Leave this role out of service discovery
    pub missing_role: Option<GattRole>,
}

impl SimDevice {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            rssi: -55,
            alarm: false,
            firmware_version: "1.0.0".to_string(),
            led: 0b10_10_10,
            status: Some(0x00),
            handshake_drops: 0,
            transfer_drops: 0,
            never_connect: false,
            reject_identify: false,
            fail_mtu: false,
            missing_role: None,
        }
    }
}

/// A request the simulator received, in call order
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlatformCall {
    StartScan,
    StopScan,
    Connect(DeviceAddress),
    Disconnect(DeviceAddress),
    Close(DeviceAddress),
    DiscoverServices(DeviceAddress),
    RequestMtu(DeviceAddress, u16),
    Read(DeviceAddress, GattRole),
    Write(DeviceAddress, GattRole, Vec<u8>),
    EnableNotify(DeviceAddress, GattRole),
}

#[derive(Debug, Default)]
struct Transfer {
    frame: Vec<u8>,
    total_blocks: usize,
    next_block: usize,
}

#[derive(Debug)]
struct DeviceState {
    config: SimDevice,
    connection: Option<ConnectionHandle>,
    connected: bool,
    connections: u32,
    transfers: u32,
    transfer: Option<Transfer>,
    last_frame: Option<Vec<u8>>,
}

/// Scriptable stand-in for a BLE stack with EPD devices in range
pub struct SimulatedPeripheral {
    devices: RwLock<HashMap<DeviceAddress, Mutex<DeviceState>>>,
    handler: RwLock<Option<Arc<PlatformEventHandler>>>,
    calls: Mutex<Vec<PlatformCall>>,
}

impl Default for SimulatedPeripheral {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedPeripheral {
    pub fn new() -> Self {
        Self {
            devices: RwLock::new(HashMap::new()),
            handler: RwLock::new(None),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Put a device in range
    pub fn add_device(&self, address: impl Into<DeviceAddress>, device: SimDevice) {
        self.devices.write().insert(
            address.into(),
            Mutex::new(DeviceState {
                config: device,
                connection: None,
                connected: false,
                connections: 0,
                transfers: 0,
                transfer: None,
                last_frame: None,
            }),
        );
    }

    /// Every request received so far
    pub fn calls(&self) -> Vec<PlatformCall> {
        self.calls.lock().clone()
    }

    pub fn clear_calls(&self) {
        self.calls.lock().clear();
    }

    /// Number of `connect` requests issued for `address`
    pub fn connect_count(&self, address: &DeviceAddress) -> usize {
        self.calls
            .lock()
            .iter()
            .filter(|call| matches!(call, PlatformCall::Connect(a) if a == address))
            .count()
    }

    pub fn is_connected(&self, address: &DeviceAddress) -> bool {
        self.with_device(address, |state| state.connected)
            .unwrap_or(false)
    }

    /// Firmware version currently reported by the device
    pub fn firmware_version(&self, address: &DeviceAddress) -> Option<String> {
        self.with_device(address, |state| state.config.firmware_version.clone())
    }

    /// Current LED byte
    pub fn led(&self, address: &DeviceAddress) -> Option<u8> {
        self.with_device(address, |state| state.config.led)
    }

    /// Frame bytes (header and blocks) of the last completed transfer
    pub fn last_frame(&self, address: &DeviceAddress) -> Option<Vec<u8>> {
        self.with_device(address, |state| state.last_frame.clone())
            .flatten()
    }

    /// Emit a Device-Event notification on the current connection
    pub fn emit_device_event(&self, address: &DeviceAddress, value: Vec<u8>) {
        let event = self.with_device(address, |state| {
            let connection = state.connection.clone().filter(|_| state.connected)?;
            Some(PlatformEvent::Gatt {
                connection,
                event: GattEvent::Notification {
                    characteristic: handle_of(GattRole::DeviceEvent),
                    value,
                },
            })
        });
        if let Some(event) = event.flatten() {
            self.emit(event);
        }
    }

    /// Drop the link as if the device went out of range
    pub fn drop_link(&self, address: &DeviceAddress) {
        let event = self.with_device(address, |state| {
            if !state.connected {
                return None;
            }
            state.connected = false;
            state.transfer = None;
            state.connection.clone().map(link_lost)
        });
        if let Some(event) = event.flatten() {
            self.emit(event);
        }
    }

    fn record(&self, call: PlatformCall) {
        self.calls.lock().push(call);
    }

    fn emit(&self, event: PlatformEvent) {
        let handler = self.handler.read().clone();
        match handler {
            Some(handler) => handler(event),
            None => debug!("Simulator event dropped, no handler: {:?}", event),
        }
    }

    fn emit_all(&self, events: Vec<PlatformEvent>) {
        for event in events {
            self.emit(event);
        }
    }

    fn with_device<R>(
        &self,
        address: &DeviceAddress,
        f: impl FnOnce(&mut DeviceState) -> R,
    ) -> Option<R> {
        let devices = self.devices.read();
        let state = devices.get(address)?;
        let mut state = state.lock();
        Some(f(&mut state))
    }

    /// Run `f` against a connected device whose current connection is `connection`
    fn on_connection(
        &self,
        connection: &ConnectionHandle,
        f: impl FnOnce(&mut DeviceState) -> Vec<GattEvent>,
    ) -> Result<(), PlatformError> {
        let events = self
            .with_device(&connection.address, |state| {
                if !state.connected || state.connection.as_ref() != Some(connection) {
                    return Err(PlatformError::Refused(GattStatus::FAILURE));
                }
                Ok(f(state))
            })
            .ok_or_else(|| PlatformError::UnknownDevice(connection.address.clone()))??;
        self.emit_all(
            events
                .into_iter()
                .map(|event| PlatformEvent::Gatt {
                    connection: connection.clone(),
                    event,
                })
                .collect(),
        );
        Ok(())
    }
}

fn handle_of(role: GattRole) -> CharacteristicHandle {
    let index = GattRole::ALL
        .iter()
        .position(|r| *r == role)
        .unwrap_or_default();
    CharacteristicHandle(0x0100 + index as u64)
}

fn role_of(handle: CharacteristicHandle) -> Option<GattRole> {
    GattRole::ALL.into_iter().find(|role| handle_of(*role) == handle)
}

fn link_lost(connection: ConnectionHandle) -> PlatformEvent {
    PlatformEvent::Gatt {
        connection,
        event: GattEvent::ConnectionStateChanged {
            status: STATUS_LINK_LOST,
            connected: false,
        },
    }
}

fn advertisement(device: &SimDevice) -> Vec<u8> {
    vec![
        0x02, 0x01, 0x06, // flags
        0x04, 0xFF, device.alarm as u8, 0x00, 0x00,
    ]
}

/// Handle a header write: parse the announced length and expect that many blocks
fn begin_transfer(state: &mut DeviceState, header: &[u8]) -> Vec<GattEvent> {
    let identify = handle_of(GattRole::ImageIdentify);
    let mut events = vec![GattEvent::CharacteristicWritten {
        status: GattStatus::SUCCESS,
        characteristic: identify,
    }];
    if state.config.reject_identify || header.len() != HEADER_LEN {
        events.push(GattEvent::Notification {
            characteristic: identify,
            value: vec![0x00],
        });
        return events;
    }

    state.transfers += 1;
    if state.transfers <= state.config.transfer_drops {
        state.connected = false;
        events.push(GattEvent::ConnectionStateChanged {
            status: STATUS_LINK_LOST,
            connected: false,
        });
        return events;
    }

    let total_len = u32::from_le_bytes([header[3], header[4], header[5], header[6]]) as usize;
    let payload_len = total_len.saturating_sub(HEADER_LEN);
    state.transfer = Some(Transfer {
        frame: header.to_vec(),
        total_blocks: payload_len.div_ceil(BLOCK_LEN),
        next_block: 0,
    });
    events.push(GattEvent::Notification {
        characteristic: handle_of(GattRole::ImageBlock),
        value: 0u16.to_le_bytes().to_vec(),
    });
    events
}

/// Handle one block write, acknowledging it and reporting status after the last
fn receive_block(state: &mut DeviceState, packet: &[u8]) -> Vec<GattEvent> {
    let block_handle = handle_of(GattRole::ImageBlock);
    let mut events = vec![GattEvent::CharacteristicWritten {
        status: GattStatus::SUCCESS,
        characteristic: block_handle,
    }];
    let Some(transfer) = state.transfer.as_mut() else {
        return events;
    };
    if packet.len() < 2 {
        return events;
    }
    let index = u16::from_le_bytes([packet[0], packet[1]]) as usize;
    if index != transfer.next_block || index >= transfer.total_blocks {
        state.transfer = None;
        events.push(GattEvent::Notification {
            characteristic: handle_of(GattRole::ImageStatus),
            value: vec![0x03],
        });
        return events;
    }
    transfer.frame.extend_from_slice(&packet[2..]);
    transfer.next_block += 1;
    if index > 0 {
        events.push(GattEvent::Notification {
            characteristic: block_handle,
            value: (index as u16).to_le_bytes().to_vec(),
        });
    }
    if transfer.next_block < transfer.total_blocks {
        return events;
    }

    let Some(transfer) = state.transfer.take() else {
        return events;
    };
    let status = if crc_matches(&transfer.frame) {
        state.config.status
    } else {
        Some(0x01)
    };
    state.last_frame = Some(transfer.frame);
    if let Some(status) = status {
        events.push(GattEvent::Notification {
            characteristic: handle_of(GattRole::ImageStatus),
            value: vec![status],
        });
    }
    events
}

fn crc_matches(frame: &[u8]) -> bool {
    if frame.len() < HEADER_LEN {
        return false;
    }
    let total_len = u32::from_le_bytes([frame[3], frame[4], frame[5], frame[6]]) as usize;
    // The announced length counts the CRC prefix as part of the 32-byte header
    let Some(covered) = frame.get(2..total_len) else {
        return false;
    };
    crc16_ccitt(covered) == u16::from_le_bytes([frame[0], frame[1]])
}

#[async_trait]
impl BlePlatform for SimulatedPeripheral {
    async fn start_scan(&self) -> Result<(), PlatformError> {
        self.record(PlatformCall::StartScan);
        let results: Vec<PlatformEvent> = self
            .devices
            .read()
            .iter()
            .map(|(address, state)| {
                let state = state.lock();
                PlatformEvent::ScanResult {
                    address: address.clone(),
                    name: Some(state.config.name.clone()),
                    rssi: state.config.rssi,
                    advertisement: advertisement(&state.config),
                }
            })
            .collect();
        self.emit_all(results);
        Ok(())
    }

    async fn stop_scan(&self) -> Result<(), PlatformError> {
        self.record(PlatformCall::StopScan);
        Ok(())
    }

    async fn connect(&self, connection: &ConnectionHandle) -> Result<(), PlatformError> {
        self.record(PlatformCall::Connect(connection.address.clone()));
        let event = self
            .with_device(&connection.address, |state| {
                state.connection = Some(connection.clone());
                state.transfer = None;
                if state.config.never_connect {
                    return None;
                }
                state.connections += 1;
                state.connected = true;
                Some(PlatformEvent::Gatt {
                    connection: connection.clone(),
                    event: GattEvent::ConnectionStateChanged {
                        status: GattStatus::SUCCESS,
                        connected: true,
                    },
                })
            })
            .ok_or_else(|| PlatformError::UnknownDevice(connection.address.clone()))?;
        if let Some(event) = event {
            self.emit(event);
        }
        Ok(())
    }

    async fn disconnect(&self, connection: &ConnectionHandle) -> Result<(), PlatformError> {
        self.record(PlatformCall::Disconnect(connection.address.clone()));
        let event = self.with_device(&connection.address, |state| {
            if state.connection.as_ref() != Some(connection) || !state.connected {
                return None;
            }
            state.connected = false;
            state.transfer = None;
            Some(PlatformEvent::Gatt {
                connection: connection.clone(),
                event: GattEvent::ConnectionStateChanged {
                    status: GattStatus::SUCCESS,
                    connected: false,
                },
            })
        });
        if let Some(event) = event.flatten() {
            self.emit(event);
        }
        Ok(())
    }

    async fn close(&self, connection: &ConnectionHandle) -> Result<(), PlatformError> {
        self.record(PlatformCall::Close(connection.address.clone()));
        self.with_device(&connection.address, |state| {
            if state.connection.as_ref() == Some(connection) {
                state.connection = None;
                state.connected = false;
                state.transfer = None;
            }
        });
        Ok(())
    }

    async fn discover_services(&self, connection: &ConnectionHandle) -> Result<(), PlatformError> {
        self.record(PlatformCall::DiscoverServices(connection.address.clone()));
        self.on_connection(connection, |state| {
            if state.connections <= state.config.handshake_drops {
                state.connected = false;
                return vec![GattEvent::ConnectionStateChanged {
                    status: STATUS_LINK_LOST,
                    connected: false,
                }];
            }
            let characteristics = GattRole::ALL
                .into_iter()
                .filter(|role| Some(*role) != state.config.missing_role)
                .map(|role| DiscoveredCharacteristic {
                    uuid: role.uuid(),
                    handle: handle_of(role),
                })
                .collect();
            vec![GattEvent::ServicesDiscovered {
                status: GattStatus::SUCCESS,
                characteristics,
            }]
        })
    }

    async fn request_mtu(
        &self,
        connection: &ConnectionHandle,
        mtu: u16,
    ) -> Result<(), PlatformError> {
        self.record(PlatformCall::RequestMtu(connection.address.clone(), mtu));
        self.on_connection(connection, |state| {
            let status = if state.config.fail_mtu {
                GattStatus::FAILURE
            } else {
                GattStatus::SUCCESS
            };
            vec![GattEvent::MtuChanged { status, mtu }]
        })
    }

    async fn read_characteristic(
        &self,
        connection: &ConnectionHandle,
        characteristic: CharacteristicHandle,
    ) -> Result<(), PlatformError> {
        let role = role_of(characteristic).ok_or(PlatformError::Refused(GattStatus::FAILURE))?;
        self.record(PlatformCall::Read(connection.address.clone(), role));
        self.on_connection(connection, |state| {
            let (status, value) = match role {
                GattRole::FirmwareVersion => (
                    GattStatus::SUCCESS,
                    state.config.firmware_version.as_bytes().to_vec(),
                ),
                GattRole::LedControl => (GattStatus::SUCCESS, vec![state.config.led]),
                // read not permitted
                _ => (GattStatus(2), Vec::new()),
            };
            vec![GattEvent::CharacteristicRead {
                status,
                characteristic,
                value,
            }]
        })
    }

    async fn write_characteristic(
        &self,
        connection: &ConnectionHandle,
        characteristic: CharacteristicHandle,
        value: Vec<u8>,
    ) -> Result<(), PlatformError> {
        let role = role_of(characteristic).ok_or(PlatformError::Refused(GattStatus::FAILURE))?;
        self.record(PlatformCall::Write(
            connection.address.clone(),
            role,
            value.clone(),
        ));
        self.on_connection(connection, |state| match role {
            GattRole::LedControl => {
                if let Some(byte) = value.first() {
                    state.config.led = *byte;
                }
                vec![GattEvent::CharacteristicWritten {
                    status: GattStatus::SUCCESS,
                    characteristic,
                }]
            }
            GattRole::ImageIdentify => begin_transfer(state, &value),
            GattRole::ImageBlock => receive_block(state, &value),
            // write not permitted
            _ => vec![GattEvent::CharacteristicWritten {
                status: GattStatus(3),
                characteristic,
            }],
        })
    }

    async fn enable_notify(
        &self,
        connection: &ConnectionHandle,
        characteristic: CharacteristicHandle,
    ) -> Result<(), PlatformError> {
        let role = role_of(characteristic).ok_or(PlatformError::Refused(GattStatus::FAILURE))?;
        self.record(PlatformCall::EnableNotify(connection.address.clone(), role));
        self.on_connection(connection, |_| {
            vec![GattEvent::NotifyEnabled {
                status: GattStatus::SUCCESS,
                characteristic,
            }]
        })
    }

    fn set_event_handler(&self, handler: PlatformEventHandler) {
        *self.handler.write() = Some(Arc::new(handler));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::frame::Frame;
    use crate::transport::ble::platform::ConnectionId;

    fn collecting(sim: &SimulatedPeripheral) -> Arc<Mutex<Vec<PlatformEvent>>> {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        sim.set_event_handler(Box::new(move |event| sink.lock().push(event)));
        events
    }

    fn gatt_events(events: &Arc<Mutex<Vec<PlatformEvent>>>) -> Vec<GattEvent> {
        events
            .lock()
            .iter()
            .filter_map(|e| match e {
                PlatformEvent::Gatt { event, .. } => Some(event.clone()),
                _ => None,
            })
            .collect()
    }

    fn handle(address: &str) -> ConnectionHandle {
        ConnectionHandle::new(DeviceAddress::from(address), ConnectionId(1))
    }

    #[tokio::test]
    async fn test_connect_and_discover() {
        let sim = SimulatedPeripheral::new();
        sim.add_device("dev", SimDevice::new("Advantech_EPD-250"));
        let events = collecting(&sim);
        let conn = handle("dev");

        sim.connect(&conn).await.expect("connect accepted");
        sim.discover_services(&conn).await.expect("discover accepted");

        let gatt = gatt_events(&events);
        assert_eq!(
            gatt[0],
            GattEvent::ConnectionStateChanged {
                status: GattStatus::SUCCESS,
                connected: true
            }
        );
        match &gatt[1] {
            GattEvent::ServicesDiscovered {
                characteristics, ..
            } => assert_eq!(characteristics.len(), 6),
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_unknown_device_refused() {
        let sim = SimulatedPeripheral::new();
        let result = sim.connect(&handle("nobody")).await;
        assert!(matches!(result, Err(PlatformError::UnknownDevice(_))));
    }

    #[tokio::test]
    async fn test_handshake_drop() {
        let sim = SimulatedPeripheral::new();
        let mut device = SimDevice::new("Advantech_EPD-250");
        device.handshake_drops = 1;
        sim.add_device("dev", device);
        let events = collecting(&sim);
        let conn = handle("dev");

        sim.connect(&conn).await.expect("connect");
        sim.discover_services(&conn).await.expect("discover");
        assert!(!sim.is_connected(&DeviceAddress::from("dev")));
        assert!(matches!(
            gatt_events(&events).last(),
            Some(GattEvent::ConnectionStateChanged {
                connected: false,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn test_full_transfer_reports_status() {
        let sim = SimulatedPeripheral::new();
        sim.add_device("dev", SimDevice::new("Advantech_EPD-250"));
        let events = collecting(&sim);
        let conn = handle("dev");
        sim.connect(&conn).await.expect("connect");

        let frame = Frame::image(&[0x5A; 300], 1, true).expect("frame");
        let identify = handle_of(GattRole::ImageIdentify);
        let block = handle_of(GattRole::ImageBlock);
        sim.write_characteristic(&conn, identify, frame.header().to_vec())
            .await
            .expect("header");
        for i in 0..frame.total_blocks() {
            let packet = frame.block_packet(i).expect("block");
            sim.write_characteristic(&conn, block, packet)
                .await
                .expect("block");
        }

        let gatt = gatt_events(&events);
        assert_eq!(
            gatt.last(),
            Some(&GattEvent::Notification {
                characteristic: handle_of(GattRole::ImageStatus),
                value: vec![0x00]
            })
        );
        assert_eq!(
            sim.last_frame(&DeviceAddress::from("dev")).as_deref(),
            Some(frame.as_bytes())
        );
    }

    #[tokio::test]
    async fn test_corrupted_frame_reports_crc_error() {
        let sim = SimulatedPeripheral::new();
        sim.add_device("dev", SimDevice::new("Advantech_EPD-250"));
        let events = collecting(&sim);
        let conn = handle("dev");
        sim.connect(&conn).await.expect("connect");

        let frame = Frame::image(&[0x5A; 100], 1, false).expect("frame");
        let mut packet = frame.block_packet(0).expect("block");
        packet[10] ^= 0xFF;
        sim.write_characteristic(&conn, handle_of(GattRole::ImageIdentify), frame.header().to_vec())
            .await
            .expect("header");
        sim.write_characteristic(&conn, handle_of(GattRole::ImageBlock), packet)
            .await
            .expect("block");

        assert_eq!(
            gatt_events(&events).last(),
            Some(&GattEvent::Notification {
                characteristic: handle_of(GattRole::ImageStatus),
                value: vec![0x01]
            })
        );
    }

    #[tokio::test]
    async fn test_calls_are_recorded() {
        let sim = SimulatedPeripheral::new();
        sim.add_device("dev", SimDevice::new("Advantech_EPD-250"));
        let _events = collecting(&sim);
        let conn = handle("dev");
        sim.connect(&conn).await.expect("connect");
        sim.request_mtu(&conn, 251).await.expect("mtu");
        sim.disconnect(&conn).await.expect("disconnect");
        assert_eq!(
            sim.calls(),
            vec![
                PlatformCall::Connect(conn.address.clone()),
                PlatformCall::RequestMtu(conn.address.clone(), 251),
                PlatformCall::Disconnect(conn.address.clone()),
            ]
        );
        assert_eq!(sim.connect_count(&conn.address), 1);
    }
}
