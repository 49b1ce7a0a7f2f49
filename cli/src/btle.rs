// btleplug adapter for the core BLE platform trait
//
// Each request is performed inline and its completion is reported through the
// registered event handler, the way the session manager expects. Central
// events (advertisements, link loss) are pumped by one background task per
// adapter; notifications by one task per connected peripheral.

use async_trait::async_trait;
use btleplug::api::{
    Central, CentralEvent, CharPropFlags, Characteristic, Manager as _, Peripheral as _,
    ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral, PeripheralId};
use futures::StreamExt;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use epdlink_core::protocol::advert::AD_TYPE_MANUFACTURER;
use epdlink_core::transport::ble::{
    BlePlatform, CharacteristicHandle, ConnectionHandle, DeviceAddress, DiscoveredCharacteristic,
    GattEvent, GattStatus, PlatformError, PlatformEvent, PlatformEventHandler,
};

/// Status reported when the link drops without a request
const STATUS_LINK_LOST: GattStatus = GattStatus(8);

type SharedHandler = Arc<RwLock<Option<Arc<PlatformEventHandler>>>>;

struct Link {
    connection: ConnectionHandle,
    peripheral: Peripheral,
    characteristics: HashMap<CharacteristicHandle, Characteristic>,
    notifications: Option<JoinHandle<()>>,
    /// Set once a disconnect was requested or reported
    closing: bool,
}

impl Link {
    fn shut(&mut self) {
        self.closing = true;
        if let Some(task) = self.notifications.take() {
            task.abort();
        }
    }
}

impl Drop for Link {
    fn drop(&mut self) {
        self.shut();
    }
}

/// Desktop BLE central backed by btleplug
pub struct BtlePlatform {
    adapter: Adapter,
    handler: SharedHandler,
    links: Arc<Mutex<HashMap<DeviceAddress, Link>>>,
    scanning: Arc<AtomicBool>,
    central_events: JoinHandle<()>,
}

impl BtlePlatform {
    /// Open the first Bluetooth adapter and start pumping its events
    pub async fn new() -> Result<Self, PlatformError> {
        let manager = Manager::new().await.map_err(other)?;
        let adapter = manager
            .adapters()
            .await
            .map_err(other)?
            .into_iter()
            .next()
            .ok_or(PlatformError::Unavailable)?;
        info!(
            "Using Bluetooth adapter {}",
            adapter.adapter_info().await.unwrap_or_default()
        );

        let handler: SharedHandler = Arc::new(RwLock::new(None));
        let links = Arc::new(Mutex::new(HashMap::new()));
        let scanning = Arc::new(AtomicBool::new(false));
        let events = adapter.events().await.map_err(other)?;
        let central_events = tokio::spawn(pump_central_events(
            adapter.clone(),
            events,
            handler.clone(),
            links.clone(),
            scanning.clone(),
        ));

        Ok(Self {
            adapter,
            handler,
            links,
            scanning,
            central_events,
        })
    }

    fn emit(&self, connection: &ConnectionHandle, event: GattEvent) {
        emit(
            &self.handler,
            PlatformEvent::Gatt {
                connection: connection.clone(),
                event,
            },
        );
    }

    async fn find_peripheral(&self, address: &DeviceAddress) -> Result<Peripheral, PlatformError> {
        for peripheral in self.adapter.peripherals().await.map_err(other)? {
            if address_of(&peripheral) == *address {
                return Ok(peripheral);
            }
        }
        Err(PlatformError::UnknownDevice(address.clone()))
    }

    /// Peripheral of the live link for `connection`
    fn peripheral(&self, connection: &ConnectionHandle) -> Result<Peripheral, PlatformError> {
        self.links
            .lock()
            .get(&connection.address)
            .filter(|link| link.connection == *connection)
            .map(|link| link.peripheral.clone())
            .ok_or(PlatformError::Refused(GattStatus::FAILURE))
    }

    fn characteristic(
        &self,
        connection: &ConnectionHandle,
        handle: CharacteristicHandle,
    ) -> Result<(Peripheral, Characteristic), PlatformError> {
        let links = self.links.lock();
        let link = links
            .get(&connection.address)
            .filter(|link| link.connection == *connection)
            .ok_or(PlatformError::Refused(GattStatus::FAILURE))?;
        let characteristic = link
            .characteristics
            .get(&handle)
            .cloned()
            .ok_or(PlatformError::Refused(GattStatus::FAILURE))?;
        Ok((link.peripheral.clone(), characteristic))
    }
}

impl Drop for BtlePlatform {
    fn drop(&mut self) {
        self.central_events.abort();
    }
}

#[async_trait]
impl BlePlatform for BtlePlatform {
    async fn start_scan(&self) -> Result<(), PlatformError> {
        self.adapter
            .start_scan(ScanFilter::default())
            .await
            .map_err(other)?;
        self.scanning.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn stop_scan(&self) -> Result<(), PlatformError> {
        self.scanning.store(false, Ordering::SeqCst);
        self.adapter.stop_scan().await.map_err(other)
    }

    async fn connect(&self, connection: &ConnectionHandle) -> Result<(), PlatformError> {
        let peripheral = self.find_peripheral(&connection.address).await?;
        self.links.lock().insert(
            connection.address.clone(),
            Link {
                connection: connection.clone(),
                peripheral: peripheral.clone(),
                characteristics: HashMap::new(),
                notifications: None,
                closing: false,
            },
        );
        let status = match peripheral.connect().await {
            Ok(()) => GattStatus::SUCCESS,
            Err(e) => {
                warn!("Connect to {} failed: {}", connection, e);
                GattStatus::FAILURE
            }
        };
        self.emit(
            connection,
            GattEvent::ConnectionStateChanged {
                status,
                connected: status.is_success(),
            },
        );
        Ok(())
    }

    async fn disconnect(&self, connection: &ConnectionHandle) -> Result<(), PlatformError> {
        let peripheral = self.peripheral(connection)?;
        if !peripheral.is_connected().await.unwrap_or(false) {
            return Ok(());
        }
        // link loss events for this peripheral are ignored from here on
        if let Some(link) = self.links.lock().get_mut(&connection.address) {
            link.shut();
        }
        peripheral.disconnect().await.map_err(other)?;
        self.emit(
            connection,
            GattEvent::ConnectionStateChanged {
                status: GattStatus::SUCCESS,
                connected: false,
            },
        );
        Ok(())
    }

    async fn close(&self, connection: &ConnectionHandle) -> Result<(), PlatformError> {
        let mut links = self.links.lock();
        if links
            .get(&connection.address)
            .is_some_and(|link| link.connection == *connection)
        {
            links.remove(&connection.address);
        }
        Ok(())
    }

    async fn discover_services(&self, connection: &ConnectionHandle) -> Result<(), PlatformError> {
        let peripheral = self.peripheral(connection)?;
        if let Err(e) = peripheral.discover_services().await {
            warn!("Service discovery on {} failed: {}", connection, e);
            self.emit(
                connection,
                GattEvent::ServicesDiscovered {
                    status: GattStatus::FAILURE,
                    characteristics: Vec::new(),
                },
            );
            return Ok(());
        }

        let mut table = HashMap::new();
        let mut discovered = Vec::new();
        for (index, characteristic) in peripheral.characteristics().into_iter().enumerate() {
            let handle = CharacteristicHandle(index as u64 + 1);
            discovered.push(DiscoveredCharacteristic {
                uuid: characteristic.uuid,
                handle,
            });
            table.insert(handle, characteristic);
        }
        debug!("{}: {} characteristics", connection, discovered.len());

        let notifications = peripheral.notifications().await.map_err(other)?;
        let by_uuid: HashMap<uuid::Uuid, CharacteristicHandle> =
            discovered.iter().map(|c| (c.uuid, c.handle)).collect();
        let task = tokio::spawn(pump_notifications(
            connection.clone(),
            notifications,
            by_uuid,
            self.handler.clone(),
        ));

        if let Some(link) = self
            .links
            .lock()
            .get_mut(&connection.address)
            .filter(|link| link.connection == *connection)
        {
            link.characteristics = table;
            if let Some(old) = link.notifications.replace(task) {
                old.abort();
            }
        }

        self.emit(
            connection,
            GattEvent::ServicesDiscovered {
                status: GattStatus::SUCCESS,
                characteristics: discovered,
            },
        );
        Ok(())
    }

    async fn request_mtu(
        &self,
        connection: &ConnectionHandle,
        mtu: u16,
    ) -> Result<(), PlatformError> {
        // btleplug negotiates the MTU itself
        self.peripheral(connection)?;
        self.emit(
            connection,
            GattEvent::MtuChanged {
                status: GattStatus::SUCCESS,
                mtu,
            },
        );
        Ok(())
    }

    async fn read_characteristic(
        &self,
        connection: &ConnectionHandle,
        characteristic: CharacteristicHandle,
    ) -> Result<(), PlatformError> {
        let (peripheral, target) = self.characteristic(connection, characteristic)?;
        let (status, value) = match peripheral.read(&target).await {
            Ok(value) => (GattStatus::SUCCESS, value),
            Err(e) => {
                warn!("Read of {} on {} failed: {}", target.uuid, connection, e);
                (GattStatus::FAILURE, Vec::new())
            }
        };
        self.emit(
            connection,
            GattEvent::CharacteristicRead {
                status,
                characteristic,
                value,
            },
        );
        Ok(())
    }

    async fn write_characteristic(
        &self,
        connection: &ConnectionHandle,
        characteristic: CharacteristicHandle,
        value: Vec<u8>,
    ) -> Result<(), PlatformError> {
        let (peripheral, target) = self.characteristic(connection, characteristic)?;
        let write_type = if target
            .properties
            .contains(CharPropFlags::WRITE_WITHOUT_RESPONSE)
        {
            WriteType::WithoutResponse
        } else {
            WriteType::WithResponse
        };
        let status = match peripheral.write(&target, &value, write_type).await {
            Ok(()) => GattStatus::SUCCESS,
            Err(e) => {
                warn!("Write of {} on {} failed: {}", target.uuid, connection, e);
                GattStatus::FAILURE
            }
        };
        self.emit(
            connection,
            GattEvent::CharacteristicWritten {
                status,
                characteristic,
            },
        );
        Ok(())
    }

    async fn enable_notify(
        &self,
        connection: &ConnectionHandle,
        characteristic: CharacteristicHandle,
    ) -> Result<(), PlatformError> {
        let (peripheral, target) = self.characteristic(connection, characteristic)?;
        let status = match peripheral.subscribe(&target).await {
            Ok(()) => GattStatus::SUCCESS,
            Err(e) => {
                warn!("Subscribe to {} on {} failed: {}", target.uuid, connection, e);
                GattStatus::FAILURE
            }
        };
        self.emit(
            connection,
            GattEvent::NotifyEnabled {
                status,
                characteristic,
            },
        );
        Ok(())
    }

    fn set_event_handler(&self, handler: PlatformEventHandler) {
        *self.handler.write() = Some(Arc::new(handler));
    }
}

fn other(e: btleplug::Error) -> PlatformError {
    PlatformError::Other(e.to_string())
}

fn emit(handler: &SharedHandler, event: PlatformEvent) {
    let handler = handler.read().clone();
    match handler {
        Some(handler) => handler(event),
        None => debug!("BLE event dropped, no handler: {:?}", event),
    }
}

/// MAC address where the platform exposes one, the peripheral id otherwise
fn address_of(peripheral: &Peripheral) -> DeviceAddress {
    let address = peripheral.address();
    if address.into_inner() == [0u8; 6] {
        DeviceAddress::new(peripheral.id().to_string())
    } else {
        DeviceAddress::new(address.to_string())
    }
}

/// Rebuild `[len][0xFF][company id LE][data]` structures from parsed manufacturer data
fn manufacturer_advertisement(data: &HashMap<u16, Vec<u8>>) -> Vec<u8> {
    let mut payload = Vec::new();
    for (company, bytes) in data {
        let len = 3 + bytes.len();
        if len > u8::MAX as usize {
            continue;
        }
        payload.push(len as u8);
        payload.push(AD_TYPE_MANUFACTURER);
        payload.extend_from_slice(&company.to_le_bytes());
        payload.extend_from_slice(bytes);
    }
    payload
}

async fn pump_central_events(
    adapter: Adapter,
    mut events: std::pin::Pin<Box<dyn futures::Stream<Item = CentralEvent> + Send>>,
    handler: SharedHandler,
    links: Arc<Mutex<HashMap<DeviceAddress, Link>>>,
    scanning: Arc<AtomicBool>,
) {
    while let Some(event) = events.next().await {
        match event {
            CentralEvent::DeviceDiscovered(id)
            | CentralEvent::DeviceUpdated(id)
            | CentralEvent::ManufacturerDataAdvertisement { id, .. } => {
                if scanning.load(Ordering::SeqCst) {
                    report_scan_result(&adapter, &id, &handler).await;
                }
            }
            CentralEvent::DeviceDisconnected(id) => {
                let lost = {
                    let mut links = links.lock();
                    let address = links
                        .iter()
                        .find(|(_, link)| link.peripheral.id() == id)
                        .map(|(address, _)| address.clone());
                    match address.and_then(|a| links.get_mut(&a)) {
                        Some(link) if !link.closing => {
                            link.shut();
                            Some(link.connection.clone())
                        }
                        _ => None,
                    }
                };
                if let Some(connection) = lost {
                    warn!("Link to {} lost", connection);
                    emit(
                        &handler,
                        PlatformEvent::Gatt {
                            connection,
                            event: GattEvent::ConnectionStateChanged {
                                status: STATUS_LINK_LOST,
                                connected: false,
                            },
                        },
                    );
                }
            }
            _ => {}
        }
    }
    debug!("Central event stream ended");
}

async fn report_scan_result(adapter: &Adapter, id: &PeripheralId, handler: &SharedHandler) {
    let Ok(peripheral) = adapter.peripheral(id).await else {
        return;
    };
    let Ok(Some(properties)) = peripheral.properties().await else {
        return;
    };
    let Some(rssi) = properties.rssi else {
        return;
    };
    emit(
        handler,
        PlatformEvent::ScanResult {
            address: address_of(&peripheral),
            name: properties.local_name,
            rssi,
            advertisement: manufacturer_advertisement(&properties.manufacturer_data),
        },
    );
}

async fn pump_notifications(
    connection: ConnectionHandle,
    mut notifications: std::pin::Pin<
        Box<dyn futures::Stream<Item = btleplug::api::ValueNotification> + Send>,
    >,
    by_uuid: HashMap<uuid::Uuid, CharacteristicHandle>,
    handler: SharedHandler,
) {
    while let Some(notification) = notifications.next().await {
        let Some(characteristic) = by_uuid.get(&notification.uuid).copied() else {
            continue;
        };
        emit(
            &handler,
            PlatformEvent::Gatt {
                connection: connection.clone(),
                event: GattEvent::Notification {
                    characteristic,
                    value: notification.value,
                },
            },
        );
    }
    debug!("Notification stream for {} ended", connection);
}

#[cfg(test)]
mod tests {
    use super::*;
    use epdlink_core::protocol::advert::alarm_flag;

    #[test]
    fn test_manufacturer_advertisement_layout() {
        let mut data = HashMap::new();
        data.insert(0x0001u16, vec![0x00]);
        let payload = manufacturer_advertisement(&data);
        assert_eq!(payload, vec![0x04, 0xFF, 0x01, 0x00, 0x00]);
        assert!(alarm_flag(&payload));
    }

    #[test]
    fn test_oversized_manufacturer_data_skipped() {
        let mut data = HashMap::new();
        data.insert(0x0002u16, vec![0u8; 300]);
        assert!(manufacturer_advertisement(&data).is_empty());
    }
}
