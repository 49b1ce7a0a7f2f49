//! Retry and failure lifecycle tests
//!
//! Lost links, connect timeouts, silent devices and rejected headers, driven
//! through a task handler on paused time.
//!
//! Run with: cargo test --test integration_retry_lifecycle

use std::sync::Arc;
use std::time::Duration;

use epdlink_core::image::{Bitmap, PanelType, Rgb};
use epdlink_core::transport::ble::GattRole;
use epdlink_core::{
    DeviceAddress, EpdConfig, ImageTask, ManagerHandle, SimDevice, SimulatedPeripheral, Task,
    TaskError, TaskErrorKind, TaskHandler, TaskHandlerCallback, TaskOptions,
};
use parking_lot::Mutex;

const ADDRESS: &str = "AA:BB:CC:00:00:01";

#[derive(Default)]
struct Outcome {
    ready: Mutex<Vec<String>>,
    success: Mutex<Vec<String>>,
    errors: Mutex<Vec<TaskError>>,
}

impl Outcome {
    fn finished(&self) -> bool {
        !self.success.lock().is_empty() || !self.errors.lock().is_empty()
    }
}

impl TaskHandlerCallback for Outcome {
    fn on_ready(&self, message: &str) {
        self.ready.lock().push(message.to_string());
    }

    fn on_success(&self, message: &str) {
        self.success.lock().push(message.to_string());
    }

    fn on_error(&self, error: &TaskError) {
        self.errors.lock().push(error.clone());
    }
}

fn start(device: SimDevice) -> (Arc<SimulatedPeripheral>, ManagerHandle, Arc<Outcome>, TaskHandler) {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("epdlink_core=debug")
        .with_test_writer()
        .try_init();

    let sim = Arc::new(SimulatedPeripheral::new());
    sim.add_device(ADDRESS, device);
    let manager = ManagerHandle::spawn(sim.clone(), EpdConfig::default()).expect("spawn");
    let outcome = Arc::new(Outcome::default());
    let handler = TaskHandler::new(
        manager.clone(),
        DeviceAddress::from(ADDRESS),
        outcome.clone(),
        TaskOptions::default(),
    );
    (sim, manager, outcome, handler)
}

async fn wait_finished(outcome: &Outcome) {
    // generous: five connect timeouts with settle delays fit comfortably
    for _ in 0..2_000 {
        if outcome.finished() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
    }
    panic!("task never finished");
}

fn small_firmware() -> Task {
    Task::FirmwareUpgrade {
        package: vec![0xEE; 64],
        version: "9.9.9".to_string(),
    }
}

#[tokio::test(start_paused = true)]
async fn test_five_link_losses_end_the_task() {
    let mut device = SimDevice::new("Advantech_EPD-250");
    device.handshake_drops = u32::MAX;
    let (sim, _manager, outcome, handler) = start(device);

    assert!(handler.start_task(small_firmware()).await);
    wait_finished(&outcome).await;
    // nothing else is scheduled after the terminal error
    tokio::time::sleep(Duration::from_secs(10)).await;

    let errors = outcome.errors.lock().clone();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].kind, TaskErrorKind::ConnectionLost);
    assert_eq!(errors[0].message, "Lost Connection! 5 times");
    assert_eq!(sim.connect_count(&DeviceAddress::from(ADDRESS)), 5);

    let retries: Vec<String> = outcome
        .ready
        .lock()
        .iter()
        .filter(|m| m.starts_with("Lost Connection!"))
        .cloned()
        .collect();
    assert_eq!(
        retries,
        [
            "Lost Connection! 1 times",
            "Lost Connection! 2 times",
            "Lost Connection! 3 times",
            "Lost Connection! 4 times",
        ]
    );
    assert!(!handler.is_running());
}

#[tokio::test(start_paused = true)]
async fn test_five_drops_mid_transfer_end_the_task() {
    let mut device = SimDevice::new("Advantech_EPD-250");
    device.transfer_drops = u32::MAX;
    let (sim, _manager, outcome, handler) = start(device);

    assert!(handler.start_task(small_firmware()).await);
    wait_finished(&outcome).await;
    tokio::time::sleep(Duration::from_secs(10)).await;

    let errors = outcome.errors.lock().clone();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].kind, TaskErrorKind::ConnectionLost);
    assert_eq!(errors[0].message, "Lost Connection! 5 times");
    assert!(outcome.success.lock().is_empty());
    assert_eq!(sim.connect_count(&DeviceAddress::from(ADDRESS)), 5);
    assert!(!handler.is_running());
}

#[tokio::test(start_paused = true)]
async fn test_transfer_recovers_after_one_drop() {
    let mut device = SimDevice::new("Advantech_EPD-250");
    device.transfer_drops = 1;
    let (sim, _manager, outcome, handler) = start(device);

    assert!(handler.start_task(small_firmware()).await);
    wait_finished(&outcome).await;

    assert!(outcome.errors.lock().is_empty());
    assert!(outcome.success.lock()[0].starts_with("Success! Take"));
    assert!(outcome
        .ready
        .lock()
        .contains(&"Lost Connection! 1 times".to_string()));
    assert_eq!(sim.connect_count(&DeviceAddress::from(ADDRESS)), 2);
}

#[tokio::test(start_paused = true)]
async fn test_connect_timeout_is_retried_then_reported() {
    let mut device = SimDevice::new("Advantech_EPD-250");
    device.never_connect = true;
    let (sim, _manager, outcome, handler) = start(device);

    assert!(handler.start_task(Task::CheckStatus).await);
    wait_finished(&outcome).await;

    let errors = outcome.errors.lock().clone();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].kind, TaskErrorKind::ConnectTimeout);
    assert_eq!(errors[0].message, "Lost Connection! 5 times");
    assert_eq!(sim.connect_count(&DeviceAddress::from(ADDRESS)), 5);
}

#[tokio::test(start_paused = true)]
async fn test_silent_device_times_out() {
    let mut device = SimDevice::new("Advantech_EPD-250");
    device.status = None;
    let (_sim, manager, outcome, handler) = start(device);

    let panel = PanelType::Epd250;
    let task = Task::PushImage(ImageTask::new(
        panel,
        Bitmap::filled(panel.width(), panel.height(), Rgb::WHITE),
    ));
    assert!(handler.start_task(task).await);
    wait_finished(&outcome).await;

    let errors = outcome.errors.lock().clone();
    assert_eq!(errors[0].kind, TaskErrorKind::TaskTimeout);
    assert_eq!(errors[0].message, "Task Timeout");
    // the session survives a task timeout
    let snapshot = manager.snapshot().await.expect("snapshot");
    assert_eq!(snapshot.active.len(), 1);
    assert_eq!(snapshot.active[0].transfer_progress, None);
}

#[tokio::test(start_paused = true)]
async fn test_identify_rejection() {
    let mut device = SimDevice::new("Advantech_EPD-250");
    device.reject_identify = true;
    let (_sim, _manager, outcome, handler) = start(device);

    assert!(handler.start_task(small_firmware()).await);
    wait_finished(&outcome).await;

    let errors = outcome.errors.lock().clone();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].kind, TaskErrorKind::Rejected);
    assert_eq!(errors[0].message, "Characteristic Error");
}

#[tokio::test(start_paused = true)]
async fn test_missing_characteristic_fails_handshake() {
    let mut device = SimDevice::new("Advantech_EPD-250");
    device.missing_role = Some(GattRole::ImageStatus);
    let (sim, _manager, outcome, handler) = start(device);

    assert!(handler.start_task(Task::CheckStatus).await);
    wait_finished(&outcome).await;

    // every attempt fails the handshake, so the retry budget runs out
    assert_eq!(outcome.errors.lock()[0].kind, TaskErrorKind::ConnectionLost);
    assert_eq!(sim.connect_count(&DeviceAddress::from(ADDRESS)), 5);
}

#[tokio::test(start_paused = true)]
async fn test_handler_disconnect_cancels_task() {
    let mut device = SimDevice::new("Advantech_EPD-250");
    device.status = None;
    let (sim, manager, outcome, handler) = start(device);

    assert!(handler.start_task(small_firmware()).await);
    tokio::time::sleep(Duration::from_millis(100)).await;
    handler.disconnect().await.expect("disconnect");
    tokio::time::sleep(Duration::from_secs(2)).await;

    assert!(!handler.is_running());
    assert!(!outcome.finished());
    assert!(!manager
        .is_connected_or_queued(DeviceAddress::from(ADDRESS))
        .await
        .expect("query"));
    assert!(!sim.is_connected(&DeviceAddress::from(ADDRESS)));
}
