//! `tuya-ble-sim`: runs the protocol engine against simulated peripherals.
//!
//! Usage: `tuya-ble-sim [config.toml]`
//!
//! Every `[[devices]]` entry in the config file gets a `SimulatedPeripheral`
//! that knows the same credentials.  Without a config file (or with no
//! devices in it) one default simulated thermostat is used.
//!
//! # Script
//!
//! ```text
//! for each device, concurrently:
//!  └─ initialize()            -- credentials, connect, handshake, status
//!  └─ set_datapoint(1)         -- single write, echoed back by the device
//!  └─ begin_batch / end_batch  -- two writes in one frame
//!  └─ device pushes            -- signed datapoints + time request
//!  └─ link drop                -- engine reconnects on its own
//!  └─ stop()
//! ```
//!
//! Set `RUST_LOG=tuya_ble=debug` to see every frame and handshake step.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use tuya_ble::infrastructure::storage::config::{load_from_path, DeviceEntry};
use tuya_ble::infrastructure::storage::credentials::StaticCredentialStore;
use tuya_ble::infrastructure::transport::{DeviceProfile, SimulatedPeripheral};
use tuya_ble::{Device, EngineConfig};
use tuya_ble_core::protocol::messages::Code;
use tuya_ble_core::{Datapoint, DatapointValue};

const DEFAULT_CONFIG: &str = "tuya-ble.toml";
const DEFAULT_ADDRESS: &str = "DC:23:4D:00:00:01";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG));
    let mut config = load_from_path(&path)
        .with_context(|| format!("loading configuration from {}", path.display()))?;

    // Initialise structured logging.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&config.engine.log_level)),
        )
        .init();

    info!("tuya-ble simulator starting");

    if config.devices.is_empty() {
        info!("no devices configured, using a default simulated thermostat");
        config.devices.push(DeviceEntry {
            address: DEFAULT_ADDRESS.to_string(),
            credentials: DeviceProfile::default().credentials(),
        });
    }
    let resolver = Arc::new(StaticCredentialStore::from_entries(&config.devices)?);

    let mut runs = Vec::new();
    for entry in &config.devices {
        let profile = DeviceProfile {
            uuid: entry.credentials.uuid.clone(),
            local_key: entry.credentials.local_key.clone(),
            device_id: entry.credentials.device_id.clone(),
            category: entry.credentials.category.clone(),
            product_id: entry.credentials.product_id.clone(),
            ..DeviceProfile::default()
        };
        let peripheral = Arc::new(SimulatedPeripheral::new(profile));
        let device = Device::new(
            entry.address.clone(),
            peripheral.clone(),
            resolver.clone(),
            config.engine.clone(),
        );
        runs.push(tokio::spawn(run_script(device, peripheral, config.engine.clone())));
    }

    for run in runs {
        match run.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("device script failed: {e:#}"),
            Err(e) => warn!("device task panicked: {e}"),
        }
    }
    info!("tuya-ble simulator finished");
    Ok(())
}

async fn run_script(
    device: Device,
    peripheral: Arc<SimulatedPeripheral>,
    engine: EngineConfig,
) -> anyhow::Result<()> {
    let address = device.address().to_string();
    let _changes = device.on_datapoints_changed({
        let address = address.clone();
        move |datapoints: &[Datapoint]| {
            for dp in datapoints {
                info!(
                    "{address}: datapoint {} = {:?}{}",
                    dp.id,
                    dp.value,
                    if dp.changed_by_device { " (changed by device)" } else { "" }
                );
            }
        }
    });
    let _disconnects = device.on_disconnected({
        let address = address.clone();
        move || info!("{address}: disconnected")
    });

    device.initialize().await.context("initialize")?;
    info!(
        "{address}: {} paired; device {}, protocol {}, hardware {}",
        device.name(),
        device.device_version(),
        device.protocol_version(),
        device.hardware_version()
    );

    device
        .set_datapoint(1, DatapointValue::Bool(false))
        .await
        .context("switch off")?;

    device.begin_batch();
    device.set_datapoint(2, DatapointValue::Value(195)).await?;
    device.set_datapoint(4, DatapointValue::enumeration(2)?).await?;
    device.end_batch().await.context("batched write")?;

    peripheral.push_signed_datapoints(1, 0, &[(2, DatapointValue::Value(190))]);
    peripheral.request_time(Code::ReceiveTime1Request);
    tokio::time::sleep(Duration::from_millis(200)).await;

    peripheral.drop_link();
    tokio::time::sleep(engine.reconnect_backoff_initial() + Duration::from_millis(500)).await;
    info!(
        "{address}: after link drop: state {}, {} connects",
        device.connection_state(),
        peripheral.connect_count()
    );

    device.stop().await;
    info!("{address}: {} datapoints known", device.datapoint_count());
    Ok(())
}
