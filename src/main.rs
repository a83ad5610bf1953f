use anyhow::Result;
use std::env;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::time::{self, MissedTickBehavior};
use tracing::{error, info};

use ozone_device::commands::REBOOT_DELAY;
use ozone_device::config::Config;
use ozone_device::link::{generate_mac, SimulatedLink};
use ozone_device::net::HttpBackend;
use ozone_device::runtime::{Device, Tick, TreatmentError};
use ozone_device::simulate;
use ozone_device::storage::StateStore;

const STATUS_LOG_INTERVAL: Duration = Duration::from_secs(60);

fn init_tracing() {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let json_logging = env::var("LOG_FORMAT").is_ok_and(|v| v.eq_ignore_ascii_case("json"));

    if json_logging {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(env_filter)
            .with_target(true)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(false)
            .compact()
            .init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let config = Config::load()?;
    log::info!(
        "Device starting: backend {} firmware {} data dir {}",
        config.backend_url,
        config.firmware_version,
        config.data_dir.display()
    );

    let mac = match &config.mac_address {
        Some(mac) => mac.clone(),
        None => StateStore::open(&config.state_db_path())?.load_or_init_mac(generate_mac)?,
    };

    let backend = HttpBackend::new(&config)?;
    let link = SimulatedLink::new(mac);
    let mut device = Device::boot(&config, backend, link)?;

    let (press_tx, mut presses) = mpsc::channel(16);
    if config.simulated_press_interval_secs > 0 {
        tokio::spawn(simulate::treatment_presses(
            press_tx,
            Duration::from_secs(config.simulated_press_interval_secs),
        ));
    } else {
        log::info!("Button simulator disabled");
        drop(press_tx);
    }

    let mut tick = time::interval(Duration::from_millis(config.tick_interval_ms));
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut status_interval = time::interval(STATUS_LOG_INTERVAL);

    loop {
        tokio::select! {
            Some(treatment) = presses.recv() => {
                match device.start_treatment(treatment) {
                    Ok(_) | Err(TreatmentError::QueueFull { .. }) => {}
                    Err(e) => error!(error = %e, %treatment, "treatment not recorded"),
                }
            }
            _ = tick.tick() => {
                device.link_mut().step();
                if device.tick(Instant::now()).await == Tick::Reboot {
                    log::info!("Rebooting in {}s", REBOOT_DELAY.as_secs());
                    time::sleep(REBOOT_DELAY).await;
                    // The supervisor restarts the process; that is the reboot.
                    std::process::exit(0);
                }
            }
            _ = status_interval.tick() => {
                let status = device.status();
                info!(
                    device_id = ?status.device_id,
                    link = ?status.link_state,
                    quality = status.quality.score,
                    basic = status.counters.basic,
                    standard = status.counters.standard,
                    premium = status.counters.premium,
                    queued_events = ?status.queued_events,
                    queued_commands = ?status.queued_commands,
                    "device status"
                );
            }
            _ = tokio::signal::ctrl_c() => {
                log::info!("Shutting down");
                break;
            }
        }
    }
    Ok(())
}
