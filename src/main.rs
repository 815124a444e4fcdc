mod console;

use anyhow::Context;
use ble_remote_controller::domain::models::{CommandTarget, SessionCommand};
use ble_remote_controller::domain::settings::SettingsService;
use ble_remote_controller::infrastructure::bluetooth::{
    self, BleSession, SessionConfig, SessionWorker,
};
use ble_remote_controller::infrastructure::logging::init_logger;
use ble_remote_controller::infrastructure::permissions::StaticPermissionGate;
use console::Input;
use std::io::BufRead;
use tokio::sync::mpsc;
use tracing::{error, info};

fn main() -> anyhow::Result<()> {
    let settings_service = SettingsService::new().context("Failed to load settings")?;

    let _logging_guard = init_logger(&settings_service.get().log_settings)
        .map_err(|e| eprintln!("Failed to initialize logging: {}", e))
        .ok();

    info!(
        settings = %settings_service.path().display(),
        "Starting BLE Remote Controller"
    );

    let config = SessionConfig::try_from(&settings_service.get().ble)
        .context("Invalid BLE settings")?;
    let raw_target = CommandTarget::new(config.service_uuid, config.raw_characteristic_uuid);

    let (event_tx, mut event_rx) = mpsc::unbounded_channel();
    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();

    let bluetooth_thread = std::thread::spawn(move || -> anyhow::Result<()> {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .context("Failed to create tokio runtime for Bluetooth")?;

        rt.block_on(async move {
            let transport = bluetooth::platform_transport().await?;
            let session = BleSession::new(
                transport,
                Box::new(StaticPermissionGate::granted()),
                config,
                event_tx,
            );
            SessionWorker::new(session, cmd_rx).run().await;
            Ok(())
        })
    });

    let printer_thread = std::thread::spawn(move || {
        while let Some(event) = event_rx.blocking_recv() {
            println!("{}", console::describe_event(&event));
        }
    });

    println!("{}", console::HELP);
    for line in std::io::stdin().lock().lines() {
        let line = line.context("Failed to read from stdin")?;
        match console::parse_line(&line, &raw_target) {
            Ok(Input::Command(command)) => {
                let quit = command == SessionCommand::Quit;
                if cmd_tx.send(command).is_err() || quit {
                    break;
                }
            }
            Ok(Input::Help) => println!("{}", console::HELP),
            Ok(Input::Nothing) => {}
            Err(e) => eprintln!("{}", e),
        }
    }

    // A closed command channel shuts the session down
    drop(cmd_tx);
    let result = match bluetooth_thread.join() {
        Ok(result) => result,
        Err(_) => Err(anyhow::anyhow!("Bluetooth thread panicked")),
    };
    if let Err(e) = &result {
        error!("Bluetooth session ended with error: {:#}", e);
    }
    let _ = printer_thread.join();

    info!("BLE Remote Controller stopped");
    result
}
