//! Line-oriented console: command parsing and event rendering.

use anyhow::bail;
use ble_remote_controller::domain::command::VolumeDirection;
use ble_remote_controller::domain::models::{
    AppEvent, CommandTarget, ConnectionState, MessageSeverity, SessionCommand,
};

#[derive(Debug, PartialEq, Eq)]
pub enum Input {
    Command(SessionCommand),
    Help,
    Nothing,
}

pub const HELP: &str = "\
Commands:
  scan                          start scanning
  stop                          stop scanning
  refresh                       restart the scan
  connect <id>                  connect to a discovered device
  disconnect                    drop the connection
  services                      list services of the connected device
  chars <service>               list characteristics of a service
  service <uuid>                select a service
  char <uuid>                   select a characteristic
  vol <+|->                     send a volume directive
  raw <text>                    send text to the default raw characteristic
  rawto <service> <char> <text> send text to a specific characteristic
  help                          show this list
  quit                          exit";

/// Parse one console line. `raw_target` is used by `raw` without UUIDs.
pub fn parse_line(line: &str, raw_target: &CommandTarget) -> anyhow::Result<Input> {
    let line = line.trim();
    let (verb, rest) = match line.split_once(char::is_whitespace) {
        Some((verb, rest)) => (verb, rest.trim()),
        None => (line, ""),
    };

    let command = match verb.to_ascii_lowercase().as_str() {
        "" => return Ok(Input::Nothing),
        "help" | "?" => return Ok(Input::Help),
        "scan" => SessionCommand::StartScan,
        "stop" => SessionCommand::StopScan,
        "refresh" => SessionCommand::RefreshScan,
        "connect" => SessionCommand::Connect(required(rest, "connect <id>")?.to_string()),
        "disconnect" => SessionCommand::Disconnect,
        "services" => SessionCommand::ListServices,
        "chars" => {
            SessionCommand::ListCharacteristics(required(rest, "chars <service>")?.to_string())
        }
        "service" => SessionCommand::SelectService(required(rest, "service <uuid>")?.to_string()),
        "char" => SessionCommand::SelectCharacteristic(required(rest, "char <uuid>")?.to_string()),
        "vol" => {
            let direction: VolumeDirection = required(rest, "vol <+|->")?.parse()?;
            SessionCommand::SendVolume(direction)
        }
        "raw" => SessionCommand::SendRaw {
            service: raw_target.service_uuid.to_string(),
            characteristic: raw_target.characteristic_uuid.to_string(),
            text: required(rest, "raw <text>")?.to_string(),
        },
        "rawto" => {
            let mut parts = rest.splitn(3, char::is_whitespace);
            match (parts.next(), parts.next(), parts.next()) {
                (Some(service), Some(characteristic), Some(text)) if !service.is_empty() => {
                    SessionCommand::SendRaw {
                        service: service.to_string(),
                        characteristic: characteristic.to_string(),
                        text: text.trim_start().to_string(),
                    }
                }
                _ => bail!("usage: rawto <service> <char> <text>"),
            }
        }
        "quit" | "exit" => SessionCommand::Quit,
        other => bail!("unknown command {:?}, type 'help'", other),
    };
    Ok(Input::Command(command))
}

fn required<'a>(argument: &'a str, usage: &str) -> anyhow::Result<&'a str> {
    if argument.is_empty() {
        bail!("usage: {}", usage);
    }
    Ok(argument)
}

/// Human-readable line(s) for an event
pub fn describe_event(event: &AppEvent) -> String {
    match event {
        AppEvent::DevicesUpdated(devices) => {
            let mut out = format!("Devices ({}):", devices.len());
            for device in devices {
                out.push_str(&format!("\n  {:<20} {}", device.id, device.label()));
            }
            out
        }
        AppEvent::ScanState(true) => "Scanning...".to_string(),
        AppEvent::ScanState(false) => "Scan idle".to_string(),
        AppEvent::ScanFailed(error) => format!("Scan failed [{}]: {}", error.kind(), error.cause()),
        AppEvent::AdapterState(state) => format!("Adapter: {:?}", state),
        AppEvent::ConnectionState(snapshot) => {
            let mut out = format!("Connection: {:?}", snapshot.state);
            if let Some(peripheral) = &snapshot.peripheral {
                out.push_str(&format!(" ({} {})", peripheral.id, peripheral.label()));
            }
            if let (ConnectionState::Failed, Some(error)) = (snapshot.state, &snapshot.failure) {
                out.push_str(&format!(" [{}] {}", error.kind(), error.cause()));
            }
            out
        }
        AppEvent::CatalogReady(catalog) => {
            let characteristics = catalog.all_characteristics().count();
            format!(
                "GATT catalog: {} services, {} characteristics",
                catalog.len(),
                characteristics
            )
        }
        AppEvent::Services(services) => {
            let mut out = format!("Services ({}):", services.len());
            for service in services {
                out.push_str(&format!("\n  {}", service));
            }
            out
        }
        AppEvent::Characteristics {
            service,
            characteristics,
        } => {
            let mut out = format!("Characteristics of {}:", service);
            for characteristic in characteristics {
                out.push_str(&format!("\n  {}", characteristic.uuid));
            }
            out
        }
        AppEvent::OperationFailed { operation, error } => {
            format!("{} failed [{}]: {}", operation, error.kind(), error.cause())
        }
        AppEvent::LogMessage(status) => {
            let tag = match status.severity {
                MessageSeverity::Info => "info",
                MessageSeverity::Success => "ok",
                MessageSeverity::Warning => "warn",
                MessageSeverity::Error => "error",
            };
            format!("[{}] {}", tag, status.message)
        }
    }
}
