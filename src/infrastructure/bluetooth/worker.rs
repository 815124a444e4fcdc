//! Session worker: runs a [`BleSession`] on one control flow, fed by
//! [`SessionCommand`]s, discovery events and adapter power changes.

use crate::domain::error::SessionError;
use crate::domain::models::{AdapterState, AppEvent, SessionCommand};
use crate::infrastructure::bluetooth::service::BleSession;
use std::collections::VecDeque;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info};

pub struct SessionWorker {
    session: BleSession,
    commands: mpsc::UnboundedReceiver<SessionCommand>,
    /// Commands that arrived while a connect was in flight
    backlog: VecDeque<SessionCommand>,
    adapter_changes: watch::Receiver<AdapterState>,
    adapter_open: bool,
    event_sender: mpsc::UnboundedSender<AppEvent>,
}

impl SessionWorker {
    pub fn new(session: BleSession, commands: mpsc::UnboundedReceiver<SessionCommand>) -> Self {
        let adapter_changes = session.subscribe_adapter();
        let event_sender = session.event_sender().clone();
        Self {
            session,
            commands,
            backlog: VecDeque::new(),
            adapter_changes,
            adapter_open: true,
            event_sender,
        }
    }

    /// Run until `Quit` or until every command sender is gone. The session
    /// is shut down before it is handed back.
    pub async fn run(mut self) -> BleSession {
        info!("Session worker started");

        if self.session.config().scan_on_start {
            if let Err(e) = self.session.start_scan().await {
                Self::report(&self.event_sender, "start_scan", e);
            }
        }

        loop {
            let command = match self.backlog.pop_front() {
                Some(command) => Some(command),
                None => tokio::select! {
                    command = self.commands.recv() => command,
                    event = self.session.next_discovery() => {
                        match event {
                            // Failures are published as ScanFailed by the session
                            Some(event) => {
                                let _ = self.session.handle_discovery(event).await;
                            }
                            None => {
                                let _ = self.session.discovery_ended().await;
                            }
                        }
                        continue;
                    }
                    changed = self.adapter_changes.changed(), if self.adapter_open => {
                        match changed {
                            Ok(()) => {
                                let state = *self.adapter_changes.borrow_and_update();
                                self.session.handle_adapter_change(state).await;
                            }
                            Err(_) => self.adapter_open = false,
                        }
                        continue;
                    }
                },
            };

            match command {
                None | Some(SessionCommand::Quit) => break,
                Some(command) => self.execute(command).await,
            }
        }

        self.session.shutdown().await;
        info!("Session worker stopped");
        self.session
    }

    async fn execute(&mut self, command: SessionCommand) {
        let operation = command.name();
        debug!(operation, "Executing command");

        let result = match command {
            SessionCommand::Connect(peripheral_id) => {
                self.connect(peripheral_id).await;
                return;
            }
            SessionCommand::StartScan => self.session.start_scan().await,
            SessionCommand::StopScan => self.session.stop_scan().await,
            SessionCommand::RefreshScan => self.session.refresh_scan().await,
            SessionCommand::Disconnect => {
                self.session.disconnect().await;
                Ok(())
            }
            SessionCommand::ListServices => self.session.list_services().map(drop),
            SessionCommand::ListCharacteristics(service) => {
                self.session.list_characteristics(&service).map(drop)
            }
            SessionCommand::SelectService(service) => self.session.select_service(&service).map(drop),
            SessionCommand::SelectCharacteristic(characteristic) => self
                .session
                .select_characteristic(&characteristic)
                .map(drop),
            SessionCommand::SendVolume(direction) => {
                self.session.send_volume_directive(direction).await
            }
            SessionCommand::SendRaw {
                service,
                characteristic,
                text,
            } => {
                self.session
                    .send_raw_payload(&service, &characteristic, &text)
                    .await
            }
            SessionCommand::Quit => Ok(()),
        };

        if let Err(e) = result {
            Self::report(&self.event_sender, operation, e);
        }
    }

    /// Drive a connect while still listening for commands. A new `Connect`
    /// or `Disconnect` drops the attempt in flight; anything else waits.
    async fn connect(&mut self, peripheral_id: String) {
        let mut pending = Some(peripheral_id);

        while let Some(peripheral_id) = pending.take() {
            let superseded_by = {
                let attempt = self.session.connect(&peripheral_id);
                tokio::pin!(attempt);

                loop {
                    tokio::select! {
                        biased;
                        result = &mut attempt => {
                            if let Err(e) = result {
                                Self::report(&self.event_sender, "connect", e);
                            }
                            break None;
                        }
                        command = self.commands.recv() => match command {
                            Some(command) if command.supersedes_connect() => break Some(command),
                            Some(command) => self.backlog.push_back(command),
                            None => break Some(SessionCommand::Quit),
                        },
                    }
                }
            };

            match superseded_by {
                Some(SessionCommand::Connect(next)) => {
                    info!(from = %peripheral_id, to = %next, "Connect superseded");
                    pending = Some(next);
                }
                Some(SessionCommand::Disconnect) => {
                    info!(id = %peripheral_id, "Connect cancelled");
                    self.session.disconnect().await;
                }
                Some(command) => self.backlog.push_front(command),
                None => {}
            }
        }
    }

    fn report(
        event_sender: &mpsc::UnboundedSender<AppEvent>,
        operation: &'static str,
        error: SessionError,
    ) {
        error!(operation, kind = error.kind().as_str(), "{}", error);
        let _ = event_sender.send(AppEvent::OperationFailed { operation, error });
    }
}
