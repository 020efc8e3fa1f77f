//! Experimental hardware backend over btleplug.
//!
//! A dedicated worker thread owns the adapter and a current-thread tokio
//! runtime; the synchronous [`CentralRadio`] surface talks to it over
//! channels. Backend events come out of [`BtleplugRadio::poll_event`] and are
//! fed to the endpoint by the caller's pump loop.

use std::collections::HashMap;
use std::sync::mpsc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use btleplug::api::{
    Central as _, CentralEvent as AdapterEvent, Manager as _, Peripheral as _, ScanFilter,
    WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures_util::StreamExt;
use tokio::sync::{mpsc as tokio_mpsc, oneshot};
use tracing::{debug, error, warn};
use uuid::Uuid;

use tally_core::wire::{CCCD_DISABLE, CCCD_ENABLE};
use tally_core::{PeerId, SessionToken};

use crate::endpoint::CentralEvent;
use crate::radio::CentralRadio;

#[derive(Debug, Clone)]
pub struct BtleplugRadioConfig {
    pub command_queue_capacity: usize,
    pub event_queue_capacity: usize,
    /// Interval at which an active scan is re-armed; some adapters silently
    /// stop delivering advertisements otherwise.
    pub scan_refresh: Duration,
}

impl Default for BtleplugRadioConfig {
    fn default() -> Self {
        Self {
            command_queue_capacity: 64,
            event_queue_capacity: 1024,
            scan_refresh: Duration::from_secs(2),
        }
    }
}

#[derive(Debug)]
pub enum BtleplugRadioError {
    WorkerFailed,
}

#[derive(Debug)]
enum WorkerCommand {
    StartScan {
        token: SessionToken,
        service_uuid: String,
    },
    StopScan,
    Connect {
        token: SessionToken,
        peer: PeerId,
    },
    DiscoverServices {
        token: SessionToken,
        peer: PeerId,
        service_uuid: String,
    },
    WriteDescriptor {
        token: SessionToken,
        peer: PeerId,
        characteristic: String,
        payload: Vec<u8>,
    },
    WriteCharacteristic {
        token: SessionToken,
        peer: PeerId,
        characteristic: String,
        payload: Vec<u8>,
    },
    Disconnect {
        peer: PeerId,
    },
}

/// Bridges the synchronous radio trait onto a btleplug worker thread.
#[derive(Debug)]
pub struct BtleplugRadio {
    command_tx: tokio_mpsc::Sender<WorkerCommand>,
    event_rx: mpsc::Receiver<CentralEvent>,
    shutdown_tx: Option<oneshot::Sender<()>>,
    worker: Option<JoinHandle<()>>,
    service_uuid: String,
}

impl BtleplugRadio {
    pub fn spawn(config: BtleplugRadioConfig) -> Result<Self, BtleplugRadioError> {
        let (command_tx, command_rx) =
            tokio_mpsc::channel::<WorkerCommand>(config.command_queue_capacity);
        let (event_tx, event_rx) = mpsc::sync_channel::<CentralEvent>(config.event_queue_capacity);
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let config_clone = config.clone();

        let worker = thread::spawn(move || {
            let runtime = match tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
            {
                Ok(rt) => rt,
                Err(err) => {
                    error!(?err, "backend runtime failed to build");
                    return;
                }
            };
            runtime.block_on(run_worker(config_clone, command_rx, event_tx, shutdown_rx));
        });

        Ok(Self {
            command_tx,
            event_rx,
            shutdown_tx: Some(shutdown_tx),
            worker: Some(worker),
            service_uuid: String::new(),
        })
    }

    /// Next backend event, if any. Non-blocking.
    pub fn poll_event(&mut self) -> Option<CentralEvent> {
        self.event_rx.try_recv().ok()
    }

    fn send(&self, command: WorkerCommand) -> Result<(), BtleplugRadioError> {
        self.command_tx
            .try_send(command)
            .map_err(|_| BtleplugRadioError::WorkerFailed)
    }
}

impl CentralRadio for BtleplugRadio {
    type Error = BtleplugRadioError;

    fn start_scan(&mut self, token: SessionToken, service_uuid: &str) -> Result<(), Self::Error> {
        self.service_uuid = service_uuid.to_string();
        self.send(WorkerCommand::StartScan {
            token,
            service_uuid: service_uuid.to_string(),
        })
    }

    fn stop_scan(&mut self) {
        let _ = self.send(WorkerCommand::StopScan);
    }

    fn connect(&mut self, token: SessionToken, peer: &PeerId) -> Result<(), Self::Error> {
        self.send(WorkerCommand::Connect {
            token,
            peer: peer.clone(),
        })
    }

    fn discover_services(
        &mut self,
        token: SessionToken,
        peer: &PeerId,
    ) -> Result<(), Self::Error> {
        self.send(WorkerCommand::DiscoverServices {
            token,
            peer: peer.clone(),
            service_uuid: self.service_uuid.clone(),
        })
    }

    fn write_descriptor(
        &mut self,
        token: SessionToken,
        peer: &PeerId,
        characteristic: &str,
        _descriptor: &str,
        payload: &[u8],
    ) -> Result<(), Self::Error> {
        self.send(WorkerCommand::WriteDescriptor {
            token,
            peer: peer.clone(),
            characteristic: characteristic.to_string(),
            payload: payload.to_vec(),
        })
    }

    fn write_characteristic(
        &mut self,
        token: SessionToken,
        peer: &PeerId,
        characteristic: &str,
        payload: &[u8],
    ) -> Result<(), Self::Error> {
        self.send(WorkerCommand::WriteCharacteristic {
            token,
            peer: peer.clone(),
            characteristic: characteristic.to_string(),
            payload: payload.to_vec(),
        })
    }

    fn disconnect(&mut self, peer: &PeerId) {
        let _ = self.send(WorkerCommand::Disconnect { peer: peer.clone() });
    }
}

impl Drop for BtleplugRadio {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

struct WorkerState {
    // Peripherals seen during the current scan, keyed by address string.
    peripherals: HashMap<String, Peripheral>,
    notify_tasks: HashMap<String, tokio::task::JoinHandle<()>>,
    // Token of the session the last command was issued under; every event
    // is stamped with it so the endpoint can discard leftovers.
    token: SessionToken,
    // Filter of the scan in progress, re-armed on the refresh tick.
    active_scan: Option<ScanFilter>,
}

async fn run_worker(
    config: BtleplugRadioConfig,
    mut command_rx: tokio_mpsc::Receiver<WorkerCommand>,
    event_tx: mpsc::SyncSender<CentralEvent>,
    mut shutdown_rx: oneshot::Receiver<()>,
) {
    let manager = match Manager::new().await {
        Ok(m) => m,
        Err(err) => {
            error!(?err, "bluetooth manager unavailable");
            return;
        }
    };
    let adapters = match manager.adapters().await {
        Ok(a) => a,
        Err(err) => {
            error!(?err, "adapter enumeration failed");
            return;
        }
    };
    let adapter = match adapters.into_iter().next() {
        Some(a) => a,
        None => {
            error!("no bluetooth adapter present");
            return;
        }
    };

    let mut adapter_events = match adapter.events().await {
        Ok(e) => e,
        Err(err) => {
            error!(?err, "adapter event stream unavailable");
            return;
        }
    };

    let mut state = WorkerState {
        peripherals: HashMap::new(),
        notify_tasks: HashMap::new(),
        token: SessionToken::default(),
        active_scan: None,
    };

    loop {
        tokio::select! {
            _ = &mut shutdown_rx => {
                break;
            }
            maybe_event = adapter_events.next() => {
                if let Some(event) = maybe_event {
                    handle_adapter_event(&adapter, event, &mut state, &event_tx).await;
                }
            }
            maybe_command = command_rx.recv() => {
                match maybe_command {
                    Some(command) => {
                        handle_command(&adapter, command, &mut state, &event_tx).await;
                    }
                    None => break,
                }
            }
            _ = tokio::time::sleep(config.scan_refresh) => {
                if let Some(filter) = state.active_scan.clone() {
                    let _ = adapter.start_scan(filter).await;
                }
            }
        }
    }

    for (_, task) in state.notify_tasks.drain() {
        task.abort();
    }
}

async fn handle_command(
    adapter: &Adapter,
    command: WorkerCommand,
    state: &mut WorkerState,
    event_tx: &mpsc::SyncSender<CentralEvent>,
) {
    match command {
        WorkerCommand::StartScan {
            token,
            service_uuid,
        } => {
            state.token = token;
            let filter = match Uuid::parse_str(&service_uuid) {
                Ok(uuid) => ScanFilter {
                    services: vec![uuid],
                },
                Err(_) => ScanFilter::default(),
            };
            match adapter.start_scan(filter.clone()).await {
                Ok(()) => state.active_scan = Some(filter),
                Err(err) => {
                    warn!(?err, "adapter refused to scan");
                    let _ = event_tx.try_send(CentralEvent::ScanFailed {
                        token,
                        reason: err.to_string(),
                    });
                }
            }
        }
        WorkerCommand::StopScan => {
            state.active_scan = None;
            let _ = adapter.stop_scan().await;
        }
        WorkerCommand::Connect { token, peer } => {
            state.token = token;
            let Some(peripheral) = state.peripherals.get(&peer.0).cloned() else {
                let _ = event_tx.try_send(CentralEvent::ConnectionChanged {
                    token,
                    peer,
                    connected: false,
                });
                return;
            };
            if peripheral.connect().await.is_err() {
                let _ = event_tx.try_send(CentralEvent::ConnectionChanged {
                    token,
                    peer,
                    connected: false,
                });
            }
            // Success surfaces through the adapter's DeviceConnected event.
        }
        WorkerCommand::DiscoverServices {
            token,
            peer,
            service_uuid,
        } => {
            state.token = token;
            let Some(peripheral) = state.peripherals.get(&peer.0).cloned() else {
                return;
            };
            if peripheral.discover_services().await.is_err() {
                let _ = event_tx.try_send(CentralEvent::ConnectionChanged {
                    token,
                    peer,
                    connected: false,
                });
                return;
            }
            let service = Uuid::parse_str(&service_uuid).ok();
            let characteristics: Vec<String> = peripheral
                .characteristics()
                .iter()
                .filter(|ch| service.map(|s| ch.service_uuid == s).unwrap_or(true))
                .map(|ch| ch.uuid.to_string())
                .collect();
            let _ = event_tx.try_send(CentralEvent::ServicesDiscovered {
                token,
                peer,
                characteristics,
            });
        }
        WorkerCommand::WriteDescriptor {
            token,
            peer,
            characteristic,
            payload,
        } => {
            state.token = token;
            let Some(peripheral) = state.peripherals.get(&peer.0).cloned() else {
                return;
            };
            let Some(target) = find_characteristic(&peripheral, &characteristic) else {
                return;
            };
            // btleplug manages the CCCD itself; the sentinel payloads map
            // onto subscribe/unsubscribe.
            let result = if payload == CCCD_ENABLE {
                let subscribed = peripheral.subscribe(&target).await;
                if subscribed.is_ok() {
                    spawn_notification_task(&peripheral, &peer, token, state, event_tx);
                }
                subscribed
            } else if payload == CCCD_DISABLE {
                if let Some(task) = state.notify_tasks.remove(&peer.0) {
                    task.abort();
                }
                peripheral.unsubscribe(&target).await
            } else {
                debug!(%peer, "unrecognized descriptor payload dropped");
                return;
            };
            if result.is_ok() {
                let _ = event_tx.try_send(CentralEvent::DescriptorWriteComplete {
                    token,
                    peer,
                    characteristic,
                });
            }
        }
        WorkerCommand::WriteCharacteristic {
            token,
            peer,
            characteristic,
            payload,
        } => {
            state.token = token;
            let Some(peripheral) = state.peripherals.get(&peer.0).cloned() else {
                return;
            };
            let Some(target) = find_characteristic(&peripheral, &characteristic) else {
                return;
            };
            if peripheral
                .write(&target, &payload, WriteType::WithResponse)
                .await
                .is_ok()
            {
                let _ = event_tx.try_send(CentralEvent::WriteComplete {
                    token,
                    peer,
                    characteristic,
                });
            }
        }
        WorkerCommand::Disconnect { peer } => {
            if let Some(task) = state.notify_tasks.remove(&peer.0) {
                task.abort();
            }
            if let Some(peripheral) = state.peripherals.get(&peer.0).cloned() {
                let _ = peripheral.disconnect().await;
            }
        }
    }
}

async fn handle_adapter_event(
    adapter: &Adapter,
    event: AdapterEvent,
    state: &mut WorkerState,
    event_tx: &mpsc::SyncSender<CentralEvent>,
) {
    match event {
        AdapterEvent::DeviceDiscovered(id) | AdapterEvent::DeviceUpdated(id) => {
            let Ok(peripheral) = adapter.peripheral(&id).await else {
                return;
            };
            let addr = id.to_string();
            let properties = match peripheral.properties().await {
                Ok(Some(props)) => props,
                _ => return,
            };
            state.peripherals.insert(addr.clone(), peripheral);
            let services: Vec<String> =
                properties.services.iter().map(Uuid::to_string).collect();
            let _ = event_tx.try_send(CentralEvent::AdvertisementSeen {
                token: state.token,
                peer: PeerId(addr),
                services,
                local_name: properties.local_name,
            });
        }
        AdapterEvent::DeviceConnected(id) => {
            let _ = event_tx.try_send(CentralEvent::ConnectionChanged {
                token: state.token,
                peer: PeerId(id.to_string()),
                connected: true,
            });
        }
        AdapterEvent::DeviceDisconnected(id) => {
            let addr = id.to_string();
            if let Some(task) = state.notify_tasks.remove(&addr) {
                task.abort();
            }
            let _ = event_tx.try_send(CentralEvent::ConnectionChanged {
                token: state.token,
                peer: PeerId(addr),
                connected: false,
            });
        }
        _ => {}
    }
}

fn spawn_notification_task(
    peripheral: &Peripheral,
    peer: &PeerId,
    token: SessionToken,
    state: &mut WorkerState,
    event_tx: &mpsc::SyncSender<CentralEvent>,
) {
    if state.notify_tasks.contains_key(&peer.0) {
        return;
    }
    let peripheral = peripheral.clone();
    let peer = peer.clone();
    let addr = peer.0.clone();
    let event_tx = event_tx.clone();
    let handle = tokio::spawn(async move {
        let Ok(mut notifications) = peripheral.notifications().await else {
            return;
        };
        while let Some(data) = notifications.next().await {
            let _ = event_tx.try_send(CentralEvent::Notification {
                token,
                peer: peer.clone(),
                characteristic: data.uuid.to_string(),
                payload: data.value,
            });
        }
    });
    state.notify_tasks.insert(addr, handle);
}

fn find_characteristic(
    peripheral: &Peripheral,
    uuid_text: &str,
) -> Option<btleplug::api::Characteristic> {
    let uuid = Uuid::parse_str(uuid_text).ok()?;
    peripheral
        .characteristics()
        .iter()
        .find(|ch| ch.uuid == uuid)
        .cloned()
}
