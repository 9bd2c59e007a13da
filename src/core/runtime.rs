//! Coordinating thread of the station
//!
//! One thread owns the workflow and waits on the frontend channel and the
//! three collaborator event channels at once. Messages are handled one at a
//! time in arrival order, so the workflow never sees two events concurrently.

use anyhow::{anyhow, Result};
use flume::{Receiver, RecvError, Selector, Sender};
use std::thread::{self, JoinHandle};

use super::{
    bus::{Bus, CoreToUi, UiToCore},
    logs::RunLog,
    workflow::Workflow,
};
use crate::{
    config::StationConfig,
    protocol::{
        process::{FlashRunner, ProcessEvent, ProcessRunner},
        registration::{RegistrationBackend, RegistrationClient, RegistrationEvent},
        serial::{SerialEvent, SerialLink, SerialTransport},
        Stamped,
    },
};

/// Sending halves handed to the collaborators.
#[derive(Debug, Clone)]
pub struct EventSenders {
    pub serial: Sender<Stamped<SerialEvent>>,
    pub registration: Sender<Stamped<RegistrationEvent>>,
    pub process: Sender<Stamped<ProcessEvent>>,
}

/// Receiving halves drained by the core thread.
#[derive(Debug)]
pub struct EventReceivers {
    pub serial: Receiver<Stamped<SerialEvent>>,
    pub registration: Receiver<Stamped<RegistrationEvent>>,
    pub process: Receiver<Stamped<ProcessEvent>>,
}

pub fn event_channels() -> (EventSenders, EventReceivers) {
    let (serial_tx, serial_rx) = flume::unbounded();
    let (registration_tx, registration_rx) = flume::unbounded();
    let (process_tx, process_rx) = flume::unbounded();
    (
        EventSenders {
            serial: serial_tx,
            registration: registration_tx,
            process: process_tx,
        },
        EventReceivers {
            serial: serial_rx,
            registration: registration_rx,
            process: process_rx,
        },
    )
}

enum Inbound {
    Ui(UiToCore),
    Serial(Stamped<SerialEvent>),
    Registration(Stamped<RegistrationEvent>),
    Process(Stamped<ProcessEvent>),
    /// The frontend went away without saying goodbye.
    UiClosed,
    Closed(&'static str),
}

fn select<T>(
    msg: Result<T, RecvError>,
    wrap: fn(T) -> Inbound,
    source: &'static str,
) -> Inbound {
    msg.map(wrap).unwrap_or(Inbound::Closed(source))
}

/// Run the core loop until the frontend quits.
///
/// `UiToCore::Quit` (or a closed frontend channel) stops every collaborator
/// and answers with `CoreToUi::Quit`.
pub fn run_core_thread<S, R, P>(
    ui_rx: Receiver<UiToCore>,
    core_tx: Sender<CoreToUi>,
    events: EventReceivers,
    mut workflow: Workflow<S, R, P>,
) -> Result<()>
where
    S: SerialLink,
    R: RegistrationBackend,
    P: FlashRunner,
{
    workflow.announce();

    loop {
        let inbound = Selector::new()
            .recv(&ui_rx, |msg| msg.map(Inbound::Ui).unwrap_or(Inbound::UiClosed))
            .recv(&events.serial, |msg| select(msg, Inbound::Serial, "serial"))
            .recv(&events.registration, |msg| {
                select(msg, Inbound::Registration, "registration")
            })
            .recv(&events.process, |msg| select(msg, Inbound::Process, "process"))
            .wait();

        match inbound {
            Inbound::Ui(UiToCore::Start) => workflow.start(),
            Inbound::Ui(UiToCore::Reset) => workflow.reset(),
            Inbound::Ui(UiToCore::Key(key)) => workflow.key_pressed(key),
            Inbound::Ui(UiToCore::Quit) => {
                log::info!("Received quit signal");
                workflow.shutdown();
                core_tx
                    .send(CoreToUi::Quit)
                    .map_err(|err| anyhow!("Failed to send Quit to UI: {err}"))?;
                return Ok(());
            }
            Inbound::UiClosed => {
                log::info!("Frontend channel closed, shutting down");
                workflow.shutdown();
                return Ok(());
            }
            Inbound::Serial(event) => workflow.handle_serial(event),
            Inbound::Registration(event) => workflow.handle_registration(event),
            Inbound::Process(event) => workflow.handle_process(event),
            Inbound::Closed(source) => {
                workflow.shutdown();
                return Err(anyhow!("{source} event channel closed unexpectedly"));
            }
        }
    }
}

/// Wire the real collaborators to a workflow and start the core thread.
pub fn spawn_station(config: &StationConfig) -> Result<(Bus, JoinHandle<Result<()>>)> {
    let (core_tx, core_rx) = flume::unbounded::<CoreToUi>();
    let (ui_tx, ui_rx) = flume::unbounded::<UiToCore>();
    let (senders, receivers) = event_channels();

    let serial = SerialTransport::new(config.serial.clone(), senders.serial);
    let registration = RegistrationClient::new(
        config.server_endpoint.clone(),
        config.registration.timeout(),
        senders.registration,
    );
    let flasher = ProcessRunner::new(
        senders.process,
        config.firmware.as_ref().and_then(|fw| fw.timeout()),
    );
    let log = RunLog::new(config.log_dir.clone(), core_tx.clone());
    let workflow = Workflow::new(
        config.clone(),
        serial,
        registration,
        flasher,
        log,
        core_tx.clone(),
    );

    let handle = thread::Builder::new()
        .name("mbt-core".to_string())
        .spawn(move || run_core_thread(ui_rx, core_tx, receivers, workflow))
        .map_err(|err| anyhow!("Failed to spawn core thread: {err}"))?;

    Ok((Bus::new(core_rx, ui_tx), handle))
}
