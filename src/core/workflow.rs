//! Test run sequencer
//!
//! The workflow owns the serial link, the registration client and the flash
//! runner, starts each one when its step is entered and turns their stamped
//! events into state changes and checkpoint verdicts. It never blocks on I/O:
//! every collaborator reports back through its event channel and the core
//! thread feeds those events in here one at a time.

use flume::Sender;
use strum::IntoEnumIterator;

use super::{
    bus::{CoreToUi, KeyInput},
    logs::RunLog,
    scanner::ScannerInput,
    types::{Failure, RegistrationResult, TestData, TestKey, TestVerdict, WorkflowState},
};
use crate::{
    config::StationConfig,
    protocol::{
        process::{FlashRunner, ProcessEvent, ProcessWaitController},
        registration::{RegistrationBackend, RegistrationEvent, RegistrationRequest},
        serial::{SerialEvent, SerialLink, SerialWaitController},
        Stamped,
    },
};

const UART_FAILED: &str = "Connection to UART failed!";
const UART_LOST: &str = "UART connection lost!";
const REGISTRATION_FAILED: &str = "Fetching serial number failed!";
const SERVER_UNREACHABLE: &str = "Could not reach server!";
const FIRMWARE_FAILED: &str = "Loading firmware failed!";

/// What a fired waiter asks the workflow to do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepAction {
    /// First line of any kind seen on the UART after cabling.
    SerialDataSeen,
    BootPromptSeen,
    /// Flash tool printed its success pattern.
    FirmwareConfirmed,
}

pub struct Workflow<S: SerialLink, R: RegistrationBackend, P: FlashRunner> {
    config: StationConfig,
    state: WorkflowState,
    attempt: u64,
    data: TestData,
    /// Checkpoint currently reported as `Running`.
    running_key: Option<TestKey>,
    overscan_reported: bool,
    log: RunLog,
    scanner: ScannerInput,
    serial: SerialWaitController<S, StepAction>,
    registration: R,
    flasher: ProcessWaitController<P, StepAction>,
    ui_tx: Sender<CoreToUi>,
}

impl<S: SerialLink, R: RegistrationBackend, P: FlashRunner> Workflow<S, R, P> {
    pub fn new(
        config: StationConfig,
        serial: S,
        registration: R,
        flasher: P,
        log: RunLog,
        ui_tx: Sender<CoreToUi>,
    ) -> Self {
        Self {
            config,
            state: WorkflowState::Idle,
            attempt: 1,
            data: TestData::default(),
            running_key: None,
            overscan_reported: false,
            log,
            scanner: ScannerInput::new(),
            serial: SerialWaitController::new(serial),
            registration,
            flasher: ProcessWaitController::new(flasher),
            ui_tx,
        }
    }

    pub fn state(&self) -> WorkflowState {
        self.state
    }

    pub fn data(&self) -> &TestData {
        &self.data
    }

    /// Number of the current run; events stamped with any other number are dropped.
    pub fn attempt(&self) -> u64 {
        self.attempt
    }

    pub fn config(&self) -> &StationConfig {
        &self.config
    }

    pub fn serial(&self) -> &S {
        self.serial.sink()
    }

    pub fn registration(&self) -> &R {
        &self.registration
    }

    pub fn flasher(&self) -> &P {
        self.flasher.sink()
    }

    pub fn run_log(&self) -> &RunLog {
        &self.log
    }

    /// Checkpoints that take part in a run with the current configuration.
    pub fn checkpoints(&self) -> Vec<TestKey> {
        let workflow = &self.config.workflow;
        TestKey::iter()
            .filter(|key| match key {
                TestKey::ScanSerialNumber => workflow.scan_serial_number,
                TestKey::LoadFirmware => self.config.firmware.is_some(),
                TestKey::ReceiveUartData => workflow.connect_cables,
                _ => true,
            })
            .collect()
    }

    /// Publish the current state and pending checkpoints so a fresh frontend can draw them.
    pub fn announce(&self) {
        self.emit(CoreToUi::StateChanged {
            state: self.state,
            failure: None,
        });
        for key in self.checkpoints() {
            self.emit_verdict(key, TestVerdict::Pending);
        }
    }

    pub fn start(&mut self) {
        if self.state != WorkflowState::Idle {
            self.log
                .error(format!("Can not start from state: {}", self.state));
            return;
        }

        self.log.info("Starting test run");
        self.change_state(WorkflowState::Started);
        self.advance(WorkflowState::ConnectingToUart, Some(TestKey::ConnectToUart));
        self.log.info(format!(
            "Connecting to UART {} at {} baud",
            self.config.serial.port, self.config.serial.baud_rate
        ));
        self.serial.sink_mut().open(self.attempt);
    }

    /// Abort whatever is in flight and return to `Idle`. Valid from any state.
    ///
    /// All collaborators are stopped and joined before the attempt number
    /// moves on, so nothing from the previous run can reach the next one.
    pub fn reset(&mut self) {
        self.log.info("--- Resetting ---");
        self.stop_collaborators();
        self.data.clear();
        self.scanner.clear();
        self.running_key = None;
        self.overscan_reported = false;
        self.attempt += 1;
        self.log.reopen();

        self.change_state(WorkflowState::Idle);
        self.emit(CoreToUi::CodesScanned { codes: Vec::new() });
        for key in self.checkpoints() {
            self.emit_verdict(key, TestVerdict::Pending);
        }
    }

    /// Stop every collaborator ahead of process exit.
    pub fn shutdown(&mut self) {
        self.log.info("Shutting down");
        self.stop_collaborators();
    }

    /// Raw scanner key. Only routed while a scan step is active.
    pub fn key_pressed(&mut self, key: KeyInput) {
        if !self.state.accepts_scanner_input() {
            log::debug!("Ignoring key {key:?} in state {}", self.state);
            return;
        }
        if let Some(code) = self.scanner.handle_key(key) {
            self.on_code_scanned(code);
        }
    }

    /// A complete code from the scanner.
    pub fn on_code_scanned(&mut self, code: String) {
        let code = code.trim().to_string();
        if code.is_empty() {
            self.log.info("Ignoring empty scan");
            return;
        }
        if !self.state.is_in_progress() {
            self.log
                .info(format!("Ignoring code {code} in state {}", self.state));
            return;
        }

        // The run keeps its state; only the scan checkpoint is marked, once.
        if self.data.scanned_codes.len() >= 2 {
            self.log.error(format!(
                "More than 2 dm qr codes scanned somehow! Extra code: {code}"
            ));
            if !self.overscan_reported {
                self.overscan_reported = true;
                self.emit_verdict(TestKey::ScanTwoCodes, TestVerdict::Failed);
            }
            return;
        }

        match self.state {
            WorkflowState::ScanningSerialNumber => {
                self.log.info(format!("Serial number label scanned: {code}"));
                self.data.label_serial = Some(code);
                self.enter_qr_scan();
            }
            WorkflowState::ScanningQrCodes => {
                self.data.scanned_codes.push(code.clone());
                self.log.info(format!(
                    "Data matrix code {} scanned: {code}",
                    self.data.scanned_codes.len()
                ));
                self.emit(CoreToUi::CodesScanned {
                    codes: self.data.scanned_codes.clone(),
                });
                if self.data.scanned_codes.len() == 2 {
                    self.register_device();
                }
            }
            state => self
                .log
                .info(format!("Ignoring code {code} in state {state}")),
        }
    }

    pub fn handle_serial(&mut self, stamped: Stamped<SerialEvent>) {
        if !self.is_current(stamped.attempt, "serial") {
            return;
        }
        match stamped.event {
            SerialEvent::Connected => {
                if self.state != WorkflowState::ConnectingToUart {
                    log::debug!("Late serial connect in state {}", self.state);
                    return;
                }
                self.log.info("Connected to UART");
                if self.config.workflow.scan_serial_number {
                    self.advance(
                        WorkflowState::ScanningSerialNumber,
                        Some(TestKey::ScanSerialNumber),
                    );
                    self.log.info("Scan the serial number label");
                } else {
                    self.enter_qr_scan();
                }
            }
            SerialEvent::ReceivedLine(line) => {
                self.log.info_quiet(format!("S> {line}"));
                for action in self.serial.on_line(&line) {
                    self.dispatch(action);
                }
            }
            SerialEvent::Error(err) => {
                self.log.error(format!("UART connection FAILED: {err}"));
                let status = if self.state == WorkflowState::ConnectingToUart {
                    UART_FAILED
                } else {
                    UART_LOST
                };
                self.fail(status, err);
            }
        }
    }

    pub fn handle_registration(&mut self, stamped: Stamped<RegistrationEvent>) {
        if !self.is_current(stamped.attempt, "registration") {
            return;
        }
        if self.state != WorkflowState::RegisteringDevice {
            log::debug!("Registration answer in state {}, ignoring", self.state);
            return;
        }
        match stamped.event {
            RegistrationEvent::Response {
                success: true,
                body,
            } => match RegistrationResult::parse(&body) {
                Some(result) => {
                    self.log.info(format!(
                        "Serial number: {}, MAC addresses: {}",
                        result.serial_number,
                        result.mac_addresses.join(", ")
                    ));
                    self.data.apply_registration(result);
                    self.after_registration();
                }
                None => {
                    self.log.error("Server returned an empty response");
                    self.fail(REGISTRATION_FAILED, "Empty response from server");
                }
            },
            RegistrationEvent::Response {
                success: false,
                body,
            } => {
                self.log.error(format!("Server rejected registration: {body}"));
                self.fail(REGISTRATION_FAILED, body);
            }
            RegistrationEvent::Error(err) => {
                self.log.error(format!("Registration request failed: {err}"));
                self.fail(SERVER_UNREACHABLE, err);
            }
        }
    }

    pub fn handle_process(&mut self, stamped: Stamped<ProcessEvent>) {
        if !self.is_current(stamped.attempt, "process") {
            return;
        }
        match stamped.event {
            ProcessEvent::Output(line) => {
                self.log.info_quiet(format!("P> {line}"));
                for action in self.flasher.on_line(&line) {
                    self.dispatch(action);
                }
            }
            ProcessEvent::ErrorOutput(line) => {
                self.log.info_quiet(format!("P! {line}"));
                for action in self.flasher.on_line(&line) {
                    self.dispatch(action);
                }
            }
            ProcessEvent::Finished(code) => {
                if self.state != WorkflowState::LoadingFirmware {
                    return;
                }
                let confirmed_by_pattern = self
                    .config
                    .firmware
                    .as_ref()
                    .is_some_and(|fw| fw.success_pattern.is_some());
                if code == 0 && !confirmed_by_pattern {
                    self.log.info("Firmware loaded");
                    self.after_firmware();
                } else {
                    let error = if code == 0 {
                        "Flash tool exited without confirming success".to_string()
                    } else {
                        format!("Flash tool exited with code {code}")
                    };
                    self.log.error(&error);
                    self.fail(FIRMWARE_FAILED, error);
                }
            }
            ProcessEvent::Errored { kind, message } => {
                self.log.error(format!("Flash tool error ({kind}): {message}"));
                if self.state == WorkflowState::LoadingFirmware {
                    self.fail(FIRMWARE_FAILED, format!("{kind}: {message}"));
                }
            }
        }
    }

    fn dispatch(&mut self, action: StepAction) {
        match (action, self.state) {
            (StepAction::SerialDataSeen, WorkflowState::ConnectingCables) => {
                self.log.info("Received data via UART");
                self.wait_for_boot_prompt();
            }
            (StepAction::BootPromptSeen, WorkflowState::WaitingForBootPrompt) => {
                self.log.info("Boot prompt received");
                self.advance(WorkflowState::Done, None);
                self.log.info("Done!");
            }
            (StepAction::FirmwareConfirmed, WorkflowState::LoadingFirmware) => {
                self.log.info("Firmware loaded");
                self.flasher.clear();
                self.flasher.sink_mut().stop();
                self.after_firmware();
            }
            (action, state) => log::debug!("Ignoring {action:?} in state {state}"),
        }
    }

    fn enter_qr_scan(&mut self) {
        self.advance(WorkflowState::ScanningQrCodes, Some(TestKey::ScanTwoCodes));
        self.log.info("Scan the two data matrix codes");
    }

    fn register_device(&mut self) {
        self.advance(
            WorkflowState::RegisteringDevice,
            Some(TestKey::RegisterDevice),
        );

        let mut params = vec![
            ("qr1".to_string(), self.data.scanned_codes[0].clone()),
            ("qr2".to_string(), self.data.scanned_codes[1].clone()),
        ];
        if let Some(serial) = self.data.label_serial.clone() {
            params.push(("serial".to_string(), serial));
        }
        let settings = &self.config.registration;
        let request = RegistrationRequest {
            method: settings.method,
            path: settings.path.clone(),
            params,
        };

        self.log
            .info("Fetching serial number and MAC addresses from server");
        self.registration.configure(request);
        self.registration.send(self.attempt);
    }

    fn after_registration(&mut self) {
        let Some(firmware) = self.config.firmware.clone() else {
            self.after_firmware();
            return;
        };

        self.advance(WorkflowState::LoadingFirmware, Some(TestKey::LoadFirmware));
        if let Some(pattern) = firmware.success_pattern {
            self.flasher
                .wait_for(pattern, StepAction::FirmwareConfirmed);
        }
        self.log.info(format!("Loading firmware with {}", firmware.program));
        self.flasher
            .sink_mut()
            .start(self.attempt, &firmware.program, &firmware.args);
    }

    fn after_firmware(&mut self) {
        if self.config.workflow.connect_cables {
            self.advance(
                WorkflowState::ConnectingCables,
                Some(TestKey::ReceiveUartData),
            );
            self.serial.wait_for("", StepAction::SerialDataSeen);
            self.log.info("Connect the remaining cables and power the board");
        } else {
            self.wait_for_boot_prompt();
        }
    }

    fn wait_for_boot_prompt(&mut self) {
        self.advance(
            WorkflowState::WaitingForBootPrompt,
            Some(TestKey::BootPromptReceived),
        );
        let workflow = &self.config.workflow;
        let (prompt, interrupt) = (workflow.boot_prompt.clone(), workflow.boot_interrupt.clone());
        self.serial
            .wait_for_and_send(prompt, interrupt, StepAction::BootPromptSeen);
    }

    /// Forward transition: previous checkpoint succeeded, new state, new checkpoint running.
    fn advance(&mut self, next: WorkflowState, checkpoint: Option<TestKey>) {
        if let Some(previous) = self.running_key.take() {
            self.emit_verdict(previous, TestVerdict::Succeeded);
        }
        self.change_state(next);
        if let Some(key) = checkpoint {
            self.running_key = Some(key);
            self.emit_verdict(key, TestVerdict::Running);
        }
    }

    /// Terminal failure of the current run. Waits are dropped and the flash
    /// tool stopped; the serial link stays up until reset.
    fn fail(&mut self, status: &str, error: impl Into<String>) {
        if !self.state.is_in_progress() {
            log::debug!("Failure '{status}' outside a run, state {}", self.state);
            return;
        }
        let failure = Failure::new(status, error);

        if let Some(key) = self.running_key.take() {
            self.emit_verdict(key, TestVerdict::Failed);
        }
        self.serial.clear();
        self.flasher.clear();
        self.flasher.sink_mut().stop();

        self.state = WorkflowState::Failed;
        log::info!("Workflow state -> {}", self.state);
        self.emit(CoreToUi::StateChanged {
            state: WorkflowState::Failed,
            failure: Some(failure),
        });
    }

    fn stop_collaborators(&mut self) {
        self.serial.clear();
        self.serial.sink_mut().stop();
        self.flasher.clear();
        self.flasher.sink_mut().stop();
        self.registration.stop();
    }

    fn is_current(&self, attempt: u64, source: &str) -> bool {
        if attempt != self.attempt {
            log::debug!(
                "Dropping stale {source} event from attempt {attempt} (current {})",
                self.attempt
            );
            return false;
        }
        true
    }

    fn change_state(&mut self, next: WorkflowState) {
        self.state = next;
        log::info!("Workflow state -> {next}");
        self.emit(CoreToUi::StateChanged {
            state: next,
            failure: None,
        });
    }

    fn emit_verdict(&self, key: TestKey, verdict: TestVerdict) {
        self.emit(CoreToUi::TestVerdict { key, verdict });
    }

    fn emit(&self, msg: CoreToUi) {
        if self.ui_tx.send(msg).is_err() {
            log::debug!("Frontend channel closed");
        }
    }
}
