use anyhow::Result;
use flume::Receiver;
use std::{thread, time::Duration};

use mbt::{
    config::{FirmwareSettings, StationConfig},
    core::{
        bus::{CoreToUi, KeyInput, UiToCore},
        logs::RunLog,
        runtime::{event_channels, run_core_thread},
        types::{TestKey, TestVerdict, WorkflowState},
        waiter::TextSink,
        workflow::Workflow,
    },
    protocol::{
        process::{FlashRunner, ProcessErrorKind, ProcessEvent},
        registration::{HttpMethod, RegistrationBackend, RegistrationEvent, RegistrationRequest},
        serial::{SerialEvent, SerialLink},
        Stamped,
    },
};

#[derive(Debug, Default)]
struct FakeSerial {
    opened: Vec<u64>,
    sent: Vec<String>,
    stops: usize,
    running: bool,
}

impl TextSink for FakeSerial {
    fn send_text(&mut self, text: &str) {
        self.sent.push(text.to_string());
    }
}

impl SerialLink for FakeSerial {
    fn open(&mut self, attempt: u64) {
        self.opened.push(attempt);
        self.running = true;
    }

    fn stop(&mut self) {
        self.stops += 1;
        self.running = false;
    }

    fn is_running(&self) -> bool {
        self.running
    }
}

#[derive(Debug, Default)]
struct FakeRegistration {
    requests: Vec<RegistrationRequest>,
    sent: Vec<u64>,
    stops: usize,
}

impl RegistrationBackend for FakeRegistration {
    fn configure(&mut self, request: RegistrationRequest) {
        self.requests.push(request);
    }

    fn send(&mut self, attempt: u64) {
        self.sent.push(attempt);
    }

    fn stop(&mut self) {
        self.stops += 1;
    }
}

#[derive(Debug, Default)]
struct FakeFlasher {
    started: Vec<(u64, String, Vec<String>)>,
    stdin: Vec<String>,
    stops: usize,
    running: bool,
}

impl TextSink for FakeFlasher {
    fn send_text(&mut self, text: &str) {
        self.stdin.push(text.to_string());
    }
}

impl FlashRunner for FakeFlasher {
    fn start(&mut self, attempt: u64, program: &str, args: &[String]) {
        self.started.push((attempt, program.to_string(), args.to_vec()));
        self.running = true;
    }

    fn stop(&mut self) {
        self.stops += 1;
        self.running = false;
    }

    fn is_running(&self) -> bool {
        self.running
    }
}

type TestWorkflow = Workflow<FakeSerial, FakeRegistration, FakeFlasher>;

struct Station {
    workflow: TestWorkflow,
    ui_rx: Receiver<CoreToUi>,
}

impl Station {
    fn new(mut config: StationConfig) -> Self {
        config.log_dir = None;
        let (ui_tx, ui_rx) = flume::unbounded();
        let log = RunLog::new(None, ui_tx.clone());
        let workflow = Workflow::new(
            config,
            FakeSerial::default(),
            FakeRegistration::default(),
            FakeFlasher::default(),
            log,
            ui_tx,
        );
        Self { workflow, ui_rx }
    }

    fn standard() -> Self {
        Self::new(StationConfig::default())
    }

    fn all(&self) -> Vec<CoreToUi> {
        self.ui_rx.try_iter().collect()
    }

    /// Everything emitted since the last call, log lines excluded.
    fn events(&self) -> Vec<CoreToUi> {
        self.ui_rx
            .try_iter()
            .filter(|msg| !matches!(msg, CoreToUi::Log(_)))
            .collect()
    }

    fn logs(&self) -> Vec<String> {
        log_texts(&self.all())
    }

    fn state(&self) -> WorkflowState {
        self.workflow.state()
    }

    fn serial(&mut self, event: SerialEvent) {
        let attempt = self.workflow.attempt();
        self.workflow.handle_serial(Stamped::new(attempt, event));
    }

    fn line(&mut self, line: &str) {
        self.serial(SerialEvent::ReceivedLine(line.to_string()));
    }

    fn registration(&mut self, event: RegistrationEvent) {
        let attempt = self.workflow.attempt();
        self.workflow.handle_registration(Stamped::new(attempt, event));
    }

    fn answer(&mut self, body: &str) {
        self.registration(RegistrationEvent::Response {
            success: true,
            body: body.to_string(),
        });
    }

    fn process(&mut self, event: ProcessEvent) {
        let attempt = self.workflow.attempt();
        self.workflow.handle_process(Stamped::new(attempt, event));
    }

    fn scan(&mut self, code: &str) {
        for ch in code.chars() {
            self.workflow.key_pressed(KeyInput::Char(ch));
        }
        self.workflow.key_pressed(KeyInput::Enter);
    }

    fn to_registration(&mut self) {
        self.workflow.start();
        self.serial(SerialEvent::Connected);
        self.scan("QR1");
        self.scan("QR2");
        assert_eq!(self.state(), WorkflowState::RegisteringDevice);
    }
}

fn state_changes(events: &[CoreToUi]) -> Vec<WorkflowState> {
    events
        .iter()
        .filter_map(|msg| match msg {
            CoreToUi::StateChanged { state, .. } => Some(*state),
            _ => None,
        })
        .collect()
}

fn verdicts(events: &[CoreToUi]) -> Vec<(TestKey, TestVerdict)> {
    events
        .iter()
        .filter_map(|msg| match msg {
            CoreToUi::TestVerdict { key, verdict } => Some((*key, *verdict)),
            _ => None,
        })
        .collect()
}

fn log_texts(events: &[CoreToUi]) -> Vec<String> {
    events
        .iter()
        .filter_map(|msg| match msg {
            CoreToUi::Log(line) => Some(line.text.clone()),
            _ => None,
        })
        .collect()
}

fn failure_status(events: &[CoreToUi]) -> Option<String> {
    events.iter().find_map(|msg| match msg {
        CoreToUi::StateChanged {
            failure: Some(failure),
            ..
        } => Some(failure.status.clone()),
        _ => None,
    })
}

fn flash_config(pattern: Option<&str>) -> StationConfig {
    StationConfig {
        firmware: Some(FirmwareSettings {
            program: "openocd".to_string(),
            args: vec!["-f".to_string(), "board.cfg".to_string()],
            success_pattern: pattern.map(str::to_string),
            timeout_secs: Some(60),
        }),
        ..StationConfig::default()
    }
}

#[test]
fn test_full_run_reaches_done() {
    let mut station = Station::standard();

    station.workflow.start();
    assert_eq!(
        state_changes(&station.events()),
        vec![WorkflowState::Started, WorkflowState::ConnectingToUart]
    );
    assert_eq!(station.workflow.serial().opened, vec![1]);

    station.serial(SerialEvent::Connected);
    assert_eq!(station.state(), WorkflowState::ScanningQrCodes);

    station.scan("QR1");
    assert_eq!(station.state(), WorkflowState::ScanningQrCodes);
    assert_eq!(station.workflow.data().scanned_codes, vec!["QR1"]);

    station.scan("QR2");
    assert_eq!(station.state(), WorkflowState::RegisteringDevice);
    assert_eq!(station.workflow.data().scanned_codes, vec!["QR1", "QR2"]);

    let registration = station.workflow.registration();
    assert_eq!(registration.sent, vec![1]);
    let request = &registration.requests[0];
    assert_eq!(request.method, HttpMethod::Get);
    assert_eq!(request.path, "getserial");
    assert_eq!(
        request.params,
        vec![
            ("qr1".to_string(), "QR1".to_string()),
            ("qr2".to_string(), "QR2".to_string()),
        ]
    );

    station.answer("SNX MACA MACB");
    assert_eq!(station.state(), WorkflowState::ConnectingCables);
    assert_eq!(
        station.workflow.data().serial_number.as_deref(),
        Some("SNX")
    );
    assert_eq!(station.workflow.data().mac_addresses, vec!["MACA", "MACB"]);

    station.line("U-Boot SPL 2023.04");
    assert_eq!(station.state(), WorkflowState::WaitingForBootPrompt);
    station.line("DRAM:  1 GiB");
    assert_eq!(station.state(), WorkflowState::WaitingForBootPrompt);
    assert!(station.workflow.serial().sent.is_empty());

    station.line("Hit any key to stop autoboot:  3");
    assert_eq!(station.state(), WorkflowState::Done);
    assert_eq!(station.workflow.serial().sent, vec!["STOP\r\n"]);

    station.line("Hit any key to stop autoboot:  2");
    assert_eq!(station.workflow.serial().sent.len(), 1);

    let events = station.events();
    assert_eq!(
        verdicts(&events).last(),
        Some(&(TestKey::BootPromptReceived, TestVerdict::Succeeded))
    );
}

#[test]
fn test_transition_event_order() {
    let mut station = Station::standard();
    station.workflow.start();
    station.events();

    station.serial(SerialEvent::Connected);
    assert_eq!(
        station.events(),
        vec![
            CoreToUi::TestVerdict {
                key: TestKey::ConnectToUart,
                verdict: TestVerdict::Succeeded,
            },
            CoreToUi::StateChanged {
                state: WorkflowState::ScanningQrCodes,
                failure: None,
            },
            CoreToUi::TestVerdict {
                key: TestKey::ScanTwoCodes,
                verdict: TestVerdict::Running,
            },
        ]
    );
}

#[test]
fn test_scanned_codes_are_published() {
    let mut station = Station::standard();
    station.workflow.start();
    station.serial(SerialEvent::Connected);
    station.events();

    station.scan("QR1");
    assert_eq!(
        station.events(),
        vec![CoreToUi::CodesScanned {
            codes: vec!["QR1".to_string()]
        }]
    );
}

#[test]
fn test_third_code_marks_scan_failed_once() {
    let mut station = Station::standard();
    station.to_registration();
    station.events();

    station.workflow.on_code_scanned("QR3".to_string());
    let events = station.all();
    assert_eq!(
        verdicts(&events),
        vec![(TestKey::ScanTwoCodes, TestVerdict::Failed)]
    );
    assert!(state_changes(&events).is_empty());
    assert_eq!(station.state(), WorkflowState::RegisteringDevice);
    assert_eq!(station.workflow.data().scanned_codes, vec!["QR1", "QR2"]);
    assert!(log_texts(&events)
        .iter()
        .any(|line| line.contains("More than 2 dm qr codes scanned somehow!")));

    station.workflow.on_code_scanned("QR4".to_string());
    assert!(verdicts(&station.events()).is_empty());
    assert_eq!(station.workflow.data().scanned_codes.len(), 2);
}

#[test]
fn test_rejected_registration_fails_run() {
    let mut station = Station::standard();
    station.to_registration();
    station.events();

    station.registration(RegistrationEvent::Response {
        success: false,
        body: "unknown board".to_string(),
    });
    let events = station.events();
    assert_eq!(station.state(), WorkflowState::Failed);
    assert_eq!(
        verdicts(&events),
        vec![(TestKey::RegisterDevice, TestVerdict::Failed)]
    );
    assert_eq!(
        failure_status(&events).as_deref(),
        Some("Fetching serial number failed!")
    );
    assert!(station.workflow.data().serial_number.is_none());
    assert!(station.workflow.data().mac_addresses.is_empty());
}

#[test]
fn test_unreachable_server_fails_run() {
    let mut station = Station::standard();
    station.to_registration();
    station.events();

    station.registration(RegistrationEvent::Error("connection refused".to_string()));
    let events = station.events();
    assert_eq!(station.state(), WorkflowState::Failed);
    assert_eq!(
        failure_status(&events).as_deref(),
        Some("Could not reach server!")
    );
}

#[test]
fn test_empty_answer_fails_run() {
    let mut station = Station::standard();
    station.to_registration();
    station.answer("  \n");
    assert_eq!(station.state(), WorkflowState::Failed);
    assert!(station.workflow.data().serial_number.is_none());
}

#[test]
fn test_uart_open_failure() {
    let mut station = Station::standard();
    station.workflow.start();
    station.events();

    station.serial(SerialEvent::Error("No such file or directory".to_string()));
    let events = station.events();
    assert_eq!(station.state(), WorkflowState::Failed);
    assert_eq!(
        verdicts(&events),
        vec![(TestKey::ConnectToUart, TestVerdict::Failed)]
    );
    assert_eq!(
        events.last(),
        Some(&CoreToUi::StateChanged {
            state: WorkflowState::Failed,
            failure: Some(mbt::core::types::Failure::new(
                "Connection to UART failed!",
                "No such file or directory"
            )),
        })
    );

    // Failed is terminal; further errors change nothing.
    station.serial(SerialEvent::Error("again".to_string()));
    assert!(station.events().is_empty());
}

#[test]
fn test_uart_lost_while_waiting_for_prompt() {
    let mut station = Station::standard();
    station.to_registration();
    station.answer("SNX MACA");
    station.line("U-Boot");
    assert_eq!(station.state(), WorkflowState::WaitingForBootPrompt);
    station.events();

    station.serial(SerialEvent::Error("Read error: device disconnected".to_string()));
    let events = station.events();
    assert_eq!(station.state(), WorkflowState::Failed);
    assert_eq!(
        verdicts(&events),
        vec![(TestKey::BootPromptReceived, TestVerdict::Failed)]
    );

    // Waiters are gone with the failed run.
    station.line("Hit any key to stop autoboot");
    assert!(station.workflow.serial().sent.is_empty());
}

#[test]
fn test_start_only_from_idle() {
    let mut station = Station::standard();
    station.workflow.start();
    station.events();
    station.logs();

    station.workflow.start();
    assert!(station.events().is_empty());
    assert_eq!(station.state(), WorkflowState::ConnectingToUart);
    assert_eq!(station.workflow.serial().opened, vec![1]);

    station.workflow.start();
    let logs = station.logs();
    assert_eq!(
        logs,
        vec!["Can not start from state: connecting_to_uart".to_string()]
    );
}

#[test]
fn test_reset_from_any_state() {
    let mut station = Station::standard();
    station.to_registration();
    station.answer("SNX MACA MACB");
    station.line("U-Boot");
    station.line("stop autoboot");
    assert_eq!(station.state(), WorkflowState::Done);
    station.events();

    station.workflow.reset();
    let events = station.events();
    assert_eq!(station.state(), WorkflowState::Idle);
    assert!(station.workflow.data().is_empty());
    assert!(!station.workflow.serial().is_running());
    assert!(!station.workflow.flasher().is_running());
    assert_eq!(station.workflow.registration().stops, 1);
    assert_eq!(station.workflow.flasher().stops, 1);
    assert!(station.workflow.flasher().stdin.is_empty());
    assert_eq!(station.workflow.attempt(), 2);
    assert_eq!(state_changes(&events), vec![WorkflowState::Idle]);
    assert!(events.contains(&CoreToUi::CodesScanned { codes: vec![] }));
    assert_eq!(
        verdicts(&events),
        vec![
            (TestKey::ConnectToUart, TestVerdict::Pending),
            (TestKey::ScanTwoCodes, TestVerdict::Pending),
            (TestKey::RegisterDevice, TestVerdict::Pending),
            (TestKey::ReceiveUartData, TestVerdict::Pending),
            (TestKey::BootPromptReceived, TestVerdict::Pending),
        ]
    );

    station.workflow.reset();
    assert_eq!(station.state(), WorkflowState::Idle);
    assert!(station.workflow.data().is_empty());
    assert_eq!(station.workflow.serial().stops, 2);

    station.workflow.start();
    assert_eq!(station.workflow.serial().opened, vec![1, 3]);
}

#[test]
fn test_reset_mid_scan_clears_partial_input() {
    let mut station = Station::standard();
    station.workflow.start();
    station.serial(SerialEvent::Connected);
    station.scan("QR1");
    station.workflow.key_pressed(KeyInput::Char('X'));

    station.workflow.reset();
    station.workflow.start();
    station.serial(SerialEvent::Connected);
    station.scan("QR9");
    assert_eq!(station.workflow.data().scanned_codes, vec!["QR9"]);
}

#[test]
fn test_stale_events_are_dropped() {
    let mut station = Station::standard();
    station.workflow.start();
    station.workflow.reset();
    station.workflow.start();
    assert_eq!(station.workflow.attempt(), 2);
    station.events();

    station
        .workflow
        .handle_serial(Stamped::new(1, SerialEvent::Connected));
    station
        .workflow
        .handle_serial(Stamped::new(1, SerialEvent::Error("late".to_string())));
    assert_eq!(station.state(), WorkflowState::ConnectingToUart);
    assert!(station.events().is_empty());

    station.serial(SerialEvent::Connected);
    assert_eq!(station.state(), WorkflowState::ScanningQrCodes);
}

#[test]
fn test_stale_registration_after_reset() {
    let mut station = Station::standard();
    station.to_registration();
    station.workflow.reset();
    station
        .workflow
        .handle_registration(Stamped::new(1, RegistrationEvent::Response {
            success: true,
            body: "SNX MACA".to_string(),
        }));
    assert_eq!(station.state(), WorkflowState::Idle);
    assert!(station.workflow.data().is_empty());
}

#[test]
fn test_keys_only_routed_while_scanning() {
    let mut station = Station::standard();
    station.scan("QR1");
    station.workflow.start();
    station.scan("QR1");
    station.serial(SerialEvent::Connected);
    assert!(station.workflow.data().scanned_codes.is_empty());

    // Enter on an empty buffer is not a code.
    station.workflow.key_pressed(KeyInput::Enter);
    assert!(station.workflow.data().scanned_codes.is_empty());
    assert_eq!(station.state(), WorkflowState::ScanningQrCodes);
}

#[test]
fn test_serial_number_scan_step() {
    let mut config = StationConfig::default();
    config.workflow.scan_serial_number = true;
    let mut station = Station::new(config);
    assert!(station
        .workflow
        .checkpoints()
        .contains(&TestKey::ScanSerialNumber));

    station.workflow.start();
    station.serial(SerialEvent::Connected);
    assert_eq!(station.state(), WorkflowState::ScanningSerialNumber);

    station.scan("MB-000123");
    assert_eq!(station.state(), WorkflowState::ScanningQrCodes);
    assert_eq!(
        station.workflow.data().label_serial.as_deref(),
        Some("MB-000123")
    );

    station.scan("QR1");
    station.scan("QR2");
    let request = &station.workflow.registration().requests[0];
    assert_eq!(
        request.params.last(),
        Some(&("serial".to_string(), "MB-000123".to_string()))
    );
}

#[test]
fn test_without_cable_step() {
    let mut config = StationConfig::default();
    config.workflow.connect_cables = false;
    let mut station = Station::new(config);
    assert!(!station
        .workflow
        .checkpoints()
        .contains(&TestKey::ReceiveUartData));

    station.to_registration();
    station.answer("SNX MACA");
    assert_eq!(station.state(), WorkflowState::WaitingForBootPrompt);

    station.line("Hit any key to stop autoboot");
    assert_eq!(station.state(), WorkflowState::Done);
}

#[test]
fn test_flash_confirmed_by_pattern() {
    let mut station = Station::new(flash_config(Some("Verified OK")));
    station.to_registration();
    station.answer("SNX MACA MACB");
    assert_eq!(station.state(), WorkflowState::LoadingFirmware);

    let started = &station.workflow.flasher().started;
    assert_eq!(started.len(), 1);
    assert_eq!(started[0].0, 1);
    assert_eq!(started[0].1, "openocd");

    station.process(ProcessEvent::ErrorOutput("Info : flash size = 256kbytes".into()));
    assert_eq!(station.state(), WorkflowState::LoadingFirmware);

    station.process(ProcessEvent::ErrorOutput("** Verified OK **".into()));
    assert_eq!(station.state(), WorkflowState::ConnectingCables);
    assert!(!station.workflow.flasher().is_running());

    // The stopped tool's exit is no longer of interest.
    station.process(ProcessEvent::Finished(0));
    assert_eq!(station.state(), WorkflowState::ConnectingCables);
}

#[test]
fn test_flash_by_exit_code() {
    let mut station = Station::new(flash_config(None));
    station.to_registration();
    station.answer("SNX MACA");
    station.process(ProcessEvent::Output("Programming Finished".into()));
    assert_eq!(station.state(), WorkflowState::LoadingFirmware);

    station.process(ProcessEvent::Finished(0));
    assert_eq!(station.state(), WorkflowState::ConnectingCables);
}

#[test]
fn test_flash_failures() {
    let mut station = Station::new(flash_config(None));
    station.to_registration();
    station.answer("SNX MACA");
    station.events();
    station.process(ProcessEvent::Finished(1));
    let events = station.events();
    assert_eq!(station.state(), WorkflowState::Failed);
    assert_eq!(
        verdicts(&events),
        vec![(TestKey::LoadFirmware, TestVerdict::Failed)]
    );
    assert_eq!(
        failure_status(&events).as_deref(),
        Some("Loading firmware failed!")
    );

    let mut station = Station::new(flash_config(Some("Verified OK")));
    station.to_registration();
    station.answer("SNX MACA");
    station.process(ProcessEvent::Finished(0));
    assert_eq!(station.state(), WorkflowState::Failed);

    let mut station = Station::new(flash_config(None));
    station.to_registration();
    station.answer("SNX MACA");
    station.process(ProcessEvent::Errored {
        kind: ProcessErrorKind::TimedOut,
        message: "Process did not finish within 60s".into(),
    });
    assert_eq!(station.state(), WorkflowState::Failed);
}

#[test]
fn test_core_loop_dispatches_and_quits() -> Result<()> {
    let (core_tx, core_rx) = flume::unbounded();
    let (ui_tx, ui_rx) = flume::unbounded();
    let (senders, receivers) = event_channels();

    let mut config = StationConfig::default();
    config.log_dir = None;
    let workflow = Workflow::new(
        config,
        FakeSerial::default(),
        FakeRegistration::default(),
        FakeFlasher::default(),
        RunLog::new(None, core_tx.clone()),
        core_tx.clone(),
    );
    let handle = thread::spawn(move || run_core_thread(ui_rx, core_tx, receivers, workflow));

    ui_tx.send(UiToCore::Start)?;
    let wait_for_state = |wanted: WorkflowState| loop {
        match core_rx.recv_timeout(Duration::from_secs(5)) {
            Ok(CoreToUi::StateChanged { state, .. }) if state == wanted => break,
            Ok(_) => continue,
            Err(err) => panic!("no {wanted} state: {err}"),
        }
    };
    wait_for_state(WorkflowState::ConnectingToUart);

    senders
        .serial
        .send(Stamped::new(1, SerialEvent::Connected))?;
    wait_for_state(WorkflowState::ScanningQrCodes);

    ui_tx.send(UiToCore::Quit)?;
    loop {
        match core_rx.recv_timeout(Duration::from_secs(5))? {
            CoreToUi::Quit => break,
            _ => continue,
        }
    }
    handle
        .join()
        .map_err(|_| anyhow::anyhow!("core thread panicked"))??;
    Ok(())
}
