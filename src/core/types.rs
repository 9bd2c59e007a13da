use serde::Serialize;
use strum::{Display, EnumIter};

/// Macro-phase of a test run. Exactly one is active at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum WorkflowState {
    Idle,
    Started,
    ConnectingToUart,
    ScanningSerialNumber,
    ScanningQrCodes,
    RegisteringDevice,
    LoadingFirmware,
    ConnectingCables,
    WaitingForBootPrompt,
    Done,
    Failed,
}

impl WorkflowState {
    /// Raw scanner key events are only routed while a scan phase is active.
    pub fn accepts_scanner_input(self) -> bool {
        matches!(
            self,
            WorkflowState::ScanningSerialNumber | WorkflowState::ScanningQrCodes
        )
    }

    /// States in which a run is in flight and may still fail.
    pub fn is_in_progress(self) -> bool {
        !matches!(
            self,
            WorkflowState::Idle | WorkflowState::Done | WorkflowState::Failed
        )
    }
}

/// Named checkpoints of a run, in traversal order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Display, EnumIter)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum TestKey {
    ConnectToUart,
    ScanSerialNumber,
    ScanTwoCodes,
    RegisterDevice,
    LoadFirmware,
    ReceiveUartData,
    BootPromptReceived,
}

impl TestKey {
    /// Operator-facing label.
    pub fn description(self) -> &'static str {
        match self {
            TestKey::ConnectToUart => "Connect to UART",
            TestKey::ScanSerialNumber => "Scan serial number",
            TestKey::ScanTwoCodes => "Scan two data matrix QR codes",
            TestKey::RegisterDevice => "Fetch serial number and MAC addresses from server",
            TestKey::LoadFirmware => "Load firmware",
            TestKey::ReceiveUartData => "Receive data via UART",
            TestKey::BootPromptReceived => "Receive u-boot prompt",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum TestVerdict {
    Pending,
    Running,
    Succeeded,
    Failed,
}

/// Payload carried by the `Failed` state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Failure {
    /// Short operator-facing status line.
    pub status: String,
    /// Raw error text from the collaborator that failed.
    pub error: String,
}

impl Failure {
    pub fn new(status: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            status: status.into(),
            error: error.into(),
        }
    }
}

/// Serial number and MAC addresses assigned by the backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RegistrationResult {
    pub serial_number: String,
    pub mac_addresses: Vec<String>,
}

impl RegistrationResult {
    /// Parse a whitespace-delimited `<serial> <mac1> ... <macN>` body.
    /// Returns `None` when the body holds no tokens at all.
    pub fn parse(body: &str) -> Option<Self> {
        let mut tokens = body.split_whitespace().map(str::to_string);
        let serial_number = tokens.next()?;
        Some(Self {
            serial_number,
            mac_addresses: tokens.collect(),
        })
    }
}

/// Data accumulated over one run. Cleared as a whole on reset.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TestData {
    /// Data matrix codes in arrival order, at most two.
    pub scanned_codes: Vec<String>,
    /// Serial number read from the board label, when that step is enabled.
    pub label_serial: Option<String>,
    /// Serial number assigned by the backend.
    pub serial_number: Option<String>,
    pub mac_addresses: Vec<String>,
}

impl TestData {
    pub fn clear(&mut self) {
        self.scanned_codes.clear();
        self.label_serial = None;
        self.serial_number = None;
        self.mac_addresses.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.scanned_codes.is_empty()
            && self.label_serial.is_none()
            && self.serial_number.is_none()
            && self.mac_addresses.is_empty()
    }

    pub fn apply_registration(&mut self, result: RegistrationResult) {
        self.serial_number = Some(result.serial_number);
        self.mac_addresses = result.mac_addresses;
    }
}
