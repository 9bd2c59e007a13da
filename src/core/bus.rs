use flume::{Receiver, Sender};
use serde::Serialize;

use super::{
    logs::LogLine,
    types::{Failure, TestKey, TestVerdict, WorkflowState},
};

/// A single key event from the keyboard-wedge scanner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyInput {
    Char(char),
    Enter,
}

/// Messages sent from the operator frontend to the core thread.
#[derive(Debug, Clone, PartialEq)]
pub enum UiToCore {
    /// Begin a run. Ignored unless the workflow is idle.
    Start,
    /// Abort whatever is running and return to idle.
    Reset,
    /// Raw scanner input, routed only during scan phases.
    Key(KeyInput),
    /// Graceful shutdown request.
    Quit,
}

/// Messages sent from the core thread back to the frontend.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum CoreToUi {
    StateChanged {
        state: WorkflowState,
        #[serde(skip_serializing_if = "Option::is_none")]
        failure: Option<Failure>,
    },
    TestVerdict {
        key: TestKey,
        verdict: TestVerdict,
    },
    CodesScanned {
        codes: Vec<String>,
    },
    Log(LogLine),
    /// Core finished shutting down; frontend may exit.
    Quit,
}

/// Holder passed into the frontend loop: receiving side from core and sending side to core.
#[derive(Debug, Clone)]
pub struct Bus {
    pub core_rx: Receiver<CoreToUi>,
    pub ui_tx: Sender<UiToCore>,
}

impl Bus {
    pub fn new(core_rx: Receiver<CoreToUi>, ui_tx: Sender<UiToCore>) -> Self {
        Self { core_rx, ui_tx }
    }
}
