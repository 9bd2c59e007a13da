use anyhow::{anyhow, Result};
use flume::Sender;
use std::{
    io::{self, BufRead, Write},
    thread,
};

use crate::core::{
    bus::{Bus, CoreToUi, KeyInput, UiToCore},
    types::TestVerdict,
};

/// Translate one line typed by the operator into frontend messages.
///
/// `:start`, `:reset` and `:quit` are commands; anything else is treated as
/// keyboard-wedge scanner output and replayed key by key, ending with Enter.
pub fn parse_line(line: &str) -> Vec<UiToCore> {
    match line.trim() {
        ":start" | ":s" => vec![UiToCore::Start],
        ":reset" | ":r" => vec![UiToCore::Reset],
        ":quit" | ":q" => vec![UiToCore::Quit],
        _ => line
            .trim_end_matches(['\r', '\n'])
            .chars()
            .map(|ch| UiToCore::Key(KeyInput::Char(ch)))
            .chain(std::iter::once(UiToCore::Key(KeyInput::Enter)))
            .collect(),
    }
}

/// Human-readable rendering of a core event; `None` for events not shown.
pub fn render(msg: &CoreToUi) -> Option<String> {
    match msg {
        CoreToUi::StateChanged {
            state,
            failure: None,
        } => Some(format!("== {state}")),
        CoreToUi::StateChanged {
            state,
            failure: Some(failure),
        } => Some(format!("== {state}: {} {}", failure.status, failure.error)),
        CoreToUi::TestVerdict { key, verdict } => {
            let mark = match verdict {
                TestVerdict::Pending => " ",
                TestVerdict::Running => "~",
                TestVerdict::Succeeded => "+",
                TestVerdict::Failed => "!",
            };
            Some(format!("[{mark}] {}", key.description()))
        }
        CoreToUi::CodesScanned { codes } if !codes.is_empty() => {
            Some(format!("   codes: {}", codes.join(", ")))
        }
        CoreToUi::CodesScanned { .. } => None,
        CoreToUi::Log(line) if !line.display => None,
        CoreToUi::Log(line) if line.is_error => Some(format!("   ERROR {}", line.text)),
        CoreToUi::Log(line) => Some(format!("   {}", line.text)),
        CoreToUi::Quit => None,
    }
}

fn spawn_input_reader(ui_tx: Sender<UiToCore>) -> Result<()> {
    thread::Builder::new()
        .name("mbt-console-input".to_string())
        .spawn(move || {
            let stdin = io::stdin();
            for line in stdin.lock().lines() {
                let Ok(line) = line else { break };
                for msg in parse_line(&line) {
                    if ui_tx.send(msg).is_err() {
                        return;
                    }
                }
            }
            log::info!("Console input closed");
            let _ = ui_tx.send(UiToCore::Quit);
        })
        .map_err(|err| anyhow!("Failed to spawn console input thread: {err}"))?;
    Ok(())
}

/// Operator console on stdin/stdout. Returns once the core has acknowledged Quit.
pub fn run_console(bus: Bus, json: bool) -> Result<()> {
    spawn_input_reader(bus.ui_tx.clone())?;
    if !json {
        println!("Commands: :start, :reset, :quit. Any other line is taken as a scanned code.");
    }

    let mut stdout = io::stdout();
    while let Ok(msg) = bus.core_rx.recv() {
        let out = if json {
            Some(serde_json::to_string(&msg)?)
        } else {
            render(&msg)
        };
        if let Some(text) = out {
            writeln!(stdout, "{text}")?;
            stdout.flush()?;
        }
        if matches!(msg, CoreToUi::Quit) {
            break;
        }
    }
    Ok(())
}
