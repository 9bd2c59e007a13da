use anyhow::{anyhow, Result};
use flume::{Receiver, Sender};
use std::{
    io::{ErrorKind, Read, Write},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread::{self, JoinHandle},
    time::Duration,
};

use serialport::SerialPort;

use super::{Emitter, Stamped};
use crate::{
    config::SerialSettings,
    core::waiter::{TextSink, WaitController},
};

/// Outcome and traffic events of the serial link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SerialEvent {
    Connected,
    ReceivedLine(String),
    Error(String),
}

/// What the workflow needs from a UART link.
pub trait SerialLink: TextSink + Send {
    /// Start the link on its own context; reports `Connected` or `Error`.
    fn open(&mut self, attempt: u64);
    /// Stop the link and block until its context has exited. Idempotent.
    fn stop(&mut self);
    fn is_running(&self) -> bool;
}

pub type SerialWaitController<S, A> = WaitController<S, A>;

pub type PortOpener =
    Arc<dyn Fn(&SerialSettings) -> Result<Box<dyn SerialPort>> + Send + Sync + 'static>;

/// Open a serial port with the configured read timeout, enabling exclusive access on Unix systems.
pub fn open_serial_port(settings: &SerialSettings) -> Result<Box<dyn SerialPort>> {
    let port = settings.port.as_str();
    let builder = serialport::new(port, settings.baud_rate).timeout(settings.read_timeout());

    #[cfg(unix)]
    {
        let mut handle = builder
            .open_native()
            .map_err(|err| anyhow!("Failed to open port {port}: {err}"))?;
        handle
            .set_exclusive(true)
            .map_err(|err| anyhow!("Failed to acquire exclusive access to {port}: {err}"))?;
        Ok(Box::new(handle))
    }

    #[cfg(not(unix))]
    {
        builder
            .open()
            .map_err(|err| anyhow!("Failed to open port {port}: {err}"))
    }
}

/// UART client running its read/write loop on a dedicated thread.
pub struct SerialTransport {
    settings: SerialSettings,
    opener: PortOpener,
    evt_tx: Sender<Stamped<SerialEvent>>,
    attempt: u64,
    outbound: Option<Sender<String>>,
    connected: Arc<AtomicBool>,
    stopping: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
}

impl SerialTransport {
    pub fn new(settings: SerialSettings, evt_tx: Sender<Stamped<SerialEvent>>) -> Self {
        Self::with_opener(settings, evt_tx, Arc::new(open_serial_port))
    }

    /// Use a custom way of acquiring the device (pseudo terminals, adapters).
    pub fn with_opener(
        settings: SerialSettings,
        evt_tx: Sender<Stamped<SerialEvent>>,
        opener: PortOpener,
    ) -> Self {
        Self {
            settings,
            opener,
            evt_tx,
            attempt: 0,
            outbound: None,
            connected: Arc::new(AtomicBool::new(false)),
            stopping: Arc::new(AtomicBool::new(false)),
            worker: None,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    fn emitter(&self) -> Emitter<SerialEvent> {
        Emitter::new(self.evt_tx.clone(), self.attempt)
    }
}

impl TextSink for SerialTransport {
    /// Queue `text` for the next drain cycle. Nothing is kept across disconnects.
    fn send_text(&mut self, text: &str) {
        if !self.is_connected() {
            self.emitter()
                .emit(SerialEvent::Error("Serial port is not open".to_string()));
            return;
        }
        match self.outbound.as_ref() {
            Some(tx) if tx.send(text.to_string()).is_ok() => {}
            _ => self
                .emitter()
                .emit(SerialEvent::Error("Serial loop is not running".to_string())),
        }
    }
}

impl SerialLink for SerialTransport {
    fn open(&mut self, attempt: u64) {
        if self.worker.is_some() {
            log::info!("Serial loop already running, restarting it");
            self.stop();
        }

        self.attempt = attempt;
        self.stopping.store(false, Ordering::Release);
        let (out_tx, out_rx) = flume::unbounded();
        self.outbound = Some(out_tx);

        let ctx = LoopContext {
            settings: self.settings.clone(),
            opener: Arc::clone(&self.opener),
            emitter: self.emitter(),
            outbound: out_rx,
            connected: Arc::clone(&self.connected),
            stopping: Arc::clone(&self.stopping),
        };
        let spawned = thread::Builder::new()
            .name("mbt-serial".to_string())
            .spawn(move || run_serial_loop(ctx));
        match spawned {
            Ok(handle) => self.worker = Some(handle),
            Err(err) => {
                self.outbound = None;
                self.emitter().emit(SerialEvent::Error(format!(
                    "Failed to spawn serial thread: {err}"
                )));
            }
        }
    }

    fn stop(&mut self) {
        self.stopping.store(true, Ordering::Release);
        self.outbound = None;
        if let Some(handle) = self.worker.take() {
            if handle.join().is_err() {
                log::warn!("Serial thread panicked");
            }
            log::info!("Serial loop stopped");
        }
        self.connected.store(false, Ordering::Release);
    }

    fn is_running(&self) -> bool {
        self.worker
            .as_ref()
            .map(|handle| !handle.is_finished())
            .unwrap_or(false)
    }
}

impl Drop for SerialTransport {
    fn drop(&mut self) {
        self.stop();
    }
}

struct LoopContext {
    settings: SerialSettings,
    opener: PortOpener,
    emitter: Emitter<SerialEvent>,
    outbound: Receiver<String>,
    connected: Arc<AtomicBool>,
    stopping: Arc<AtomicBool>,
}

/// Open the port, then alternate bounded reads with draining the send queue
/// until stopped. Must run on its own thread.
fn run_serial_loop(ctx: LoopContext) {
    let mut port = match (ctx.opener)(&ctx.settings) {
        Ok(port) => port,
        Err(err) => {
            ctx.emitter.emit(SerialEvent::Error(err.to_string()));
            return;
        }
    };

    ctx.connected.store(true, Ordering::Release);
    ctx.emitter.emit(SerialEvent::Connected);

    let mut assembling: Vec<u8> = Vec::with_capacity(256);
    while !ctx.stopping.load(Ordering::Acquire) {
        if let Err(err) = pump(port.as_mut(), &mut assembling, &ctx) {
            if !ctx.stopping.load(Ordering::Acquire) {
                ctx.emitter.emit(SerialEvent::Error(err));
            }
            break;
        }
    }

    ctx.connected.store(false, Ordering::Release);
    drop(port);
    log::debug!("Serial port {} closed", ctx.settings.port);
}

/// One loop iteration: a bounded read, then the queued writes.
fn pump(
    port: &mut dyn SerialPort,
    assembling: &mut Vec<u8>,
    ctx: &LoopContext,
) -> std::result::Result<(), String> {
    let mut buf = [0u8; 256];
    match port.read(&mut buf) {
        Ok(0) => thread::sleep(Duration::from_millis(1)),
        Ok(n) => {
            assembling.extend_from_slice(&buf[..n]);
            for line in take_lines(assembling) {
                ctx.emitter.emit(SerialEvent::ReceivedLine(line));
            }
        }
        Err(err) if matches!(err.kind(), ErrorKind::TimedOut | ErrorKind::Interrupted) => {}
        Err(err) => return Err(format!("Read error: {err}")),
    }

    for data in ctx.outbound.try_iter() {
        port.write_all(data.as_bytes())
            .and_then(|_| port.flush())
            .map_err(|err| format!("Write error: {err}"))?;
    }
    Ok(())
}

/// Split complete lines off the front of `buffer`, returning the non-empty
/// ones trimmed. An incomplete tail stays in the buffer.
fn take_lines(buffer: &mut Vec<u8>) -> Vec<String> {
    let mut lines = Vec::new();
    while let Some(pos) = buffer.iter().position(|&b| b == b'\n') {
        let raw: Vec<u8> = buffer.drain(..=pos).collect();
        let line = String::from_utf8_lossy(&raw).trim().to_string();
        if !line.is_empty() {
            lines.push(line);
        }
    }
    lines
}
