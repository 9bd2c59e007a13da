use flume::Sender;
use std::{
    io::{BufRead, BufReader, Read, Write},
    process::{Child, ChildStdin, Command, Stdio},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use super::{Emitter, Stamped};
use crate::core::waiter::{TextSink, WaitController};

const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(20);

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "kebab-case")]
pub enum ProcessErrorKind {
    FailedToStart,
    /// Terminated by a signal nobody asked for.
    Crashed,
    TimedOut,
    WriteError,
    ReadError,
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessEvent {
    Output(String),
    ErrorOutput(String),
    Finished(i32),
    Errored {
        kind: ProcessErrorKind,
        message: String,
    },
}

/// What the workflow needs from the external flashing tool.
pub trait FlashRunner: TextSink + Send {
    fn start(&mut self, attempt: u64, program: &str, args: &[String]);
    /// Terminate the child and wait until it and its readers are gone.
    /// The resulting abnormal exit is not reported. Idempotent.
    fn stop(&mut self);
    fn is_running(&self) -> bool;
}

pub type ProcessWaitController<P, A> = WaitController<P, A>;

/// Runs one child process at a time and streams its output line by line.
pub struct ProcessRunner {
    evt_tx: Sender<Stamped<ProcessEvent>>,
    timeout: Option<Duration>,
    attempt: u64,
    stdin: Option<ChildStdin>,
    stop_requested: Arc<AtomicBool>,
    monitor: Option<JoinHandle<()>>,
}

impl ProcessRunner {
    pub fn new(evt_tx: Sender<Stamped<ProcessEvent>>, timeout: Option<Duration>) -> Self {
        Self {
            evt_tx,
            timeout,
            attempt: 0,
            stdin: None,
            stop_requested: Arc::new(AtomicBool::new(false)),
            monitor: None,
        }
    }

    fn emitter(&self) -> Emitter<ProcessEvent> {
        Emitter::new(self.evt_tx.clone(), self.attempt)
    }
}

impl TextSink for ProcessRunner {
    /// Write `text` plus a newline to the child's stdin.
    fn send_text(&mut self, text: &str) {
        let result = match self.stdin.as_mut() {
            Some(stdin) => stdin
                .write_all(text.as_bytes())
                .and_then(|_| stdin.write_all(b"\n"))
                .and_then(|_| stdin.flush())
                .map_err(|err| err.to_string()),
            None => Err("Process is not running".to_string()),
        };
        if let Err(message) = result {
            self.emitter().emit(ProcessEvent::Errored {
                kind: ProcessErrorKind::WriteError,
                message,
            });
        }
    }
}

impl FlashRunner for ProcessRunner {
    fn start(&mut self, attempt: u64, program: &str, args: &[String]) {
        self.stop();
        self.attempt = attempt;
        self.stop_requested.store(false, Ordering::Release);

        log::info!("Starting {program} {}", args.join(" "));
        let mut command = Command::new(program);
        command
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        // Own process group, so helpers started by a wrapper script die with it.
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            command.process_group(0);
        }
        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(err) => {
                self.emitter().emit(ProcessEvent::Errored {
                    kind: ProcessErrorKind::FailedToStart,
                    message: format!("Failed to start {program}: {err}"),
                });
                return;
            }
        };
        log::info!("{program} spawned with PID: {}", child.id());

        self.stdin = child.stdin.take();
        let mut readers = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            readers.push(spawn_reader(stdout, self.emitter(), ProcessEvent::Output));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(spawn_reader(stderr, self.emitter(), ProcessEvent::ErrorOutput));
        }

        let ctx = MonitorContext {
            child,
            readers,
            emitter: self.emitter(),
            stop_requested: Arc::clone(&self.stop_requested),
            timeout: self.timeout,
        };
        match thread::Builder::new()
            .name("mbt-process".to_string())
            .spawn(move || monitor_child(ctx))
        {
            Ok(handle) => self.monitor = Some(handle),
            Err(err) => {
                // The context was moved into the failed spawn and dropped;
                // the child is left to the OS.
                self.stdin = None;
                self.emitter().emit(ProcessEvent::Errored {
                    kind: ProcessErrorKind::Unknown,
                    message: format!("Failed to spawn process monitor: {err}"),
                });
            }
        }
    }

    fn stop(&mut self) {
        self.stop_requested.store(true, Ordering::Release);
        self.stdin = None;
        if let Some(handle) = self.monitor.take() {
            if handle.join().is_err() {
                log::warn!("Process monitor panicked");
            }
        }
    }

    fn is_running(&self) -> bool {
        self.monitor
            .as_ref()
            .map(|handle| !handle.is_finished())
            .unwrap_or(false)
    }
}

impl Drop for ProcessRunner {
    fn drop(&mut self) {
        self.stop();
    }
}

fn spawn_reader<R: Read + Send + 'static>(
    stream: R,
    emitter: Emitter<ProcessEvent>,
    wrap: fn(String) -> ProcessEvent,
) -> JoinHandle<()> {
    thread::spawn(move || {
        let mut reader = BufReader::new(stream);
        let mut raw = Vec::new();
        loop {
            raw.clear();
            match reader.read_until(b'\n', &mut raw) {
                Ok(0) => break,
                Ok(_) => {
                    let line = String::from_utf8_lossy(&raw);
                    let trimmed = line.trim_end_matches(['\r', '\n']);
                    if !trimmed.is_empty() {
                        emitter.emit(wrap(trimmed.to_string()));
                    }
                }
                Err(err) => {
                    emitter.emit(ProcessEvent::Errored {
                        kind: ProcessErrorKind::ReadError,
                        message: err.to_string(),
                    });
                    break;
                }
            }
        }
    })
}

struct MonitorContext {
    child: Child,
    readers: Vec<JoinHandle<()>>,
    emitter: Emitter<ProcessEvent>,
    stop_requested: Arc<AtomicBool>,
    timeout: Option<Duration>,
}

impl MonitorContext {
    /// SIGKILL everything left in the child's process group. The group
    /// outlives a reaped leader only while members remain, so the id cannot
    /// have been reused.
    #[cfg(unix)]
    fn kill_group(&self) {
        let pgid = self.child.id() as libc::pid_t;
        // SAFETY: killpg has no memory-safety preconditions.
        if unsafe { libc::killpg(pgid, libc::SIGKILL) } != 0 {
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::ESRCH) {
                log::debug!("killpg({pgid}) failed: {err}");
            }
        }
    }

    #[cfg(not(unix))]
    fn kill_group(&self) {}

    fn kill(&mut self) {
        self.kill_group();
        if let Err(err) = self.child.kill() {
            log::debug!("Kill failed (child may have exited already): {err}");
        }
        if let Err(err) = self.child.wait() {
            log::warn!("Failed to reap child: {err}");
        }
    }

    /// Readers finish once the child's pipes close. Joining them before the
    /// final event keeps every output line ahead of it.
    fn join_readers(&mut self) {
        for reader in self.readers.drain(..) {
            if reader.join().is_err() {
                log::warn!("Process output reader panicked");
            }
        }
    }
}

/// Watch the child until it exits, is stopped or runs out of time.
fn monitor_child(mut ctx: MonitorContext) {
    let started = Instant::now();
    loop {
        if ctx.stop_requested.load(Ordering::Acquire) {
            ctx.kill();
            ctx.join_readers();
            log::info!("Process stopped on request");
            return;
        }

        match ctx.child.try_wait() {
            Ok(Some(status)) => {
                // Leftover helpers would hold the pipes open.
                ctx.kill_group();
                ctx.join_readers();
                match status.code() {
                    Some(code) => ctx.emitter.emit(ProcessEvent::Finished(code)),
                    None if ctx.stop_requested.load(Ordering::Acquire) => {}
                    None => ctx.emitter.emit(ProcessEvent::Errored {
                        kind: ProcessErrorKind::Crashed,
                        message: format!("Process terminated abnormally ({status})"),
                    }),
                }
                return;
            }
            Ok(None) => {}
            Err(err) => {
                ctx.kill();
                ctx.join_readers();
                ctx.emitter.emit(ProcessEvent::Errored {
                    kind: ProcessErrorKind::Unknown,
                    message: err.to_string(),
                });
                return;
            }
        }

        if let Some(limit) = ctx.timeout {
            if started.elapsed() >= limit {
                ctx.kill();
                ctx.join_readers();
                ctx.emitter.emit(ProcessEvent::Errored {
                    kind: ProcessErrorKind::TimedOut,
                    message: format!("Process did not finish within {}s", limit.as_secs_f32()),
                });
                return;
            }
        }

        thread::sleep(EXIT_POLL_INTERVAL);
    }
}
