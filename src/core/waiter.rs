//! Substring waiters over a line-oriented text stream
//!
//! Both the UART and the flashing tool's output are watched the same way: a
//! step registers a waiter for a substring, optionally with text to send back
//! when it appears, and a tagged action that the workflow dispatches once the
//! waiter fires. A waiter fires at most once and is removed when it does.

/// Anything that text can be pushed into (serial transport, child stdin).
pub trait TextSink {
    fn send_text(&mut self, text: &str);
}

/// One pending wait.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Waiter<A> {
    pub pattern: String,
    pub send_on_match: Option<String>,
    pub on_match: A,
}

/// Owns a sink and the waiters registered against the stream it feeds.
pub struct WaitController<T, A> {
    sink: T,
    waiters: Vec<Waiter<A>>,
}

impl<T: TextSink, A> WaitController<T, A> {
    pub fn new(sink: T) -> Self {
        Self {
            sink,
            waiters: Vec::new(),
        }
    }

    pub fn sink(&self) -> &T {
        &self.sink
    }

    pub fn sink_mut(&mut self) -> &mut T {
        &mut self.sink
    }

    /// Fire `on_match` on the first line containing `pattern`.
    /// An empty pattern matches any line.
    pub fn wait_for(&mut self, pattern: impl Into<String>, on_match: A) {
        self.waiters.push(Waiter {
            pattern: pattern.into(),
            send_on_match: None,
            on_match,
        });
    }

    /// Like `wait_for`, also sending `text` through the sink when it fires.
    pub fn wait_for_and_send(
        &mut self,
        pattern: impl Into<String>,
        text: impl Into<String>,
        on_match: A,
    ) {
        self.waiters.push(Waiter {
            pattern: pattern.into(),
            send_on_match: Some(text.into()),
            on_match,
        });
    }

    /// Match `line` against all waiters in registration order. Every matching
    /// waiter is removed, its text sent, and its action returned.
    pub fn on_line(&mut self, line: &str) -> Vec<A> {
        let (fired, pending): (Vec<_>, Vec<_>) = std::mem::take(&mut self.waiters)
            .into_iter()
            .partition(|waiter| line.contains(waiter.pattern.as_str()));
        self.waiters = pending;

        fired
            .into_iter()
            .map(|waiter| {
                if let Some(text) = waiter.send_on_match.as_deref() {
                    self.sink.send_text(text);
                }
                waiter.on_match
            })
            .collect()
    }

    pub fn pending(&self) -> usize {
        self.waiters.len()
    }

    pub fn clear(&mut self) {
        self.waiters.clear();
    }
}
