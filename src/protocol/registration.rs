use anyhow::{anyhow, Result};
use flume::Sender;
use serde::{Deserialize, Serialize};
use std::{
    thread::{self, JoinHandle},
    time::Duration,
};

use super::{Emitter, Stamped};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "UPPERCASE")]
#[strum(serialize_all = "UPPERCASE")]
pub enum HttpMethod {
    #[default]
    Get,
    Post,
}

/// Shape of the single request the client issues on `send`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegistrationRequest {
    pub method: HttpMethod,
    /// Appended to the base endpoint.
    pub path: String,
    /// Query parameters, kept in insertion order.
    pub params: Vec<(String, String)>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistrationEvent {
    /// The server answered. `success` is true only for status 200.
    Response { success: bool, body: String },
    /// No usable answer: timeout, refused connection, DNS failure.
    Error(String),
}

/// What the workflow needs from the provisioning backend client.
pub trait RegistrationBackend: Send {
    fn configure(&mut self, request: RegistrationRequest);
    /// Issue the configured request off the calling thread.
    fn send(&mut self, attempt: u64);
    /// Wait for an in-flight request to finish. Idempotent.
    fn stop(&mut self);
}

/// Join `base` and `path` with exactly one slash between them.
pub fn build_url(base: &str, path: &str) -> String {
    let base = base.trim_end_matches('/');
    let path = path.trim_start_matches('/');
    if path.is_empty() {
        base.to_string()
    } else {
        format!("{base}/{path}")
    }
}

/// HTTP client for the registration endpoint; one request in flight at a time.
pub struct RegistrationClient {
    base: String,
    timeout: Duration,
    request: RegistrationRequest,
    evt_tx: Sender<Stamped<RegistrationEvent>>,
    worker: Option<JoinHandle<()>>,
}

impl RegistrationClient {
    pub fn new(
        base: impl Into<String>,
        timeout: Duration,
        evt_tx: Sender<Stamped<RegistrationEvent>>,
    ) -> Self {
        Self {
            base: base.into(),
            timeout,
            request: RegistrationRequest::default(),
            evt_tx,
            worker: None,
        }
    }

    pub fn request(&self) -> &RegistrationRequest {
        &self.request
    }

    pub fn is_busy(&self) -> bool {
        self.worker
            .as_ref()
            .map(|handle| !handle.is_finished())
            .unwrap_or(false)
    }
}

impl RegistrationBackend for RegistrationClient {
    fn configure(&mut self, request: RegistrationRequest) {
        self.request = request;
    }

    fn send(&mut self, attempt: u64) {
        // One request at a time; a previous one is waited for first.
        self.stop();

        let emitter = Emitter::new(self.evt_tx.clone(), attempt);
        let url = build_url(&self.base, &self.request.path);
        let request = self.request.clone();
        let timeout = self.timeout;

        log::info!("Registration {} {url}", request.method);
        let spawned = thread::Builder::new()
            .name("mbt-registration".to_string())
            .spawn(move || {
                let event = match perform(&url, &request, timeout) {
                    Ok((status, body)) => {
                        log::debug!("Registration answered {status}");
                        RegistrationEvent::Response {
                            success: status == 200,
                            body,
                        }
                    }
                    Err(err) => RegistrationEvent::Error(err.to_string()),
                };
                emitter.emit(event);
            });
        match spawned {
            Ok(handle) => self.worker = Some(handle),
            Err(err) => Emitter::new(self.evt_tx.clone(), attempt).emit(RegistrationEvent::Error(
                format!("Failed to spawn registration thread: {err}"),
            )),
        }
    }

    fn stop(&mut self) {
        if let Some(handle) = self.worker.take() {
            if handle.join().is_err() {
                log::warn!("Registration thread panicked");
            }
        }
    }
}

impl Drop for RegistrationClient {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Perform one blocking request, returning status code and body text.
/// Non-200 statuses are answers, not errors.
fn perform(url: &str, request: &RegistrationRequest, timeout: Duration) -> Result<(u16, String)> {
    let tls = ureq::tls::TlsConfig::builder()
        .provider(ureq::tls::TlsProvider::NativeTls)
        .build();
    let agent: ureq::Agent = ureq::Agent::config_builder()
        .timeout_global(Some(timeout))
        .http_status_as_error(false)
        .tls_config(tls)
        .build()
        .into();

    let result = match request.method {
        HttpMethod::Get => {
            let mut builder = agent.get(url);
            for (key, value) in &request.params {
                builder = builder.query(key.as_str(), value.as_str());
            }
            builder.call()
        }
        HttpMethod::Post => {
            let mut builder = agent.post(url);
            for (key, value) in &request.params {
                builder = builder.query(key.as_str(), value.as_str());
            }
            builder.send_empty()
        }
    };

    let mut response = result.map_err(|err| anyhow!("Request to {url} failed: {err}"))?;
    let status = response.status().as_u16();
    let body = response
        .body_mut()
        .read_to_string()
        .map_err(|err| anyhow!("Failed to read response from {url}: {err}"))?;
    Ok((status, body))
}
