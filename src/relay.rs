//! Client for the loopback relay that streams episodes out of the upload
//! channel.
//!
//! The relay is a separate process that can be down at any time. Nothing in
//! here panics or bubbles up on a dead relay: the health probe collapses every
//! failure to `false`, and stream fetches return an error the caller is
//! expected to degrade from.

use std::{io::Read, time::Duration};

use anyhow::{Result, anyhow};
use tracing::debug;

/// Relay operations the resolution engine depends on.
pub trait Relay: Send + Sync {
    /// Bounded liveness probe. Never errors; timeouts and refused
    /// connections are `false`.
    fn health_check(&self) -> bool;

    /// Opens the full audio byte stream for `remote_ref`.
    fn fetch_stream(&self, remote_ref: &str) -> Result<Box<dyn Read + Send>>;

    /// URL a client can stream `remote_ref` from directly.
    fn stream_url(&self, remote_ref: &str) -> String;
}

/// [`Relay`] speaking HTTP to `<base>/health` and `<base>/stream/<ref>`.
#[derive(Debug, Clone)]
pub struct HttpRelay {
    base_url: String,
    probe: ureq::Agent,
    fetch: ureq::Agent,
}

impl HttpRelay {
    pub fn new(base_url: impl Into<String>, health_timeout: Duration, fetch_timeout: Duration) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        let probe = ureq::AgentBuilder::new().timeout(health_timeout).build();
        // Per-read timeout rather than a total deadline: long episodes take a
        // while to drain, but a stalled relay should still be noticed.
        let fetch = ureq::AgentBuilder::new()
            .timeout_connect(health_timeout)
            .timeout_read(fetch_timeout)
            .build();
        Self {
            base_url,
            probe,
            fetch,
        }
    }
}

impl Relay for HttpRelay {
    fn health_check(&self) -> bool {
        let url = format!("{}/health", self.base_url);
        match self.probe.get(&url).call() {
            Ok(response) => {
                let healthy = (200..300).contains(&response.status());
                debug!(relay = %self.base_url, status = response.status(), healthy, "relay health probe");
                healthy
            }
            Err(err) => {
                debug!(relay = %self.base_url, error = %err, "relay health probe failed");
                false
            }
        }
    }

    fn fetch_stream(&self, remote_ref: &str) -> Result<Box<dyn Read + Send>> {
        let url = self.stream_url(remote_ref);
        let response = self
            .fetch
            .get(&url)
            .call()
            .map_err(|err| anyhow!("fetching {url}: {err}"))?;
        Ok(Box::new(response.into_reader()))
    }

    fn stream_url(&self, remote_ref: &str) -> String {
        format!("{}/stream/{}", self.base_url, encode_path_segment(remote_ref))
    }
}

/// Percent-encodes everything outside the RFC 3986 unreserved set so a ref
/// can never add path segments or a query string.
fn encode_path_segment(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for byte in value.bytes() {
        if byte.is_ascii_alphanumeric() || matches!(byte, b'-' | b'_' | b'.' | b'~') {
            out.push(byte as char);
        } else {
            out.push_str(&format!("%{byte:02X}"));
        }
    }
    out
}
