//! Best-effort error telemetry.
//!
//! Failed work items are POSTed to an HTTP endpoint as structured records.
//! Delivery of telemetry must never affect the pipeline: failures here are
//! logged and swallowed.

use crate::error::ErrorRecord;
use reqwest::Client;
use std::time::Duration;
use tracing::{debug, warn};

const REPORT_TIMEOUT: Duration = Duration::from_secs(10);

/// HTTP reporter for [`ErrorRecord`]s. Disabled when no endpoint is
/// configured, in which case records are only logged.
pub struct ErrorReporter {
    client: Client,
    endpoint: Option<String>,
}

impl ErrorReporter {
    pub fn new(endpoint: Option<String>) -> Result<Self, reqwest::Error> {
        let client = Client::builder().timeout(REPORT_TIMEOUT).build()?;
        Ok(Self { client, endpoint })
    }

    /// Reporter that never sends anything.
    pub fn disabled() -> Self {
        Self {
            client: Client::new(),
            endpoint: None,
        }
    }

    /// Send one error record. Best effort: a failed or slow POST is logged
    /// at `warn` and otherwise ignored.
    pub async fn report(&self, record: &ErrorRecord) {
        let Some(endpoint) = &self.endpoint else {
            debug!(
                target: "reporter",
                kind = %record.kind,
                "Error reporting disabled, dropping record"
            );
            return;
        };

        match self.client.post(endpoint).json(record).send().await {
            Ok(response) if response.status().is_success() => {
                debug!(target: "reporter", kind = %record.kind, "Error record delivered");
            }
            Ok(response) => {
                warn!(
                    target: "reporter",
                    kind = %record.kind,
                    status = %response.status(),
                    "Error endpoint rejected record"
                );
            }
            Err(e) => {
                warn!(
                    target: "reporter",
                    kind = %record.kind,
                    error = %e,
                    "Failed to deliver error record"
                );
            }
        }
    }
}
