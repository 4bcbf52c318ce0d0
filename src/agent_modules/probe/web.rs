use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use std::time::{Duration, Instant};

use super::{Probe, ProbeError};
use crate::agent_modules::models::ProbeKind;
use crate::version::user_agent;

/// HTTP(S) GET that only counts a final `200 OK` as success.
pub struct WebProbe {
    client: Client,
}

impl WebProbe {
    pub fn new() -> Result<Self, ProbeError> {
        let client = Client::builder()
            .user_agent(user_agent())
            .build()
            .map_err(|e| ProbeError::Http(e.to_string()))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Probe for WebProbe {
    fn kind(&self) -> ProbeKind {
        ProbeKind::Web
    }

    async fn probe(&self, target: &str, timeout: Duration) -> Result<Option<f64>, ProbeError> {
        let start_time = Instant::now();
        let response = self
            .client
            .get(target)
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ProbeError::Timeout(timeout)
                } else if e.is_builder() {
                    ProbeError::InvalidTarget(format!("{target}: {e}"))
                } else {
                    ProbeError::Http(e.to_string())
                }
            })?;
        let response_time_ms = start_time.elapsed().as_secs_f64() * 1000.0;

        match response.status() {
            StatusCode::OK => Ok(Some(response_time_ms)),
            other => Err(ProbeError::UnexpectedStatus(other.as_u16())),
        }
    }
}
