use async_trait::async_trait;
use reqwest::{Client, Method, header};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use super::{Cell, CellUpdate, Row, RowMatch, Sink, SinkConnector, SinkError, Table};
use crate::version::user_agent;

/// Where and how to reach the HTTP sink.
#[derive(Debug, Clone, PartialEq)]
pub struct SinkSettings {
    pub endpoint: String,
    pub credentials_path: PathBuf,
    pub request_timeout: Duration,
}

/// Builds [`HttpSink`] sessions. Credentials are re-read on every connect so
/// a rotated token is picked up by the next rebuild.
pub struct HttpSinkConnector {
    settings: SinkSettings,
}

impl HttpSinkConnector {
    pub fn new(settings: SinkSettings) -> Self {
        Self { settings }
    }

    async fn read_token(&self) -> Result<String, SinkError> {
        let path = &self.settings.credentials_path;
        let raw = tokio::fs::read_to_string(path).await.map_err(|e| {
            SinkError::Auth(format!("cannot read credentials {}: {e}", path.display()))
        })?;
        let token = raw.trim();
        if token.is_empty() {
            return Err(SinkError::Auth(format!(
                "credentials file {} is empty",
                path.display()
            )));
        }
        Ok(token.to_string())
    }
}

#[async_trait]
impl SinkConnector for HttpSinkConnector {
    async fn connect(&self) -> Result<Arc<dyn Sink>, SinkError> {
        let token = self.read_token().await?;
        let client = Client::builder()
            .timeout(self.settings.request_timeout)
            .user_agent(user_agent())
            .build()
            .map_err(|e| SinkError::Unknown(format!("failed to build HTTP client: {e}")))?;
        debug!(endpoint = %self.settings.endpoint, "Built sink session.");
        Ok(Arc::new(HttpSink {
            client,
            endpoint: self.settings.endpoint.trim_end_matches('/').to_string(),
            token,
        }))
    }
}

pub struct HttpSink {
    client: Client,
    endpoint: String,
    token: String,
}

#[derive(Serialize)]
struct SchemaTable<'a> {
    name: &'a str,
    columns: &'a [&'a str],
}

#[derive(Serialize)]
struct SchemaRequest<'a> {
    tables: Vec<SchemaTable<'a>>,
}

#[derive(Serialize)]
struct AppendRequest<'a> {
    values: &'a [Cell],
}

#[derive(Serialize)]
struct UpdateRequest<'a> {
    #[serde(rename = "match")]
    criteria: BTreeMap<&'a str, &'a Cell>,
    updates: BTreeMap<&'a str, &'a Cell>,
}

#[derive(Deserialize)]
struct UpdateResponse {
    matched: bool,
}

impl HttpSink {
    fn rows_url(&self, table: Table) -> String {
        format!("{}/tables/{}/rows", self.endpoint, table.name())
    }

    async fn call<B: Serialize + ?Sized>(
        &self,
        method: Method,
        url: String,
        body: &B,
    ) -> Result<reqwest::Response, SinkError> {
        let response = self
            .client
            .request(method, &url)
            .header(header::AUTHORIZATION, format!("Bearer {}", self.token))
            .json(body)
            .send()
            .await
            .map_err(classify_transport)?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "Failed to read error body".to_string());
            return Err(SinkError::from_status(status.as_u16(), body));
        }
        Ok(response)
    }
}

fn classify_transport(e: reqwest::Error) -> SinkError {
    if e.is_timeout() || e.is_connect() || e.is_request() {
        SinkError::Transport(e.to_string())
    } else if let Some(status) = e.status() {
        SinkError::from_status(status.as_u16(), e.to_string())
    } else {
        SinkError::Unknown(e.to_string())
    }
}

#[async_trait]
impl Sink for HttpSink {
    async fn ensure_schema(&self) -> Result<(), SinkError> {
        let request = SchemaRequest {
            tables: Table::ALL
                .iter()
                .map(|t| SchemaTable {
                    name: t.name(),
                    columns: t.columns(),
                })
                .collect(),
        };
        self.call(Method::POST, format!("{}/schema", self.endpoint), &request)
            .await?;
        Ok(())
    }

    async fn append_row(&self, table: Table, row: Row) -> Result<(), SinkError> {
        self.call(Method::POST, self.rows_url(table), &AppendRequest { values: &row })
            .await?;
        Ok(())
    }

    async fn find_and_update_row(
        &self,
        table: Table,
        matcher: &RowMatch,
        updates: &[CellUpdate],
    ) -> Result<bool, SinkError> {
        let request = UpdateRequest {
            criteria: matcher.criteria().iter().map(|(c, v)| (*c, v)).collect(),
            updates: updates.iter().map(|u| (u.column, &u.value)).collect(),
        };
        let response = self
            .call(Method::PATCH, self.rows_url(table), &request)
            .await?;
        let parsed: UpdateResponse = response
            .json()
            .await
            .map_err(|e| SinkError::Unknown(format!("malformed update response: {e}")))?;
        Ok(parsed.matched)
    }
}
