//! WeCom group-robot notifier.
//!
//! Posts a markdown summary of each terminal run to a group-robot webhook
//! (`https://qyapi.weixin.qq.com/cgi-bin/webhook/send?key=...`). The robot
//! answers HTTP 200 with `{"errcode": 0, "errmsg": "ok"}` on success and a
//! non-zero `errcode` otherwise.

use std::fmt::Write as _;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tracing::debug;
use url::Url;

use crate::connectors::trait_::{ConnectorError, Notifier, RunOutcome};
use crate::models::ExecutionLog;

#[derive(Debug, Deserialize)]
struct RobotResponse {
    errcode: i64,
    #[serde(default)]
    errmsg: String,
}

/// Notifier delivering run summaries to a WeCom group robot.
#[derive(Debug, Clone)]
pub struct WebhookNotifier {
    client: reqwest::Client,
    url: Url,
}

impl WebhookNotifier {
    pub fn new(url: &str, timeout: Duration) -> Result<Self, ConnectorError> {
        let url = Url::parse(url).map_err(|e| ConnectorError::ConfigurationError {
            details: format!("invalid webhook url: {e}"),
        })?;
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ConnectorError::ConfigurationError {
                details: format!("failed to build http client: {e}"),
            })?;
        Ok(Self { client, url })
    }
}

/// Markdown body shown in the group chat.
pub fn render_summary(job_name: &str, outcome: RunOutcome, log: &ExecutionLog) -> String {
    let headline = match outcome {
        RunOutcome::Success => "<font color=\"info\">succeeded</font>",
        RunOutcome::Failed => "<font color=\"warning\">failed</font>",
    };
    let mut content = format!("**Sync job {job_name}** {headline}\n");
    let _ = writeln!(
        content,
        "> Records: processed {}, succeeded {}, failed {}, skipped {}",
        log.records_processed, log.records_succeeded, log.records_failed, log.records_skipped
    );
    if log.conflict_count > 0 {
        let _ = writeln!(content, "> Conflicts: {}", log.conflict_count);
    }
    if log.retry_attempt > 0 {
        let _ = writeln!(content, "> Retries: {}", log.retry_attempt);
    }
    let _ = writeln!(content, "> Duration: {} ms", log.elapsed_ms());
    if let Some(error) = &log.error_message {
        let _ = writeln!(content, "> Error: {error}");
    }
    content
}

fn map_reqwest_err(err: reqwest::Error) -> ConnectorError {
    if err.is_timeout() {
        ConnectorError::Timeout {
            details: err.to_string(),
        }
    } else {
        ConnectorError::NetworkError {
            details: err.to_string(),
            retryable: err.is_connect() || err.is_request(),
        }
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn notify(
        &self,
        job_name: &str,
        outcome: RunOutcome,
        details: &ExecutionLog,
    ) -> Result<(), ConnectorError> {
        let body = json!({
            "msgtype": "markdown",
            "markdown": { "content": render_summary(job_name, outcome, details) }
        });

        let response = self
            .client
            .post(self.url.clone())
            .json(&body)
            .send()
            .await
            .map_err(map_reqwest_err)?;

        let status = response.status();
        if !status.is_success() {
            let retry_after = response
                .headers()
                .get("Retry-After")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse().ok());
            let body = response.text().await.ok();
            return Err(ConnectorError::HttpError {
                status: status.as_u16(),
                body,
                retry_after,
            });
        }

        let parsed: RobotResponse =
            response
                .json()
                .await
                .map_err(|e| ConnectorError::MalformedResponse {
                    details: e.to_string(),
                })?;
        if parsed.errcode != 0 {
            return Err(ConnectorError::RemoteError {
                code: parsed.errcode,
                message: parsed.errmsg,
            });
        }

        debug!(job_name, ?outcome, "run notification delivered");
        Ok(())
    }
}
