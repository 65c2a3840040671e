use crate::destination::retry::{retry_with_backoff, RetryPolicy};
use crate::destination::{Destination, UploadOutcome};
use crate::error::Result;
use crate::reading::Payload;
use reqwest::{Client, StatusCode};
use tracing::{debug, info};

/// Generic collector that accepts the payload as a JSON POST body.
pub struct HttpCollector {
    client: Client,
    url: String,
    auth_token: Option<String>,
    retry: RetryPolicy,
}

impl HttpCollector {
    pub fn new(
        client: Client,
        url: &str,
        auth_token: Option<String>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            client,
            url: url.to_string(),
            auth_token,
            retry,
        }
    }

    async fn post(&self, payload: &Payload) -> Result<StatusCode> {
        let mut request = self.client.post(&self.url).json(payload);
        if let Some(token) = &self.auth_token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await?;
        let status = response.status();
        if status.is_server_error() {
            // Surface 5xx as an error so the retry window sees it
            response.error_for_status()?;
        }
        Ok(status)
    }
}

/// Maps a collector response status to a delivery outcome.
pub fn classify_status(status: StatusCode) -> UploadOutcome {
    match status {
        s if s.is_success() => UploadOutcome::Success,
        StatusCode::TOO_MANY_REQUESTS => UploadOutcome::RateLimited,
        // Collector rejected the timestamp as stale or in the future
        StatusCode::UNPROCESSABLE_ENTITY => UploadOutcome::LostSync,
        StatusCode::BAD_REQUEST => UploadOutcome::SkipFile,
        _ => UploadOutcome::Failed,
    }
}

impl Destination for HttpCollector {
    fn kind(&self) -> &'static str {
        "http"
    }

    fn log_destination(&self) {
        info!("Uploading readings to HTTP collector: {}", self.url);
    }

    async fn upload(&self, payload: &Payload) -> UploadOutcome {
        match retry_with_backoff(&self.retry, || self.post(payload)).await {
            Ok(status) => {
                let outcome = classify_status(status);
                debug!("Collector answered {} for {} ({:?})", status, payload.label(), outcome);
                outcome
            }
            Err(e) => {
                debug!("Upload of {} failed: {}", payload.label(), e);
                UploadOutcome::Failed
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_status() {
        assert_eq!(classify_status(StatusCode::OK), UploadOutcome::Success);
        assert_eq!(classify_status(StatusCode::ACCEPTED), UploadOutcome::Success);
        assert_eq!(
            classify_status(StatusCode::TOO_MANY_REQUESTS),
            UploadOutcome::RateLimited
        );
        assert_eq!(
            classify_status(StatusCode::UNPROCESSABLE_ENTITY),
            UploadOutcome::LostSync
        );
        assert_eq!(classify_status(StatusCode::BAD_REQUEST), UploadOutcome::SkipFile);
        assert_eq!(classify_status(StatusCode::UNAUTHORIZED), UploadOutcome::Failed);
        assert_eq!(
            classify_status(StatusCode::SERVICE_UNAVAILABLE),
            UploadOutcome::Failed
        );
    }
}
