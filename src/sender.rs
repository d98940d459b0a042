//! Delivering activities to remote inboxes.

use crate::error::AppError;
use crate::ids::IdBuilder;
use crate::metrics::Metrics;
use crate::signatures::{build_digest_header, build_signature_header};
use async_trait::async_trait;
use http::Method;
use rsa::RsaPrivateKey;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tracing::{debug, warn};
use url::Url;

const ACTIVITY_TIMEOUT: Duration = Duration::from_secs(10);

/// Signs and POSTs one activity to one inbox. Exactly one HTTP call per
/// invocation; no internal retry.
#[async_trait]
pub trait ActivitySender: Send + Sync {
    async fn send(
        &self,
        priv_key: &RsaPrivateKey,
        sending_user: &str,
        inbox_url: &str,
        activity: &serde_json::Value,
    ) -> Result<(), AppError>;
}

pub struct HttpActivitySender {
    idb: IdBuilder,
    metrics: Arc<Metrics>,
    client: reqwest::Client,
}

impl HttpActivitySender {
    pub fn new(host: &str, metrics: Arc<Metrics>) -> Result<HttpActivitySender, AppError> {
        let client = reqwest::Client::builder()
            .timeout(ACTIVITY_TIMEOUT)
            .user_agent(crate::user_agent(host))
            .build()?;
        Ok(HttpActivitySender {
            idb: IdBuilder::new(host),
            metrics,
            client,
        })
    }
}

#[async_trait]
impl ActivitySender for HttpActivitySender {
    async fn send(
        &self,
        priv_key: &RsaPrivateKey,
        sending_user: &str,
        inbox_url: &str,
        activity: &serde_json::Value,
    ) -> Result<(), AppError> {
        let _obs = self.metrics.start_apub_request_out("post");

        let parsed = Url::parse(inbox_url)
            .map_err(|e| AppError::BadRequest(format!("invalid inbox URL '{}': {}", inbox_url, e)))?;
        let host = parsed
            .host_str()
            .ok_or_else(|| AppError::BadRequest(format!("inbox URL has no host: {}", inbox_url)))?
            .to_owned();
        let path_and_query = match parsed.query() {
            Some(q) => format!("{}?{}", parsed.path(), q),
            None => parsed.path().to_owned(),
        };

        let body = serde_json::to_vec(activity)?;
        let date = httpdate::fmt_http_date(SystemTime::now());
        let digest = build_digest_header(&body);
        let signature = build_signature_header(
            priv_key,
            &self.idb.user_key_id(sending_user),
            &Method::POST,
            &path_and_query,
            &host,
            &date,
            Some(&digest),
        )?;

        debug!(inbox_url, "sending activity");
        let resp = self
            .client
            .post(inbox_url)
            .header("Content-Type", "application/json")
            .header("Host", host)
            .header("Date", date)
            .header("Digest", digest)
            .header("Signature", signature)
            .body(body)
            .send()
            .await?;

        if resp.status().as_u16() >= 300 {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            warn!(%status, inbox_url, "activity POST failed");
            return Err(AppError::Internal(format!(
                "activity POST got status {}: {}",
                status, body
            )));
        }
        Ok(())
    }
}

/// In-process sender that records what would have gone over the wire.
#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::Mutex;

    #[derive(Debug, Clone)]
    pub struct SentActivity {
        pub sending_user: String,
        pub inbox_url: String,
        pub activity: serde_json::Value,
    }

    #[derive(Default)]
    pub struct RecordedState {
        pub current: usize,
        pub max_concurrent: usize,
        pub sent: Vec<SentActivity>,
    }

    #[derive(Default)]
    pub struct RecordingSender {
        pub delay: Option<Duration>,
        pub state: Mutex<RecordedState>,
    }

    impl RecordingSender {
        pub fn sent(&self) -> Vec<SentActivity> {
            self.state.lock().unwrap().sent.clone()
        }

        pub fn max_concurrent(&self) -> usize {
            self.state.lock().unwrap().max_concurrent
        }
    }

    #[async_trait]
    impl ActivitySender for RecordingSender {
        async fn send(
            &self,
            _priv_key: &RsaPrivateKey,
            sending_user: &str,
            inbox_url: &str,
            activity: &serde_json::Value,
        ) -> Result<(), AppError> {
            {
                let mut state = self.state.lock().unwrap();
                state.current += 1;
                state.max_concurrent = state.max_concurrent.max(state.current);
            }
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            let mut state = self.state.lock().unwrap();
            state.current -= 1;
            state.sent.push(SentActivity {
                sending_user: sending_user.to_owned(),
                inbox_url: inbox_url.to_owned(),
                activity: activity.clone(),
            });
            Ok(())
        }
    }
}
