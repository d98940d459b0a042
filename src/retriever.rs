//! Fetching remote actor documents.

use crate::config::Config;
use crate::error::AppError;
use crate::ids::IdBuilder;
use crate::keystore::KeyStore;
use crate::protocol::ActorDoc;
use crate::signatures::build_signature_header;
use async_trait::async_trait;
use http::Method;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use url::Url;

const ACTOR_GET_TIMEOUT: Duration = Duration::from_secs(10);

/// Resolves an actor URL to its document.
#[async_trait]
pub trait ActorRetriever: Send + Sync {
    async fn retrieve(&self, user_url: &str) -> Result<ActorDoc, AppError>;
}

/// Fetches the document over HTTP with a GET signed by the built-in actor;
/// some servers refuse unsigned fetches.
pub struct HttpActorRetriever {
    cfg: Arc<Config>,
    keystore: Arc<KeyStore>,
    idb: IdBuilder,
    client: reqwest::Client,
}

impl HttpActorRetriever {
    pub fn new(cfg: Arc<Config>, keystore: Arc<KeyStore>) -> Result<HttpActorRetriever, AppError> {
        let client = reqwest::Client::builder()
            .timeout(ACTOR_GET_TIMEOUT)
            .user_agent(crate::user_agent(&cfg.host))
            .build()?;
        let idb = IdBuilder::new(cfg.host.clone());
        Ok(HttpActorRetriever {
            cfg,
            keystore,
            idb,
            client,
        })
    }
}

#[async_trait]
impl ActorRetriever for HttpActorRetriever {
    async fn retrieve(&self, user_url: &str) -> Result<ActorDoc, AppError> {
        let parsed = Url::parse(user_url)
            .map_err(|e| AppError::BadRequest(format!("invalid actor URL '{}': {}", user_url, e)))?;
        let host = parsed
            .host_str()
            .ok_or_else(|| AppError::BadRequest(format!("actor URL has no host: {}", user_url)))?
            .to_owned();
        let path_and_query = match parsed.query() {
            Some(q) => format!("{}?{}", parsed.path(), q),
            None => parsed.path().to_owned(),
        };

        let date = httpdate::fmt_http_date(SystemTime::now());
        let priv_key = self.keystore.get_priv_key(&self.cfg.birb.user).await?;
        let signature = build_signature_header(
            &priv_key,
            &self.idb.user_key_id(&self.cfg.birb.user),
            &Method::GET,
            &path_and_query,
            &host,
            &date,
            None,
        )?;

        let resp = self
            .client
            .get(user_url)
            .header("Accept", crate::APUB_JSON_CONTENT_TYPE)
            .header("Host", host)
            .header("Date", date)
            .header("Signature", signature)
            .send()
            .await?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(AppError::Internal(format!(
                "failed to get actor document {}; status {}: {}",
                user_url, status, body
            )));
        }
        Ok(resp.json::<ActorDoc>().await?)
    }
}
