//! The blocked-feeds list: site owners who asked not to be republished.

use crate::config::Config;
use crate::error::AppError;

pub struct BlockedFeeds {
    file: String,
}

impl BlockedFeeds {
    pub fn new(cfg: &Config) -> BlockedFeeds {
        BlockedFeeds {
            file: cfg.blocked_feeds_file.clone(),
        }
    }

    /// Case-insensitive, scheme-stripped match against the list. The file is
    /// re-read on every call so edits take effect without a restart.
    pub async fn is_blocked(&self, feed_url: &str) -> Result<bool, AppError> {
        if self.file.is_empty() {
            return Ok(false);
        }
        let normalized = normalize(feed_url);
        let content = tokio::fs::read_to_string(&self.file).await.map_err(|e| {
            AppError::Internal(format!("failed to read blocked feeds file {}: {}", self.file, e))
        })?;
        Ok(content.lines().any(|line| line.trim() == normalized))
    }
}

fn normalize(feed_url: &str) -> String {
    let lower = feed_url.to_lowercase();
    lower
        .trim_start_matches("https://")
        .trim_start_matches("http://")
        .to_owned()
}
