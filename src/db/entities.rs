//! Rows of the durable store.

use chrono::{DateTime, Utc};

/// A parrot actor (or the built-in birb account, whose `feed_url` is empty).
#[derive(Debug, Clone)]
pub struct Account {
    pub id: i64,
    pub created_at: DateTime<Utc>,
    /// <= -100: banned; 0: default; 1: approved
    pub approve_status: i64,
    pub user_url: String,
    pub handle: String,
    pub name: String,
    pub summary: String,
    pub profile_image_url: String,
    pub header_image_url: String,
    pub site_url: String,
    pub feed_url: String,
    /// Time of the newest feed item seen so far; monotone non-decreasing
    pub feed_last_updated: DateTime<Utc>,
    /// Scheduler key: when this feed is due for its next check
    pub next_check_due: DateTime<Utc>,
    pub pub_key: String,
}

/// A remote actor following one of our accounts.
#[derive(Debug, Clone)]
pub struct Follower {
    /// Id of the Follow activity; echoed back in the Accept
    pub request_id: String,
    /// 0: unapproved, 1: approved, negative: banned
    pub approve_status: i64,
    pub user_url: String,
    pub handle: String,
    pub host: String,
    pub user_inbox: String,
    pub shared_inbox: String,
}

/// A feed item we have seen, keyed by `(account_id, post_guid_hash)`.
#[derive(Debug, Clone)]
pub struct FeedPost {
    pub post_guid_hash: i64,
    pub post_time: DateTime<Utc>,
    pub link: String,
    pub title: String,
    pub description: String,
}

/// The rendered outbound form of a feed post.
#[derive(Debug, Clone)]
pub struct Toot {
    pub post_guid_hash: i64,
    pub tooted_at: DateTime<Utc>,
    /// Canonical status URL embedding a monotone numeric id
    pub status_id: String,
    pub content: String,
}

/// The `(tooted_at, post_guid_hash)` projection the purge routine works on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TootExtract {
    pub post_guid_hash: i64,
    pub tooted_at: DateTime<Utc>,
}

/// One pending delivery. The row is the receipt: it exists until the
/// delivery has been acknowledged.
#[derive(Debug, Clone)]
pub struct TootQueueItem {
    pub id: i64,
    pub sending_user: String,
    pub to_inbox: String,
    pub tooted_at: DateTime<Utc>,
    pub status_id: String,
    pub content: String,
}
