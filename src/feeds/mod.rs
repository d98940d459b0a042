//! Feed discovery, polling and ingestion.

mod blocked;
mod follower;

pub use blocked::BlockedFeeds;
pub use follower::{FeedFollower, FeedResolver, FeedStatus};
