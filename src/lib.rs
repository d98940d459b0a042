//! Federated gateway that turns web feeds into followable ActivityPub actors.
//!
//! Each discovered feed is represented by a synthetic "parrot" actor that
//! remote fediverse servers can follow; new feed items are rendered as public
//! posts and fanned out to follower inboxes with signed HTTP requests. The
//! built-in `birb` actor accepts natural-language requests and replies
//! in-thread with a mention of the newly created parrot.

pub mod config;
pub mod db;
pub mod directory;
pub mod error;
pub mod feeds;
pub mod http;
pub mod ids;
pub mod inbox;
pub mod keystore;
pub mod messenger;
pub mod metrics;
pub mod protocol;
pub mod retriever;
pub mod sender;
pub mod signatures;
pub mod texts;

/// Mime type for Activitypub, used for `Accept` and `Content-Type` HTTP headers
pub static APUB_JSON_CONTENT_TYPE: &str = "application/activity+json";

/// The ActivityStreams "public" collection; presence in `to` or `cc` makes a
/// note visible to the world.
pub static PUBLIC_STREAM: &str = "https://www.w3.org/ns/activitystreams#Public";

/// User-Agent header sent on all outbound HTTP requests.
pub fn user_agent(host: &str) -> String {
    format!(
        "{}/{} (+https://{})",
        env!("CARGO_PKG_NAME"),
        env!("CARGO_PKG_VERSION"),
        host
    )
}
