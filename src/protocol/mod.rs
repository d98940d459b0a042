//! ActivityPub wire types.
//!
//! The real-world wire format is sloppy: `to`, `cc` and `tag` may be absent,
//! a single value or an array. Deserialization normalizes all of them to
//! vectors; serialization always emits arrays.

pub mod activity;
pub mod actor;
pub mod collections;
pub mod helpers;
pub mod webfinger;

pub use activity::{ActivityEnvelope, IncomingActivity, Note, OutgoingActivity, Tag};
pub use actor::{ActorDoc, Attachment, Endpoints, Image, PublicKey};
pub use collections::OrderedCollectionSummary;
pub use webfinger::{WebfingerLink, WebfingerResponse};

/// The two JSON-LD contexts our actor documents declare.
pub const ACTOR_CONTEXTS: [&str; 2] = [
    "https://www.w3.org/ns/activitystreams",
    "https://w3id.org/security/v1",
];

/// Context for plain activities and objects.
pub const ACTIVITY_CONTEXT: &str = "https://www.w3.org/ns/activitystreams";
