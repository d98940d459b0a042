//! Inbound and outbound activity shapes.
//!
//! Inbound activities vary in the type of `object`: a bare URL string for
//! Follow, a nested object for Undo and Create. They are parsed in two
//! passes: first as [`ActivityEnvelope`] to decide on the `type`, then as
//! [`IncomingActivity`] with the matching object type.

use crate::protocol::helpers::deserialize_one_or_many;
use serde::{Deserialize, Deserializer, Serialize};

/// First-pass parse of any inbound activity: enough to route and to verify
/// the signature, with `object` left as raw JSON.
#[derive(Debug, Clone, Deserialize)]
pub struct ActivityEnvelope {
    #[serde(default)]
    pub id: String,
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub actor: String,
    #[serde(default, deserialize_with = "deserialize_one_or_many")]
    pub to: Vec<String>,
    #[serde(default, deserialize_with = "deserialize_one_or_many")]
    pub cc: Vec<String>,
    #[serde(default)]
    pub object: serde_json::Value,
}

impl ActivityEnvelope {
    /// The `type` of the nested object, when `object` is itself an object.
    pub fn object_kind(&self) -> Option<&str> {
        self.object.get("type").and_then(|v| v.as_str())
    }
}

/// Second-pass parse with a typed `object`: `String` for Follow,
/// [`IncomingActivity<String>`] for Undo-Follow, [`Note`] for Create.
#[derive(Debug, Clone, Deserialize)]
pub struct IncomingActivity<Obj> {
    #[serde(default)]
    pub id: String,
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub actor: String,
    #[serde(default, deserialize_with = "deserialize_one_or_many")]
    pub to: Vec<String>,
    #[serde(default, deserialize_with = "deserialize_one_or_many")]
    pub cc: Vec<String>,
    pub object: Obj,
}

/// An activity we send: Create wrapping a Note, or Accept echoing a Follow.
#[derive(Debug, Clone, Serialize)]
pub struct OutgoingActivity<Obj: Serialize> {
    #[serde(rename = "@context", skip_serializing_if = "Option::is_none")]
    pub context: Option<&'static str>,
    pub id: String,
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub actor: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub to: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cc: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub object: Option<Obj>,
}

/// A microblog post, in both directions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Note {
    #[serde(rename = "@context", default, skip_serializing_if = "Option::is_none")]
    pub context: Option<serde_json::Value>,
    #[serde(default)]
    pub id: String,
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub published: String,
    #[serde(default)]
    pub summary: Option<String>,
    #[serde(rename = "attributedTo", default)]
    pub attributed_to: String,
    #[serde(rename = "inReplyTo", default)]
    pub in_reply_to: Option<String>,
    #[serde(default, deserialize_with = "deserialize_one_or_many")]
    pub to: Vec<String>,
    #[serde(default, deserialize_with = "deserialize_one_or_many")]
    pub cc: Vec<String>,
    #[serde(default)]
    pub content: String,
    #[serde(default, deserialize_with = "deserialize_tags", skip_serializing_if = "Vec::is_empty")]
    pub tag: Vec<Tag>,
}

/// A `Mention` (or other) tag attached to a note.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tag {
    #[serde(rename = "type")]
    pub kind: String,
    pub href: String,
    pub name: String,
}

impl Tag {
    pub fn mention(href: impl Into<String>, name: impl Into<String>) -> Tag {
        Tag {
            kind: "Mention".to_owned(),
            href: href.into(),
            name: name.into(),
        }
    }
}

/// `tag` arrives as a single object, an array, or not at all.
fn deserialize_tags<'de, D>(deserializer: D) -> Result<Vec<Tag>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum TagField {
        Many(Vec<Tag>),
        One(Tag),
    }

    let result: Option<TagField> = Deserialize::deserialize(deserializer)?;
    Ok(match result {
        Some(TagField::Many(list)) => list,
        Some(TagField::One(tag)) => vec![tag],
        None => Vec::new(),
    })
}
