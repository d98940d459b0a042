//! Actor documents: what we serve for our own users and what we parse from
//! remote servers. Remote documents omit fields freely, so everything
//! defaults.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ActorDoc {
    #[serde(rename = "@context", default, skip_serializing_if = "Option::is_none")]
    pub context: Option<serde_json::Value>,
    #[serde(default)]
    pub id: String,
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(rename = "preferredUsername", default)]
    pub preferred_username: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub summary: String,
    #[serde(rename = "manuallyApprovesFollowers", default)]
    pub manually_approves: bool,
    #[serde(default)]
    pub published: String,
    #[serde(default)]
    pub inbox: String,
    #[serde(default)]
    pub outbox: String,
    #[serde(default)]
    pub followers: String,
    #[serde(default)]
    pub following: String,
    #[serde(default)]
    pub endpoints: Endpoints,
    #[serde(rename = "publicKey", default)]
    pub public_key: PublicKey,
    #[serde(rename = "attachment", default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<Attachment>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icon: Option<Image>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<Image>,
}

impl ActorDoc {
    /// The inbox deliveries should go to: the shared inbox when the remote
    /// server advertises one, the personal inbox otherwise.
    pub fn preferred_inbox(&self) -> &str {
        if self.endpoints.shared_inbox.is_empty() {
            &self.inbox
        } else {
            &self.endpoints.shared_inbox
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Endpoints {
    #[serde(rename = "sharedInbox", default)]
    pub shared_inbox: String,
}

/// Public key of actors, used for HTTP signatures.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PublicKey {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub owner: String,
    #[serde(rename = "publicKeyPem", default)]
    pub public_key_pem: String,
}

/// A profile metadata row; we use one to link back to the source site.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Attachment {
    #[serde(rename = "type")]
    pub kind: String,
    pub name: String,
    pub value: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Image {
    #[serde(rename = "type")]
    pub kind: String,
    pub url: String,
}

impl Image {
    pub fn new(url: impl Into<String>) -> Image {
        Image {
            kind: "Image".to_owned(),
            url: url.into(),
        }
    }
}
