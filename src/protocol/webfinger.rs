//! Webfinger resource documents.

use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
pub struct WebfingerResponse {
    pub subject: String,
    pub aliases: Vec<String>,
    pub links: Vec<WebfingerLink>,
}

#[derive(Debug, Clone, Serialize)]
pub struct WebfingerLink {
    pub rel: &'static str,
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub href: String,
}
