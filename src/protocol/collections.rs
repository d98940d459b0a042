//! Collection summaries served for outbox, followers and following.
//! We report totals only; there is no pagination.

use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
pub struct OrderedCollectionSummary {
    #[serde(rename = "@context")]
    pub context: &'static str,
    pub id: String,
    #[serde(rename = "type")]
    pub kind: &'static str,
    #[serde(rename = "totalItems")]
    pub total_items: u64,
}

impl OrderedCollectionSummary {
    pub fn new(id: String, total_items: u64) -> Self {
        OrderedCollectionSummary {
            context: crate::protocol::ACTIVITY_CONTEXT,
            id,
            kind: "OrderedCollection",
            total_items,
        }
    }
}
