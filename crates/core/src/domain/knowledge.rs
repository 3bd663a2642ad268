use serde::{Deserialize, Serialize};

/// A curated support-answer snippet with a stored embedding, maintained by
/// operators outside this core.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct KnowledgeBankEntry {
    pub id: i64,
    pub content: String,
    pub embedding: Vec<f32>,
    pub enabled: bool,
}
