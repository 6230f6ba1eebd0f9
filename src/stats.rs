//! Diagnostics snapshot of a stack instance.

use crate::manager::ModeKind;
use crate::raw::RawStats;
use crate::wan::WanStats;
use serde::Serialize;

/// Point-in-time view served by the stats endpoint. Only the active mode's
/// section is present.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LoraStats {
    pub mode: Option<ModeKind>,
    pub powered: bool,
    pub sync_in_use: usize,
    pub sync_capacity: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw: Option<RawStats>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub wan: Option<WanStats>,
}

impl LoraStats {
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|e| format!(r#"{{"error":"{}"}}"#, e))
    }
}
