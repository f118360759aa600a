use serde_json::Value;

/// One inbound message together with the raw bytes it was parsed from, kept
/// around for diagnostics when a line fails to parse as JSON-RPC.
#[derive(Debug, Clone)]
pub struct RawMessage {
    pub value: Value,
    pub raw: String,
}

impl RawMessage {
    pub fn new(raw: String, value: Value) -> Self {
        Self { raw, value }
    }
}
