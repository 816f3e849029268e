use serde::{Deserialize, Serialize};
use std::io::Write;
use tendersim_common::{Height, NodeId, Timestamp};

/// One structured simulator event. Log order is insertion order; dumped as
/// JSON lines with sorted keys for byte-level comparison between runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub time_ms: Timestamp,
    pub event: String,
    pub from: NodeId,
    pub to: NodeId,
    pub height: Option<Height>,
    pub details: serde_json::Value,
}

impl LogEntry {
    /// Renders the entry as a single JSON line with sorted keys.
    pub fn to_json_line(&self) -> String {
        // Round-tripping through `Value` sorts the object keys.
        let value = serde_json::to_value(self).unwrap();
        serde_json::to_string(&value).unwrap()
    }
}

/// Writes logs as JSON lines for determinism checks.
pub fn dump_logs(logs: &[LogEntry], mut writer: impl Write) -> std::io::Result<()> {
    for entry in logs {
        writeln!(writer, "{}", entry.to_json_line())?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_lines_have_sorted_keys() {
        let entry = LogEntry {
            time_ms: 5,
            event: "send".to_string(),
            from: "A".to_string(),
            to: "B".to_string(),
            height: Some(1),
            details: serde_json::json!({"msg_id": 1}),
        };
        assert_eq!(
            entry.to_json_line(),
            r#"{"details":{"msg_id":1},"event":"send","from":"A","height":1,"time_ms":5,"to":"B"}"#
        );
    }
}
