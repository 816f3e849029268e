use crate::NetworkError;
use serde::{Deserialize, Serialize};

/// Basic knobs for the unreliable network.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Minimum delay applied to every delivery.
    pub base_delay_ms: u64,
    /// Added randomness on top of the base delay.
    pub jitter_ms: u64,
    /// Probability in [0, 1] of dropping an admitted message.
    pub drop_rate: f64,
    /// Probability in [0, 1] of scheduling a byte-identical duplicate.
    pub duplicate_rate: f64,
    pub max_inflight_per_sender: usize,
    pub max_inflight_per_link: usize,
    /// Soft byte cap per link; excess messages queue instead of dropping.
    pub max_bytes_inflight_per_link: usize,
    /// Auto-block the link when its inflight count reaches this.
    pub auto_block_inflight_threshold: usize,
    pub auto_block_duration_ms: u64,
    /// Serializes sends on a link (throughput).
    pub link_bandwidth_bytes_per_ms: usize,
    /// Window for rate-based auto blocking.
    pub rate_window_ms: u64,
    /// If set, auto-block a link that sends more than this per window.
    pub max_msgs_per_link_per_window: Option<usize>,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        NetworkConfig {
            base_delay_ms: 50,
            jitter_ms: 100,
            drop_rate: 0.0,
            duplicate_rate: 0.0,
            max_inflight_per_sender: 64,
            max_inflight_per_link: 32,
            max_bytes_inflight_per_link: 1_000_000,
            auto_block_inflight_threshold: 128,
            auto_block_duration_ms: 5000,
            link_bandwidth_bytes_per_ms: 50,
            rate_window_ms: 1000,
            max_msgs_per_link_per_window: None,
        }
    }
}

/// Per-link overrides; unset fields fall back to the global config.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LinkProfile {
    pub base_delay_ms: Option<u64>,
    pub jitter_ms: Option<u64>,
    pub bandwidth_bytes_per_ms: Option<usize>,
    pub drop_rate: Option<f64>,
}

fn split_csv_line(line: &str) -> Vec<&str> {
    line.split(',').map(|part| part.trim()).collect()
}

fn is_skippable(line: &str) -> bool {
    line.is_empty() || line.starts_with('#')
}

/// Parses topology lines: `sender,receiver`, `#` comments allowed.
/// Malformed lines are rejected, not skipped.
pub(crate) fn parse_topology(content: &str) -> Result<Vec<(String, String)>, NetworkError> {
    let mut edges = Vec::new();
    for (index, raw) in content.lines().enumerate() {
        let line = raw.trim();
        if is_skippable(line) {
            continue;
        }
        let parts = split_csv_line(line);
        match parts.as_slice() {
            [sender, receiver] if !sender.is_empty() && !receiver.is_empty() => {
                edges.push((sender.to_string(), receiver.to_string()));
            }
            _ => {
                return Err(NetworkError::MalformedLine {
                    line: index + 1,
                    reason: format!("expected `sender,receiver`, got `{line}`"),
                })
            }
        }
    }
    Ok(edges)
}

/// Parses link profile lines:
/// `sender,receiver[,base_delay_ms[,jitter_ms[,bandwidth_bytes_per_ms[,drop_rate]]]]`.
/// Empty optional fields keep the global default.
pub(crate) fn parse_link_profiles(
    content: &str,
) -> Result<Vec<((String, String), LinkProfile)>, NetworkError> {
    let mut profiles = Vec::new();
    for (index, raw) in content.lines().enumerate() {
        let line = raw.trim();
        if is_skippable(line) {
            continue;
        }
        let parts = split_csv_line(line);
        if parts.len() < 2 || parts.len() > 6 || parts[0].is_empty() || parts[1].is_empty() {
            return Err(NetworkError::MalformedLine {
                line: index + 1,
                reason: format!("expected `sender,receiver[,...overrides]`, got `{line}`"),
            });
        }
        let malformed = |reason: String| NetworkError::MalformedLine {
            line: index + 1,
            reason,
        };
        let mut profile = LinkProfile::default();
        if let Some(field) = parts.get(2).filter(|f| !f.is_empty()) {
            profile.base_delay_ms =
                Some(field.parse().map_err(|_| malformed(format!("bad base delay `{field}`")))?);
        }
        if let Some(field) = parts.get(3).filter(|f| !f.is_empty()) {
            profile.jitter_ms =
                Some(field.parse().map_err(|_| malformed(format!("bad jitter `{field}`")))?);
        }
        if let Some(field) = parts.get(4).filter(|f| !f.is_empty()) {
            profile.bandwidth_bytes_per_ms =
                Some(field.parse().map_err(|_| malformed(format!("bad bandwidth `{field}`")))?);
        }
        if let Some(field) = parts.get(5).filter(|f| !f.is_empty()) {
            profile.drop_rate =
                Some(field.parse().map_err(|_| malformed(format!("bad drop rate `{field}`")))?);
        }
        profiles.push(((parts[0].to_string(), parts[1].to_string()), profile));
    }
    Ok(profiles)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topology_accepts_comments_and_blanks() {
        let edges = parse_topology("# mesh\nA,B\n\nB,A\nA,A\n").unwrap();
        assert_eq!(edges.len(), 3);
        assert_eq!(edges[2], ("A".to_string(), "A".to_string()));
    }

    #[test]
    fn topology_rejects_malformed_lines() {
        assert!(matches!(
            parse_topology("A,B\nA,B,C\n"),
            Err(NetworkError::MalformedLine { line: 2, .. })
        ));
        assert!(parse_topology("just-one-field\n").is_err());
    }

    #[test]
    fn profiles_fill_missing_fields_with_none() {
        let profiles = parse_link_profiles("A,B,10\nB,A,,5,200,0.25\n").unwrap();
        assert_eq!(
            profiles[0].1,
            LinkProfile {
                base_delay_ms: Some(10),
                ..LinkProfile::default()
            }
        );
        assert_eq!(
            profiles[1].1,
            LinkProfile {
                base_delay_ms: None,
                jitter_ms: Some(5),
                bandwidth_bytes_per_ms: Some(200),
                drop_rate: Some(0.25),
            }
        );
    }

    #[test]
    fn profiles_reject_bad_numbers() {
        assert!(parse_link_profiles("A,B,fast\n").is_err());
    }
}
