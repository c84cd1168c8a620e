use chrono::{DateTime, Utc};

/// Splits the timestamp prefix the log API adds when `timestamps=true`
pub struct LogParser;

impl LogParser {
    /// Split a raw line into its Kubernetes timestamp and the remaining text
    ///
    /// Lines without a parseable prefix are returned unchanged.
    pub fn split_timestamp(raw: &str) -> (Option<DateTime<Utc>>, &str) {
        // K8s timestamp format: 2024-01-15T10:30:00.123456789Z (30 chars)
        // Sometimes shorter: 2024-01-15T10:30:00Z (20 chars)
        if raw.len() >= 20 {
            let search_end = Self::floor_char_boundary(raw, 35.min(raw.len()));
            if let Some(z_pos) = raw.get(..search_end).and_then(|s| s.find('Z')) {
                let ts_str = &raw[..=z_pos];
                if let Ok(ts) = DateTime::parse_from_rfc3339(ts_str) {
                    let rest = &raw[z_pos + 1..];
                    let rest = rest.strip_prefix(' ').unwrap_or(rest);
                    return (Some(ts.with_timezone(&Utc)), rest);
                }
            }
        }
        (None, raw)
    }

    /// Find the largest valid char boundary <= the given byte index
    fn floor_char_boundary(s: &str, mut idx: usize) -> usize {
        if idx >= s.len() {
            return s.len();
        }
        while idx > 0 && !s.is_char_boundary(idx) {
            idx -= 1;
        }
        idx
    }
}
