use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

/// Header attributes of a message: lowercase keys mapped to raw value bytes.
pub type Header = HashMap<String, Vec<u8>>;

/// A single metric sample as it flows through the pipeline.
///
/// All three fields are opaque byte ranges straight from the wire. The
/// validator is the first stage to interpret `value` and `timestamp`
/// numerically; the resolver replaces `name` with the resolved sink path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Metric {
    pub name: Vec<u8>,
    pub value: Vec<u8>,
    pub timestamp: Vec<u8>,
}

impl Metric {
    /// Build a metric from an already-rendered name, value and timestamp.
    pub fn new(name: Vec<u8>, value: Vec<u8>, timestamp: Vec<u8>) -> Self {
        Self {
            name,
            value,
            timestamp,
        }
    }

    /// Build a metric from a numeric value and a wall-clock time.
    ///
    /// Used for system-authored metrics (the monitoring loop) that never
    /// cross the wire parser.
    pub fn from_value(name: &str, value: f64, at: SystemTime) -> Self {
        let secs = at
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();

        Self {
            name: name.as_bytes().to_vec(),
            value: format!("{value}").into_bytes(),
            timestamp: secs.to_string().into_bytes(),
        }
    }
}

/// One decoded datagram: shared header attributes plus the metrics that
/// were sent under them.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Message {
    pub header: Header,
    pub metrics: Vec<Metric>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_from_value_renders_decimal() {
        let at = UNIX_EPOCH + Duration::from_secs(1_711_000_000);
        let m = Metric::from_value("udp_received", 42.0, at);

        assert_eq!(m.name, b"udp_received");
        assert_eq!(m.value, b"42");
        assert_eq!(m.timestamp, b"1711000000");
    }

    #[test]
    fn test_from_value_fractional() {
        let m = Metric::from_value("load", 0.5, UNIX_EPOCH);
        assert_eq!(m.value, b"0.5");
        assert_eq!(m.timestamp, b"0");
    }
}
