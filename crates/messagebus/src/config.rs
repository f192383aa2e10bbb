use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Tunables shared by every [`crate::connection::ConnectionHandle`] and the
/// [`crate::server::Server`] that spawns them.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Default timeout for `call_method` when the caller doesn't supply one.
    #[serde(with = "duration_secs")]
    pub timeout: Duration,
    /// A single framed message larger than this closes the connection.
    pub max_message_size: usize,
    /// Inbound queue depth above which the read pump throttles.
    pub max_incoming_messages: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            max_message_size: 1_024_000,
            max_incoming_messages: 100,
        }
    }
}

mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, ser: S) -> Result<S::Ok, S::Error> {
        ser.serialize_f64(value.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(de)?;
        Ok(Duration::from_secs_f64(secs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_documented_values() {
        let config = Config::default();
        assert_eq!(config.timeout, Duration::from_secs(30));
        assert_eq!(config.max_message_size, 1_024_000);
        assert_eq!(config.max_incoming_messages, 100);
    }

    #[test]
    fn round_trips_through_json() {
        let config = Config::default();
        let encoded = serde_json::to_string(&config).unwrap();
        let decoded: Config = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded.max_message_size, config.max_message_size);
    }

    #[test]
    fn missing_fields_fall_back_to_defaults() {
        let decoded: Config = serde_json::from_str(r#"{"max_incoming_messages": 5}"#).unwrap();
        assert_eq!(decoded.max_incoming_messages, 5);
        assert_eq!(decoded.timeout, Duration::from_secs(30));
    }
}
