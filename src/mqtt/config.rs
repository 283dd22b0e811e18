use serde::{Deserialize, Serialize};

/// `[mqtt]` section of the configuration file
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct MqttConfig {
    pub broker: String,
    pub port: u16,
    /// Client id on the broker
    pub client_name: String,
    /// First segment of every topic the bridge uses
    pub topic_prefix: String,
    pub keep_alive_secs: u64,
    /// Log outbound publishes instead of sending them
    pub dry_run: bool,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            broker: "192.168.1.1".to_string(),
            port: 1883,
            client_name: "mqtt2cast".to_string(),
            topic_prefix: "mqtt2cast".to_string(),
            keep_alive_secs: 60,
            dry_run: false,
        }
    }
}

impl MqttConfig {
    /// Liveness topic carrying the last will
    pub fn status_topic(&self) -> String {
        format!("{}/sys/status", self.topic_prefix)
    }

    /// `P/<device>/event/<kind>` with wildcard and separator characters removed from
    /// the device name.
    pub fn event_topic(&self, device: &str, kind: &str) -> String {
        let device: String = device
            .chars()
            .map(|c| match c {
                '/' | '+' | '#' => '_',
                c => c,
            })
            .collect();
        format!("{}/{}/event/{}", self.topic_prefix, device, kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topics_hang_off_the_prefix() {
        let config = MqttConfig::default();
        assert_eq!(config.status_topic(), "mqtt2cast/sys/status");
        assert_eq!(
            config.event_topic("Living Room", "media_status"),
            "mqtt2cast/Living Room/event/media_status"
        );
    }

    #[test]
    fn device_names_cannot_inject_levels_or_wildcards() {
        let config = MqttConfig::default();
        assert_eq!(
            config.event_topic("a/b+#", "cast_status"),
            "mqtt2cast/a_b__/event/cast_status"
        );
    }

    #[test]
    fn partial_section_keeps_defaults() {
        let config: MqttConfig = toml::from_str("broker = \"10.1.1.1\"").unwrap();
        assert_eq!(config.broker, "10.1.1.1");
        assert_eq!(config.port, 1883);
        assert_eq!(config.keep_alive_secs, 60);
    }
}
