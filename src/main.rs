// NetAgent UPS MQTT bridge
// SPDX-License-Identifier: ISC

use clap::Parser;
use netagent2mqtt::{publish_messages, NetAgent, PollerConfig};
use std::time::{Duration, Instant};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Cli {
    /// MQTT broker to publish to
    #[arg(long, env = "MQTT_SERVER", default_value = "mqtt://192.168.1.1")]
    mqtt_server: String,

    /// Hostname or IP address of the UPS web card
    #[arg(long, env = "UPS_IP", default_value = "192.168.1.2")]
    ups_ip: String,

    /// HTTP port of the UPS web card
    #[arg(long, env = "UPS_HTTP_PORT", default_value_t = 80)]
    ups_http_port: u16,

    /// Per-page request timeout in milliseconds
    #[arg(long, env = "UPS_HTTP_TIMEOUT_MS", default_value_t = 5000)]
    ups_http_timeout_ms: u64,

    /// Seconds between poll cycles
    #[arg(long, env = "POLL_INTERVAL_SECONDS", default_value_t = 20)]
    poll_interval_seconds: u64,

    /// Root of the state topic tree
    #[arg(long, env = "UPS_TOPIC", default_value = "ups-netagent")]
    ups_topic: String,

    /// Home Assistant discovery prefix, defaults to
    /// homeassistant/sensor/<ups-topic>
    #[arg(long, env = "DISCOVERY_TOPIC_PREFIX")]
    discovery_topic_prefix: Option<String>,

    /// Path of the live status page
    #[arg(long, env = "UPS_STATUS_PATH", default_value = "/pda/status-1.htm")]
    ups_status_path: String,

    /// Path of the system status page
    #[arg(long, env = "UPS_SYSTEM_PATH", default_value = "/pda/sys_status.htm")]
    ups_system_path: String,

    /// Path of the UPS information page
    #[arg(long, env = "UPS_INFO_PATH", default_value = "/pda/UPS.htm")]
    ups_info_path: String,

    /// Device identifier used in discovery unique_ids
    #[arg(long, env = "HA_DEVICE_ID", default_value = "ups_netagent")]
    ha_device_id: String,

    /// Device name override, defaults to the UPS reported system name
    #[arg(long, env = "HA_DEVICE_NAME")]
    ha_device_name: Option<String>,

    /// Configuration URL override for the discovery device record
    #[arg(long, env = "UPS_CONFIG_URL")]
    ups_config_url: Option<String>,

    /// Log filter directives
    #[arg(long, env = "NETAGENT2MQTT_LOG", default_value = "info")]
    log: String,
}

impl Cli {
    /// Resolve into the poller configuration, deriving the discovery
    /// prefix and configuration URL when they were not given.
    fn poller_config(self) -> PollerConfig {
        let discovery_prefix = match self.discovery_topic_prefix {
            Some(prefix) => prefix,
            None => format!("homeassistant/sensor/{}", self.ups_topic),
        };
        let configuration_url = match self.ups_config_url {
            Some(url) => url,
            None => netagent2mqtt::derive_configuration_url(&self.ups_ip, self.ups_http_port),
        };

        PollerConfig {
            host: self.ups_ip,
            port: self.ups_http_port,
            timeout: Duration::from_millis(self.ups_http_timeout_ms),
            status_path: self.ups_status_path,
            system_path: self.ups_system_path,
            info_path: self.ups_info_path,
            discovery_prefix,
            topic_root: self.ups_topic,
            device_id: self.ha_device_id,
            device_name: self.ha_device_name,
            configuration_url,
        }
    }
}

/// Split an mqtt:// or tcp:// broker URL into host and port,
/// defaulting to 1883.
fn parse_broker_url(url: &str) -> Result<(String, u16), String> {
    let stripped = url
        .strip_prefix("mqtt://")
        .or_else(|| url.strip_prefix("tcp://"))
        .unwrap_or(url);

    let (host, port) = match stripped.rsplit_once(':') {
        Some((host, port)) => {
            let port = port
                .parse::<u16>()
                .map_err(|_| format!("invalid broker port in {:?}", url))?;
            (host, port)
        }
        None => (stripped, 1883),
    };

    if host.is_empty() {
        return Err(format!("missing broker host in {:?}", url));
    }

    Ok((host.to_string(), port))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(EnvFilter::new(&cli.log))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let (broker_host, broker_port) = parse_broker_url(&cli.mqtt_server)?;
    let poll_interval_seconds = cli.poll_interval_seconds;
    let config = cli.poller_config();
    let client_id = config.device_id.clone();

    info!(
        ups = %format!("{}:{}", config.host, config.port),
        broker = %format!("{}:{}", broker_host, broker_port),
        topic_root = %config.topic_root,
        interval_seconds = poll_interval_seconds,
        "starting NetAgent UPS poller"
    );

    let ups = NetAgent::new(config);
    let interval = Duration::from_secs(poll_interval_seconds);
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        ticker.tick().await;
        let started = Instant::now();

        match ups.poll_batch().await {
            Ok(messages) => {
                match publish_messages(&broker_host, broker_port, &client_id, &messages)
                    .await
                {
                    Ok(()) => debug!(messages = messages.len(), "published UPS data"),
                    Err(e) => error!("Failed to publish UPS data: {}", e),
                }
            }
            Err(e) => error!("Failed to update UPS data: {}", e),
        }

        if started.elapsed() >= interval {
            warn!(
                elapsed_ms = started.elapsed().as_millis() as u64,
                "poll cycle overran the interval, skipping missed ticks"
            );
        }
    }
}

#[cfg(test)]
mod cli_tests {
    use super::*;

    #[test]
    fn test_01_broker_url_with_scheme_and_port() {
        assert_eq!(
            parse_broker_url("mqtt://broker.local:1884"),
            Ok(("broker.local".to_string(), 1884))
        );
    }

    #[test]
    fn test_02_broker_url_defaults_port() {
        assert_eq!(
            parse_broker_url("mqtt://192.168.1.1"),
            Ok(("192.168.1.1".to_string(), 1883))
        );
        assert_eq!(
            parse_broker_url("tcp://broker.local"),
            Ok(("broker.local".to_string(), 1883))
        );
    }

    #[test]
    fn test_03_broker_url_bare_host() {
        assert_eq!(
            parse_broker_url("broker.local"),
            Ok(("broker.local".to_string(), 1883))
        );
    }

    #[test]
    fn test_04_broker_url_rejects_garbage() {
        assert!(parse_broker_url("mqtt://broker.local:notaport").is_err());
        assert!(parse_broker_url("mqtt://").is_err());
    }

    #[test]
    fn test_05_poller_config_defaults() {
        let cli = Cli::parse_from(["netagent2mqtt"]);
        let config = cli.poller_config();

        assert_eq!(config.host, "192.168.1.2");
        assert_eq!(config.port, 80);
        assert_eq!(config.timeout, Duration::from_millis(5000));
        assert_eq!(config.status_path, "/pda/status-1.htm");
        assert_eq!(config.topic_root, "ups-netagent");
        assert_eq!(config.discovery_prefix, "homeassistant/sensor/ups-netagent");
        assert_eq!(config.device_id, "ups_netagent");
        assert_eq!(config.device_name, None);
        assert_eq!(config.configuration_url, "http://192.168.1.2");
    }

    #[test]
    fn test_06_poller_config_overrides() {
        let cli = Cli::parse_from([
            "netagent2mqtt",
            "--ups-ip",
            "10.0.0.9",
            "--ups-http-port",
            "8080",
            "--ups-topic",
            "office-ups",
            "--discovery-topic-prefix",
            "homeassistant/sensor/office",
            "--ups-config-url",
            "http://ups.example.net/",
            "--ha-device-name",
            "Office UPS",
        ]);
        let config = cli.poller_config();

        assert_eq!(config.host, "10.0.0.9");
        assert_eq!(config.port, 8080);
        assert_eq!(config.topic_root, "office-ups");
        assert_eq!(config.discovery_prefix, "homeassistant/sensor/office");
        assert_eq!(config.configuration_url, "http://ups.example.net/");
        assert_eq!(config.device_name, Some("Office UPS".to_string()));
    }

    #[test]
    fn test_07_poller_config_derives_url_with_port() {
        let cli = Cli::parse_from(["netagent2mqtt", "--ups-ip", "10.0.0.9", "--ups-http-port", "8080"]);
        let config = cli.poller_config();
        assert_eq!(config.configuration_url, "http://10.0.0.9:8080");
        // the derived discovery prefix follows the topic root
        assert_eq!(config.discovery_prefix, "homeassistant/sensor/ups-netagent");
    }
}
