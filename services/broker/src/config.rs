use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::net::SocketAddr;
use std::time::Duration;
use trellis_broker::BrokerSettings;
use trellis_common::LimitsConfig;

// Broker service configuration sourced from environment variables.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    // TCP listener bind address.
    pub bind: SocketAddr,
    // Metrics HTTP listener bind address.
    pub metrics_bind: SocketAddr,
    // Delay before coalesced responses are flushed.
    pub dispatch_delay_ms: u64,
    // Frame size, flow window and queue ceilings per connection.
    pub limits: LimitsConfig,
    // Envelopes buffered for a connection's writer task.
    pub outbound_queue_depth: usize,
}

const DEFAULT_DISPATCH_DELAY_MS: u64 = 75;
const DEFAULT_OUTBOUND_QUEUE_DEPTH: usize = 1024;

#[derive(Debug, Deserialize)]
struct BrokerConfigOverride {
    bind: Option<String>,
    metrics_bind: Option<String>,
    dispatch_delay_ms: Option<u64>,
    max_missing_acks: Option<u64>,
    max_pending_envelopes: Option<usize>,
    max_frame_bytes: Option<usize>,
    outbound_queue_depth: Option<usize>,
}

fn env_positive<T>(key: &str) -> Option<T>
where
    T: std::str::FromStr + PartialOrd + Default,
{
    std::env::var(key)
        .ok()
        .and_then(|value| value.parse::<T>().ok())
        .filter(|value| *value > T::default())
}

impl BrokerConfig {
    pub fn from_env() -> Result<Self> {
        // Environment variables provide defaults for local development.
        let bind = std::env::var("TRELLIS_BIND")
            .unwrap_or_else(|_| "0.0.0.0:4100".to_string())
            .parse()
            .with_context(|| "parse TRELLIS_BIND")?;
        let metrics_bind = std::env::var("TRELLIS_METRICS_BIND")
            .unwrap_or_else(|_| "0.0.0.0:8080".to_string())
            .parse()
            .with_context(|| "parse TRELLIS_METRICS_BIND")?;
        let defaults = LimitsConfig::default();
        let limits = LimitsConfig {
            max_frame_bytes: env_positive("TRELLIS_MAX_FRAME_BYTES").unwrap_or(defaults.max_frame_bytes),
            max_missing_acks: env_positive("TRELLIS_MAX_MISSING_ACKS").unwrap_or(defaults.max_missing_acks),
            max_pending_envelopes: env_positive("TRELLIS_MAX_PENDING_ENVELOPES")
                .unwrap_or(defaults.max_pending_envelopes),
        };
        Ok(Self {
            bind,
            metrics_bind,
            // Zero disables the coalescing delay, so it is allowed here.
            dispatch_delay_ms: std::env::var("TRELLIS_DISPATCH_DELAY_MS")
                .ok()
                .and_then(|value| value.parse::<u64>().ok())
                .unwrap_or(DEFAULT_DISPATCH_DELAY_MS),
            limits,
            outbound_queue_depth: env_positive("TRELLIS_OUTBOUND_QUEUE_DEPTH")
                .unwrap_or(DEFAULT_OUTBOUND_QUEUE_DEPTH),
        })
    }

    pub fn from_env_or_yaml() -> Result<Self> {
        let mut config = Self::from_env()?;
        if let Ok(path) = std::env::var("TRELLIS_BROKER_CONFIG") {
            // YAML overrides allow ops-friendly config files.
            let contents = fs::read_to_string(&path)
                .with_context(|| format!("read TRELLIS_BROKER_CONFIG: {path}"))?;
            let override_cfg: BrokerConfigOverride =
                serde_yaml::from_str(&contents).with_context(|| "parse broker config yaml")?;
            if let Some(value) = override_cfg.bind {
                config.bind = value.parse().with_context(|| "parse bind")?;
            }
            if let Some(value) = override_cfg.metrics_bind {
                config.metrics_bind = value.parse().with_context(|| "parse metrics_bind")?;
            }
            if let Some(value) = override_cfg.dispatch_delay_ms {
                config.dispatch_delay_ms = value;
            }
            if let Some(value) = override_cfg.max_missing_acks
                && value > 0
            {
                config.limits.max_missing_acks = value;
            }
            if let Some(value) = override_cfg.max_pending_envelopes
                && value > 0
            {
                config.limits.max_pending_envelopes = value;
            }
            if let Some(value) = override_cfg.max_frame_bytes
                && value > 0
            {
                config.limits.max_frame_bytes = value;
            }
            if let Some(value) = override_cfg.outbound_queue_depth
                && value > 0
            {
                config.outbound_queue_depth = value;
            }
        }
        Ok(config)
    }

    /// Core settings derived from this config.
    pub fn settings(&self) -> BrokerSettings {
        BrokerSettings {
            dispatch_delay: Duration::from_millis(self.dispatch_delay_ms),
            max_missing_acks: self.limits.max_missing_acks,
            max_pending_envelopes: self.limits.max_pending_envelopes,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::env::EnvGuard;
    use serial_test::serial;
    use std::io::Write;

    const KEYS: [&str; 8] = [
        "TRELLIS_BIND",
        "TRELLIS_METRICS_BIND",
        "TRELLIS_DISPATCH_DELAY_MS",
        "TRELLIS_MAX_MISSING_ACKS",
        "TRELLIS_MAX_PENDING_ENVELOPES",
        "TRELLIS_MAX_FRAME_BYTES",
        "TRELLIS_OUTBOUND_QUEUE_DEPTH",
        "TRELLIS_BROKER_CONFIG",
    ];

    fn clean_env() -> Vec<EnvGuard> {
        KEYS.iter().map(|key| EnvGuard::unset(*key)).collect()
    }

    #[test]
    #[serial]
    fn defaults_without_env() {
        let _env = clean_env();
        let config = BrokerConfig::from_env_or_yaml().expect("config");
        assert_eq!(config.bind.port(), 4100);
        assert_eq!(config.dispatch_delay_ms, 75);
        assert_eq!(config.limits, LimitsConfig::default());
        let settings = config.settings();
        assert_eq!(settings.dispatch_delay, Duration::from_millis(75));
        assert_eq!(settings.max_missing_acks, 8);
        assert_eq!(settings.max_pending_envelopes, 4096);
    }

    #[test]
    #[serial]
    fn env_overrides_and_ignores_zero_limits() {
        let _env = clean_env();
        let _g1 = EnvGuard::set("TRELLIS_BIND", "127.0.0.1:9000");
        let _g2 = EnvGuard::set("TRELLIS_MAX_MISSING_ACKS", "16");
        let _g3 = EnvGuard::set("TRELLIS_MAX_PENDING_ENVELOPES", "0");
        let _g4 = EnvGuard::set("TRELLIS_DISPATCH_DELAY_MS", "0");
        let config = BrokerConfig::from_env().expect("config");
        assert_eq!(config.bind.port(), 9000);
        assert_eq!(config.limits.max_missing_acks, 16);
        assert_eq!(config.limits.max_pending_envelopes, 4096);
        assert_eq!(config.dispatch_delay_ms, 0);
    }

    #[test]
    #[serial]
    fn invalid_bind_is_an_error() {
        let _env = clean_env();
        let _g = EnvGuard::set("TRELLIS_BIND", "not-an-address");
        let err = BrokerConfig::from_env().expect_err("bad bind");
        assert!(err.to_string().contains("TRELLIS_BIND"));
    }

    #[test]
    #[serial]
    fn yaml_overrides_env() {
        let _env = clean_env();
        let _g1 = EnvGuard::set("TRELLIS_MAX_MISSING_ACKS", "16");
        let mut file = tempfile();
        writeln!(file.1, "max_missing_acks: 32\noutbound_queue_depth: 8\nbind: 127.0.0.1:7000").expect("write");
        let _g2 = EnvGuard::set("TRELLIS_BROKER_CONFIG", file.0.to_str().expect("utf8"));
        let config = BrokerConfig::from_env_or_yaml().expect("config");
        assert_eq!(config.limits.max_missing_acks, 32);
        assert_eq!(config.outbound_queue_depth, 8);
        assert_eq!(config.bind.port(), 7000);
        let _ = std::fs::remove_file(&file.0);
    }

    #[test]
    #[serial]
    fn missing_yaml_file_is_an_error() {
        let _env = clean_env();
        let _g = EnvGuard::set("TRELLIS_BROKER_CONFIG", "/nonexistent/trellis.yaml");
        let err = BrokerConfig::from_env_or_yaml().expect_err("missing file");
        assert!(format!("{err:#}").contains("TRELLIS_BROKER_CONFIG"));
    }

    fn tempfile() -> (std::path::PathBuf, std::fs::File) {
        let path = std::env::temp_dir().join(format!("trellis-config-{}.yaml", std::process::id()));
        let file = std::fs::File::create(&path).expect("create");
        (path, file)
    }
}
