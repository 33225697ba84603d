//! Startup configuration: CLI values normalized into an immutable [`Config`].

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use log::info;

/// Relative path handed to the device client as its opaque persistence store.
pub const PERSISTENCE_DIR: &str = "astarte_persistency.d";

const DEFAULT_BROKER_PORT: u16 = 1883;

/// Immutable runtime configuration, built once from the command line.
#[derive(Debug, Clone)]
pub struct Config {
    pub device_id: String,
    pub device_secret: String,
    pub realm_name: String,
    pub pairing_url: String,
    /// Remaining-count seed. `None` means the send loop is unbounded.
    pub limit: Option<u64>,
    pub persistence_dir: PathBuf,
}

impl Config {
    pub fn new(
        device_id: String,
        device_secret: String,
        pairing_url: String,
        realm_name: String,
        limit: i64,
    ) -> Self {
        Config {
            device_id,
            device_secret,
            realm_name,
            pairing_url,
            limit: send_limit(limit),
            persistence_dir: Path::new(".").join(PERSISTENCE_DIR),
        }
    }

    /// Create the persistence directory when absent; refuse to start when the
    /// path is occupied by something that is not a directory.
    pub fn ensure_persistence_dir(&self) -> Result<()> {
        let path = &self.persistence_dir;
        if !path.exists() {
            info!("persistence directory {} does not exist, creating it", path.display());
            std::fs::create_dir(path)
                .with_context(|| format!("failed to create persistence directory {}", path.display()))?;
        } else if !path.is_dir() {
            bail!("path {} exists but is not a directory", path.display());
        }
        Ok(())
    }

    /// Broker `host:port` derived from the pairing URL. The pairing handshake
    /// itself is owned by the broker side; only the endpoint address is
    /// needed here.
    pub fn broker_addr(&self) -> Result<(String, u16)> {
        let raw = self
            .pairing_url
            .split_once("://")
            .map_or(self.pairing_url.as_str(), |(_, rest)| rest);
        let raw = raw.split(['/', '?']).next().unwrap_or(raw);
        if raw.is_empty() {
            bail!("pairing URL {:?} has no host", self.pairing_url);
        }
        match raw.split_once(':') {
            Some((host, port)) => {
                let port = port
                    .parse::<u16>()
                    .with_context(|| format!("invalid port in pairing URL {:?}", self.pairing_url))?;
                Ok((host.to_string(), port))
            }
            None => Ok((raw.to_string(), DEFAULT_BROKER_PORT)),
        }
    }
}

/// Non-positive limits mean "send forever".
fn send_limit(raw: i64) -> Option<u64> {
    (raw > 0).then(|| raw as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_with(limit: i64) -> Config {
        Config::new(
            "abcDEF123".into(),
            "secret".into(),
            "http://api.example.com:8883/pairing".into(),
            "test".into(),
            limit,
        )
    }

    #[test]
    fn positive_limit_bounds_the_loop() {
        assert_eq!(config_with(3).limit, Some(3));
        assert_eq!(config_with(1).limit, Some(1));
    }

    #[test]
    fn zero_and_negative_limits_mean_unbounded() {
        assert_eq!(config_with(0).limit, None);
        assert_eq!(config_with(-5).limit, None);
        assert_eq!(config_with(-1).limit, None);
    }

    #[test]
    fn broker_addr_from_url_with_port() {
        let (host, port) = config_with(1).broker_addr().unwrap();
        assert_eq!(host, "api.example.com");
        assert_eq!(port, 8883);
    }

    #[test]
    fn broker_addr_defaults_port() {
        let mut config = config_with(1);
        config.pairing_url = "mqtt://broker.local/".into();
        assert_eq!(config.broker_addr().unwrap(), ("broker.local".into(), 1883));
    }

    #[test]
    fn broker_addr_rejects_empty_host() {
        let mut config = config_with(1);
        config.pairing_url = "http://".into();
        assert!(config.broker_addr().is_err());
    }

    #[test]
    fn persistence_dir_is_created_when_absent() {
        let tmp = tempfile::tempdir().unwrap();
        let mut config = config_with(1);
        config.persistence_dir = tmp.path().join("astarte_persistency.d");
        config.ensure_persistence_dir().unwrap();
        assert!(config.persistence_dir.is_dir());
        // Second call is a no-op on an existing directory.
        config.ensure_persistence_dir().unwrap();
    }

    #[test]
    fn persistence_path_occupied_by_file_is_fatal() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("astarte_persistency.d");
        std::fs::write(&path, b"not a directory").unwrap();
        let mut config = config_with(1);
        config.persistence_dir = path;
        let err = config.ensure_persistence_dir().unwrap_err();
        assert!(err.to_string().contains("not a directory"));
    }
}
