// =============================================================================
// Configuration — YAML file loaded once at process startup
// =============================================================================
//
// Every field is required in the YAML (no `#[serde(default)]`): an operator
// typo should fail fast at startup rather than silently run with a default.
// =============================================================================

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::IngestError;
use crate::types::CalendarCode;

/// Top-level configuration, one-to-one with the YAML shape in the interface
/// contract.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub username: String,
    pub password: String,
    /// Session-storage encryption secret.
    pub secret: String,
    /// Paper vs live broker endpoint.
    pub paper: bool,
    pub redis: RedisConfig,
    pub instruments: Vec<InstrumentConfig>,
    pub dashboard_csv_path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    pub host: String,
    pub port: u16,
    pub db: i64,
    #[serde(default)]
    pub password: Option<String>,
}

impl RedisConfig {
    /// Build a `redis://` connection URL from the parsed fields.
    pub fn url(&self) -> String {
        match &self.password {
            Some(pw) if !pw.is_empty() => {
                format!("redis://:{pw}@{}:{}/{}", self.host, self.port, self.db)
            }
            _ => format!("redis://{}:{}/{}", self.host, self.port, self.db),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstrumentConfig {
    pub conid: i64,
    pub symbol: String,
    pub exchange: String,
}

impl Config {
    /// Read and parse the YAML file at `path`, validating that every
    /// instrument's `exchange` maps to a known calendar code.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, IngestError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| IngestError::Config(format!("reading {}: {e}", path.display())))?;

        let config: Config = serde_yaml::from_str(&raw)
            .map_err(|e| IngestError::Config(format!("parsing {}: {e}", path.display())))?;

        for instrument in &config.instruments {
            CalendarCode::from_exchange(&instrument.exchange).ok_or_else(|| {
                IngestError::Config(format!(
                    "instrument {} has unknown exchange {:?}",
                    instrument.symbol, instrument.exchange
                ))
            })?;
        }

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_yaml() -> &'static str {
        r#"
username: alice
password: hunter2
secret: s3cr3t
paper: true
redis:
  host: 127.0.0.1
  port: 6379
  db: 0
  password: null
instruments:
  - conid: 265598
    symbol: AAPL
    exchange: NASDAQ
  - conid: 8314
    symbol: SPY
    exchange: ARCA
dashboard_csv_path: dash.csv
"#
    }

    #[test]
    fn loads_valid_config() {
        let dir = std::env::temp_dir().join(format!("portal-ingest-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("config.yaml");
        std::fs::write(&path, sample_yaml()).unwrap();

        let config = Config::load(&path).expect("should parse");
        assert_eq!(config.username, "alice");
        assert_eq!(config.instruments.len(), 2);
        assert_eq!(config.redis.url(), "redis://127.0.0.1:6379/0");

        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn rejects_unknown_exchange() {
        let dir = std::env::temp_dir().join(format!("portal-ingest-test2-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("bad.yaml");
        let bad = sample_yaml().replace("NASDAQ", "FOOEX");
        std::fs::write(&path, bad).unwrap();

        let err = Config::load(&path).unwrap_err();
        assert!(matches!(err, IngestError::Config(_)));

        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn redis_url_includes_password() {
        let cfg = RedisConfig {
            host: "redis.local".into(),
            port: 6380,
            db: 2,
            password: Some("pw".into()),
        };
        assert_eq!(cfg.url(), "redis://:pw@redis.local:6380/2");
    }
}
