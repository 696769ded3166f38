use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use serde::Deserialize;
use url::Url;

use crate::modbus::UnitId;

/// File name looked up when the configured path is a directory.
const CONFIG_FILE: &str = "config.json";

#[derive(Debug, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub servers: Vec<ServerConfig>,
}

#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    pub url: Url,

    #[serde(default, with = "humantime_serde")]
    pub write_timeout: Option<Duration>,

    #[serde(default)]
    pub slaves: Vec<SlaveConfig>,
}

#[derive(Debug, PartialEq, Eq, Deserialize)]
pub struct SlaveConfig {
    #[serde(alias = "unit")]
    pub address: UnitId,

    /// Free-form device type, only shown to the operator.
    #[serde(default, rename = "type")]
    pub kind: Option<String>,

    /// Whether the slave starts out connected.
    #[serde(default)]
    pub online: bool,
}

impl Config {
    /// Reads a JSON config from `path`, or from `path/config.json` if `path` is a directory.
    pub fn load(path: impl AsRef<Path>) -> crate::Result<Self> {
        let path = resolve(path.as_ref());
        let bytes = std::fs::read(&path).map_err(|err| {
            crate::Error::Other(format!("reading {}: {err}", path.display()).into())
        })?;
        Ok(serde_json::from_slice(&bytes)?)
    }
}

fn resolve(path: &Path) -> PathBuf {
    if path.is_dir() {
        path.join(CONFIG_FILE)
    } else {
        path.to_owned()
    }
}

#[cfg(test)]
use pretty_assertions::assert_eq;

#[test]
fn parse_minimal_config() {
    use serde_json::json;
    let config = serde_json::from_value::<Config>(json!({
        "servers": [{ "url": "tcp://localhost:5020" }]
    }))
    .unwrap();

    let server = &config.servers[0];
    assert_eq!(server.url.as_str(), "tcp://localhost:5020");
    assert_eq!(server.write_timeout, None);
    assert!(server.slaves.is_empty());
}

#[test]
fn parse_full_config() {
    use serde_json::json;
    let config = serde_json::from_value::<Config>(json!({
        "servers": [
            {
                "url": "tcp://0.0.0.0:5020",
                "write_timeout": "5s",
                "slaves": [
                    { "address": 101, "type": "trafo", "online": true },
                    { "unit": 102, "type": "shortcircuit" },
                ]
            },
            { "url": "tcp://0.0.0.0:5021" }
        ]
    }))
    .unwrap();

    assert_eq!(config.servers.len(), 2);
    assert_eq!(
        config.servers[0].write_timeout,
        Some(Duration::from_secs(5))
    );
    assert_eq!(
        config.servers[0].slaves,
        vec![
            SlaveConfig {
                address: 101,
                kind: Some("trafo".into()),
                online: true,
            },
            SlaveConfig {
                address: 102,
                kind: Some("shortcircuit".into()),
                online: false,
            },
        ]
    );
}

#[test]
fn rejects_invalid_unit_ids() {
    use serde_json::json;
    let result = serde_json::from_value::<Config>(json!({
        "servers": [{ "url": "tcp://localhost", "slaves": [{ "address": 256 }] }]
    }));
    assert!(result.is_err());
}

#[test]
fn loads_config_json_from_directory() {
    let dir = std::env::temp_dir().join(format!("modbus-sim-config-{}", std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(
        dir.join(CONFIG_FILE),
        r#"{ "servers": [{ "url": "tcp://127.0.0.1:5020", "slaves": [{ "address": 1 }] }] }"#,
    )
    .unwrap();

    let from_dir = Config::load(&dir).unwrap();
    let from_file = Config::load(dir.join(CONFIG_FILE)).unwrap();
    assert_eq!(from_dir.servers[0].slaves, from_file.servers[0].slaves);

    assert!(matches!(
        Config::load(dir.join("missing.json")),
        Err(crate::Error::Other(_))
    ));

    std::fs::remove_dir_all(&dir).unwrap();
}
