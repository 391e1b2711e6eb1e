//! Parameter set loading
//!
//! Reads a [`ConnectionParams`] from a TOML, YAML or JSON file, optionally
//! overlaid with prefixed environment variables. Every option missing from
//! the sources keeps its default.

use figment::{
    providers::{Env, Format, Json, Toml, Yaml},
    Figment,
};
use std::path::Path;
use tracing::debug;

use crate::error::{LinkError, Result};
use crate::params::ConnectionParams;

/// Config file formats recognised by extension
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigFormat {
    Toml,
    Yaml,
    Json,
}

impl ConfigFormat {
    pub fn from_path(path: &Path) -> Result<Self> {
        let extension = path
            .extension()
            .and_then(|s| s.to_str())
            .ok_or_else(|| LinkError::config("Config file must have an extension"))?;

        match extension.to_lowercase().as_str() {
            "toml" => Ok(ConfigFormat::Toml),
            "yaml" | "yml" => Ok(ConfigFormat::Yaml),
            "json" => Ok(ConfigFormat::Json),
            other => Err(LinkError::config(format!(
                "Unsupported config file format: {}",
                other
            ))),
        }
    }
}

fn file_figment(path: &Path) -> Result<Figment> {
    if !path.exists() {
        return Err(LinkError::config(format!(
            "Config file not found: {}",
            path.display()
        )));
    }
    Ok(match ConfigFormat::from_path(path)? {
        ConfigFormat::Toml => Figment::new().merge(Toml::file(path)),
        ConfigFormat::Yaml => Figment::new().merge(Yaml::file(path)),
        ConfigFormat::Json => Figment::new().merge(Json::file(path)),
    })
}

fn extract(figment: Figment) -> Result<ConnectionParams> {
    let raw: serde_json::Value = figment
        .extract()
        .map_err(|e| LinkError::config(format!("Failed to load connection parameters: {}", e)))?;
    let params = ConnectionParams::from_value(raw)?;
    debug!("Loaded connection parameters: {:?}", params);
    Ok(params)
}

/// Load a parameter set from a single file
pub fn load_params_from_file<P: AsRef<Path>>(path: P) -> Result<ConnectionParams> {
    extract(file_figment(path.as_ref())?)
}

/// Load a parameter set from a file, then overlay `<PREFIX>*` environment
/// variables (e.g. `DEVLINK_BAUDRATE=19200`)
pub fn load_params<P: AsRef<Path>>(path: P, env_prefix: &str) -> Result<ConnectionParams> {
    extract(file_figment(path.as_ref())?.merge(Env::prefixed(env_prefix)))
}

/// Write a parameter set in the format given by the file extension
pub fn save_params_to_file<P: AsRef<Path>>(params: &ConnectionParams, path: P) -> Result<()> {
    let path = path.as_ref();
    let content = match ConfigFormat::from_path(path)? {
        ConfigFormat::Toml => toml::to_string_pretty(params)
            .map_err(|e| LinkError::config(format!("TOML serialization failed: {}", e)))?,
        ConfigFormat::Yaml => serde_yaml::to_string(params)
            .map_err(|e| LinkError::config(format!("YAML serialization failed: {}", e)))?,
        ConfigFormat::Json => serde_json::to_string_pretty(params)?,
    };

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, content)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::{Parity, StopBits, Terminator};
    use tempfile::TempDir;

    fn write(dir: &TempDir, name: &str, content: &str) -> std::path::PathBuf {
        let path = dir.path().join(name);
        std::fs::write(&path, content).unwrap();
        path
    }

    #[test]
    fn test_load_yaml() {
        let dir = TempDir::new().unwrap();
        let path = write(
            &dir,
            "meter.yaml",
            r#"
name: meter
serial_port: /dev/ttyUSB1
baudrate: "19200"
parity: E
stopbits: 2
terminator: "\\r\\n"
autoreconnect: "no"
"#,
        );

        let params = load_params_from_file(&path).unwrap();
        assert_eq!(params.name, "meter");
        assert_eq!(params.serial_port, "/dev/ttyUSB1");
        assert_eq!(params.baudrate, 19200);
        assert_eq!(params.parity, Parity::Even);
        assert_eq!(params.stopbits, StopBits::Two);
        assert_eq!(params.terminator, Terminator::Bytes(b"\r\n".to_vec()));
        assert!(!params.auto_reconnect);
        // untouched options keep their defaults
        assert_eq!(params.bytesize, 8);
        assert_eq!(params.connect_retries, 3);
    }

    #[test]
    fn test_load_toml_and_json() {
        let dir = TempDir::new().unwrap();
        let toml_path = write(
            &dir,
            "web.toml",
            "host = \"192.168.1.20\"\nport = 8080\ntimeout = 0.5\nterminator = 12\n",
        );
        let params = load_params_from_file(&toml_path).unwrap();
        assert_eq!(params.host, "192.168.1.20");
        assert_eq!(params.port, 8080);
        assert_eq!(params.timeout, 0.5);
        assert_eq!(params.terminator, Terminator::Length(12));

        let json_path = write(&dir, "udp.json", r#"{"host": "h", "local_port": 9999}"#);
        let params = load_params_from_file(&json_path).unwrap();
        assert_eq!(params.port, 9999);
    }

    #[test]
    fn test_alias_and_canonical_key_in_one_file() {
        let dir = TempDir::new().unwrap();
        let path = write(&dir, "listener.yaml", "port: 5000\nlocal_port: 9999\n");
        let params = load_params_from_file(&path).unwrap();
        assert_eq!(params.port, 5000);
    }

    #[test]
    fn test_env_overlay() {
        let dir = TempDir::new().unwrap();
        let path = write(&dir, "line.toml", "serial_port = \"/dev/ttyS0\"\nbaudrate = 9600\n");

        std::env::set_var("DEVLINKTEST_BAUDRATE", "38400");
        std::env::set_var("DEVLINKTEST_BINARY_MODE", "true");
        let params = load_params(&path, "DEVLINKTEST_").unwrap();
        std::env::remove_var("DEVLINKTEST_BAUDRATE");
        std::env::remove_var("DEVLINKTEST_BINARY_MODE");

        assert_eq!(params.serial_port, "/dev/ttyS0");
        assert_eq!(params.baudrate, 38400);
        assert!(params.binary_mode);
    }

    #[test]
    fn test_rejects_bad_files() {
        let dir = TempDir::new().unwrap();
        let missing = dir.path().join("absent.yaml");
        assert!(matches!(load_params_from_file(&missing), Err(LinkError::Config(_))));

        let ini = write(&dir, "line.ini", "baudrate=9600");
        assert!(matches!(load_params_from_file(&ini), Err(LinkError::Config(_))));

        let invalid = write(&dir, "bad.toml", "bytesize = 9\n");
        assert!(matches!(load_params_from_file(&invalid), Err(LinkError::Config(_))));
    }

    #[test]
    fn test_saved_file_loads_back() {
        let dir = TempDir::new().unwrap();
        let params = ConnectionParams::default()
            .with_name("saved")
            .with_serial_port("/dev/ttyACM0")
            .with_terminator(&b"\r"[..]);

        for name in ["saved.toml", "saved.yaml", "nested/saved.json"] {
            let path = dir.path().join(name);
            save_params_to_file(&params, &path).unwrap();
            let loaded = load_params_from_file(&path).unwrap();
            assert_eq!(loaded.name, "saved");
            assert_eq!(loaded.serial_port, "/dev/ttyACM0");
            assert_eq!(loaded.terminator, Terminator::Bytes(b"\r".to_vec()));
        }
    }
}
