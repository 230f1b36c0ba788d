//! `system/config.json` deserialization. Every key is optional except the
//! server name and the two addresses; absent keys take the documented
//! defaults.

use serde_derive::Deserialize;
use std::fs::File;
use std::io;
use std::path::Path;

fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize)]
pub struct Config {
    #[serde(rename = "ServerName")]
    pub server_name: String,

    #[serde(rename = "CommonItemDropRates-Enemy", default)]
    pub common_item_drop_rates_enemy: Vec<u32>,

    #[serde(rename = "CommonItemDropRates-Box", default)]
    pub common_item_drop_rates_box: Vec<u32>,

    #[serde(rename = "CommonUnitTypes", default)]
    pub common_unit_types: Vec<Vec<u8>>,

    /// Entries of [title, short description, long text].
    #[serde(rename = "InformationMenuContents", default)]
    pub information_menu_contents: Vec<[String; 3]>,

    /// 0 means one worker per hardware thread.
    #[serde(rename = "Threads", default)]
    pub threads: usize,

    #[serde(rename = "LocalAddress")]
    pub local_address: String,

    #[serde(rename = "ExternalAddress")]
    pub external_address: String,

    #[serde(rename = "RunDNSServer", default = "default_true")]
    pub run_dns_server: bool,

    #[serde(rename = "RunInteractiveShell")]
    pub run_interactive_shell: Option<bool>,
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> io::Result<Config> {
        let file = File::open(path)?;
        serde_json::from_reader(file)
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_config_parses_with_defaults() {
        let raw = r#"{
            "ServerName": "Pioneer",
            "LocalAddress": "192.168.1.10",
            "ExternalAddress": "203.0.113.5"
        }"#;
        let config: Config = serde_json::from_str(raw).unwrap();
        assert_eq!(config.server_name, "Pioneer");
        assert!(config.run_dns_server);
        assert_eq!(config.threads, 0);
        assert!(config.information_menu_contents.is_empty());
        assert!(config.run_interactive_shell.is_none());
    }

    #[test]
    fn full_config_parses() {
        let raw = r#"{
            "ServerName": "Pioneer",
            "CommonItemDropRates-Enemy": [10, 10, 10, 5, 20, 20, 25],
            "CommonItemDropRates-Box": [10, 10, 10, 5, 20, 20, 25],
            "CommonUnitTypes": [[1, 2], [3], [], []],
            "InformationMenuContents": [["News", "Latest news", "Welcome!"]],
            "Threads": 4,
            "LocalAddress": "10.0.0.2",
            "ExternalAddress": "198.51.100.7",
            "RunDNSServer": false,
            "RunInteractiveShell": false
        }"#;
        let config: Config = serde_json::from_str(raw).unwrap();
        assert_eq!(config.threads, 4);
        assert!(!config.run_dns_server);
        assert_eq!(config.information_menu_contents.len(), 1);
        assert_eq!(config.common_unit_types[0], vec![1, 2]);
    }
}
