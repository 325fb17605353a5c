//! Configuration file handling

use std::{fs::File, path::Path};

use anyhow::Context;
use natbox_core::NatTableParam;
use serde::{de::DeserializeOwned, Deserialize};

/// Ticks (milliseconds of capture time) an incomplete datagram waits for its
/// missing fragments
const DEFAULT_FRAGMENT_TIMEOUT: u64 = 30_000;

/// Loads a configuration structure from a YAML document
pub trait YamlConfig: Sized + DeserializeOwned {
    /// Reads and parses a YAML file
    ///
    /// ### Arguments
    /// * `path` - Path to the YAML file on disk
    fn read_yaml_from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let file = File::open(path)
            .with_context(|| format!("unable to open config file {}", path.display()))?;
        let cfg = serde_yaml::from_reader(file)
            .with_context(|| format!("unable to parse config file {}", path.display()))?;
        Ok(cfg)
    }

    /// Parses a YAML document held in memory
    fn read_yaml_from_str(yaml: &str) -> anyhow::Result<Self> {
        Ok(serde_yaml::from_str(yaml)?)
    }
}

/// Natbox configuration
#[derive(Debug, Deserialize)]
pub struct NatboxConfig {
    /// NAT table parameters (external address, port ranges, echo identifier)
    pub nat: NatTableParam,

    /// Reassembly timeout, in milliseconds of capture time
    #[serde(default = "default_fragment_timeout")]
    pub fragment_timeout: u64,
}

fn default_fragment_timeout() -> u64 {
    DEFAULT_FRAGMENT_TIMEOUT
}

impl YamlConfig for NatboxConfig {}
