// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0

use std::{
  net::{IpAddr, Ipv4Addr},
  path::{Path, PathBuf},
};

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::util::framed::DEFAULT_MAX_FRAME_LENGTH;

pub const DEFAULT_DISCOVERY_PORT: u16 = 2888;
pub const RANDOM_TCP_PORTS: std::ops::Range<u16> = 6000..7000;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TlsFiles {
  pub cert: PathBuf,
  pub key: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
  /// Marks a configuration that nobody has customized; startup warns loudly about it
  pub default: bool,
  pub tls: Option<TlsFiles>,
  /// Authority for client certificates; without one, client identities are not verified
  pub ca: Option<PathBuf>,
  pub bind_ip: IpAddr,
  /// `0` picks a random port from [RANDOM_TCP_PORTS]
  pub tcp_port: u16,
  pub udp_port: u16,
  pub min_log_level: String,
  /// Largest accepted frame payload; `null` lifts the limit
  pub max_frame_length: Option<usize>,
}

impl Default for BrokerConfig {
  fn default() -> Self {
    Self {
      default: false,
      tls: None,
      ca: None,
      bind_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
      tcp_port: 0,
      udp_port: DEFAULT_DISCOVERY_PORT,
      min_log_level: String::from("info"),
      max_frame_length: Some(DEFAULT_MAX_FRAME_LENGTH),
    }
  }
}

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
  #[error("Failed reading configuration file {path:?}")]
  Io {
    path: PathBuf,
    #[source]
    error: std::io::Error,
  },
  #[error("Configuration file {path:?} is not valid")]
  Parse {
    path: PathBuf,
    #[source]
    error: serde_json::Error,
  },
}

impl BrokerConfig {
  /// Settings used when no configuration file is supplied
  pub fn builtin() -> Self {
    Self {
      default: true,
      ..Default::default()
    }
  }

  pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
    serde_json::from_str(json)
  }

  pub fn from_json_file(path: &Path) -> Result<Self, ConfigError> {
    let json = std::fs::read_to_string(path).map_err(|error| ConfigError::Io {
      path: path.to_path_buf(),
      error,
    })?;
    Self::from_json(&json).map_err(|error| ConfigError::Parse {
      path: path.to_path_buf(),
      error,
    })
  }

  pub fn resolve_tcp_port(&self) -> u16 {
    match self.tcp_port {
      0 => rand::thread_rng().gen_range(RANDOM_TCP_PORTS),
      port => port,
    }
  }
}
