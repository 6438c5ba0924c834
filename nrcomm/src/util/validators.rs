// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use anyhow::{Error as AnyErr, Result};
use std::net::{IpAddr, SocketAddr};
use std::path::Path;

pub fn validate_existing_file(v: &str) -> Result<(), String> {
  if !Path::new(&v).is_file() {
    Err(String::from("A file must exist at the given path"))
  } else {
    Ok(())
  }
}

pub fn parse_socketaddr(v: &str) -> Result<SocketAddr> {
  use std::net::ToSocketAddrs;
  ToSocketAddrs::to_socket_addrs(v)
    .map_err(AnyErr::from)
    .and_then(|mut items| {
      items
        .next()
        .ok_or_else(|| AnyErr::msg("No addresses were resolved from the given host"))
    })
}

pub fn parse_ipaddr(v: &str) -> Result<IpAddr> {
  v.parse::<IpAddr>()
    .map_err(|_| AnyErr::msg("Could not parse input as ipv4 or ipv6 address"))
}

/// Port numbers, where `0` requests a randomly chosen port
pub fn parse_port(v: &str) -> Result<u16> {
  v.parse::<u16>()
    .map_err(|_| AnyErr::msg("Port must be an integer between 0 and 65535"))
}

pub fn parse_log_level(v: &str) -> Result<tracing::Level> {
  v.parse::<tracing::Level>()
    .map_err(|_| AnyErr::msg("Log level must be one of trace, debug, info, warn, or error"))
}

pub fn validate_socketaddr(v: &str) -> Result<(), String> {
  parse_socketaddr(v).map(|_| ()).map_err(|e| e.to_string())
}

pub fn validate_ipaddr(v: &str) -> Result<(), String> {
  parse_ipaddr(v).map(|_| ()).map_err(|e| e.to_string())
}

pub fn validate_port(v: &str) -> Result<(), String> {
  parse_port(v).map(|_| ()).map_err(|e| e.to_string())
}

pub fn validate_log_level(v: &str) -> Result<(), String> {
  parse_log_level(v).map(|_| ()).map_err(|e| e.to_string())
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn addresses_and_ports() {
    assert_eq!(
      parse_socketaddr("127.0.0.1:2888").unwrap(),
      "127.0.0.1:2888".parse::<SocketAddr>().unwrap()
    );
    assert!(parse_ipaddr("::1").unwrap().is_loopback());
    assert!(parse_ipaddr("not-an-ip").is_err());
    assert_eq!(parse_port("0").unwrap(), 0);
    assert!(validate_port("70000").is_err());
  }

  #[test]
  fn log_levels() {
    assert_eq!(parse_log_level("debug").unwrap(), tracing::Level::DEBUG);
    assert_eq!(parse_log_level("WARN").unwrap(), tracing::Level::WARN);
    assert!(validate_log_level("loud").is_err());
  }
}
