//! Allow-list parsing
//!
//! Turns the comma-separated CLI values into the CIDR and port allow-lists
//! loaded into the kernel tables at startup.

use std::collections::HashSet;
use std::net::Ipv4Addr;

use crate::error::{ExporterError, Result};

/// Split a comma-separated list into a set of entries.
///
/// The empty entry is a valid set member and is preserved; rejecting it is
/// the job of the typed parsers below, which then name the offending entry.
pub fn as_set(list: &str) -> HashSet<String> {
    list.split(',').map(str::to_owned).collect()
}

/// One destination CIDR allow-list entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cidr {
    pub addr: Ipv4Addr,
    pub prefix_len: u8,
}

/// Parse an `a.b.c.d/len` entry.
pub fn parse_cidr(entry: &str) -> Result<Cidr> {
    let (addr, prefix) = entry
        .split_once('/')
        .ok_or_else(|| ExporterError::Config(format!("CIDR '{entry}' has no prefix length")))?;
    let addr: Ipv4Addr = addr
        .parse()
        .map_err(|_| ExporterError::Config(format!("CIDR '{entry}' has an invalid address")))?;
    let prefix_len: u8 = prefix
        .parse()
        .map_err(|_| ExporterError::Config(format!("CIDR '{entry}' has an invalid prefix")))?;
    if prefix_len > 32 {
        return Err(ExporterError::Config(format!(
            "CIDR '{entry}' prefix length exceeds 32"
        )));
    }
    Ok(Cidr { addr, prefix_len })
}

pub fn parse_cidrs(entries: &HashSet<String>) -> Result<Vec<Cidr>> {
    entries.iter().map(|e| parse_cidr(e)).collect()
}

/// Parse a decimal TCP port entry; port 0 is not a valid destination.
pub fn parse_port(entry: &str) -> Result<u16> {
    let port: u16 = entry
        .parse()
        .map_err(|_| ExporterError::Config(format!("'{entry}' is not a valid port")))?;
    if port == 0 {
        return Err(ExporterError::Config("port 0 is not allowed".to_owned()));
    }
    Ok(port)
}

pub fn parse_ports(entries: &HashSet<String>) -> Result<Vec<u16>> {
    entries.iter().map(|e| parse_port(e)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn as_set_splits_on_commas() {
        let set = as_set("10.0.0.0/8,192.168.0.0/16");
        assert_eq!(set.len(), 2);
        assert!(set.contains("10.0.0.0/8"));
        assert!(set.contains("192.168.0.0/16"));
    }

    #[test]
    fn as_set_preserves_empty_entries() {
        let set = as_set("");
        assert_eq!(set.len(), 1);
        assert!(set.contains(""));

        let set = as_set("443,");
        assert_eq!(set.len(), 2);
        assert!(set.contains("443"));
        assert!(set.contains(""));
    }

    #[test]
    fn parse_cidr_accepts_valid_entries() {
        let cidr = parse_cidr("10.1.2.0/24").unwrap();
        assert_eq!(cidr.addr, Ipv4Addr::new(10, 1, 2, 0));
        assert_eq!(cidr.prefix_len, 24);

        assert_eq!(parse_cidr("0.0.0.0/0").unwrap().prefix_len, 0);
        assert_eq!(parse_cidr("10.0.0.1/32").unwrap().prefix_len, 32);
    }

    #[test]
    fn parse_cidr_rejects_malformed_entries() {
        assert!(parse_cidr("").is_err());
        assert!(parse_cidr("10.0.0.0").is_err());
        assert!(parse_cidr("10.0.0.0/33").is_err());
        assert!(parse_cidr("256.0.0.0/8").is_err());
        assert!(parse_cidr("10.0.0.0/abc").is_err());
    }

    #[test]
    fn parse_port_bounds() {
        assert_eq!(parse_port("443").unwrap(), 443);
        assert_eq!(parse_port("65535").unwrap(), 65535);
        assert!(parse_port("0").is_err());
        assert!(parse_port("65536").is_err());
        assert!(parse_port("").is_err());
        assert!(parse_port("https").is_err());
    }
}
