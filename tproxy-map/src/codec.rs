//! Text to wire-format conversion for the rule arguments.
//!
//! Every parser accepts plain decimal digit sequences only and returns values
//! in network byte order, ready to be copied into the map structs.

use crate::error::UpdateError;

/// Parses a dotted-quad IPv4 address into network byte order.
///
/// The first octet must be in `1..=223` (no zero network, multicast or
/// reserved space); the remaining octets in `0..=255`.
pub fn parse_ip(text: &str) -> Result<u32, UpdateError> {
    let invalid = || UpdateError::InvalidAddress(text.to_string());

    let mut octets = [0u8; 4];
    let mut parts = text.split('.');
    for (idx, octet) in octets.iter_mut().enumerate() {
        let value = parts.next().and_then(parse_decimal).ok_or_else(invalid)?;
        let in_range = if idx == 0 {
            (1..=223).contains(&value)
        } else {
            value <= 255
        };
        if !in_range {
            return Err(invalid());
        }
        *octet = value as u8;
    }
    if parts.next().is_some() {
        return Err(invalid());
    }

    Ok(u32::from_ne_bytes(octets))
}

/// Parses a port in `1..=65535` into network byte order.
pub fn parse_port(text: &str) -> Result<u16, UpdateError> {
    match parse_decimal(text) {
        Some(value @ 1..=65535) => Ok((value as u16).to_be()),
        _ => Err(UpdateError::InvalidPort(text.to_string())),
    }
}

/// Parses an IP protocol number in `1..=255`.
///
/// Only TCP and UDP have a side in the rule record; other numbers pass here
/// and are rejected when the record is merged.
pub fn parse_protocol(text: &str) -> Result<u8, UpdateError> {
    match parse_decimal(text) {
        Some(value @ 1..=255) => Ok(value as u8),
        _ => Err(UpdateError::InvalidProtocol(text.to_string())),
    }
}

/// Parses an IPv4 prefix length in `1..=32`.
pub fn parse_prefix_length(text: &str) -> Result<u16, UpdateError> {
    match parse_decimal(text) {
        Some(value @ 1..=32) => Ok(value as u16),
        _ => Err(UpdateError::InvalidPrefixLength(text.to_string())),
    }
}

fn parse_decimal(text: &str) -> Option<u32> {
    if text.is_empty() || !text.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    text.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_dotted_quad_in_network_order() {
        let ip = parse_ip("10.0.0.1").unwrap();
        assert_eq!(ip.to_ne_bytes(), [10, 0, 0, 1]);
        assert_eq!(u32::from_be(ip), 0x0a00_0001);
    }

    #[test]
    fn first_octet_bounds() {
        assert!(parse_ip("223.255.255.255").is_ok());
        assert!(parse_ip("1.0.0.0").is_ok());
        assert!(matches!(
            parse_ip("224.0.0.1"),
            Err(UpdateError::InvalidAddress(s)) if s == "224.0.0.1"
        ));
        assert!(parse_ip("0.1.2.3").is_err());
    }

    #[test]
    fn rejects_malformed_addresses() {
        for text in [
            "",
            "10",
            "10.0.0",
            "10.0.0.1.5",
            "10.0.0.256",
            "10..0.1",
            "10.0.0.1 ",
            " 10.0.0.1",
            "+10.0.0.1",
            "10.0.0.-1",
            "10.0.0.x",
            "10.0.0.99999999999",
        ] {
            assert!(parse_ip(text).is_err(), "{text:?} should be rejected");
        }
    }

    #[test]
    fn port_bounds() {
        assert_eq!(parse_port("65535").unwrap(), 0xffff);
        assert_eq!(parse_port("1").unwrap(), 1u16.to_be());
        assert_eq!(u16::from_be(parse_port("5060").unwrap()), 5060);
        assert!(matches!(parse_port("0"), Err(UpdateError::InvalidPort(_))));
        assert!(matches!(parse_port("65536"), Err(UpdateError::InvalidPort(_))));
        assert!(parse_port("80a").is_err());
        assert!(parse_port("-80").is_err());
        assert!(parse_port("").is_err());
    }

    #[test]
    fn protocol_bounds() {
        assert_eq!(parse_protocol("6").unwrap(), 6);
        assert_eq!(parse_protocol("17").unwrap(), 17);
        assert_eq!(parse_protocol("255").unwrap(), 255);
        assert!(matches!(
            parse_protocol("0"),
            Err(UpdateError::InvalidProtocol(_))
        ));
        assert!(parse_protocol("256").is_err());
        assert!(parse_protocol("tcp").is_err());
    }

    #[test]
    fn prefix_length_bounds() {
        assert_eq!(parse_prefix_length("32").unwrap(), 32);
        assert_eq!(parse_prefix_length("1").unwrap(), 1);
        assert!(matches!(
            parse_prefix_length("33"),
            Err(UpdateError::InvalidPrefixLength(s)) if s == "33"
        ));
        assert!(parse_prefix_length("0").is_err());
    }
}
