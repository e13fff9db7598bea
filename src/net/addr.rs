//! Recognition of literal IPv4 and IPv6 address text.
//!
//! The scans are allocation-free and strict: an IPv4 literal is exactly four
//! dot-separated decimal groups in `0..=255`, an IPv6 literal is up to eight
//! colon-separated groups of one to four hex digits with at most one `::`
//! compression. Embedded IPv4 suffixes and zone identifiers are not literals
//! for the purposes of this layer; such targets are handed to the resolver.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

/// Address family of a socket or a lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Family {
    /// `AF_INET`.
    V4,
    /// `AF_INET6`.
    V6,
}

impl From<IpAddr> for Family {
    fn from(ip: IpAddr) -> Family {
        match ip {
            IpAddr::V4(_) => Family::V4,
            IpAddr::V6(_) => Family::V6,
        }
    }
}

/// Returns `true` if `s` is a dotted-quad IPv4 literal.
pub fn is_ipv4(s: &str) -> bool {
    parse_ipv4(s).is_some()
}

/// Returns `true` if `s` is a colon-delimited IPv6 literal.
pub fn is_ipv6(s: &str) -> bool {
    let b = s.as_bytes();
    let len = b.len();

    if len == 0 {
        return false;
    }

    let mut groups = 0usize;
    let mut compressed = false;
    let mut i = 0;

    // A leading colon is only valid as the start of a `::`.
    if b[0] == b':' {
        if len < 2 || b[1] != b':' {
            return false;
        }
        compressed = true;
        i = 2;
        if i == len {
            return true;
        }
    }

    loop {
        let start = i;
        while i < len && b[i].is_ascii_hexdigit() {
            i += 1;
            if i - start > 4 {
                return false;
            }
        }
        if i == start {
            return false;
        }

        groups += 1;
        if groups > 8 {
            return false;
        }

        if i == len {
            break;
        }
        if b[i] != b':' {
            return false;
        }
        i += 1;

        if i < len && b[i] == b':' {
            if compressed {
                return false;
            }
            compressed = true;
            i += 1;
            if i == len {
                break;
            }
        } else if i == len {
            return false;
        }
    }

    // `::` must stand for at least one elided group.
    if compressed { groups <= 7 } else { groups == 8 }
}

fn parse_ipv4(s: &str) -> Option<[u8; 4]> {
    let mut octets = [0u8; 4];
    let mut groups = 0usize;

    for group in s.split('.') {
        if groups == 4 || group.is_empty() || group.len() > 3 {
            return None;
        }
        let mut value = 0u16;
        for &c in group.as_bytes() {
            if !c.is_ascii_digit() {
                return None;
            }
            value = value * 10 + u16::from(c - b'0');
        }
        octets[groups] = u8::try_from(value).ok()?;
        groups += 1;
    }

    (groups == 4).then_some(octets)
}

/// A literal IP address as accepted by [is_ipv4] or [is_ipv6].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Address {
    /// IPv4 literal.
    V4(Ipv4Addr),
    /// IPv6 literal.
    V6(Ipv6Addr),
}

impl Address {
    /// Parses a literal, returning `None` for host names and malformed text.
    pub fn parse(s: &str) -> Option<Address> {
        if let Some(octets) = parse_ipv4(s) {
            return Some(Address::V4(Ipv4Addr::from(octets)));
        }
        if is_ipv6(s) {
            return s.parse().ok().map(Address::V6);
        }
        None
    }

    /// Address family of the literal.
    pub fn family(&self) -> Family {
        match self {
            Address::V4(_) => Family::V4,
            Address::V6(_) => Family::V6,
        }
    }

    /// Converts to a standard library address.
    pub fn to_ip(self) -> IpAddr {
        match self {
            Address::V4(ip) => IpAddr::V4(ip),
            Address::V6(ip) => IpAddr::V6(ip),
        }
    }
}

impl From<IpAddr> for Address {
    fn from(ip: IpAddr) -> Address {
        match ip {
            IpAddr::V4(ip) => Address::V4(ip),
            IpAddr::V6(ip) => Address::V6(ip),
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Address::V4(ip) => fmt::Display::fmt(ip, f),
            Address::V6(ip) => fmt::Display::fmt(ip, f),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn classifiers_mutually_exclusive(s in "\\PC*") {
            prop_assert!(!(is_ipv4(&s) && is_ipv6(&s)));
        }

        #[test]
        fn classifiers_mutually_exclusive_address_like(s in "[0-9a-fA-F:.]{0,40}") {
            prop_assert!(!(is_ipv4(&s) && is_ipv6(&s)));
        }

        #[test]
        fn ipv4_literals_agree_with_std(a: u8, b: u8, c: u8, d: u8) {
            let s = format!("{a}.{b}.{c}.{d}");
            prop_assert!(is_ipv4(&s));
            prop_assert!(!is_ipv6(&s));
            prop_assert_eq!(Address::parse(&s), Some(Address::V4(Ipv4Addr::new(a, b, c, d))));
        }

        #[test]
        fn ipv6_std_display_accepted(segments: [u16; 8]) {
            let ip = Ipv6Addr::from(segments);
            // Skip forms std prints with an embedded IPv4 suffix.
            let s = ip.to_string();
            prop_assume!(!s.contains('.'));
            prop_assert!(is_ipv6(&s), "{}", s);
            prop_assert_eq!(Address::parse(&s), Some(Address::V6(ip)));
        }
    }

    #[test]
    fn non_addresses_rejected() {
        for s in ["", "hello", "localhost", "example.com", ".", ":", "1.2.3", "a.b.c.d"] {
            assert!(!is_ipv4(s), "{s}");
            assert!(!is_ipv6(s), "{s}");
        }
    }

    #[test]
    fn ipv4_valid() {
        for s in ["0.0.0.0", "127.0.0.1", "255.255.255.255", "10.0.0.01"] {
            assert!(is_ipv4(s), "{s}");
        }
    }

    #[test]
    fn ipv4_invalid() {
        for s in [
            "256.0.0.1",
            "1.2.3.4.5",
            "1..2.3",
            "1.2.3.",
            ".1.2.3",
            "1.2.3.4 ",
            "1.2.3.0004",
            "+1.2.3.4",
            "1.2.3.a",
        ] {
            assert!(!is_ipv4(s), "{s}");
        }
    }

    #[test]
    fn ipv6_valid() {
        for s in [
            "::",
            "::1",
            "1::",
            "fe80::1",
            "2001:db8::8a2e:370:7334",
            "2001:0db8:0000:0000:0000:ff00:0042:8329",
            "1:2:3:4:5:6:7::",
            "::2:3:4:5:6:7:8",
            "ABCD:ef01::",
        ] {
            assert!(is_ipv6(s), "{s}");
        }
    }

    #[test]
    fn ipv6_invalid() {
        for s in [
            ":::",
            "1:::2",
            "1::2::3",
            ":1::",
            "1:",
            "1:2:3:4:5:6:7",
            "1:2:3:4:5:6:7:8:9",
            "1:2:3:4::5:6:7:8",
            "12345::",
            "g::1",
            "::ffff:1.2.3.4",
            "fe80::1%eth0",
        ] {
            assert!(!is_ipv6(s), "{s}");
        }
    }

    #[test]
    fn leading_zero_octets_parse() {
        assert_eq!(
            Address::parse("010.000.000.001"),
            Some(Address::V4(Ipv4Addr::new(10, 0, 0, 1)))
        );
    }

    #[test]
    fn canonical_text() {
        let addr = Address::parse("2001:0db8:0000:0000:0000:0000:0000:0001").unwrap();
        assert_eq!(addr.family(), Family::V6);
        assert_eq!(addr.to_string(), "2001:db8::1");
        assert_eq!(Address::parse("host.example"), None);
    }
}
