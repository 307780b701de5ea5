//! IPv4 CIDR parsing and overlap checks, shared by the "validate" phase
//! executor and the reconfigure operation initializer's precondition check
//! (§4.E: "reject impossible configurations, e.g. CIDR conflicts").

use std::net::Ipv4Addr;

#[derive(Debug, Clone, Copy)]
pub struct CidrNet {
    network: u32,
    prefix_len: u32,
}

impl CidrNet {
    pub fn overlaps(&self, other: &CidrNet) -> bool {
        let narrower_prefix = self.prefix_len.max(other.prefix_len);
        let mask = if narrower_prefix == 0 {
            0
        } else {
            u32::MAX << (32 - narrower_prefix)
        };
        (self.network & mask) == (other.network & mask)
    }
}

pub fn parse_cidr(s: &str) -> Result<CidrNet, String> {
    let (addr_part, prefix_part) = s
        .split_once('/')
        .ok_or_else(|| format!("'{s}' is not a CIDR (missing /prefix)"))?;

    let addr: Ipv4Addr = addr_part
        .parse()
        .map_err(|_| format!("'{addr_part}' is not a valid IPv4 address"))?;
    let prefix_len: u32 = prefix_part
        .parse()
        .map_err(|_| format!("'{prefix_part}' is not a valid prefix length"))?;
    if prefix_len > 32 {
        return Err(format!("prefix length {prefix_len} out of range"));
    }

    let addr_bits = u32::from_be_bytes(addr.octets());
    let mask = if prefix_len == 0 { 0 } else { u32::MAX << (32 - prefix_len) };

    Ok(CidrNet {
        network: addr_bits & mask,
        prefix_len,
    })
}

/// Check a requested CIDR against a set of CIDRs already in use, returning
/// the first conflicting one found.
pub fn find_conflict<'a>(requested: &str, existing: &[&'a str]) -> Result<Option<&'a str>, String> {
    let requested_net = parse_cidr(requested)?;
    for other in existing {
        let other_net = parse_cidr(other)?;
        if requested_net.overlaps(&other_net) {
            return Ok(Some(other));
        }
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disjoint_cidrs_do_not_overlap() {
        let a = parse_cidr("10.0.0.0/24").unwrap();
        let b = parse_cidr("10.0.1.0/24").unwrap();
        assert!(!a.overlaps(&b));
    }

    #[test]
    fn nested_cidrs_overlap() {
        let wide = parse_cidr("10.0.0.0/16").unwrap();
        let narrow = parse_cidr("10.0.5.0/24").unwrap();
        assert!(wide.overlaps(&narrow));
        assert!(narrow.overlaps(&wide));
    }

    #[test]
    fn find_conflict_returns_first_overlapping_cidr() {
        let existing = vec!["10.0.0.0/24", "10.0.1.0/24"];
        let conflict = find_conflict("10.0.1.128/25", &existing).unwrap();
        assert_eq!(conflict, Some("10.0.1.0/24"));
    }

    #[test]
    fn find_conflict_returns_none_when_disjoint() {
        let existing = vec!["10.0.0.0/24"];
        let conflict = find_conflict("10.1.0.0/24", &existing).unwrap();
        assert_eq!(conflict, None);
    }

    #[test]
    fn parse_cidr_rejects_bad_prefix() {
        assert!(parse_cidr("10.0.0.0/33").is_err());
        assert!(parse_cidr("10.0.0.0").is_err());
        assert!(parse_cidr("not-an-ip/24").is_err());
    }
}
