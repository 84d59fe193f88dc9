//! Lease URI encoding.
//!
//! A lease token's URI embeds the slot index, the price, and an
//! optional outbound IP: `evrlease:<index>:<amount>[:<ip>]`, hex-encoded
//! on the wire. Encoding is deterministic so equal leases produce
//! byte-identical URIs.

use super::{LedgerError, LedgerResult};

const PREFIX: &str = "evrlease";

/// Decoded lease URI contents.
#[derive(Debug, Clone, PartialEq)]
pub struct LeaseUri {
    /// Slot index on this host, `0..total_instances`.
    pub lease_index: u32,
    /// Price encoded into the offer.
    pub lease_amount: f64,
    /// Outbound IP assigned to the slot, if any.
    pub outbound_ip: Option<String>,
}

/// Deterministic amount rendering: integers print without a decimal
/// point, everything else with the shortest roundtrip form.
fn format_amount(amount: f64) -> String {
    if amount.fract() == 0.0 && amount.abs() < 1e15 {
        #[allow(clippy::cast_possible_truncation)]
        format!("{}", amount as i64)
    } else {
        format!("{amount}")
    }
}

/// Encode a lease URI to its hex wire form.
#[must_use]
pub fn encode(lease: &LeaseUri) -> String {
    let mut plain = format!(
        "{PREFIX}:{}:{}",
        lease.lease_index,
        format_amount(lease.lease_amount)
    );
    if let Some(ip) = &lease.outbound_ip {
        plain.push(':');
        plain.push_str(ip);
    }
    hex::encode_upper(plain.as_bytes())
}

/// Decode a hex wire URI.
///
/// # Errors
///
/// Rejects anything that is not a well-formed lease URI.
pub fn decode(raw: &str) -> LedgerResult<LeaseUri> {
    let bytes = hex::decode(raw)
        .map_err(|e| LedgerError::Protocol(format!("lease uri is not hex: {e}")))?;
    let plain = String::from_utf8(bytes)
        .map_err(|_| LedgerError::Protocol("lease uri is not utf-8".to_string()))?;

    // The ip field may itself contain colons (IPv6), so split off the
    // three fixed fields only.
    let mut parts = plain.splitn(4, ':');
    if parts.next() != Some(PREFIX) {
        return Err(LedgerError::Protocol(format!(
            "lease uri has wrong prefix: {plain}"
        )));
    }
    let lease_index = parts
        .next()
        .and_then(|p| p.parse::<u32>().ok())
        .ok_or_else(|| LedgerError::Protocol(format!("lease uri has no index: {plain}")))?;
    let lease_amount = parts
        .next()
        .and_then(|p| p.parse::<f64>().ok())
        .ok_or_else(|| LedgerError::Protocol(format!("lease uri has no amount: {plain}")))?;
    let outbound_ip = parts.next().map(str::to_string);

    Ok(LeaseUri {
        lease_index,
        lease_amount,
        outbound_ip,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_without_ip() {
        let lease = LeaseUri {
            lease_index: 0,
            lease_amount: 2.0,
            outbound_ip: None,
        };
        let encoded = encode(&lease);
        assert_eq!(encoded, hex::encode_upper(b"evrlease:0:2"));
        assert_eq!(decode(&encoded).unwrap(), lease);
    }

    #[test]
    fn roundtrip_with_ipv6_and_fractional_amount() {
        let lease = LeaseUri {
            lease_index: 7,
            lease_amount: 2.5,
            outbound_ip: Some("2001:db8::7".to_string()),
        };
        assert_eq!(decode(&encode(&lease)).unwrap(), lease);
    }

    #[test]
    fn encoding_is_deterministic() {
        let lease = LeaseUri {
            lease_index: 3,
            lease_amount: 2.0,
            outbound_ip: None,
        };
        assert_eq!(encode(&lease), encode(&lease.clone()));
    }

    #[test]
    fn rejects_foreign_uris() {
        assert!(decode("ZZ").is_err());
        assert!(decode(&hex::encode_upper(b"other:0:2")).is_err());
        assert!(decode(&hex::encode_upper(b"evrlease:x:2")).is_err());
        assert!(decode(&hex::encode_upper(b"evrlease:0")).is_err());
    }
}
