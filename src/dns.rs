//! DNS name handling for the tunnel zone.
//!
//! The carrier encodes upstream payload into DNS query names beneath the
//! tunnel zone, so the zone's own length directly limits how much payload
//! fits per query. [`DomainName::capacity`] computes that limit from the
//! RFC 1035 wire format rules.

use std::fmt;

use crate::error::{Error, Result};

/// Maximum total length of an encoded DNS name, including the root label.
const MAX_NAME_LEN: usize = 255;

/// Maximum length of a single DNS label.
const MAX_LABEL_LEN: usize = 63;

/// A validated, lowercased DNS name (the tunnel zone).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DomainName {
    labels: Vec<String>,
}

impl DomainName {
    /// Parse a dotted DNS name.
    ///
    /// A single trailing dot is accepted and dropped. Labels must be 1–63
    /// bytes of printable ASCII with no embedded whitespace; the whole name
    /// must fit the 255-octet wire limit. Letters are lowercased.
    pub fn parse(s: &str) -> Result<Self> {
        let s = s.strip_suffix('.').unwrap_or(s);
        if s.is_empty() {
            return Err(Error::InvalidDomain("empty name".into()));
        }

        let mut labels = Vec::new();
        for label in s.split('.') {
            if label.is_empty() {
                return Err(Error::InvalidDomain("empty label".into()));
            }
            if label.len() > MAX_LABEL_LEN {
                return Err(Error::InvalidDomain(format!(
                    "label {:?} longer than {} bytes",
                    label, MAX_LABEL_LEN
                )));
            }
            if !label
                .bytes()
                .all(|b| b.is_ascii_graphic() && b != b'.')
            {
                return Err(Error::InvalidDomain(format!(
                    "label {:?} contains invalid characters",
                    label
                )));
            }
            labels.push(label.to_ascii_lowercase());
        }

        let name = Self { labels };
        if name.wire_len() > MAX_NAME_LEN {
            return Err(Error::InvalidDomain(format!(
                "name exceeds {} octets on the wire",
                MAX_NAME_LEN
            )));
        }
        Ok(name)
    }

    /// Encoded length on the wire: one length octet per label plus the
    /// label bytes, plus the terminating null label.
    pub fn wire_len(&self) -> usize {
        self.labels.iter().map(|l| l.len() + 1).sum::<usize>() + 1
    }

    /// Number of labels in the name.
    pub fn label_count(&self) -> usize {
        self.labels.len()
    }

    /// Payload bytes available in a query name under this zone.
    ///
    /// Starts from the 255-octet name limit, subtracts this zone's wire
    /// encoding, then accounts for the per-label length octet (63 data
    /// bytes cost 64 on the wire) and the base32 expansion of the payload
    /// (5 bytes become 8 characters).
    pub fn capacity(&self) -> usize {
        let mut capacity = MAX_NAME_LEN;
        // Terminating null label.
        capacity -= 1;
        for label in &self.labels {
            capacity -= label.len() + 1;
        }
        capacity = capacity * 63 / 64;
        capacity * 5 / 8
    }
}

impl fmt::Display for DomainName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.labels.join("."))
    }
}

impl std::str::FromStr for DomainName {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}
