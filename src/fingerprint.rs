//! TLS fingerprint selection.
//!
//! DoH and DoT carriers can camouflage their TLS ClientHello as a common
//! browser. Which browser to imitate is chosen by sampling a weighted
//! distribution spec such as `"3*Firefox,1*Chrome,1*none"`. The actual
//! ClientHello construction happens inside the carrier; this module only
//! parses the spec and draws from it.

use std::fmt;

use rand::Rng;

use crate::error::{Error, Result};

/// A browser TLS fingerprint the carrier can imitate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fingerprint {
    /// Google Chrome ClientHello
    Chrome,
    /// Mozilla Firefox ClientHello
    Firefox,
    /// Apple iOS ClientHello
    Ios,
    /// Apple Safari ClientHello
    Safari,
    /// Microsoft Edge ClientHello
    Edge,
    /// A randomized ClientHello
    Randomized,
}

impl Fingerprint {
    /// Look up a fingerprint by name.
    ///
    /// A version suffix after an underscore (`"Firefox_65"`) is accepted
    /// and ignored; the carrier imitates the current version of the
    /// browser family.
    pub fn from_name(name: &str) -> Option<Self> {
        let family = name.split('_').next().unwrap_or(name);
        match family.to_ascii_lowercase().as_str() {
            "chrome" => Some(Self::Chrome),
            "firefox" => Some(Self::Firefox),
            "ios" => Some(Self::Ios),
            "safari" => Some(Self::Safari),
            "edge" => Some(Self::Edge),
            "randomized" => Some(Self::Randomized),
            _ => None,
        }
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Chrome => "Chrome",
            Self::Firefox => "Firefox",
            Self::Ios => "iOS",
            Self::Safari => "Safari",
            Self::Edge => "Edge",
            Self::Randomized => "Randomized",
        };
        write!(f, "{}", name)
    }
}

/// One weighted entry in a distribution spec.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct WeightedEntry {
    weight: u32,
    // None means "no fingerprinting" was drawn.
    fingerprint: Option<Fingerprint>,
}

/// Parse a distribution spec and sample one entry from it.
///
/// The spec is a comma-separated list of `weight*name` entries; the weight
/// and `*` may be omitted for weight 1. The name `none` stands for plain
/// TLS. Returns `Ok(None)` when the draw lands on `none`.
pub fn sample_distribution(spec: &str) -> Result<Option<Fingerprint>> {
    let entries = parse_distribution(spec)?;
    let total: u64 = entries.iter().map(|e| u64::from(e.weight)).sum();

    let mut draw = rand::thread_rng().gen_range(0..total);
    for entry in &entries {
        let w = u64::from(entry.weight);
        if draw < w {
            return Ok(entry.fingerprint);
        }
        draw -= w;
    }
    // draw < total, so the loop always returns; keep the compiler happy.
    Ok(entries.last().and_then(|e| e.fingerprint))
}

fn parse_distribution(spec: &str) -> Result<Vec<WeightedEntry>> {
    let mut entries = Vec::new();
    for part in spec.split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }

        let (weight, name) = match part.split_once('*') {
            Some((w, name)) => {
                let weight: u32 = w.trim().parse().map_err(|_| {
                    Error::InvalidFingerprint(format!("bad weight in {:?}", part))
                })?;
                (weight, name.trim())
            }
            None => (1, part),
        };
        if weight == 0 {
            return Err(Error::InvalidFingerprint(format!(
                "zero weight in {:?}",
                part
            )));
        }

        let fingerprint = if name.eq_ignore_ascii_case("none") {
            None
        } else {
            Some(Fingerprint::from_name(name).ok_or_else(|| {
                Error::InvalidFingerprint(format!("unknown fingerprint {:?}", name))
            })?)
        };
        entries.push(WeightedEntry {
            weight,
            fingerprint,
        });
    }

    if entries.is_empty() {
        return Err(Error::InvalidFingerprint("empty spec".into()));
    }
    Ok(entries)
}
