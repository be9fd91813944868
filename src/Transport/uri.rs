//! Destination URIs of the form `shm://<region>[?slots=N]`

use std::fmt;
use std::str::FromStr;

use crate::error::TransportError;

const SCHEME: &str = "shm://";

/// Frame ring slots when the URI does not say otherwise.
pub const DEFAULT_SLOTS: usize = 4096;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DestinationUri {
    region: String,
    slots: usize,
}

impl DestinationUri {
    pub fn parse(uri: &str) -> Result<Self, TransportError> {
        let bad = |reason: &str| TransportError::InvalidUri {
            uri: uri.to_string(),
            reason: reason.to_string(),
        };

        let rest = uri
            .strip_prefix(SCHEME)
            .ok_or_else(|| bad("expected scheme shm://"))?;
        let (region, query) = match rest.split_once('?') {
            Some((region, query)) => (region, Some(query)),
            None => (rest, None),
        };
        if region.is_empty() {
            return Err(bad("region name is empty"));
        }
        if region.contains('/') || region.contains('\0') {
            return Err(bad("region name must not contain '/' or NUL"));
        }

        let mut slots = DEFAULT_SLOTS;
        for pair in query.into_iter().flat_map(|q| q.split('&')).filter(|p| !p.is_empty()) {
            match pair.split_once('=') {
                Some(("slots", value)) => {
                    slots = value
                        .parse()
                        .map_err(|_| bad("slots must be an integer"))?;
                    if slots == 0 || !slots.is_power_of_two() {
                        return Err(bad("slots must be a non-zero power of two"));
                    }
                }
                Some((key, _)) => return Err(bad(&format!("unknown parameter '{key}'"))),
                None => return Err(bad(&format!("parameter '{pair}' has no value"))),
            }
        }

        Ok(Self {
            region: region.to_string(),
            slots,
        })
    }

    /// Name of the shared memory region carrying the frames.
    pub fn region(&self) -> &str {
        &self.region
    }

    pub fn slots(&self) -> usize {
        self.slots
    }
}

impl FromStr for DestinationUri {
    type Err = TransportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for DestinationUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{SCHEME}{}?slots={}", self.region, self.slots)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_region_and_default_slots() {
        let uri = DestinationUri::parse("shm://relay_frames").unwrap();
        assert_eq!(uri.region(), "relay_frames");
        assert_eq!(uri.slots(), DEFAULT_SLOTS);
    }

    #[test]
    fn parses_slots() {
        let uri: DestinationUri = "shm://r1?slots=256".parse().unwrap();
        assert_eq!(uri.slots(), 256);
        assert_eq!(uri.to_string(), "shm://r1?slots=256");
    }

    #[test]
    fn rejects_malformed() {
        for bad in [
            "",
            "udp://host:1234",
            "shm://",
            "shm://?slots=8",
            "shm://a/b",
            "shm://r?slots=3",
            "shm://r?slots=0",
            "shm://r?slots=abc",
            "shm://r?depth=8",
            "shm://r?slots",
        ] {
            assert!(
                matches!(DestinationUri::parse(bad), Err(TransportError::InvalidUri { .. })),
                "{bad} should be rejected"
            );
        }
    }
}
