use std::cmp::Ordering;
use std::fmt;

use crate::error::TrackerError;

/// Release maturity track. The derived order (alpha < beta < stable) is the
/// tie-breaker between releases with an equal numeric triple.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Channel {
    Alpha,
    Beta,
    Stable,
}

impl Channel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::Alpha => "alpha",
            Channel::Beta => "beta",
            Channel::Stable => "stable",
        }
    }

    /// Whether archive URLs for this channel carry a channel path prefix.
    /// Only pre-release builds live under channel-prefixed paths.
    pub fn has_url_prefix(&self) -> bool {
        matches!(self, Channel::Alpha | Channel::Beta)
    }

    /// Derives the channel from a version string suffix. Absent or
    /// unrecognized suffixes map to stable.
    pub fn of_version(version: &str) -> Channel {
        match version.split_once('-') {
            Some((_, suffix)) => match suffix.to_ascii_lowercase().as_str() {
                "alpha" => Channel::Alpha,
                "beta" => Channel::Beta,
                _ => Channel::Stable,
            },
            None => Channel::Stable,
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Orderable key parsed from a dotted version string with an optional
/// `-alpha`/`-beta` suffix, e.g. "1.4.0-beta".
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Version {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
    pub channel: Channel,
}

impl Version {
    pub fn parse(version: &str) -> Result<Version, TrackerError> {
        let (base, _) = match version.split_once('-') {
            Some((base, suffix)) => (base, Some(suffix)),
            None => (version, None),
        };

        let mut numbers = Vec::with_capacity(3);
        for token in base.split('.') {
            let n = token
                .parse::<u32>()
                .map_err(|_| TrackerError::InvalidVersionFormat(version.to_string()))?;
            numbers.push(n);
        }
        if numbers.len() != 3 {
            return Err(TrackerError::InvalidVersionFormat(version.to_string()));
        }

        Ok(Version {
            major: numbers[0],
            minor: numbers[1],
            patch: numbers[2],
            channel: Channel::of_version(version),
        })
    }

    /// The numeric triple without the channel, for "same release, different
    /// maturity" comparisons.
    pub fn triple(&self) -> (u32, u32, u32) {
        (self.major, self.minor, self.patch)
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)?;
        if self.channel.has_url_prefix() {
            write!(f, "-{}", self.channel)?;
        }
        Ok(())
    }
}

/// Compares two version strings by parsed order. Unparseable strings sort
/// before everything parseable (they are ancient or junk either way) and
/// fall back to lexicographic order among themselves.
pub fn compare_version_strings(a: &str, b: &str) -> Ordering {
    match (Version::parse(a), Version::parse(b)) {
        (Ok(va), Ok(vb)) => va.cmp(&vb),
        (Ok(_), Err(_)) => Ordering::Greater,
        (Err(_), Ok(_)) => Ordering::Less,
        (Err(_), Err(_)) => a.cmp(b),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_orders_numeric_triples() {
        let a = Version::parse("1.2.0").unwrap();
        let b = Version::parse("1.2.1").unwrap();
        let c = Version::parse("1.3.0").unwrap();
        assert!(a < b);
        assert!(b < c);
    }

    #[test]
    fn parse_orders_channels_below_stable() {
        let alpha = Version::parse("1.4.0-alpha").unwrap();
        let beta = Version::parse("1.4.0-beta").unwrap();
        let stable = Version::parse("1.4.0").unwrap();
        assert!(alpha < beta);
        assert!(beta < stable);
        assert_eq!(alpha.triple(), stable.triple());
    }

    #[test]
    fn parse_is_case_insensitive_on_suffix() {
        assert_eq!(Version::parse("1.4.0-BETA").unwrap().channel, Channel::Beta);
        assert_eq!(
            Version::parse("1.4.0-Alpha").unwrap().channel,
            Channel::Alpha
        );
    }

    #[test]
    fn unknown_suffix_maps_to_stable() {
        let v = Version::parse("2.0.0-rc1");
        // "rc1" is not a channel but the numeric portion still has to parse.
        assert!(v.is_ok());
        assert_eq!(v.unwrap().channel, Channel::Stable);
    }

    #[test]
    fn parse_rejects_short_and_non_numeric() {
        assert!(matches!(
            Version::parse("1.2"),
            Err(TrackerError::InvalidVersionFormat(_))
        ));
        assert!(matches!(
            Version::parse("abc.def.ghi"),
            Err(TrackerError::InvalidVersionFormat(_))
        ));
        assert!(Version::parse("1.2.3.4").is_err());
        assert!(Version::parse("").is_err());
    }

    #[test]
    fn display_round_trips_channel_suffix() {
        assert_eq!(Version::parse("1.4.0-beta").unwrap().to_string(), "1.4.0-beta");
        assert_eq!(Version::parse("1.4.0").unwrap().to_string(), "1.4.0");
    }

    #[test]
    fn string_comparison_pushes_junk_first() {
        assert_eq!(compare_version_strings("1.2.0", "1.2.1"), Ordering::Less);
        assert_eq!(compare_version_strings("1.2.0", "garbage"), Ordering::Greater);
        assert_eq!(compare_version_strings("a", "b"), Ordering::Less);
    }
}
