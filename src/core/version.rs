//! Build metadata stamped by the build script

/// Layout version of queued envelopes and shared queue segments
///
/// A segment written under another version is refused when opened.
pub const WIRE_FORMAT_VERSION: u32 = parse_decimal(env!("RELAYBUS_WIRE_FORMAT"));
/// Build time (UTC)
pub const BUILD_TIME: &str = env!("RELAYBUS_BUILD_TIME");
/// Short git hash, `unknown` outside a checkout
pub const GIT_HASH: &str = env!("RELAYBUS_GIT_HASH");

// The build script only exports validated decimal digits
const fn parse_decimal(digits: &str) -> u32 {
    let bytes = digits.as_bytes();
    let mut value = 0u32;
    let mut i = 0;
    while i < bytes.len() {
        value = value * 10 + (bytes[i] - b'0') as u32;
        i += 1;
    }
    value
}

/// Long `--version` text with build metadata
pub fn long_version() -> String {
    format!(
        "{} (wire format {}, built {}, git {})",
        env!("CARGO_PKG_VERSION"),
        WIRE_FORMAT_VERSION,
        BUILD_TIME,
        GIT_HASH
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_long_version_mentions_package_version() {
        let text = long_version();
        assert!(text.starts_with(env!("CARGO_PKG_VERSION")));
        assert!(text.contains(&format!("wire format {}", WIRE_FORMAT_VERSION)));
    }

    #[test]
    fn test_wire_format_matches_manifest() {
        assert_eq!(WIRE_FORMAT_VERSION, 20250727);
        assert_eq!(parse_decimal("7"), 7);
    }
}
