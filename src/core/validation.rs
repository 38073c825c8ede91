//! Validation utilities for broker configuration
//!
//! Small, pure checks used while validating configuration eagerly, before any
//! backend connection is attempted.

use once_cell::sync::Lazy;
use regex::Regex;

static HOSTNAME: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[A-Za-z0-9]([A-Za-z0-9\-]{0,61}[A-Za-z0-9])?(\.[A-Za-z0-9]([A-Za-z0-9\-]{0,61}[A-Za-z0-9])?)*$")
        .expect("hostname pattern compiles")
});

/// Validate positive integer value
pub fn validate_positive_int(value: &str) -> Result<usize, String> {
    match value.parse::<usize>() {
        Ok(0) => Err("Value must be greater than 0".to_string()),
        Ok(n) => Ok(n),
        Err(_) => Err(format!("'{}' is not a valid positive integer", value)),
    }
}

/// Validate that a numeric setting is strictly positive
pub fn validate_positive(field: &str, value: u64) -> Result<u64, String> {
    if value == 0 {
        Err(format!("'{}' must be greater than 0", field))
    } else {
        Ok(value)
    }
}

/// Validate a host name or IP address literal
pub fn validate_host(host: &str) -> Result<String, String> {
    let trimmed = host.trim();
    if trimmed.is_empty() {
        return Err("Host cannot be empty".to_string());
    }
    if trimmed.parse::<std::net::IpAddr>().is_ok() {
        return Ok(trimmed.to_string());
    }
    // Bracketed IPv6 literal as written in URLs
    if let Some(inner) = trimmed.strip_prefix('[').and_then(|s| s.strip_suffix(']')) {
        if inner.parse::<std::net::Ipv6Addr>().is_ok() {
            return Ok(trimmed.to_string());
        }
    }
    if trimmed.len() > 253 || !HOSTNAME.is_match(trimmed) {
        return Err(format!("'{}' is not a valid host name", host));
    }
    Ok(trimmed.to_string())
}

/// Validate a TCP port number
pub fn validate_port(port: u32) -> Result<u16, String> {
    if port == 0 || port > u16::MAX as u32 {
        return Err(format!("Port {} is outside the range 1-65535", port));
    }
    Ok(port as u16)
}

/// Validate a single `host:port` broker address
pub fn validate_broker_address(address: &str) -> Result<(String, u16), String> {
    let (host, port) = address
        .trim()
        .rsplit_once(':')
        .ok_or_else(|| format!("Broker address '{}' must be in host:port form", address))?;
    let host = validate_host(host)?;
    let port = port
        .parse::<u32>()
        .map_err(|_| format!("Broker address '{}' has a non-numeric port", address))?;
    let port = validate_port(port)?;
    Ok((host, port))
}

/// Validate a broker list (at least one `host:port` entry)
pub fn validate_broker_list(brokers: &[String]) -> Result<Vec<(String, u16)>, String> {
    if brokers.is_empty() {
        return Err("Broker list cannot be empty".to_string());
    }
    brokers
        .iter()
        .map(|address| validate_broker_address(address))
        .collect()
}

/// Validate a name used to build physical destinations (topics, groups, queues)
pub fn validate_identifier(field: &str, value: &str) -> Result<String, String> {
    if value.trim().is_empty() {
        return Err(format!("'{}' cannot be empty", field));
    }
    if value.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return Err(format!(
            "'{}' contains whitespace or control characters: '{}'",
            field, value
        ));
    }
    Ok(value.to_string())
}

/// Validate a ratio expressed as a fraction in (0, 1]
pub fn validate_ratio(field: &str, value: f64) -> Result<f64, String> {
    if !(value > 0.0 && value <= 1.0) {
        return Err(format!("'{}' must be within (0, 1], got {}", field, value));
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_positive_int() {
        assert_eq!(validate_positive_int("5").unwrap(), 5);
        assert_eq!(validate_positive_int("100").unwrap(), 100);
        assert!(validate_positive_int("0").is_err());
        assert!(validate_positive_int("-5").is_err());
        assert!(validate_positive_int("not_a_number").is_err());
    }

    #[test]
    fn test_validate_host() {
        assert_eq!(validate_host("localhost").unwrap(), "localhost");
        assert_eq!(validate_host("redis.internal.example").unwrap(), "redis.internal.example");
        assert!(validate_host("10.0.0.7").is_ok());
        assert!(validate_host("::1").is_ok());
        assert!(validate_host("[::1]").is_ok());
        assert!(validate_host("").is_err());
        assert!(validate_host("bad host").is_err());
        assert!(validate_host("-leading-dash").is_err());
    }

    #[test]
    fn test_validate_port() {
        assert_eq!(validate_port(6379).unwrap(), 6379);
        assert!(validate_port(0).is_err());
        assert!(validate_port(70000).is_err());
    }

    #[test]
    fn test_validate_broker_list() {
        let brokers = vec!["kafka-1:9092".to_string(), "10.0.0.2:9093".to_string()];
        let parsed = validate_broker_list(&brokers).unwrap();
        assert_eq!(parsed[0], ("kafka-1".to_string(), 9092));
        assert_eq!(parsed[1], ("10.0.0.2".to_string(), 9093));

        assert!(validate_broker_list(&[]).is_err());
        assert!(validate_broker_list(&["kafka-1".to_string()]).is_err());
        assert!(validate_broker_list(&["kafka-1:http".to_string()]).is_err());
        assert!(validate_broker_list(&["kafka-1:0".to_string()]).is_err());
    }

    #[test]
    fn test_validate_identifier_and_ratio() {
        assert!(validate_identifier("group", "workers").is_ok());
        assert!(validate_identifier("group", "").is_err());
        assert!(validate_identifier("group", "two words").is_err());
        assert!(validate_ratio("warn_ratio", 0.8).is_ok());
        assert!(validate_ratio("warn_ratio", 0.0).is_err());
        assert!(validate_ratio("warn_ratio", 1.5).is_err());
        assert!(validate_positive("batch_size", 0).is_err());
    }
}
