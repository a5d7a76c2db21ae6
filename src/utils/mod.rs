/// Utility functions and helpers

/// Split a `database.collection` namespace at its first dot.
///
/// A namespace with no dot is all database and has an empty collection.
pub fn split_namespace(namespace: &str) -> (&str, &str) {
    match namespace.find('.') {
        Some(dot) => (&namespace[..dot], &namespace[dot + 1..]),
        None => (namespace, ""),
    }
}

/// Parse a comma separated seed list, trimming whitespace and skipping
/// empty entries
pub fn parse_seeds(seeds: &str) -> Vec<String> {
    seeds
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Check that an address has the `host:port` shape with a numeric port
pub fn validate_address(address: &str) -> Result<(), String> {
    let (host, port) = address
        .rsplit_once(':')
        .ok_or_else(|| format!("address '{}' is missing a port", address))?;

    if host.is_empty() {
        return Err(format!("address '{}' is missing a host", address));
    }
    match port.parse::<u16>() {
        Ok(0) | Err(_) => Err(format!("address '{}' has an invalid port", address)),
        Ok(_) => Ok(()),
    }
}

/// Format duration for human-readable output
pub fn format_duration(duration: std::time::Duration) -> String {
    let secs = duration.as_secs();
    if secs == 0 {
        format!("{}ms", duration.as_millis())
    } else if secs < 60 {
        format!("{}s", secs)
    } else if secs < 3600 {
        format!("{}m{}s", secs / 60, secs % 60)
    } else {
        format!("{}h{}m{}s", secs / 3600, (secs % 3600) / 60, secs % 60)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_namespace() {
        assert_eq!(split_namespace("admin.$cmd"), ("admin", "$cmd"));
        assert_eq!(split_namespace("app.users.archive"), ("app", "users.archive"));
        assert_eq!(split_namespace("admin"), ("admin", ""));
    }

    #[test]
    fn test_parse_seeds() {
        assert_eq!(
            parse_seeds(" a:27017, b:27018 ,,"),
            vec!["a:27017".to_string(), "b:27018".to_string()]
        );
        assert!(parse_seeds("").is_empty());
    }

    #[test]
    fn test_validate_address() {
        assert!(validate_address("127.0.0.1:27017").is_ok());
        assert!(validate_address("db-1.internal:27018").is_ok());
        assert!(validate_address("localhost").is_err());
        assert!(validate_address(":27017").is_err());
        assert!(validate_address("host:port").is_err());
        assert!(validate_address("host:0").is_err());
    }

    #[test]
    fn test_format_duration() {
        use std::time::Duration;

        assert_eq!(format_duration(Duration::from_millis(250)), "250ms");
        assert_eq!(format_duration(Duration::from_secs(30)), "30s");
        assert_eq!(format_duration(Duration::from_secs(90)), "1m30s");
        assert_eq!(format_duration(Duration::from_secs(3661)), "1h1m1s");
    }
}
