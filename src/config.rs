//! Backend configuration.

use clap::Args;
use std::path::PathBuf;
use std::time::Duration;

/// Archive cache and transport settings for [`crate::zip::ZipVfs`].
#[derive(Args, Debug, Clone, PartialEq, Eq)]
pub struct ZipConfig {
    /// How long an opened archive stays cached
    #[arg(long = "zip-cache-expiration", value_name = "DURATION", default_value = "60s", value_parser = parse_duration)]
    pub expiration_interval: Duration,

    /// Interval of the sweep that drops expired archives
    #[arg(long = "zip-cache-cleanup", value_name = "DURATION", default_value = "30s", value_parser = parse_duration)]
    pub cleanup_interval: Duration,

    /// Archives used this close to expiry get their lifetime extended
    #[arg(long = "zip-cache-refresh", value_name = "DURATION", default_value = "30s", value_parser = parse_duration)]
    pub refresh_interval: Duration,

    /// Upper bound for reading an archive's central directory
    #[arg(long = "zip-open-timeout", value_name = "DURATION", default_value = "30s", value_parser = parse_duration)]
    pub open_timeout: Duration,

    /// Timeout of a single HTTP request, body included
    #[arg(long = "zip-http-client-timeout", value_name = "DURATION", default_value = "30m", value_parser = parse_duration)]
    pub http_client_timeout: Duration,

    /// Longest symlink target accepted inside an archive
    #[arg(long = "zip-max-symlink-size", value_name = "BYTES", default_value_t = 256)]
    pub max_symlink_size: usize,

    /// Directories `file://` archive URLs may point into
    #[arg(long = "zip-allowed-path", value_name = "DIR")]
    pub allowed_paths: Vec<PathBuf>,
}

impl Default for ZipConfig {
    fn default() -> Self {
        Self {
            expiration_interval: Duration::from_secs(60),
            cleanup_interval: Duration::from_secs(30),
            refresh_interval: Duration::from_secs(30),
            open_timeout: Duration::from_secs(30),
            http_client_timeout: Duration::from_secs(30 * 60),
            max_symlink_size: 256,
            allowed_paths: Vec::new(),
        }
    }
}

/// Settings for [`crate::vfs::blob::BlobVfs`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobConfig {
    /// Maximum number of cached object attributes.
    pub attribute_cache_capacity: u64,
}

impl Default for BlobConfig {
    fn default() -> Self {
        Self {
            attribute_cache_capacity: 100_000,
        }
    }
}

/// Parses `250ms`, `30s`, `5m`, `1h`; a bare number means seconds.
pub fn parse_duration(value: &str) -> Result<Duration, String> {
    let value = value.trim();
    let split = value
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(value.len());
    let (number, unit) = value.split_at(split);

    let number: u64 = number
        .parse()
        .map_err(|_| format!("invalid duration: {value:?}"))?;

    let scaled = |factor: u64| {
        number
            .checked_mul(factor)
            .map(Duration::from_secs)
            .ok_or_else(|| format!("invalid duration: {value:?}"))
    };

    match unit {
        "ms" => Ok(Duration::from_millis(number)),
        "" | "s" => Ok(Duration::from_secs(number)),
        "m" => scaled(60),
        "h" => scaled(3600),
        _ => Err(format!("invalid duration unit in {value:?}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[derive(Parser)]
    struct TestCli {
        #[command(flatten)]
        zip: ZipConfig,
    }

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("250ms").unwrap(), Duration::from_millis(250));
        assert_eq!(parse_duration("30").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_duration("5m").unwrap(), Duration::from_secs(300));
        assert!(parse_duration("5 parsecs").is_err());
        assert!(parse_duration("").is_err());
    }

    #[test]
    fn test_parse_duration_overflow() {
        assert!(parse_duration("9999999999999999h").is_err());
        assert!(parse_duration("999999999999999999m").is_err());
        assert_eq!(
            parse_duration("18446744073709551615s").unwrap(),
            Duration::from_secs(u64::MAX)
        );
    }

    #[test]
    fn test_cli_defaults_match_default() {
        let cli = TestCli::parse_from(["test"]);
        assert_eq!(cli.zip, ZipConfig::default());
    }

    #[test]
    fn test_cli_overrides() {
        let cli = TestCli::parse_from([
            "test",
            "--zip-cache-expiration",
            "2m",
            "--zip-allowed-path",
            "/srv/pages",
        ]);
        assert_eq!(cli.zip.expiration_interval, Duration::from_secs(120));
        assert_eq!(cli.zip.allowed_paths, vec![PathBuf::from("/srv/pages")]);
    }
}
