//! BMC address handling

use crate::error::RedfishError;
use reqwest::Url;

/// Parses a BMC address, defaulting to `https://` when no scheme is given.
pub fn parse_address(address: &str) -> Result<Url, RedfishError> {
    let trimmed = address.trim();
    if trimmed.is_empty() {
        return Err(RedfishError::InvalidRequest("empty BMC address".to_string()));
    }
    let with_scheme = if trimmed.contains("://") {
        trimmed.to_string()
    } else {
        format!("https://{trimmed}")
    };
    Url::parse(&with_scheme)
        .map_err(|e| RedfishError::InvalidRequest(format!("invalid BMC address {trimmed}: {e}")))
}

/// Normalized `host:port` of the management controller behind `address`.
///
/// Several systems in one chassis can sit behind the same BMC with different
/// system paths; they share this key. Unparseable addresses fall back to the
/// lowercased, trimmed input so they still get a stable key.
pub fn bmc_endpoint(address: &str) -> String {
    match parse_address(address) {
        Ok(url) => match (url.host_str(), url.port_or_known_default()) {
            (Some(host), Some(port)) => format!("{}:{port}", host.to_ascii_lowercase()),
            (Some(host), None) => host.to_ascii_lowercase(),
            _ => address.trim().to_ascii_lowercase(),
        },
        Err(_) => address.trim().trim_end_matches('/').to_ascii_lowercase(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_systems_behind_one_bmc_share_endpoint() {
        let a = bmc_endpoint("https://10.0.0.5/redfish/v1/Systems/1");
        let b = bmc_endpoint("https://10.0.0.5/redfish/v1/Systems/2");
        assert_eq!(a, b);
        assert_eq!(a, "10.0.0.5:443");
    }

    #[test]
    fn test_bare_address_defaults_to_https() {
        assert_eq!(bmc_endpoint("bmc-rack1.example.com"), "bmc-rack1.example.com:443");
        assert_eq!(bmc_endpoint("http://10.0.0.9:8000/"), "10.0.0.9:8000");
    }

    #[test]
    fn test_empty_address_rejected() {
        assert!(parse_address("  ").is_err());
    }
}
