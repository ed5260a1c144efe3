//! Backend pool definitions.

use serde::{Deserialize, Serialize};
use url::Url;

/// One URL-prefix and the backends serving it.
///
/// This is both the static `[[location]]` config entry and the payload of a
/// replicated create-pool log entry, so its serialized shape is part of the
/// wire format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Location {
    /// Path prefix, e.g. `/api`.
    pub pattern: String,
    /// Backend URLs, e.g. `http://10.0.0.5:8080`.
    pub proxy_pass: Vec<String>,
    /// Balancer name, e.g. `round-robin` or `consistent-hash`.
    pub balance_mode: String,
}

impl Location {
    pub fn new(
        pattern: impl Into<String>,
        proxy_pass: Vec<String>,
        balance_mode: impl Into<String>,
    ) -> Self {
        Self {
            pattern: pattern.into(),
            proxy_pass,
            balance_mode: balance_mode.into(),
        }
    }

    /// Structural checks that need no runtime knowledge.
    ///
    /// Balancer names are checked later against the balancer registry.
    pub fn check(&self) -> Result<(), String> {
        check_pattern(&self.pattern)?;
        if self.proxy_pass.is_empty() {
            return Err(format!("location '{}' has no proxy hosts", self.pattern));
        }
        for backend in &self.proxy_pass {
            parse_backend(backend)
                .map_err(|e| format!("location '{}': {}", self.pattern, e))?;
        }
        if self.balance_mode.trim().is_empty() {
            return Err(format!("location '{}' has no balance mode", self.pattern));
        }
        Ok(())
    }

    /// Backend addresses (`host:port`) in declaration order, skipping
    /// duplicates and anything unparsable.
    pub fn backend_addresses(&self) -> Vec<String> {
        let mut out: Vec<String> = Vec::with_capacity(self.proxy_pass.len());
        for backend in &self.proxy_pass {
            if let Some(addr) = parse_backend(backend).ok().and_then(|u| backend_address(&u)) {
                if !out.contains(&addr) {
                    out.push(addr);
                }
            }
        }
        out
    }
}

/// Validate a routing pattern.
pub fn check_pattern(pattern: &str) -> Result<(), String> {
    if !pattern.starts_with('/') {
        return Err(format!("pattern '{}' must begin with '/'", pattern));
    }
    if pattern.len() > 1 && pattern.ends_with('/') {
        return Err(format!("pattern '{}' must not end with '/'", pattern));
    }
    if pattern.contains("//") {
        return Err(format!("pattern '{}' contains an empty segment", pattern));
    }
    Ok(())
}

/// Parse a backend URL. Only `http` and `https` targets with a host are accepted.
pub fn parse_backend(raw: &str) -> Result<Url, String> {
    let url = Url::parse(raw).map_err(|e| format!("invalid backend url '{}': {}", raw, e))?;
    match url.scheme() {
        "http" | "https" => {}
        other => {
            return Err(format!(
                "backend '{}' uses unsupported scheme '{}', expected http or https",
                raw, other
            ))
        }
    }
    if url.host_str().is_none() {
        return Err(format!("backend '{}' has no host", raw));
    }
    Ok(url)
}

/// The `host:port` key a backend is tracked under.
///
/// Ports default from the scheme (80 for http, 443 for https).
pub fn backend_address(url: &Url) -> Option<String> {
    let host = url.host_str()?;
    // host_str keeps the brackets on IPv6 literals
    let port = url.port_or_known_default()?;
    Some(format!("{}:{}", host, port))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_address_default_ports() {
        let url = parse_backend("http://example.com").unwrap();
        assert_eq!(backend_address(&url).unwrap(), "example.com:80");
        let url = parse_backend("https://example.com/base").unwrap();
        assert_eq!(backend_address(&url).unwrap(), "example.com:443");
        let url = parse_backend("http://127.0.0.1:8000").unwrap();
        assert_eq!(backend_address(&url).unwrap(), "127.0.0.1:8000");
    }

    #[test]
    fn test_parse_backend_rejects_other_schemes() {
        assert!(parse_backend("ftp://example.com").is_err());
        assert!(parse_backend("127.0.0.1:8000").is_err());
        assert!(parse_backend("not a url").is_err());
    }

    #[test]
    fn test_check_pattern() {
        assert!(check_pattern("/").is_ok());
        assert!(check_pattern("/api/v2").is_ok());
        assert!(check_pattern("api").is_err());
        assert!(check_pattern("/api/").is_err());
        assert!(check_pattern("/api//v2").is_err());
    }

    #[test]
    fn test_location_check() {
        let ok = Location::new("/api", vec!["http://127.0.0.1:8000".into()], "round-robin");
        assert!(ok.check().is_ok());

        let empty = Location::new("/api", vec![], "round-robin");
        assert!(empty.check().unwrap_err().contains("no proxy hosts"));

        let bad_host = Location::new("/api", vec!["gopher://x".into()], "round-robin");
        assert!(bad_host.check().is_err());
    }

    #[test]
    fn test_backend_addresses_dedup() {
        let location = Location::new(
            "/api",
            vec![
                "http://127.0.0.1:8000".into(),
                "http://127.0.0.1:8000/other".into(),
                "http://127.0.0.1:8001".into(),
            ],
            "round-robin",
        );
        assert_eq!(
            location.backend_addresses(),
            vec!["127.0.0.1:8000".to_string(), "127.0.0.1:8001".to_string()]
        );
    }

    #[test]
    fn test_wire_shape() {
        let location = Location::new("/api", vec!["http://a:1".into()], "round-robin");
        let json = serde_json::to_string(&location).unwrap();
        assert_eq!(
            json,
            r#"{"pattern":"/api","proxy_pass":["http://a:1"],"balance_mode":"round-robin"}"#
        );
    }
}
