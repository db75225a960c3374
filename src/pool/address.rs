//! Forward proxy addresses.

use std::fmt;

/// Address of a forward proxy, `host:port` with an optional scheme.
///
/// The value is kept as received from the list provider. It is only
/// interpreted when turned into a proxy URL for an HTTP client.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProxyAddress(String);

impl ProxyAddress {
    pub fn new(address: impl Into<String>) -> Self {
        Self(address.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Proxy URL usable by reqwest. Bare `host:port` values are assumed to be
    /// plain HTTP proxies.
    pub fn to_url(&self) -> String {
        if self.0.contains("://") {
            self.0.clone()
        } else {
            format!("http://{}", self.0)
        }
    }
}

impl fmt::Display for ProxyAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ProxyAddress {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for ProxyAddress {
    fn from(s: String) -> Self {
        Self(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_address_gets_http_scheme() {
        let addr = ProxyAddress::from("10.0.0.1:8080");
        assert_eq!(addr.to_url(), "http://10.0.0.1:8080");
    }

    #[test]
    fn scheme_qualified_address_is_kept() {
        let addr = ProxyAddress::from("socks5://10.0.0.1:1080");
        assert_eq!(addr.to_url(), "socks5://10.0.0.1:1080");
        assert_eq!(addr.to_string(), "socks5://10.0.0.1:1080");
    }
}
