//! Upstream proxy rows.

/// One upstream proxy from the fixed pool.
#[derive(Debug, Clone)]
pub struct Proxy {
    pub id: i64,
    pub host: String,
    pub port: i32,
    pub username: Option<String>,
    pub password: Option<String>,
    pub consecutive_errors: i32,
}

impl Proxy {
    /// `host:port` form used for the Chromium `--proxy-server` argument.
    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn has_credentials(&self) -> bool {
        self.username.as_deref().is_some_and(|u| !u.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_addr_joins_host_and_port() {
        let proxy = Proxy {
            id: 1,
            host: "10.0.0.5".into(),
            port: 8080,
            username: None,
            password: None,
            consecutive_errors: 0,
        };
        assert_eq!(proxy.server_addr(), "10.0.0.5:8080");
        assert!(!proxy.has_credentials());
    }
}
