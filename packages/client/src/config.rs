//! Client configuration. Every field here has a spec-mandated default; there is
//! no other configuration surface in the core (no CLI, no environment variables).

use std::path::PathBuf;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    /// Prefer the multiplexed (libcurl multi-handle) transport when available,
    /// falling back to the raw socket transport.
    Auto,
    Curl,
    Socket,
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub concurrency: usize,
    pub timeout_ms: u64,
    pub transport: TransportKind,
    pub max_redirects: u32,
    pub cache_dir: Option<PathBuf>,
    pub user_agent: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            concurrency: 10,
            timeout_ms: 30_000,
            transport: TransportKind::Auto,
            max_redirects: 5,
            cache_dir: None,
            user_agent: format!("pullhttp/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ClientConfigBuilder {
    config: ClientConfig,
}

impl ClientConfigBuilder {
    pub fn new() -> Self {
        ClientConfigBuilder { config: ClientConfig::default() }
    }

    pub fn concurrency(mut self, n: usize) -> Self {
        self.config.concurrency = n;
        self
    }

    pub fn timeout_ms(mut self, ms: u64) -> Self {
        self.config.timeout_ms = ms;
        self
    }

    pub fn transport(mut self, kind: TransportKind) -> Self {
        self.config.transport = kind;
        self
    }

    pub fn max_redirects(mut self, n: u32) -> Self {
        self.config.max_redirects = n;
        self
    }

    pub fn cache_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.cache_dir = Some(dir.into());
        self
    }

    pub fn user_agent(mut self, ua: impl Into<String>) -> Self {
        self.config.user_agent = ua.into();
        self
    }

    pub fn build(self) -> ClientConfig {
        self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec() {
        let config = ClientConfig::default();
        assert_eq!(config.concurrency, 10);
        assert_eq!(config.timeout_ms, 30_000);
        assert_eq!(config.transport, TransportKind::Auto);
        assert_eq!(config.max_redirects, 5);
        assert!(config.cache_dir.is_none());
    }

    #[test]
    fn builder_overrides_defaults() {
        let config = ClientConfigBuilder::new().concurrency(4).max_redirects(1).build();
        assert_eq!(config.concurrency, 4);
        assert_eq!(config.max_redirects, 1);
        assert_eq!(config.timeout_ms, 30_000);
    }
}
