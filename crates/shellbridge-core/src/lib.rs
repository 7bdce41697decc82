pub mod config;
pub mod error;

pub use config::BridgeConfig;
pub use error::{CoreError, Result};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_expected_port() {
        let cfg = BridgeConfig {
            sandbox: config::SandboxConfig::default(),
            ..BridgeConfig::default()
        };
        assert_eq!(cfg.server.port, config::DEFAULT_PORT);
        assert_eq!(cfg.timing.rate_limit_ms, config::DEFAULT_RATE_LIMIT_MS);
    }
}
