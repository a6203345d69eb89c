//! Session configuration

use crate::query::QueryMode;

/// Configuration for a coordinator session
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Filesystem image of the coordinator itself; active workers sharing it
    /// never need file transfers and are excluded from the unique set
    pub image: String,
    /// Maximum concurrent connection attempts during parallel startup;
    /// 0 disables the helper pool and forces sequential startup
    pub max_startup_connections: usize,
    /// Default query submission mode
    pub default_mode: QueryMode,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            image: "<local>".to_string(),
            max_startup_connections: 4,
            default_mode: QueryMode::Sync,
        }
    }
}

impl SessionConfig {
    /// Set the coordinator's own image
    pub fn with_image(mut self, image: impl Into<String>) -> Self {
        self.image = image.into();
        self
    }

    /// Set the startup concurrency bound
    pub fn with_max_startup_connections(mut self, max: usize) -> Self {
        self.max_startup_connections = max;
        self
    }

    /// Set the default query mode
    pub fn with_default_mode(mut self, mode: QueryMode) -> Self {
        self.default_mode = mode;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = SessionConfig::default();
        assert_eq!(config.max_startup_connections, 4);
        assert_eq!(config.default_mode, QueryMode::Sync);
        assert_eq!(config.image, "<local>");
    }

    #[test]
    fn test_config_builders() {
        let config = SessionConfig::default()
            .with_image("nfs-a")
            .with_max_startup_connections(0)
            .with_default_mode(QueryMode::Async);
        assert_eq!(config.image, "nfs-a");
        assert_eq!(config.max_startup_connections, 0);
        assert_eq!(config.default_mode, QueryMode::Async);
    }
}
