//! Container configuration

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::error::ServiceError;

/// Configuration for one download container
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerConfig {
    /// Maximum number of transfers running at once
    pub max_concurrent_transfers: usize,
    /// Directory where finished downloads are placed
    pub download_dir: PathBuf,
    /// HTTP transport settings
    pub http: HttpConfig,
}

/// HTTP transport settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    /// Connection timeout in seconds
    pub connect_timeout_secs: u64,
    /// User-Agent header sent with every request
    pub user_agent: String,
}

impl Default for ContainerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_transfers: 2,
            download_dir: PathBuf::from("downloads"),
            http: HttpConfig::default(),
        }
    }
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: 30,
            user_agent: format!("hydra-dl/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

impl ContainerConfig {
    /// Validate configuration values
    pub fn validate(&self) -> Result<(), ServiceError> {
        if self.max_concurrent_transfers == 0 {
            return Err(ServiceError::invalid_input(
                "max_concurrent_transfers",
                "must be at least 1",
            ));
        }
        if self.download_dir.as_os_str().is_empty() {
            return Err(ServiceError::invalid_input(
                "download_dir",
                "must not be empty",
            ));
        }
        if self.http.connect_timeout_secs == 0 {
            return Err(ServiceError::invalid_input(
                "connect_timeout_secs",
                "must be at least 1",
            ));
        }
        Ok(())
    }
}
