//! Named container registry
//!
//! The service owns a default container plus any number of named ones,
//! so independent parts of an application can run their downloads with
//! separate concurrency limits and target directories.

use std::collections::HashMap;

use parking_lot::RwLock;
use tracing::info;

use crate::config::ContainerConfig;
use crate::container::Container;
use crate::error::ServiceError;
use crate::handle::DownloadHandle;

/// Entry point: registry of download containers
pub struct DownloadService {
    default_container: Container,
    containers: RwLock<HashMap<String, Container>>,
}

impl DownloadService {
    /// Create a service with a default-configured default container
    pub fn new() -> Result<Self, ServiceError> {
        Self::with_config(ContainerConfig::default())
    }

    /// Create a service with an explicit default container configuration
    pub fn with_config(config: ContainerConfig) -> Result<Self, ServiceError> {
        Ok(Self {
            default_container: Container::new(config)?,
            containers: RwLock::new(HashMap::new()),
        })
    }

    /// Register a download in the named container, or the default when
    /// `container` is `None`. The task starts out suspended.
    pub fn add_download_task(
        &self,
        url: &str,
        container: Option<&str>,
    ) -> Result<DownloadHandle, ServiceError> {
        self.container(container)?.add_download_task(url)
    }

    /// Register a download and immediately vote it runnable
    pub fn add_download_task_and_resume(
        &self,
        url: &str,
        container: Option<&str>,
    ) -> Result<DownloadHandle, ServiceError> {
        self.container(container)?.add_download_task_and_resume(url)
    }

    /// Register a named container. Fails when the name is taken.
    pub fn register_container(
        &self,
        name: &str,
        config: ContainerConfig,
    ) -> Result<(), ServiceError> {
        let mut containers = self.containers.write();
        if containers.contains_key(name) {
            return Err(ServiceError::ContainerAlreadyExists(name.to_string()));
        }
        let container = Container::named(name, config)?;
        containers.insert(name.to_string(), container);
        info!(name, "container registered");
        Ok(())
    }

    /// Remove a named container, shutting it down. The default
    /// container cannot be removed.
    pub fn remove_container(&self, name: &str) -> Result<(), ServiceError> {
        let removed = self.containers.write().remove(name);
        match removed {
            Some(container) => {
                container.shutdown();
                info!(name, "container removed");
                Ok(())
            }
            None => Err(ServiceError::ContainerNotFound(name.to_string())),
        }
    }

    /// Check whether a named container is registered
    pub fn contains(&self, name: &str) -> bool {
        self.containers.read().contains_key(name)
    }

    /// The always-present default container
    pub fn default_container(&self) -> &Container {
        &self.default_container
    }

    fn container(&self, name: Option<&str>) -> Result<Container, ServiceError> {
        match name {
            None => Ok(self.default_container.clone()),
            Some(name) => self
                .containers
                .read()
                .get(name)
                .cloned()
                .ok_or_else(|| ServiceError::ContainerNotFound(name.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn named_container_lifecycle() {
        let service = DownloadService::new().unwrap();
        assert!(!service.contains("media"));

        service
            .register_container("media", ContainerConfig::default())
            .unwrap();
        assert!(service.contains("media"));

        let err = service
            .register_container("media", ContainerConfig::default())
            .unwrap_err();
        assert!(matches!(err, ServiceError::ContainerAlreadyExists(_)));

        service.remove_container("media").unwrap();
        assert!(!service.contains("media"));

        let err = service.remove_container("media").unwrap_err();
        assert!(matches!(err, ServiceError::ContainerNotFound(_)));
    }

    #[tokio::test]
    async fn unknown_container_rejects_tasks() {
        let service = DownloadService::new().unwrap();
        let err = service
            .add_download_task("https://example.com/f", Some("nope"))
            .unwrap_err();
        assert!(matches!(err, ServiceError::ContainerNotFound(_)));
    }

    #[tokio::test]
    async fn default_container_accepts_tasks() {
        let service = DownloadService::new().unwrap();
        let handle = service
            .add_download_task("https://example.com/f.bin", None)
            .unwrap();
        assert_eq!(handle.state(), crate::protocol::TaskState::Suspended);
    }

    #[tokio::test]
    async fn invalid_config_rejected_at_registration() {
        let service = DownloadService::new().unwrap();
        let mut config = ContainerConfig::default();
        config.max_concurrent_transfers = 0;
        assert!(service.register_container("bad", config).is_err());
        assert!(!service.contains("bad"));
    }
}
