//! Fixed `name -> [host:port]` table.

use std::collections::HashMap;

use super::{Listing, Registry};
use crate::error::Result;
use crate::service::{Check, Index, Service};

/// Registry answering from configuration. Listings never change.
#[derive(Clone, Debug, Default)]
pub struct StaticRegistry {
    entries: HashMap<String, Vec<Service>>,
}

impl StaticRegistry {
    /// Builds the table from `name -> [host:port]` pairs.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidAddress`](crate::Error::InvalidAddress) for the first entry
    /// that is not `host:port`.
    pub fn new(table: &HashMap<String, Vec<String>>) -> Result<Self> {
        let mut entries = HashMap::with_capacity(table.len());

        for (name, addrs) in table {
            let services = addrs
                .iter()
                .map(|addr| Service::from_address(name.as_str(), addr))
                .collect::<Result<Vec<_>>>()?;

            entries.insert(name.clone(), services);
        }

        Ok(Self { entries })
    }

    fn listing(&self, name: &str) -> Vec<Service> {
        self.entries.get(name).cloned().unwrap_or_default()
    }
}

impl Registry for StaticRegistry {
    async fn register(&self, service: &Service, _check: Option<&Check>) -> Result<()> {
        tracing::debug!("static registry ignores registration of {service}");
        Ok(())
    }

    async fn deregister(&self, service_id: &str) -> Result<()> {
        tracing::debug!("static registry ignores deregistration of {service_id}");
        Ok(())
    }

    async fn fetch_service(&self, name: &str) -> Result<Listing> {
        Ok((self.listing(name), 0))
    }

    async fn watch_service(&self, name: &str, index: Index) -> Result<Listing> {
        if index == 0 {
            return Ok((self.listing(name), 1));
        }

        // Nothing ever changes; block until the caller gives up.
        std::future::pending::<()>().await;
        Ok((self.listing(name), index + 1))
    }

    fn is_dynamic(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn registry() -> StaticRegistry {
        let table = HashMap::from([(
            "api".to_string(),
            vec!["10.0.0.1:80".to_string(), "10.0.0.2:80".to_string()],
        )]);

        StaticRegistry::new(&table).unwrap()
    }

    #[tokio::test]
    async fn fetch_returns_table_at_index_zero() {
        let (services, index) = registry().fetch_service("api").await.unwrap();

        assert_eq!(index, 0);
        assert_eq!(services.len(), 2);
        assert_eq!(services[0].address(), "10.0.0.1:80");
        assert_eq!(services[0].name(), "api");
    }

    #[tokio::test]
    async fn unknown_name_is_empty() {
        let (services, _) = registry().fetch_service("missing").await.unwrap();
        assert!(services.is_empty());
    }

    #[tokio::test]
    async fn first_watch_returns_immediately() {
        let (services, index) = registry().watch_service("api", 0).await.unwrap();

        assert_eq!(index, 1);
        assert_eq!(services.len(), 2);
    }

    #[tokio::test]
    async fn later_watches_block() {
        let registry = registry();
        let watch = registry.watch_service("api", 1);

        assert!(
            tokio::time::timeout(Duration::from_millis(50), watch)
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn registration_is_a_no_op() {
        let registry = registry();
        let service = Service::new("api", "10.0.0.3", 80);

        registry.register(&service, None).await.unwrap();
        registry.deregister(service.id()).await.unwrap();

        let (services, _) = registry.fetch_service("api").await.unwrap();
        assert_eq!(services.len(), 2);
    }
}
