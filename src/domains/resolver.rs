use super::DomainsManager;
use reqwest::dns::{Addrs, Name, Resolve, Resolving};
use std::net::SocketAddr;
use std::sync::Arc;

/// Lets reqwest resolve hosts through the manager's resolution cache
#[derive(Debug, Clone)]
pub struct DomainsResolver {
    domains: Arc<DomainsManager>,
}

impl DomainsResolver {
    pub fn new(domains: Arc<DomainsManager>) -> Self {
        Self { domains }
    }
}

impl Resolve for DomainsResolver {
    fn resolve(&self, name: Name) -> Resolving {
        let domains = Arc::clone(&self.domains);
        Box::pin(async move {
            let ips = domains
                .resolve_host(name.as_str())
                .await
                .map_err(|e| Box::new(e) as Box<dyn std::error::Error + Send + Sync>)?;
            // reqwest fills in the port
            let addrs: Addrs = Box::new(ips.into_iter().map(|ip| SocketAddr::new(ip, 0)));
            Ok(addrs)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[tokio::test]
    async fn test_resolver_uses_manager() {
        let domains = Arc::new(DomainsManager::default());
        let resolver = DomainsResolver::new(Arc::clone(&domains));

        let addrs: Vec<SocketAddr> = resolver
            .resolve(Name::from_str("localhost").unwrap())
            .await
            .unwrap()
            .collect();

        assert!(!addrs.is_empty());
        assert_eq!(domains.snapshot().resolutions.len(), 1);
    }
}
