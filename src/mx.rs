//! Mail-exchanger resolution.

use crate::error::Error;
use hickory_resolver::TokioAsyncResolver;

/// Resolves recipient domains to their preferred mail exchanger.
pub struct MxResolver {
    resolver: TokioAsyncResolver,
}

impl MxResolver {
    pub fn from_system_conf() -> Result<Self, Error> {
        Ok(Self {
            resolver: TokioAsyncResolver::tokio_from_system_conf()?,
        })
    }

    /// Returns the lowest-preference MX host for `domain`, without the
    /// trailing root dot.
    pub async fn resolve(&self, domain: &str) -> Result<String, Error> {
        if domain.is_empty() {
            return Err(Error::NoMailExchanger(domain.to_string()));
        }

        let lookup = self.resolver.mx_lookup(domain).await?;
        let mut records: Vec<_> = lookup
            .iter()
            .map(|mx| (mx.preference(), mx.exchange().to_string()))
            .collect();
        records.sort_unstable_by_key(|(preference, _)| *preference);

        match records.into_iter().next() {
            Some((_, host)) => Ok(host.trim_end_matches('.').to_string()),
            None => Err(Error::NoMailExchanger(domain.to_string())),
        }
    }
}
