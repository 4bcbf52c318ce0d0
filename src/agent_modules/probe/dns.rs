use async_trait::async_trait;
use hickory_resolver::Resolver;
use hickory_resolver::config::{NameServerConfig, ResolverConfig, ResolverOpts};
use hickory_resolver::name_server::TokioConnectionProvider;
use hickory_resolver::proto::xfer::Protocol;
use std::net::{IpAddr, SocketAddr};
use std::time::{Duration, Instant};
use tracing::debug;

use super::{Probe, ProbeError};
use crate::agent_modules::models::ProbeKind;

const DNS_PORT: u16 = 53;

/// Resolves a fixed domain through one specific name server.
pub struct DnsProbe {
    query_domain: String,
}

impl DnsProbe {
    pub fn new(query_domain: impl Into<String>) -> Self {
        Self {
            query_domain: query_domain.into(),
        }
    }

    fn server_addr(server: &str) -> Result<SocketAddr, ProbeError> {
        if let Ok(addr) = server.parse::<SocketAddr>() {
            return Ok(addr);
        }
        server
            .parse::<IpAddr>()
            .map(|ip| SocketAddr::new(ip, DNS_PORT))
            .map_err(|_| ProbeError::InvalidTarget(format!("{server} is not an IP address")))
    }

    fn resolver_for(addr: SocketAddr, timeout: Duration) -> Resolver<TokioConnectionProvider> {
        let config = ResolverConfig::from_parts(
            None,
            vec![],
            vec![NameServerConfig::new(addr, Protocol::Udp)],
        );
        let mut opts = ResolverOpts::default();
        opts.timeout = timeout;
        opts.attempts = 1;
        opts.cache_size = 0;
        Resolver::builder_with_config(config, TokioConnectionProvider::default())
            .with_options(opts)
            .build()
    }
}

#[async_trait]
impl Probe for DnsProbe {
    fn kind(&self) -> ProbeKind {
        ProbeKind::Dns
    }

    async fn probe(&self, target: &str, timeout: Duration) -> Result<Option<f64>, ProbeError> {
        let addr = Self::server_addr(target)?;
        let resolver = Self::resolver_for(addr, timeout);

        let start_time = Instant::now();
        let lookup = tokio::time::timeout(timeout, resolver.ipv4_lookup(self.query_domain.as_str()))
            .await
            .map_err(|_| ProbeError::Timeout(timeout))?
            .map_err(|e| {
                let message = e.to_string();
                if message.to_lowercase().contains("timed out") {
                    ProbeError::Timeout(timeout)
                } else if e.is_no_records_found() {
                    ProbeError::Resolve(format!("domain {} not found", self.query_domain))
                } else {
                    ProbeError::Resolve(message)
                }
            })?;
        let response_time_ms = start_time.elapsed().as_secs_f64() * 1000.0;

        let resolved: Vec<String> = lookup.iter().map(|a| a.to_string()).collect();
        if resolved.is_empty() {
            return Err(ProbeError::Resolve(format!(
                "no A records for {}",
                self.query_domain
            )));
        }
        debug!(server = %target, domain = %self.query_domain, resolved = ?resolved, "DNS probe resolved.");
        Ok(Some(response_time_ms))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_addr_defaults_to_port_53() {
        assert_eq!(
            DnsProbe::server_addr("1.1.1.1").unwrap(),
            "1.1.1.1:53".parse::<SocketAddr>().unwrap()
        );
        assert_eq!(
            DnsProbe::server_addr("127.0.0.1:5353").unwrap(),
            "127.0.0.1:5353".parse::<SocketAddr>().unwrap()
        );
    }

    #[test]
    fn test_server_addr_rejects_hostnames() {
        assert!(matches!(
            DnsProbe::server_addr("dns.google"),
            Err(ProbeError::InvalidTarget(_))
        ));
    }
}
