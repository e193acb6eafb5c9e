//! Exit role: DNS resolution and real-socket dial-out
//!
//! An exit terminates streams whose destination falls inside its advertised
//! prefixes. Hostnames resolve against the configured upstream servers (A
//! and AAAA in parallel, first answer wins); the resolved address must stay
//! within what the node advertises unless the name itself matched a domain
//! route.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use hickory_resolver::config::{NameServerConfig, Protocol, ResolverConfig, ResolverOpts};
use hickory_resolver::TokioAsyncResolver;
use tokio::net::TcpStream;

use crate::config::ExitConfig;
use crate::proto::{Destination, WireCode};
use crate::routing::RouteTable;
use crate::WeftError;

pub struct ExitEndpoint {
    resolver: TokioAsyncResolver,
    routes: Arc<RouteTable>,
    dns_timeout: Duration,
}

impl ExitEndpoint {
    pub fn new(config: &ExitConfig, routes: Arc<RouteTable>) -> Result<Self, WeftError> {
        let resolver = if config.dns.servers.is_empty() {
            TokioAsyncResolver::tokio_from_system_conf()
                .map_err(|e| WeftError::Config(format!("system resolver: {}", e)))?
        } else {
            let mut resolver_config = ResolverConfig::new();
            for server in &config.dns.servers {
                let addr: SocketAddr = server
                    .parse()
                    .map_err(|_| WeftError::Config(format!("bad dns server: {}", server)))?;
                resolver_config.add_name_server(NameServerConfig::new(addr, Protocol::Udp));
            }
            let mut opts = ResolverOpts::default();
            opts.timeout = config.dns.timeout;
            opts.ip_strategy = hickory_resolver::config::LookupIpStrategy::Ipv4AndIpv6;
            TokioAsyncResolver::tokio(resolver_config, opts)
        };
        Ok(Self {
            resolver,
            routes,
            dns_timeout: config.dns.timeout,
        })
    }

    /// Resolve a hostname to the first answering address.
    pub async fn resolve(&self, host: &str) -> Result<IpAddr, WeftError> {
        let lookup = tokio::time::timeout(self.dns_timeout, self.resolver.lookup_ip(host))
            .await
            .map_err(|_| WeftError::Wire(WireCode::DnsFailed))?
            .map_err(|e| {
                log::debug!("[EXIT] DNS lookup for {} failed: {}", host, e);
                WeftError::Wire(WireCode::DnsFailed)
            })?;
        lookup
            .iter()
            .next()
            .ok_or(WeftError::Wire(WireCode::DnsFailed))
    }

    /// Resolve (when needed), validate against our advertised prefixes, and
    /// dial the real TCP socket.
    pub async fn dial(&self, destination: &Destination) -> Result<TcpStream, WeftError> {
        let addr = self.resolve_validated(destination).await?;
        let stream = TcpStream::connect(addr).await.map_err(|e| {
            log::debug!("[EXIT] Dial {} failed: {}", addr, e);
            WeftError::Wire(WireCode::DialFailed)
        })?;
        log::debug!("[EXIT] Dialed {} for {}", addr, destination);
        Ok(stream)
    }

    /// Resolve and validate without dialing; UDP relays use the address
    /// directly.
    pub async fn resolve_validated(
        &self,
        destination: &Destination,
    ) -> Result<SocketAddr, WeftError> {
        let port = destination.port();
        match destination {
            Destination::V4(ip, _) => {
                let ip = IpAddr::V4(*ip);
                self.check_ip(ip)?;
                Ok(SocketAddr::new(ip, port))
            }
            Destination::V6(ip, _) => {
                let ip = IpAddr::V6(*ip);
                self.check_ip(ip)?;
                Ok(SocketAddr::new(ip, port))
            }
            Destination::Domain(name, _) => {
                let by_domain = self.routes.local_covers_domain(name);
                let ip = self.resolve(name).await?;
                // A domain-route match authorizes the name itself; otherwise
                // the resolved address must fall in an advertised CIDR.
                if !by_domain {
                    self.check_ip(ip)?;
                }
                Ok(SocketAddr::new(ip, port))
            }
        }
    }

    fn check_ip(&self, ip: IpAddr) -> Result<(), WeftError> {
        if self.routes.local_covers_ip(ip) {
            Ok(())
        } else {
            log::warn!("[EXIT] Refusing {} outside advertised prefixes", ip);
            Err(WeftError::Wire(WireCode::NoRoute))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::AgentId;
    use crate::routing::RoutePrefix;

    fn exit_with_routes(prefixes: &[&str], domains: &[&str]) -> ExitEndpoint {
        let routes = Arc::new(RouteTable::new(
            AgentId::generate(),
            8,
            Duration::from_secs(300),
        ));
        for p in prefixes {
            routes.add_local(RoutePrefix::Cidr(p.parse().unwrap()));
        }
        for d in domains {
            routes.add_local(RoutePrefix::Domain((*d).to_string()));
        }
        let config = ExitConfig {
            enabled: true,
            routes: prefixes.iter().map(|s| s.to_string()).collect(),
            domain_routes: domains.iter().map(|s| s.to_string()).collect(),
            dns: crate::config::DnsConfig {
                servers: vec!["127.0.0.1:53".into()],
                timeout: Duration::from_millis(200),
            },
        };
        ExitEndpoint::new(&config, routes).unwrap()
    }

    #[tokio::test]
    async fn test_ip_outside_prefixes_rejected() {
        let exit = exit_with_routes(&["10.0.0.0/8"], &[]);
        let dest = Destination::V4("192.168.1.1".parse().unwrap(), 80);
        match exit.resolve_validated(&dest).await {
            Err(WeftError::Wire(WireCode::NoRoute)) => {}
            other => panic!("expected NoRoute, got {:?}", other.map(|a| a.to_string())),
        }
    }

    #[tokio::test]
    async fn test_ip_inside_prefix_allowed() {
        let exit = exit_with_routes(&["10.0.0.0/8"], &[]);
        let dest = Destination::V4("10.1.2.3".parse().unwrap(), 22);
        let addr = exit.resolve_validated(&dest).await.unwrap();
        assert_eq!(addr, "10.1.2.3:22".parse().unwrap());
    }

    #[tokio::test]
    async fn test_dns_timeout_maps_to_dns_failed() {
        // Nothing answers on localhost:53 with a 200ms budget.
        let exit = exit_with_routes(&["0.0.0.0/0"], &[]);
        let dest = Destination::Domain("unresolvable.invalid".into(), 80);
        match exit.resolve_validated(&dest).await {
            Err(WeftError::Wire(WireCode::DnsFailed)) => {}
            other => panic!("expected DnsFailed, got {:?}", other.map(|a| a.to_string())),
        }
    }
}
