use crate::{
    errors::{Error, Result},
    models::{Host, StringAddr},
};

use std::net::{IpAddr, SocketAddr};
use tracing::debug;
use trust_dns_resolver::{Resolver, TokioAsyncResolver};

fn literal(s: &StringAddr) -> Option<SocketAddr> {
    s.host
        .parse::<IpAddr>()
        .ok()
        .map(|ip| SocketAddr::new(ip, s.port))
}

fn first_addr(s: &StringAddr, ips: impl Iterator<Item = IpAddr>) -> Result<SocketAddr> {
    let mut ips = ips.peekable();
    // Prefer IPv4, most game servers do not listen on v6.
    let first = ips.peek().copied();
    ips.find(IpAddr::is_ipv4)
        .or(first)
        .map(|ip| SocketAddr::new(ip, s.port))
        .ok_or_else(|| Error::Resolve(format!("no addresses for {}", s.host)))
}

/// Blocking resolution, used by the query engine when it (re)connects.
pub fn resolve_host(host: &Host) -> Result<SocketAddr> {
    match host {
        Host::A(addr) => Ok(*addr),
        Host::S(s) => {
            if let Some(addr) = literal(s) {
                return Ok(addr);
            }
            let resolver =
                Resolver::from_system_conf().map_err(|e| Error::Resolve(e.to_string()))?;
            let lookup = resolver
                .lookup_ip(s.host.as_str())
                .map_err(|e| Error::Resolve(e.to_string()))?;
            let addr = first_addr(s, lookup.iter())?;
            debug!("Resolved {} to {}", s.host, addr);
            Ok(addr)
        }
    }
}

/// Non-blocking resolution for callers running inside a tokio runtime.
pub async fn resolve_host_async(resolver: &TokioAsyncResolver, host: Host) -> Result<SocketAddr> {
    match host {
        Host::A(addr) => Ok(addr),
        Host::S(s) => {
            if let Some(addr) = literal(&s) {
                return Ok(addr);
            }
            let lookup = resolver
                .lookup_ip(s.host.as_str())
                .await
                .map_err(|e| Error::Resolve(e.to_string()))?;
            let addr = first_addr(&s, lookup.iter())?;
            debug!("Resolved {} to {}", s.host, addr);
            Ok(addr)
        }
    }
}
