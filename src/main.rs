use a2s::{dns, Host, Player, Rule, ServerInfo, SourceQuery};

use anyhow::Context;
use futures::future::join_all;
use serde::Serialize;
use std::{net::SocketAddr, time::Duration};
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;
use trust_dns_resolver::TokioAsyncResolver;

#[derive(Debug, Serialize)]
struct Report {
    addr: SocketAddr,
    info: ServerInfo,
    players: Option<Vec<Player>>,
    rules: Option<Vec<Rule>>,
}

fn parse_host(s: &str) -> anyhow::Result<Host> {
    if let Ok(addr) = s.parse::<SocketAddr>() {
        return Ok(addr.into());
    }
    let (host, port) = s
        .rsplit_once(':')
        .with_context(|| format!("{} is not in host:port form", s))?;
    let port = port
        .parse::<u16>()
        .with_context(|| format!("Invalid port in {}", s))?;
    Ok((host, port).into())
}

fn query_server(addr: SocketAddr) -> Report {
    let mut query = SourceQuery::new(addr);
    let info = query.server_info();
    let players = query.players().ok();
    let rules = query.rules().ok();
    query.cleanup();

    Report {
        addr,
        info,
        players,
        rules,
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let hosts = std::env::args()
        .skip(1)
        .map(|s| parse_host(&s))
        .collect::<anyhow::Result<Vec<_>>>()?;
    if hosts.is_empty() {
        anyhow::bail!("Usage: a2s <host:port>...");
    }

    let resolver = TokioAsyncResolver::tokio_from_system_conf()
        .context("Failed to set up DNS resolver")?;

    let mut addrs = Vec::new();
    for host in hosts {
        match dns::resolve_host_async(&resolver, host.clone()).await {
            Ok(addr) => addrs.push(addr),
            Err(e) => warn!("Skipping {:?}: {}", host, e),
        }
    }

    // Three queries per server at the default timeouts, with a margin.
    let timeout = Duration::from_secs(10);
    let total = addrs.len();

    let task = join_all(
        addrs
            .into_iter()
            .map(|addr| tokio::task::spawn_blocking(move || query_server(addr))),
    );

    debug!("Querying {} servers", total);
    let reports = tokio::time::timeout(timeout, task)
        .await
        .context("Queries did not finish in time")?;

    let mut queried = 0;
    for report in reports {
        let report = report.context("Query task failed")?;
        if report.info.is_available() {
            queried += 1;
        }
        println!("{}", serde_json::to_string(&report)?);
    }
    info!("Queried {} of {} servers", queried, total);

    Ok(())
}
