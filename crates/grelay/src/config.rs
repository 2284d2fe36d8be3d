use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;

/// CLI arguments for the proxy.
#[derive(Parser, Debug, Clone)]
#[command(name = "grelay")]
#[command(about = "Transparent gRPC proxy")]
#[command(version)]
pub struct Args {
    /// Socket address to accept gRPC calls on.
    #[arg(long, default_value = "0.0.0.0:50051", env = "GRELAY_LISTEN")]
    pub listen: SocketAddr,
    /// Socket address for the metrics endpoint.
    #[arg(long, default_value = "127.0.0.1:9090", env = "GRELAY_METRICS")]
    pub metrics_addr: SocketAddr,
    /// Backend URL for calls no route matches.
    #[arg(long, env = "GRELAY_BACKEND")]
    pub backend: Option<String>,
    /// Route a service or full method to a backend: `TARGET=URL`. Repeatable.
    #[arg(long = "route", env = "GRELAY_ROUTES", value_delimiter = ',')]
    pub routes: Vec<String>,
    /// Relay only this `SERVICE/METHOD`; everything else is rejected. Repeatable.
    #[arg(long = "allow", env = "GRELAY_ALLOW", value_delimiter = ',')]
    pub allow: Vec<String>,
    /// Backend connect timeout in seconds.
    #[arg(long, default_value = "5", env = "GRELAY_CONNECT_TIMEOUT")]
    pub connect_timeout: u64,
    /// Messages buffered per call direction.
    #[arg(long, default_value = "64", env = "GRELAY_BUFFER")]
    pub buffer: usize,
    /// Seconds to wait for in-flight calls on shutdown.
    #[arg(long, default_value = "30", env = "GRELAY_DRAIN_TIMEOUT")]
    pub drain_timeout: u64,
    /// Append logs to this file instead of stderr.
    #[arg(long, env = "GRELAY_LOG_FILE")]
    pub log_file: Option<PathBuf>,
    /// Increase log verbosity (-v debug, -vv trace). Ignored if RUST_LOG is set.
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,
}

/// Runtime configuration derived from [`Args`].
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// Socket address to accept gRPC calls on.
    pub listen: SocketAddr,
    /// Socket address for the metrics endpoint.
    pub metrics_addr: SocketAddr,
    /// Backend URL for calls no route matches.
    pub backend: Option<String>,
    /// `TARGET=URL` route entries.
    pub routes: Vec<String>,
    /// `SERVICE/METHOD` whitelist; empty means transparent mode.
    pub allow: Vec<String>,
    /// Backend connect timeout in seconds.
    pub connect_timeout: u64,
    /// Messages buffered per call direction.
    pub buffer: usize,
    /// Seconds to wait for in-flight calls on shutdown.
    pub drain_timeout: u64,
}

/// Parses a `TARGET=URL` route entry.
///
/// # Errors
///
/// Returns a description of the problem if the entry is malformed.
pub fn parse_route(entry: &str) -> Result<(&str, &str), String> {
    let (target, url) = entry
        .split_once('=')
        .ok_or_else(|| format!("route {entry:?} must have the form TARGET=URL"))?;
    if target.is_empty() {
        return Err(format!("route {entry:?} has an empty target"));
    }
    if target.starts_with('/') && target[1..].split('/').count() != 2 {
        return Err(format!(
            "route {entry:?}: method targets must look like /package.Service/Method"
        ));
    }
    check_url(url).map_err(|e| format!("route {entry:?}: {e}"))?;
    Ok((target, url))
}

/// Parses a `SERVICE/METHOD` whitelist entry.
///
/// # Errors
///
/// Returns a description of the problem if the entry is malformed.
pub fn parse_allow(entry: &str) -> Result<(&str, &str), String> {
    let trimmed = entry.strip_prefix('/').unwrap_or(entry);
    match trimmed.split_once('/') {
        Some((service, method))
            if !service.is_empty() && !method.is_empty() && !method.contains('/') =>
        {
            Ok((service, method))
        }
        _ => Err(format!("allow entry {entry:?} must have the form SERVICE/METHOD")),
    }
}

fn check_url(url: &str) -> Result<(), String> {
    if url.starts_with("http://") || url.starts_with("https://") {
        Ok(())
    } else {
        Err(format!("backend url {url:?} must start with http:// or https://"))
    }
}

impl ProxyConfig {
    /// Validates the configuration values are within acceptable bounds.
    /// Returns Ok(()) if valid, Err with description otherwise.
    pub fn validate(&self) -> Result<(), String> {
        // At least one place to send calls
        if self.backend.is_none() && self.routes.is_empty() {
            return Err("no backend configured: set backend or at least one route".to_string());
        }
        if let Some(ref url) = self.backend {
            check_url(url).map_err(|e| format!("backend: {e}"))?;
        }
        for entry in &self.routes {
            parse_route(entry)?;
        }
        for entry in &self.allow {
            parse_allow(entry)?;
        }

        if self.listen == self.metrics_addr {
            return Err("listen and metrics_addr must differ".to_string());
        }

        if self.connect_timeout == 0 {
            return Err("connect_timeout must be greater than 0".to_string());
        }
        if self.connect_timeout > 300 {
            return Err("connect_timeout exceeds reasonable limit (300 seconds)".to_string());
        }

        if self.buffer == 0 {
            return Err("buffer must be greater than 0".to_string());
        }
        if self.buffer > 65_536 {
            return Err("buffer exceeds reasonable limit (65536 messages)".to_string());
        }

        if self.drain_timeout > 3600 {
            return Err("drain_timeout exceeds reasonable limit (3600 seconds)".to_string());
        }
        Ok(())
    }
}

impl From<Args> for ProxyConfig {
    fn from(args: Args) -> Self {
        Self {
            listen: args.listen,
            metrics_addr: args.metrics_addr,
            backend: args.backend,
            routes: args.routes,
            allow: args.allow,
            connect_timeout: args.connect_timeout,
            buffer: args.buffer,
            drain_timeout: args.drain_timeout,
        }
    }
}
