use std::{
    env,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    path::PathBuf,
    time::Duration,
};

use anyhow::bail;

const DEFAULT_PORT: u16 = 8080;
const DEFAULT_MEMORY_LIMIT: u64 = 4 * 1024 * 1024 * 1024;

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub listen_addr: SocketAddr,
    pub device: String,
    pub threads: usize,
    pub memory_limit: u64,
    pub enable_auth: bool,
    pub api_key: String,
    pub hub_registry: PathBuf,
    pub engine_url: Option<String>,
    pub default_max_tokens: usize,
    pub request_timeout: Duration,
    pub persist_timeout: Duration,
    pub shutdown_grace: Duration,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), DEFAULT_PORT),
            device: "auto".to_string(),
            threads: 8,
            memory_limit: DEFAULT_MEMORY_LIMIT,
            enable_auth: false,
            api_key: String::new(),
            hub_registry: PathBuf::from("hub/registry.json"),
            engine_url: None,
            default_max_tokens: 150,
            request_timeout: Duration::from_secs(15),
            persist_timeout: Duration::from_secs(10),
            shutdown_grace: Duration::from_secs(5),
        }
    }
}

impl AppConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| env::var(key).ok().filter(|v| !v.is_empty()))
    }

    /// Builds the configuration from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> anyhow::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let port = parsed(&lookup, "PORT").unwrap_or(DEFAULT_PORT);
        let listen_addr = lookup("SERVER_ADDR")
            .and_then(|v| v.parse().ok())
            .unwrap_or_else(|| SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port));

        let device = lookup("DEVICE").unwrap_or(defaults.device);
        let threads = parsed(&lookup, "THREADS").unwrap_or(defaults.threads);
        let memory_limit = parsed(&lookup, "MEMORY_LIMIT").unwrap_or(defaults.memory_limit);

        let enable_auth = lookup("ENABLE_AUTH")
            .map(|v| matches!(v.to_lowercase().as_str(), "true" | "1" | "yes"))
            .unwrap_or(false);
        let api_key = lookup("API_KEY").unwrap_or_default();
        if enable_auth && api_key.is_empty() {
            bail!("ENABLE_AUTH is set but API_KEY is empty");
        }

        let hub_registry = lookup("HUB_REGISTRY")
            .map(PathBuf::from)
            .unwrap_or(defaults.hub_registry);
        let engine_url = lookup("ENGINE_URL").map(|url| url.trim_end_matches('/').to_string());

        let default_max_tokens =
            parsed(&lookup, "DEFAULT_MAX_TOKENS").unwrap_or(defaults.default_max_tokens);
        let request_timeout = parsed(&lookup, "REQUEST_TIMEOUT_SECS")
            .map(Duration::from_secs)
            .unwrap_or(defaults.request_timeout);
        let persist_timeout = parsed(&lookup, "PERSIST_TIMEOUT_SECS")
            .map(Duration::from_secs)
            .unwrap_or(defaults.persist_timeout);
        let shutdown_grace = parsed(&lookup, "SHUTDOWN_GRACE_SECS")
            .map(Duration::from_secs)
            .unwrap_or(defaults.shutdown_grace);

        Ok(Self {
            listen_addr,
            device,
            threads,
            memory_limit,
            enable_auth,
            api_key,
            hub_registry,
            engine_url,
            default_max_tokens,
            request_timeout,
            persist_timeout,
            shutdown_grace,
        })
    }
}

fn parsed<F, T>(lookup: &F, key: &str) -> Option<T>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    lookup(key).and_then(|v| v.trim().parse().ok())
}
