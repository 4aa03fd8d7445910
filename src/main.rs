use chat_relay::config::{
    DEFAULT_MODEL, DEFAULT_UPSTREAM_URL, OrchestratorConfig, ProxyConfig, RateLimitConfig,
    RegistryConfig, UpstreamConfig,
};
use chat_relay::logging::init_logging;
use chat_relay::{orchestrator, registry, server};
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(name = "chat-relay")]
#[command(about = "Chat completion proxy with SSE relay, service registry and dev orchestrator")]
#[command(long_about = r#"
chat-relay - Chat completion proxy with SSE relay, service registry and dev orchestrator

Examples:
  # Chat proxy in front of the upstream API
  OPENROUTER_API_KEY=sk-... chat-relay proxy --port 3001

  # Service registry persisting to ./service-registry.json
  chat-relay registry --port 3100

  # Bring up local services declared in a manifest
  chat-relay dev dev-services.json
"#)]
struct CliArgs {
    /// Log level (trace, debug, info, warn, error); RUST_LOG overrides it
    #[arg(long, env = "LOG_LEVEL", default_value = "info", global = true)]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the chat completion proxy
    Proxy(ProxyArgs),
    /// Run the service registry
    Registry(RegistryArgs),
    /// Run the dev process orchestrator with an operator console
    Dev(DevArgs),
}

#[derive(Args, Debug)]
struct ProxyArgs {
    /// Host address to bind the proxy
    #[arg(long, env = "HOST", default_value = "0.0.0.0")]
    host: String,

    /// Port number to bind the proxy
    #[arg(long, env = "PORT", default_value_t = 3001)]
    port: u16,

    /// Upstream API key; requests fail with a configuration error when absent
    #[arg(long, env = "OPENROUTER_API_KEY", hide_env_values = true)]
    api_key: Option<String>,

    /// Model used when a request does not name one
    #[arg(long, env = "AI_MODEL", default_value = DEFAULT_MODEL)]
    model: String,

    /// Upstream chat completion endpoint
    #[arg(long, env = "UPSTREAM_URL", default_value = DEFAULT_UPSTREAM_URL)]
    upstream_url: String,

    /// Sent upstream as HTTP-Referer
    #[arg(long, env = "APP_URL", default_value = "http://localhost:3000")]
    app_url: String,

    /// Sent upstream as X-Title
    #[arg(long, env = "APP_TITLE", default_value = "chat-relay")]
    app_title: String,

    /// Timeout in seconds for upstream requests
    #[arg(long, value_parser = clap::value_parser!(u64).range(1..), default_value_t = 600)]
    request_timeout_secs: u64,

    /// Rate limit window length in seconds
    #[arg(long, value_parser = clap::value_parser!(u64).range(1..), default_value_t = 900)]
    rate_limit_window_secs: u64,

    /// Requests allowed per client within one window
    #[arg(long, value_parser = clap::value_parser!(u32).range(1..), default_value_t = 50)]
    rate_limit_max_requests: u32,

    /// Maximum request body size in bytes
    #[arg(long, default_value_t = 1024 * 1024)]
    max_payload_size: usize,
}

impl ProxyArgs {
    fn into_config(self) -> ProxyConfig {
        ProxyConfig {
            host: self.host,
            port: self.port,
            max_payload_size: self.max_payload_size,
            upstream: UpstreamConfig {
                url: self.upstream_url,
                api_key: self.api_key.filter(|k| !k.is_empty()),
                model: self.model,
                referer: self.app_url,
                title: self.app_title,
                timeout_secs: self.request_timeout_secs,
            },
            rate_limit: RateLimitConfig {
                window_secs: self.rate_limit_window_secs,
                max_requests: self.rate_limit_max_requests,
            },
        }
    }
}

#[derive(Args, Debug)]
struct RegistryArgs {
    /// Host address to bind the registry
    #[arg(long, env = "HOST", default_value = "0.0.0.0")]
    host: String,

    /// Port number to bind the registry
    #[arg(long, env = "REGISTRY_PORT", default_value_t = 3100)]
    port: u16,

    /// JSON file the registry is persisted to
    #[arg(long, env = "REGISTRY_FILE", default_value = "service-registry.json")]
    state_file: PathBuf,

    /// Interval in seconds between background persists
    #[arg(long, value_parser = clap::value_parser!(u64).range(1..), default_value_t = 60)]
    persist_interval_secs: u64,

    /// Timeout in seconds for /services/health probes
    #[arg(long, value_parser = clap::value_parser!(u64).range(1..), default_value_t = 2)]
    health_timeout_secs: u64,
}

impl RegistryArgs {
    fn into_config(self) -> RegistryConfig {
        RegistryConfig {
            host: self.host,
            port: self.port,
            state_file: self.state_file,
            persist_interval_secs: self.persist_interval_secs,
            health_timeout_secs: self.health_timeout_secs,
        }
    }
}

#[derive(Args, Debug)]
struct DevArgs {
    /// JSON manifest declaring the services
    manifest: PathBuf,

    /// Seconds to wait after a graceful stop before killing a process
    #[arg(long, default_value_t = 5)]
    grace_period_secs: u64,

    /// Do not start every service at launch
    #[arg(long, default_value_t = false)]
    no_autostart: bool,
}

impl DevArgs {
    fn into_config(self) -> OrchestratorConfig {
        OrchestratorConfig {
            manifest: self.manifest,
            grace_period: Duration::from_secs(self.grace_period_secs),
            autostart: !self.no_autostart,
        }
    }
}

fn main() -> anyhow::Result<()> {
    let args = CliArgs::parse();
    let level = args.log_level.parse().unwrap_or_else(|_| {
        eprintln!("Unknown log level '{}', using info", args.log_level);
        log::LevelFilter::Info
    });
    init_logging(level);

    actix_web::rt::System::new().block_on(async move {
        match args.command {
            Command::Proxy(proxy) => server::startup(proxy.into_config()).await,
            Command::Registry(reg) => registry::server::startup(reg.into_config()).await,
            Command::Dev(dev) => orchestrator::run_dev(dev.into_config()).await,
        }
    })
}
