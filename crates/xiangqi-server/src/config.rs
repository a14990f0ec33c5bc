use clap::Parser;

use xiangqi_engine::dispatch::DEFAULT_WORKERS;

const DEFAULT_PORT: u16 = 8080;
const DEFAULT_LOG_FILTER: &str = "info";

/// `server [port]` (§6). Positional `port` wins over `XIANGQI_PORT`, which
/// wins over the compiled-in default (§ "Configuration layering").
#[derive(Parser, Debug)]
#[command(name = "xiangqi-server", about = "Multiplayer Xiangqi server")]
struct Cli {
    /// TCP port to listen on. Falls back to XIANGQI_PORT, then 8080.
    port: Option<u16>,
}

/// The process's resolved startup configuration (§3 ServerConfig),
/// assembled once at boot from CLI/env/default precedence and shared
/// read-only thereafter.
#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub port: u16,
    pub worker_count: usize,
    pub engine_path: Option<String>,
    pub socket_buf: Option<usize>,
    pub log_filter: String,
}

impl ServerConfig {
    /// CLI argument > environment variable > compiled-in default, per
    /// field, matching the precedence the teacher's own binaries use for
    /// flag-vs-env resolution.
    pub fn resolve() -> Self {
        let cli = Cli::parse();

        let port = cli
            .port
            .or_else(|| std::env::var("XIANGQI_PORT").ok().and_then(|v| v.parse().ok()))
            .unwrap_or(DEFAULT_PORT);

        let worker_count = std::env::var("XIANGQI_WORKERS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_WORKERS);

        let engine_path = std::env::var("XIANGQI_ENGINE_PATH").ok();
        let socket_buf = std::env::var("XIANGQI_SOCKET_BUF").ok().and_then(|v| v.parse().ok());
        let log_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| DEFAULT_LOG_FILTER.to_owned());

        Self { port, worker_count, engine_path, socket_buf, log_filter }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_parses_bare_port() {
        let cli = Cli::try_parse_from(["xiangqi-server", "9001"]).unwrap();
        assert_eq!(cli.port, Some(9001));
    }

    #[test]
    fn cli_allows_no_port() {
        let cli = Cli::try_parse_from(["xiangqi-server"]).unwrap();
        assert_eq!(cli.port, None);
    }
}
