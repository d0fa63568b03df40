use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use reqwest::Url;
use std::path::PathBuf;

use crate::interception::UrlMatcher;

/// Auth Relay - bearer-token relay with single-flight refresh
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct CliArgs {
    #[command(subcommand)]
    pub command: Option<Command>,

    /// Server host address
    #[arg(short = 'H', long, env = "SERVER_HOST", default_value = "127.0.0.1")]
    pub host: String,

    /// Server port
    #[arg(short, long, env = "SERVER_PORT", default_value = "8700")]
    pub port: u16,

    /// Upstream server receiving forwarded requests
    #[arg(short, long, env = "UPSTREAM_URL")]
    pub upstream: Option<String>,

    /// API key gateway clients must present (Bearer or x-api-key)
    #[arg(short = 'k', long, env = "RELAY_API_KEY")]
    pub api_key: Option<String>,

    /// Base URL of the auth endpoints (defaults to the upstream URL)
    #[arg(short, long, env = "AUTH_BASE_URL")]
    pub auth_base: Option<String>,

    /// Path to the credential SQLite database
    #[arg(short = 'd', long, env = "CREDENTIALS_DB_FILE")]
    pub db_file: Option<String>,

    /// Path fragments that get credentials attached (comma separated)
    #[arg(
        long,
        env = "INTERCEPT_PATHS",
        value_delimiter = ',',
        default_value = "/ai-assistant/,/api/"
    )]
    pub intercept_paths: Vec<String>,

    /// Path fragments that are never intercepted (comma separated)
    #[arg(
        long,
        env = "INTERCEPT_EXCLUDE",
        value_delimiter = ',',
        default_value = "/api/auth/"
    )]
    pub intercept_exclude: Vec<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Network debug logging (off, errors, all)
    #[arg(long, env = "DEBUG_MODE", default_value = "off")]
    pub debug_mode: String,

    /// HTTP request timeout in seconds
    #[arg(long, env = "HTTP_REQUEST_TIMEOUT", default_value = "60")]
    pub http_timeout: u64,

    /// Bound on the best-effort server logout, in seconds
    #[arg(long, env = "LOGOUT_TIMEOUT", default_value = "5")]
    pub logout_timeout: u64,

    /// Keep a cookie jar for intercepted requests
    #[arg(long, env = "INCLUDE_CREDENTIALS", default_value = "true", action = clap::ArgAction::Set)]
    pub include_credentials: bool,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Run the relay gateway (default)
    Serve,

    /// Sign in and store the credential pair
    Login {
        #[arg(long)]
        username: Option<String>,

        #[arg(long)]
        password: Option<String>,
    },

    /// Sign out and clear stored credentials
    Logout,

    /// Show the stored session
    Status,
}

#[derive(Clone, Debug)]
pub struct Config {
    // Server settings
    pub server_host: String,
    pub server_port: u16,

    // Endpoints
    pub upstream_url: Option<Url>,
    pub auth_base_url: Option<Url>,

    // Gateway authentication
    pub relay_api_key: Option<String>,

    // Credentials
    pub credentials_db_file: PathBuf,

    // Interception
    pub intercept_paths: Vec<String>,
    pub intercept_exclude: Vec<String>,
    pub include_credentials: bool,

    // Timeouts
    pub logout_timeout: u64,

    // HTTP client
    pub http_max_connections: usize,
    pub http_connect_timeout: u64,
    pub http_request_timeout: u64,

    // Debug
    pub debug_mode: DebugMode,
    pub log_level: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DebugMode {
    Off,
    Errors,
    All,
}

impl Config {
    /// Load configuration from all sources with priority: CLI > ENV > defaults
    pub fn load() -> Result<(Self, Command)> {
        // Load .env file if it exists
        dotenvy::dotenv().ok();

        Self::from_args(CliArgs::parse())
    }

    pub fn from_args(args: CliArgs) -> Result<(Self, Command)> {
        let upstream_url = args
            .upstream
            .as_deref()
            .map(|s| parse_url("UPSTREAM_URL", s))
            .transpose()?;

        let auth_base_url = args
            .auth_base
            .as_deref()
            .map(|s| parse_url("AUTH_BASE_URL", s))
            .transpose()?;

        let config = Config {
            server_host: args.host,
            server_port: args.port,

            upstream_url,
            auth_base_url,

            relay_api_key: args.api_key.filter(|k| !k.trim().is_empty()),

            credentials_db_file: args
                .db_file
                .map(|s| expand_tilde(&s))
                .unwrap_or_else(default_db_path),

            intercept_paths: args.intercept_paths,
            intercept_exclude: args.intercept_exclude,
            include_credentials: args.include_credentials,

            logout_timeout: args.logout_timeout,

            http_max_connections: std::env::var("HTTP_MAX_CONNECTIONS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(20),

            http_connect_timeout: std::env::var("HTTP_CONNECT_TIMEOUT")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(10),

            http_request_timeout: args.http_timeout,

            debug_mode: parse_debug_mode(&args.debug_mode),
            log_level: args.log_level,
        };

        Ok((config, args.command.unwrap_or(Command::Serve)))
    }

    /// Auth endpoints live under the explicit base URL, else under the upstream
    pub fn auth_base_url(&self) -> Result<Url> {
        self.auth_base_url
            .clone()
            .or_else(|| self.upstream_url.clone())
            .context("AUTH_BASE_URL or UPSTREAM_URL is required (use -a/-u or set the env var)")
    }

    /// Upstream URL, required when serving
    pub fn upstream_url(&self) -> Result<Url> {
        self.upstream_url
            .clone()
            .context("UPSTREAM_URL is required to serve (use -u or set UPSTREAM_URL env var)")
    }

    /// Gateway API key, required when serving
    pub fn relay_api_key(&self) -> Result<String> {
        self.relay_api_key
            .clone()
            .context("RELAY_API_KEY is required to serve (use -k or set RELAY_API_KEY env var)")
    }

    pub fn matcher(&self) -> UrlMatcher {
        UrlMatcher::new(
            self.intercept_paths.iter().cloned(),
            self.intercept_exclude.iter().cloned(),
        )
    }

    /// Validate configuration for the given command
    pub fn validate(&self, command: &Command) -> Result<()> {
        self.auth_base_url()?;

        if matches!(command, Command::Serve) {
            self.upstream_url()?;
            self.relay_api_key()?;

            if self.matcher().include().is_empty() {
                anyhow::bail!("INTERCEPT_PATHS must contain at least one path fragment");
            }
        }

        if self.http_request_timeout == 0 || self.http_connect_timeout == 0 {
            anyhow::bail!("HTTP timeouts must be greater than zero");
        }

        Ok(())
    }
}

fn parse_url(name: &str, value: &str) -> Result<Url> {
    let url = Url::parse(value.trim()).with_context(|| format!("{} is not a valid URL: {}", name, value))?;
    if !matches!(url.scheme(), "http" | "https") {
        anyhow::bail!("{} must be an http(s) URL: {}", name, value);
    }
    Ok(url)
}

/// `<data dir>/auth-relay/credentials.sqlite3`
fn default_db_path() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("auth-relay")
        .join("credentials.sqlite3")
}

/// Expand tilde (~) in file paths to user's home directory
fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}

/// Parse debug mode from string
fn parse_debug_mode(s: &str) -> DebugMode {
    match s.to_lowercase().as_str() {
        "errors" => DebugMode::Errors,
        "all" => DebugMode::All,
        _ => DebugMode::Off,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> (Config, Command) {
        let mut argv = vec!["auth-relay"];
        argv.extend_from_slice(args);
        Config::from_args(CliArgs::try_parse_from(argv).unwrap()).unwrap()
    }

    #[test]
    fn test_expand_tilde() {
        let path = expand_tilde("~/test/file.txt");
        assert!(path.to_string_lossy().contains("test/file.txt"));
        assert!(!path.to_string_lossy().starts_with("~"));

        let path = expand_tilde("/absolute/path");
        assert_eq!(path, PathBuf::from("/absolute/path"));

        // Just "~" without slash should not expand
        assert_eq!(expand_tilde("~"), PathBuf::from("~"));
    }

    #[test]
    fn test_parse_debug_mode() {
        assert_eq!(parse_debug_mode("off"), DebugMode::Off);
        assert_eq!(parse_debug_mode("ERRORS"), DebugMode::Errors);
        assert_eq!(parse_debug_mode("All"), DebugMode::All);
        assert_eq!(parse_debug_mode("invalid"), DebugMode::Off);
    }

    #[test]
    fn test_cli_overrides_and_subcommand() {
        let (config, command) = parse(&[
            "--upstream",
            "http://upstream.local:9000",
            "--port",
            "9100",
            "--intercept-paths",
            "/v1/,/graphql",
            "login",
            "--username",
            "alice",
        ]);

        assert_eq!(config.server_port, 9100);
        assert_eq!(config.intercept_paths, vec!["/v1/", "/graphql"]);
        assert_eq!(
            command,
            Command::Login {
                username: Some("alice".into()),
                password: None
            }
        );
        // Auth endpoints default to the upstream
        assert_eq!(
            config.auth_base_url().unwrap().as_str(),
            "http://upstream.local:9000/"
        );
    }

    #[test]
    fn test_explicit_auth_base() {
        let (config, command) = parse(&[
            "-u",
            "http://upstream.local",
            "-a",
            "https://auth.local",
            "--include-credentials",
            "false",
            "-k",
            "relay-secret",
        ]);

        assert_eq!(command, Command::Serve);
        assert_eq!(config.auth_base_url().unwrap().as_str(), "https://auth.local/");
        assert!(!config.include_credentials);
        assert_eq!(config.relay_api_key().unwrap(), "relay-secret");
        config.validate(&command).unwrap();
    }

    #[test]
    fn test_matcher_from_config() {
        let (config, _) = parse(&["-u", "http://upstream.local"]);
        let matcher = config.matcher();

        if std::env::var("INTERCEPT_PATHS").is_err() && std::env::var("INTERCEPT_EXCLUDE").is_err() {
            assert_eq!(matcher, UrlMatcher::default());
        }
    }

    #[test]
    fn test_rejects_bad_urls() {
        let args = CliArgs::try_parse_from(["auth-relay", "-u", "not a url"]).unwrap();
        assert!(Config::from_args(args).is_err());

        let args = CliArgs::try_parse_from(["auth-relay", "-u", "ftp://files.local"]).unwrap();
        assert!(Config::from_args(args).is_err());
    }

    #[test]
    fn test_validate_requires_upstream_for_serve() {
        let (mut config, _) = parse(&["-a", "http://auth.local"]);
        config.upstream_url = None;

        assert!(config.validate(&Command::Serve).is_err());
        assert!(config.validate(&Command::Status).is_ok());
    }

    #[test]
    fn test_validate_requires_api_key_for_serve() {
        let (mut config, _) = parse(&["-u", "http://upstream.local", "-k", "  "]);
        assert!(config.relay_api_key.is_none());
        assert!(config.validate(&Command::Serve).is_err());
        assert!(config.validate(&Command::Logout).is_ok());

        config.relay_api_key = Some("relay-secret".into());
        assert!(config.validate(&Command::Serve).is_ok());
    }

    #[test]
    fn test_validate_requires_intercept_paths() {
        let (mut config, command) = parse(&["-u", "http://upstream.local", "-k", "relay-secret"]);
        config.intercept_paths = vec![" ".into()];
        assert!(config.validate(&command).is_err());
    }
}
