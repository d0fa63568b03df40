use anyhow::{Context, Result};
use dialoguer::{Input, Password};
use std::sync::Arc;
use std::time::Duration;

use auth_relay::auth::{AuthManager, CredentialReader, SessionState};
use auth_relay::config::{Command, Config, DebugMode};
use auth_relay::interception;
use auth_relay::middleware::NetworkLogger;
use auth_relay::routes::{self, AppState};
use auth_relay::transport::{self, redact, Transport};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration first (for log level)
    let (config, command) = Config::load()?;
    config.validate(&command)?;

    // Initialize logging with a configured level
    let log_level = config.log_level.to_lowercase();
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&log_level));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(true)
        .with_line_number(true)
        .init();

    tracing::debug!("Debug mode: {:?}", config.debug_mode);

    // Shared HTTP client; the network logger wraps it when debugging
    let client = transport::build_client(
        config.http_max_connections,
        config.http_connect_timeout,
        config.http_request_timeout,
        config.include_credentials,
    )?;
    let original: Arc<dyn Transport> = match config.debug_mode {
        DebugMode::Off => Arc::new(client),
        mode => Arc::new(NetworkLogger::new(client, mode)),
    };
    tracing::info!("✅ HTTP client initialized with connection pooling");

    let auth_manager = Arc::new(AuthManager::open(
        &config.credentials_db_file,
        original.clone(),
        config.auth_base_url()?,
        Duration::from_secs(config.logout_timeout),
    )?);

    match command {
        Command::Serve => serve(config, auth_manager, original).await,
        Command::Login { username, password } => login(&auth_manager, username, password).await,
        Command::Logout => {
            auth_manager.logout().await;
            println!("Signed out.");
            Ok(())
        }
        Command::Status => {
            let status = auth_manager.restore().await;
            println!("{}", serde_json::to_string_pretty(&status)?);
            Ok(())
        }
    }
}

/// Run the gateway until a shutdown signal arrives
async fn serve(
    config: Config,
    auth_manager: Arc<AuthManager>,
    original: Arc<dyn Transport>,
) -> Result<()> {
    tracing::info!("🚀 Auth Relay starting...");
    tracing::info!(
        "Server configured: {}:{}",
        config.server_host,
        config.server_port
    );

    // Restore the stored session before accepting traffic
    tracing::info!("Restoring session...");
    let status = auth_manager.restore().await;
    match status.user {
        Some(ref user) if status.is_authenticated => {
            tracing::info!("✅ Session restored for {}", user.username);
        }
        _ => {
            tracing::warn!(
                "No active session; protected requests are sent without credentials until login"
            );
        }
    }

    let executor = Arc::new(auth_manager.executor(original.clone()));
    let layer = interception::install(original, executor, config.matcher());
    tracing::info!("✅ Request interception installed");

    spawn_session_watchers(&auth_manager);

    let app_state = AppState {
        auth_manager: auth_manager.clone(),
        layer,
        upstream_url: config.upstream_url()?,
        relay_api_key: config.relay_api_key()?,
    };

    // Build the application with routes and middleware
    let app = routes::build_app(app_state);

    // Bind to configured host and port
    let addr = format!("{}:{}", config.server_host, config.server_port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;

    // Print startup banner
    print_startup_banner(&config);

    // Start server with graceful shutdown
    tracing::info!("🚀 Server listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("👋 Server shutdown complete");

    Ok(())
}

/// Sign in from the command line, prompting for missing values
async fn login(
    auth_manager: &AuthManager,
    username: Option<String>,
    password: Option<String>,
) -> Result<()> {
    let username = match username {
        Some(username) => username,
        None => Input::<String>::new()
            .with_prompt("Username")
            .interact_text()
            .context("Failed to read username")?,
    };

    let password = match password {
        Some(password) => password,
        None => Password::new()
            .with_prompt("Password")
            .interact()
            .context("Failed to read password")?,
    };

    let user = auth_manager.login(&username, &password).await?;
    println!("✅ Signed in as {}", user.username);
    Ok(())
}

/// Log session and token changes for the lifetime of the server
fn spawn_session_watchers(auth_manager: &Arc<AuthManager>) {
    let mut states = auth_manager.subscribe();
    tokio::spawn(async move {
        while states.changed().await.is_ok() {
            let state = *states.borrow_and_update();
            if state == SessionState::Unauthenticated {
                tracing::warn!("Session ended; sign in again to restore access");
            } else {
                tracing::debug!(?state, "Session state");
            }
        }
    });

    let mut tokens = auth_manager.credentials().subscribe();
    tokio::spawn(async move {
        while tokens.changed().await.is_ok() {
            match tokens.borrow_and_update().as_deref() {
                Some(token) => tracing::info!("Access token updated: {}", redact(token)),
                None => tracing::info!("Access token cleared"),
            }
        }
    });
}

/// Print startup banner
fn print_startup_banner(config: &Config) {
    let banner = r#"
╔═══════════════════════════════════════════════════════════╗
║                                                           ║
║                     🔐 Auth Relay                         ║
║                                                           ║
║  Bearer tokens with single-flight refresh for any client  ║
║                                                           ║
╚═══════════════════════════════════════════════════════════╝
"#;

    println!("{}", banner);
    println!("  Version:     {}", env!("CARGO_PKG_VERSION"));
    println!(
        "  Server:      http://{}:{}",
        config.server_host, config.server_port
    );
    if let Some(upstream) = &config.upstream_url {
        println!("  Upstream:    {}", upstream);
    }
    println!("  Credentials: {}", config.credentials_db_file.display());
    println!("  Intercept:   {}", config.intercept_paths.join(", "));
    println!("  Debug Mode:  {:?}", config.debug_mode);
    println!("  Log Level:   {}", config.log_level);
    println!();
}

/// Handle graceful shutdown signal
async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install signal handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C signal, initiating graceful shutdown...");
        },
        _ = terminate => {
            tracing::info!("Received terminate signal, initiating graceful shutdown...");
        },
    }
}
