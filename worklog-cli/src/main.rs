use anyhow::{Context, Result};
use chrono::DateTime;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::info;
use worklog_auth::{
    load_config, ApiClient, AuthConfig, AuthError, Authenticator, Diagnostics, LifecycleManager,
    RefreshScheduler,
};

#[derive(Parser)]
#[command(name = "worklog-cli", about = "OAuth login and token upkeep for the worklog API")]
struct Cli {
    /// Path to a TOML config file
    #[arg(long, env = "WORKLOG_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Authorize in the browser and store credentials
    Login,
    /// Show authentication state
    Status {
        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },
    /// Refresh the access token now
    Refresh,
    /// Delete stored credentials
    Logout,
    /// Keep tokens fresh in the background until Ctrl-C
    Watch,
    /// GET a tenant API path and print the response
    Get {
        /// Path below the tenant, e.g. rest/api/3/myself
        path: String,
    },
}

impl Command {
    /// Commands that talk to the provider need client credentials
    fn needs_client(&self) -> bool {
        !matches!(self, Command::Status { .. } | Command::Logout)
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "worklog_auth=info,worklog_cli=info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    match run(Cli::parse()).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            match e.downcast_ref::<AuthError>() {
                Some(auth) => eprintln!("{}", auth.user_message()),
                None => eprintln!("Error: {:#}", e),
            }
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    let mut config = match &cli.config {
        Some(path) => load_config(path)?,
        None => AuthConfig::default(),
    };
    config.apply_env()?;
    if cli.command.needs_client() {
        config.validate()?;
    }

    info!(
        credentials_path = %config.storage.credentials_path.display(),
        "Configuration loaded"
    );

    let lifecycle = LifecycleManager::from_config(&config)?;

    match cli.command {
        Command::Login => login(&config, lifecycle).await,
        Command::Status { json } => status(&lifecycle, json),
        Command::Refresh => {
            lifecycle.refresh().await?;
            println!("Access token refreshed.");
            Ok(())
        }
        Command::Logout => {
            if lifecycle.logout()? {
                println!("Logged out. Stored credentials removed.");
            } else {
                println!("Not logged in.");
            }
            Ok(())
        }
        Command::Watch => watch(&config, lifecycle).await,
        Command::Get { path } => {
            let api = ApiClient::from_config(lifecycle, &config)?;
            let value = api.get(&path).await?;
            println!("{}", serde_json::to_string_pretty(&value)?);
            Ok(())
        }
    }
}

async fn login(config: &AuthConfig, lifecycle: LifecycleManager) -> Result<()> {
    let authenticator = Authenticator::new(&config.oauth, lifecycle);
    let record = authenticator
        .authenticate(|prompt| {
            println!("Open this URL in your browser to authorize:\n");
            println!("  {}\n", prompt.url);
            println!("Waiting for the redirect on http://{} ...", prompt.listening_on);
        })
        .await?;

    println!(
        "Logged in. Tenant: {}",
        record.tenant_id.as_deref().unwrap_or("-")
    );
    if record.refresh_token.is_none() {
        println!("No refresh token was issued; you will need to log in again when the token expires.");
    }
    Ok(())
}

fn status(lifecycle: &LifecycleManager, json: bool) -> Result<()> {
    let report = lifecycle.diagnostics()?;
    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    print_report(&report);
    Ok(())
}

fn print_report(report: &Diagnostics) {
    println!("State:          {}", report.state);
    println!(
        "Tenant:         {}",
        report.tenant_id.as_deref().unwrap_or("-")
    );
    if let Some(secs) = report.expires_in_secs {
        if secs > 0 {
            println!("Expires in:     {}", format_secs(secs));
        } else {
            println!("Expired:        {} ago", format_secs(-secs));
        }
    }
    println!(
        "Refresh token:  {}",
        if report.has_refresh_token { "present" } else { "absent" }
    );
    if let Some(age) = report.refresh_token_age_secs {
        println!("Token age:      {}", format_secs(age));
    }
    if let Some(at) = report.last_refresh_at {
        println!("Last refresh:   {}", format_timestamp(at));
    }
    if let Some(err) = &report.last_refresh_error {
        println!(
            "Last error:     {} ({}) at {}",
            err.message,
            err.kind,
            format_timestamp(err.at)
        );
    }
    if report.reauth_recommended {
        println!("\nRe-authentication recommended: run `worklog-cli login`.");
    }
}

async fn watch(config: &AuthConfig, lifecycle: LifecycleManager) -> Result<()> {
    let scheduler = RefreshScheduler::from_config(lifecycle, &config.refresh);
    scheduler.start();
    info!("Watching credentials, press Ctrl-C to stop");

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl_c signal")?;
    info!("Shutdown signal received");

    scheduler.stop();
    Ok(())
}

fn format_secs(secs: i64) -> String {
    let days = secs / 86_400;
    let hours = (secs % 86_400) / 3600;
    let minutes = (secs % 3600) / 60;
    if days > 0 {
        format!("{}d {}h", days, hours)
    } else if hours > 0 {
        format!("{}h {}m", hours, minutes)
    } else {
        format!("{}m {}s", minutes, secs % 60)
    }
}

fn format_timestamp(at: i64) -> String {
    DateTime::from_timestamp(at, 0)
        .map(|t| t.to_rfc3339())
        .unwrap_or_else(|| at.to_string())
}
