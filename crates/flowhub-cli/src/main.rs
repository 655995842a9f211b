//! Flowhub CLI - inspect and drive workflow-automation platforms

use clap::{Parser, Subcommand};
use flowhub_core::adapters::{PlatformAdapter, create_adapter};
use flowhub_core::config::Config;
use flowhub_core::events::EventCallback;
use flowhub_core::models::{Event, HealthState};
use futures_util::future::join_all;
use serde::Serialize;
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "flowhub")]
#[command(author, version, about = "Workflow-automation platform adapters", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Output format (text or json)
    #[arg(long, global = true, default_value = "text")]
    format: OutputFormat,

    /// Quiet mode (minimal output)
    #[arg(short, long, global = true)]
    quiet: bool,
}

#[derive(Clone, Copy, Default, PartialEq, Eq, Debug, clap::ValueEnum)]
enum OutputFormat {
    #[default]
    Text,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// List configured platforms
    Platforms,

    /// Authenticate and probe a platform
    Connect {
        /// Platform id from the config file
        platform: String,
    },

    /// List a platform's agents
    Discover { platform: String },

    /// Show one agent
    Status {
        platform: String,
        /// Agent id (canonical or native)
        agent: String,
    },

    /// Trigger an agent run
    Execute {
        platform: String,
        agent: String,
        /// JSON input passed to the run
        #[arg(short, long, default_value = "{}")]
        input: String,
    },

    /// Check platform health (all platforms when omitted)
    Health { platform: Option<String> },

    /// Stream execution events until Ctrl-C
    Watch { platform: String },

    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Show config file path
    Path,
    /// Print the configuration
    Show,
}

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    let filter = tracing_subscriber::EnvFilter::from_default_env();
    let filter = match "flowhub=info".parse() {
        Ok(directive) => filter.add_directive(directive),
        Err(_) => filter,
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    if let Err(err) = run(cli).await {
        eprintln!("Error: {:#}", err);
        if let Some(suggestion) = err
            .downcast_ref::<flowhub_core::Error>()
            .and_then(|e| e.suggestion())
        {
            eprintln!("Hint: {}", suggestion);
        }
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let out = Output {
        format: cli.format,
        quiet: cli.quiet,
    };

    match cli.command {
        Commands::Platforms => cmd_platforms(out),
        Commands::Connect { platform } => cmd_connect(&platform, out).await,
        Commands::Discover { platform } => cmd_discover(&platform, out).await,
        Commands::Status { platform, agent } => cmd_status(&platform, &agent, out).await,
        Commands::Execute {
            platform,
            agent,
            input,
        } => cmd_execute(&platform, &agent, &input, out).await,
        Commands::Health { platform } => cmd_health(platform.as_deref(), out).await,
        Commands::Watch { platform } => cmd_watch(&platform, out).await,
        Commands::Config { action } => cmd_config(action, out),
    }
}

#[derive(Clone, Copy)]
struct Output {
    format: OutputFormat,
    quiet: bool,
}

impl Output {
    fn json(&self) -> bool {
        self.format == OutputFormat::Json
    }

    fn print_json<T: Serialize>(&self, value: &T) -> anyhow::Result<()> {
        println!("{}", serde_json::to_string_pretty(value)?);
        Ok(())
    }
}

fn open_adapter(platform: &str) -> anyhow::Result<Box<dyn PlatformAdapter>> {
    let config = Config::load()?.platform(platform)?;
    Ok(create_adapter(config)?)
}

// ============================================================================
// Command Implementations
// ============================================================================

fn cmd_platforms(out: Output) -> anyhow::Result<()> {
    let config = Config::load()?;

    if out.json() {
        let rows: Vec<_> = config
            .platforms
            .iter()
            .map(|p| {
                serde_json::json!({
                    "id": p.id,
                    "name": p.name,
                    "type": p.platform_type,
                    "baseUrl": p.base_url,
                })
            })
            .collect();
        return out.print_json(&rows);
    }

    if config.platforms.is_empty() {
        if !out.quiet {
            println!("No platforms configured.");
            println!("Add [[platforms]] entries to {}", Config::config_path()?.display());
        }
        return Ok(());
    }

    for p in &config.platforms {
        println!("{:<20} {:<8} {}", p.id, p.platform_type, p.base_url);
    }
    Ok(())
}

async fn cmd_connect(platform: &str, out: Output) -> anyhow::Result<()> {
    let adapter = open_adapter(platform)?;
    let status = adapter.connect().await;
    adapter.disconnect().await;

    if out.json() {
        out.print_json(&status)?;
    } else if status.connected {
        println!("[OK] {}: connected", platform);
    } else {
        println!(
            "[!!] {}: not connected - {}",
            platform,
            status.error.as_deref().unwrap_or("unknown error")
        );
    }

    if !status.connected {
        anyhow::bail!("Could not connect to platform '{}'", platform);
    }
    Ok(())
}

async fn cmd_discover(platform: &str, out: Output) -> anyhow::Result<()> {
    let adapter = open_adapter(platform)?;
    let agents = adapter.discover_agents().await?;
    info!(platform, count = agents.len(), "Discovery complete");

    if out.json() {
        return out.print_json(&agents);
    }

    if agents.is_empty() {
        if !out.quiet {
            println!("No agents found on '{}'.", platform);
        }
        return Ok(());
    }

    for agent in &agents {
        println!("{:<24} {:<12} {}", agent.id, agent.status, agent.name);
        if !out.quiet && !agent.capabilities.is_empty() {
            let caps: Vec<&str> = agent.capabilities.iter().map(String::as_str).collect();
            println!("    capabilities: {}", caps.join(", "));
        }
    }
    Ok(())
}

async fn cmd_status(platform: &str, agent_id: &str, out: Output) -> anyhow::Result<()> {
    let adapter = open_adapter(platform)?;
    let agent = adapter.get_agent_status(agent_id).await?;

    if out.json() {
        return out.print_json(&agent);
    }

    println!("{} ({})", agent.name, agent.id);
    println!("  status:   {}", agent.status);
    println!(
        "  health:   {} ({}ms)",
        agent.health_status.status, agent.health_status.response_time
    );
    if !out.quiet {
        for (key, value) in &agent.configuration {
            println!("  {}: {}", key, value);
        }
    }
    Ok(())
}

async fn cmd_execute(platform: &str, agent_id: &str, input: &str, out: Output) -> anyhow::Result<()> {
    let input: serde_json::Value = serde_json::from_str(input)
        .map_err(|e| anyhow::anyhow!("--input must be valid JSON: {}", e))?;

    let adapter = open_adapter(platform)?;
    let result = adapter.execute_agent(agent_id, input).await?;

    if out.json() {
        return out.print_json(&result);
    }

    match &result.execution {
        Some(execution) => println!(
            "[OK] Execution {} on {}: {}",
            execution.id, execution.agent_id, execution.status
        ),
        None => println!("[OK] Triggered {}", agent_id),
    }
    if let Some(error) = &result.error {
        println!("[!!] {}", error);
    }
    Ok(())
}

async fn cmd_health(platform: Option<&str>, out: Output) -> anyhow::Result<()> {
    let config = Config::load()?;
    let ids: Vec<String> = match platform {
        Some(id) => vec![id.to_string()],
        None => config.platforms.iter().map(|p| p.id.clone()).collect(),
    };

    if ids.is_empty() {
        if !out.quiet {
            println!("No platforms configured.");
        }
        return Ok(());
    }

    let checks = ids.iter().map(|id| {
        let config = &config;
        async move {
            let adapter = match config.platform(id).and_then(|c| Ok(create_adapter(c)?)) {
                Ok(adapter) => adapter,
                Err(e) => return (id.clone(), Err(e)),
            };
            let result = adapter.health_check().await;
            adapter.disconnect().await;
            (id.clone(), Ok(result))
        }
    });
    let results = join_all(checks).await;

    let mut all_ok = true;
    let mut report = Vec::new();
    for (id, result) in results {
        match result {
            Ok(health) => {
                all_ok &= health.status != HealthState::Unhealthy;
                if !out.json() {
                    let tag = match health.status {
                        HealthState::Healthy => "[OK]",
                        HealthState::Degraded => "[~~]",
                        HealthState::Unhealthy => "[!!]",
                    };
                    print!("{} {}: {} ({}ms)", tag, id, health.status, health.response_time);
                    match &health.error {
                        Some(error) => println!(" - {}", error),
                        None => println!(),
                    }
                }
                report.push(serde_json::json!({ "platform": id, "health": health }));
            }
            Err(e) => {
                all_ok = false;
                warn!(platform = %id, error = %e, "Health check could not run");
                if !out.json() {
                    println!("[!!] {}: {:#}", id, e);
                }
                report.push(serde_json::json!({ "platform": id, "error": format!("{:#}", e) }));
            }
        }
    }

    if out.json() {
        out.print_json(&report)?;
    } else if !out.quiet {
        println!();
        if all_ok {
            println!("All platforms healthy.");
        } else {
            println!("Some platforms need attention.");
        }
    }
    Ok(())
}

async fn cmd_watch(platform: &str, out: Output) -> anyhow::Result<()> {
    let adapter = open_adapter(platform)?;
    let status = adapter.connect().await;
    if !status.connected {
        anyhow::bail!(
            "Could not connect to platform '{}': {}",
            platform,
            status.error.unwrap_or_default()
        );
    }

    let json = out.json();
    let callback: EventCallback = Arc::new(move |event: &Event| {
        if json {
            match serde_json::to_string(event) {
                Ok(line) => println!("{}", line),
                Err(e) => warn!(error = %e, "Failed to serialize event"),
            }
        } else {
            println!(
                "{} {:?} {} {}",
                event.timestamp.format("%Y-%m-%d %H:%M:%S"),
                event.event_type,
                event.agent_id,
                event.payload.get("id").and_then(|v| v.as_str()).unwrap_or("")
            );
        }
    });

    let subscription = adapter.subscribe_to_events(callback)?;
    if !out.quiet && !json {
        println!("Watching '{}' for events. Press Ctrl-C to stop.", platform);
    }

    tokio::signal::ctrl_c().await?;

    adapter.unsubscribe_from_events(subscription);
    adapter.disconnect().await;
    if !out.quiet && !json {
        println!("Stopped.");
    }
    Ok(())
}

fn cmd_config(action: ConfigAction, out: Output) -> anyhow::Result<()> {
    match action {
        ConfigAction::Path => {
            let path = Config::config_path()?;
            println!("{}", path.display());
        }
        ConfigAction::Show => {
            let config = Config::load()?;
            if out.json() {
                out.print_json(&config)?;
            } else {
                print!("{}", toml::to_string_pretty(&config)?);
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_execute_parses_input() {
        let cli = Cli::try_parse_from([
            "flowhub", "execute", "n8n-prod", "n8n_17", "--input", r#"{"a":1}"#,
        ])
        .unwrap();
        match cli.command {
            Commands::Execute {
                platform,
                agent,
                input,
            } => {
                assert_eq!(platform, "n8n-prod");
                assert_eq!(agent, "n8n_17");
                assert_eq!(input, r#"{"a":1}"#);
            }
            _ => panic!("expected execute"),
        }
    }

    #[test]
    fn test_global_flags() {
        let cli = Cli::try_parse_from(["flowhub", "health", "--format", "json", "-q"]).unwrap();
        assert_eq!(cli.format, OutputFormat::Json);
        assert!(cli.quiet);
        assert!(matches!(cli.command, Commands::Health { platform: None }));
    }
}
