//! Command-line client for the continuity management API.

use clap::{Parser, Subcommand};
use continuity::api::{
    AddServerRequest, CreatePoolRequest, PoolResponse, ServerHostResponse, TransactionRequest,
    UpdatePoolRequest,
};
use continuity::backend::Condition;
use continuity::client::{ClientConfig, ControlClient};
use std::path::PathBuf;
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "continuityctl", version, about = "continuity management client")]
struct Cli {
    /// Client configuration file path
    #[arg(short, long, global = true, default_value = "client.yaml")]
    file: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Write a sample client configuration file
    SampleConfig,
    /// Manage load balancer pools
    #[command(subcommand)]
    Pool(PoolCommand),
    /// Manage servers within a pool
    #[command(subcommand)]
    Server(ServerCommand),
    /// Replace a server through a health-guarded swap
    #[command(subcommand)]
    Transaction(TransactionCommand),
}

#[derive(Subcommand)]
enum PoolCommand {
    /// Create a pool
    Add {
        hostname: String,
        /// Health check interval in seconds
        #[arg(long, default_value_t = 10)]
        interval: u64,
        /// Grace period for new servers in seconds
        #[arg(long, default_value_t = 10)]
        initial_delay: u64,
        /// Health check timeout in seconds
        #[arg(long, default_value_t = 5)]
        timeout: u64,
        /// Consecutive successes before a server turns healthy
        #[arg(long, default_value_t = 3)]
        num_ok: u32,
        /// Consecutive failures before a server turns unhealthy
        #[arg(long, default_value_t = 3)]
        num_fail: u32,
        /// Enable sticky sessions
        #[arg(long)]
        sticky: bool,
        /// Sticky method: IP, AppCookie or LBCookie
        #[arg(long, default_value = "")]
        sticky_method: String,
        /// Sticky session lifetime in seconds
        #[arg(long, default_value_t = 0)]
        sticky_timeout: u64,
        /// Application cookie name (AppCookie method only)
        #[arg(long, default_value = "")]
        cookie_name: String,
    },
    /// Delete a pool
    Del { hostname: String },
    /// List configured pools
    List,
    /// Show a pool's configuration and servers
    Show {
        hostname: String,
        /// Print the raw JSON response
        #[arg(long)]
        json: bool,
    },
    /// Show per-server response counters
    Stats { hostname: String },
    /// Update health-check parameters; zero leaves a field unchanged
    Update {
        hostname: String,
        #[arg(long, default_value_t = 0)]
        interval: u64,
        #[arg(long, default_value_t = 0)]
        initial_delay: u64,
        #[arg(long, default_value_t = 0)]
        timeout: u64,
        #[arg(long, default_value_t = 0)]
        num_ok: u32,
        #[arg(long, default_value_t = 0)]
        num_fail: u32,
    },
}

#[derive(Subcommand)]
enum ServerCommand {
    /// Add a server to a pool
    Add {
        hostname: String,
        /// Upstream address, e.g. http://10.0.0.2:8080
        address: String,
        #[arg(long)]
        health_check_path: String,
        /// Selection condition in header=value form
        #[arg(long)]
        condition: Option<String>,
    },
    /// Remove a server from a pool
    Del { hostname: String, id: Uuid },
}

#[derive(Subcommand)]
enum TransactionCommand {
    /// Add a server and remove the old one once the new one is healthy
    Add {
        hostname: String,
        address: String,
        #[arg(long)]
        health_check_path: String,
        #[arg(long)]
        condition: Option<String>,
        /// Server to remove when the new one passes health checks
        #[arg(long)]
        old_server: Uuid,
    },
    /// Query a transaction's outcome
    Status { id: Uuid },
}

#[tokio::main]
async fn main() {
    if let Err(e) = run(Cli::parse()).await {
        eprintln!("error: {e:#}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    if matches!(cli.command, Command::SampleConfig) {
        ClientConfig::write_sample(&cli.file)?;
        println!("sample configuration written to {}", cli.file.display());
        return Ok(());
    }

    let config = ClientConfig::load(&cli.file)?;
    let client = ControlClient::new(&config)?;
    client.check_version().await?;

    match cli.command {
        Command::SampleConfig => unreachable!("handled above"),
        Command::Pool(command) => pool_command(&client, command).await,
        Command::Server(command) => server_command(&client, command).await,
        Command::Transaction(command) => transaction_command(&client, command).await,
    }
}

fn parse_condition(condition: Option<String>) -> anyhow::Result<Option<Condition>> {
    condition
        .map(|raw| Condition::parse(&raw))
        .transpose()
        .map_err(Into::into)
}

async fn pool_command(client: &ControlClient, command: PoolCommand) -> anyhow::Result<()> {
    match command {
        PoolCommand::Add {
            hostname,
            interval,
            initial_delay,
            timeout,
            num_ok,
            num_fail,
            sticky,
            sticky_method,
            sticky_timeout,
            cookie_name,
        } => {
            client
                .create_pool(&CreatePoolRequest {
                    hostname: hostname.clone(),
                    health_check_interval: interval,
                    health_check_initial_delay: initial_delay,
                    health_check_timeout: timeout,
                    health_check_num_ok: num_ok,
                    health_check_num_fail: num_fail,
                    sticky_sessions: sticky,
                    sticky_method,
                    sticky_session_timeout: sticky_timeout,
                    sticky_session_cookie_name: cookie_name,
                })
                .await?;
            println!("pool added for {hostname}");
        }
        PoolCommand::Del { hostname } => {
            client.delete_pool(&hostname).await?;
            println!("pool {hostname} removed");
        }
        PoolCommand::List => {
            println!("Configured pools:");
            for hostname in client.list_pools().await? {
                println!("  - {hostname}");
            }
        }
        PoolCommand::Show { hostname, json } => {
            let pool = client.get_pool(&hostname).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&pool)?);
            } else {
                print_pool(&pool);
            }
        }
        PoolCommand::Stats { hostname } => {
            let stats = client.pool_stats(&hostname).await?;
            println!("Pool {hostname} stats:");
            for (address, counters) in &stats.stats {
                println!("  Server {address}:");
                println!("    TotalRequests: {}", counters.ok + counters.not_ok);
                println!("    SuccessfulRequests: {}", counters.ok);
                println!("    FailedRequests: {}", counters.not_ok);
            }
        }
        PoolCommand::Update {
            hostname,
            interval,
            initial_delay,
            timeout,
            num_ok,
            num_fail,
        } => {
            client
                .update_pool(
                    &hostname,
                    &UpdatePoolRequest {
                        health_check_interval: interval,
                        health_check_initial_delay: initial_delay,
                        health_check_timeout: timeout,
                        health_check_num_ok: num_ok,
                        health_check_num_fail: num_fail,
                    },
                )
                .await?;
            println!("pool {hostname} updated");
        }
    }
    Ok(())
}

async fn server_command(client: &ControlClient, command: ServerCommand) -> anyhow::Result<()> {
    match command {
        ServerCommand::Add {
            hostname,
            address,
            health_check_path,
            condition,
        } => {
            client
                .add_server(
                    &hostname,
                    &AddServerRequest {
                        new_server_address: address,
                        condition: parse_condition(condition)?,
                        health_check_path,
                    },
                )
                .await?;
            println!("server added to pool {hostname}");
        }
        ServerCommand::Del { hostname, id } => {
            client.remove_server(&hostname, id).await?;
            println!("server {id} removed from pool {hostname}");
        }
    }
    Ok(())
}

async fn transaction_command(
    client: &ControlClient,
    command: TransactionCommand,
) -> anyhow::Result<()> {
    match command {
        TransactionCommand::Add {
            hostname,
            address,
            health_check_path,
            condition,
            old_server,
        } => {
            let response = client
                .start_transaction(
                    &hostname,
                    &TransactionRequest {
                        new_server_address: address,
                        new_server_condition: parse_condition(condition)?,
                        new_server_health_check_path: health_check_path,
                        old_server_id: old_server.to_string(),
                    },
                )
                .await?;
            println!("transaction {} started", response.transaction_id);
            println!(
                "check progress with: continuityctl transaction status {}",
                response.transaction_id
            );
        }
        TransactionCommand::Status { id } => {
            let status = client.transaction_status(id).await?;
            println!("Transaction {}:", status.transaction_id);
            println!("  Completed: {}", status.completed);
            if let Some(completed_at) = status.completed_at {
                println!("  CompletedAt: {completed_at}");
            }
            match status.error {
                Some(error) => println!("  Result: failed - {error}"),
                None if status.completed => println!("  Result: ok"),
                None => {}
            }
        }
    }
    Ok(())
}

fn print_pool(pool: &PoolResponse) {
    println!("Pool {}:", pool.hostname);
    println!("  HealthCheckInterval={}s", pool.health_check_interval);
    println!(
        "  HealthCheckInitialDelay={}s",
        pool.health_check_initial_delay
    );
    println!("  HealthCheckTimeout={}s", pool.health_check_timeout);
    println!("  HealthCheckNumOk={}", pool.health_check_num_ok);
    println!("  HealthCheckNumFail={}", pool.health_check_num_fail);
    println!("  StickySessions={}", pool.sticky_sessions);
    if pool.sticky_sessions {
        println!(
            "  StickyMethod={}",
            pool.sticky_method.as_deref().unwrap_or("-")
        );
        println!("  StickySessionTimeout={}s", pool.sticky_session_timeout);
        println!(
            "  StickyCookieName={}",
            pool.sticky_cookie_name.as_deref().unwrap_or("-")
        );
    }
    if !pool.conditional_servers.is_empty() {
        println!("  Conditional servers:");
        for server in &pool.conditional_servers {
            print_server(server);
        }
    }
    if !pool.unconditional_servers.is_empty() {
        println!("  Unconditional servers:");
        for server in &pool.unconditional_servers {
            print_server(server);
        }
    }
    println!("  RequestCounter={}", pool.request_counter);
}

fn print_server(server: &ServerHostResponse) {
    let condition = server
        .condition
        .as_ref()
        .map(|c| c.to_string())
        .unwrap_or_else(|| "---".to_string());
    println!("    Server {}:", server.id);
    println!("      Address: {}", server.address);
    println!("      Condition: {condition}");
    println!("      Status: {}", server.status);
    println!("      HealthCheckPath: {}", server.health_check_path);
}
