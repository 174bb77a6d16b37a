use anyhow::Result;
use clap::{Parser, Subcommand};
use ploinky_router::config::{ENV_CLIENT_ID, ENV_CLIENT_SECRET, ENV_ROUTER_PORT, ENV_ROUTER_URL};
use ploinky_router::{AgentManifest, AgentRuntime, AgentTokenClient, RouterConfig, create_router};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{Level, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "ploinky-router")]
#[command(about = "MCP routing plane for a workspace of containerized agents")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the routing server
    Serve {
        /// Listen port (overrides the routing file)
        #[arg(short, long, env = ENV_ROUTER_PORT)]
        port: Option<u16>,
        /// Workspace directory holding `.ploinky/`
        #[arg(long, default_value = ".")]
        workspace: PathBuf,
        /// Explicit routing file (default: <workspace>/.ploinky/routing.json)
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// Run one agent runtime from a manifest
    Agent {
        /// Bind address, e.g. 127.0.0.1:7001
        #[arg(long, default_value = "127.0.0.1:7001")]
        bind: String,
        /// Agent manifest file; omitted runs the built-in demo agent
        #[arg(long)]
        manifest: Option<PathBuf>,
        /// Workspace directory for durable task snapshots
        #[arg(long, default_value = ".")]
        workspace: PathBuf,
    },
    /// Mint an agent-to-agent token against a running router and print it
    MintToken {
        #[arg(long, env = ENV_ROUTER_URL)]
        router_url: String,
        #[arg(long, env = ENV_CLIENT_ID)]
        client_id: String,
        #[arg(long, env = ENV_CLIENT_SECRET)]
        client_secret: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env().add_directive("ploinky_router=info".parse()?),
        )
        .with_max_level(Level::INFO)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Serve {
            port,
            workspace,
            config,
        } => {
            let mut config = RouterConfig::load(&workspace, config.as_deref())?;
            if let Some(port) = port {
                config.port = port;
            }
            let bind = format!("0.0.0.0:{}", config.port);
            info!(
                agents = config.routes.len(),
                workspace = %workspace.display(),
                "starting routing server"
            );

            let (_state, app) = create_router(config);
            let listener = tokio::net::TcpListener::bind(&bind).await?;
            info!("routing server listening on http://{bind}");
            axum::serve(listener, app).await?;
        }
        Commands::Agent {
            bind,
            manifest,
            workspace,
        } => {
            let manifest = match manifest {
                Some(path) => AgentManifest::load(&path)?,
                None => {
                    info!("no manifest given, serving the built-in demo agent");
                    AgentManifest::demo("demo")
                }
            };

            let runtime = Arc::new(AgentRuntime::new(manifest, &workspace));
            runtime.initialize().await?;

            let listener = tokio::net::TcpListener::bind(&bind).await?;
            ploinky_router::agent::serve(runtime, listener).await?;
        }
        Commands::MintToken {
            router_url,
            client_id,
            client_secret,
        } => {
            let client = AgentTokenClient::new(&router_url, &client_id, &client_secret)?;
            let token = client.get().await?;
            println!("{token}");
        }
    }

    Ok(())
}
