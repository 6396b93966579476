use anyhow::{Context as _, Result, bail};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use rolegate::fixture::Fixture;
use rolegate::store::ContextProvider;
use rolegate::{
    AccountId, BaseRoleType, Collaborators, Context, EngineConfig, MemoryStore, OverrideChange,
    PermissionEngine, PluginRegistry, ResolveOptions, Role, RoleId,
};

#[derive(Parser)]
#[command(name = "rolegate")]
#[command(about = "Resolve role permissions across an account tree")]
#[command(version)]
struct Cli {
    /// Path to rolegate.toml engine configuration
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List permissions an administrator can manage at a context
    Permissions {
        /// Fixture file describing accounts, roles and overrides
        #[arg(short, long)]
        fixture: PathBuf,
        /// Context, e.g. account:2
        #[arg(long)]
        context: Context,
        /// Only permissions available to this base role type
        #[arg(long)]
        base: Option<BaseRoleType>,
        /// Print definitions as JSON
        #[arg(long)]
        json: bool,
    },
    /// Resolve one permission for a role at a context
    Resolve {
        #[arg(short, long)]
        fixture: PathBuf,
        /// Context, e.g. account:3 or course:12
        #[arg(long)]
        context: Context,
        #[arg(short, long)]
        permission: String,
        /// Role id
        #[arg(short, long)]
        role: u64,
        /// Where the role is held (defaults to the context)
        #[arg(long)]
        role_context: Option<Context>,
        /// Bypass every cache
        #[arg(long)]
        no_cache: bool,
    },
    /// Print where a permission applies from a context, as a scope list
    EnabledFor {
        #[arg(short, long)]
        fixture: PathBuf,
        #[arg(long)]
        context: Context,
        #[arg(short, long)]
        permission: String,
        #[arg(short, long)]
        role: u64,
    },
    /// Create, update or delete an override, then print the result
    Manage {
        #[arg(short, long)]
        fixture: PathBuf,
        /// Account holding the override
        #[arg(long)]
        account: u64,
        #[arg(short, long)]
        permission: String,
        #[arg(short, long)]
        role: u64,
        /// New enabled value
        #[arg(long)]
        enable: Option<bool>,
        /// New locked value
        #[arg(long)]
        lock: Option<bool>,
    },
}

struct Session {
    store: Arc<MemoryStore>,
    engine: PermissionEngine,
}

impl Session {
    async fn open(config: Option<&Path>, fixture: &Path) -> Result<Self> {
        let config = match config {
            Some(path) => EngineConfig::from_file(path)?,
            None => EngineConfig::default(),
        };
        let fixture = Fixture::from_file(fixture)?;

        let store = Arc::new(MemoryStore::new());
        let plugins = Arc::new(PluginRegistry::new());
        fixture.apply(&store, &plugins).await?;

        let engine = PermissionEngine::new(Collaborators::from_store(store.clone(), plugins), config);
        Ok(Self { store, engine })
    }

    async fn role(&self, id: u64) -> Result<Role> {
        self.store
            .role(RoleId(id))
            .await?
            .with_context(|| format!("Role {} is not defined in the fixture", id))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Permissions {
            fixture,
            context,
            base,
            json,
        } => {
            let session = Session::open(cli.config.as_deref(), &fixture).await?;
            let manageable = session.engine.manageable_permissions(context, base).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&manageable)?);
            } else if manageable.is_empty() {
                println!("No manageable permissions at {}", context);
            } else {
                for (key, definition) in &manageable {
                    println!("{:<36} {}", key, definition.label);
                }
            }
        }
        Commands::Resolve {
            fixture,
            context,
            permission,
            role,
            role_context,
            no_cache,
        } => {
            let session = Session::open(cli.config.as_deref(), &fixture).await?;
            let role = session.role(role).await?;
            let mut options = ResolveOptions::default();
            if let Some(role_context) = role_context {
                options = options.with_role_context(role_context);
            }
            if no_cache {
                options = options.uncached();
            }
            let resolved = session
                .engine
                .permission_for(context, &permission, &role, options)
                .await?;
            println!("{}", serde_json::to_string_pretty(&resolved)?);
        }
        Commands::EnabledFor {
            fixture,
            context,
            permission,
            role,
        } => {
            let session = Session::open(cli.config.as_deref(), &fixture).await?;
            let role = session.role(role).await?;
            let enabled = session.engine.enabled_for(context, &permission, &role).await?;
            println!("{}", serde_json::to_string(&enabled)?);
        }
        Commands::Manage {
            fixture,
            account,
            permission,
            role,
            enable,
            lock,
        } => {
            let session = Session::open(cli.config.as_deref(), &fixture).await?;
            let role = session.role(role).await?;
            if !session.engine.registry().contains(&permission) {
                bail!("Unknown permission '{}'", permission);
            }
            let result = session
                .engine
                .manage_override(
                    AccountId(account),
                    &role,
                    &permission,
                    OverrideChange::new(enable, lock),
                )
                .await?;
            match result {
                Some(role_override) => {
                    println!("{}", serde_json::to_string_pretty(&role_override)?)
                }
                None => println!("null"),
            }
        }
    }

    Ok(())
}
