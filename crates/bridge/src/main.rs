use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use bridge::config::BridgeConfig;
use bridge::engine::{DeploymentOverrides, GitRepoSpec, ReconcileEngine, SyncOutcome};
use bridge::server;

#[derive(Debug, Parser)]
#[command(name = "bridge")]
#[command(about = "TenantBridge reconciliation service")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the HTTP API and the periodic sync scheduler.
    Serve,
    /// Reconcile every tenant once.
    SyncAll,
    /// Reconcile a single tenant.
    SyncTenant {
        #[arg(long)]
        tenant_id: String,
    },
    /// Reconcile environment variables for one tenant, or all of them.
    SyncEnv {
        #[arg(long)]
        tenant_id: Option<String>,
    },
    /// Sync deployment history for one tenant, or all eligible tenants.
    SyncDeployments {
        #[arg(long)]
        tenant_id: Option<String>,
    },
    /// Cancel a tenant's in-flight deployments.
    CancelDeployments {
        #[arg(long)]
        tenant_id: String,
    },
    /// Create a draft tenant.
    CreateTenant {
        #[arg(long)]
        name: String,
        /// Git repository as an owner/name slug.
        #[arg(long)]
        repo: Option<String>,
        #[arg(long)]
        branch: Option<String>,
    },
    /// Approve a tenant, creating or connecting its remote project.
    ApproveTenant {
        #[arg(long)]
        tenant_id: String,
    },
    /// Trigger a deployment for a tenant.
    CreateDeployment {
        #[arg(long)]
        tenant_id: String,
        #[arg(long)]
        target: Option<String>,
        #[arg(long)]
        branch: Option<String>,
    },
    /// Delete a tenant (drafts, or deactivated approved tenants).
    DeleteTenant {
        #[arg(long)]
        tenant_id: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = BridgeConfig::load()?;

    if matches!(cli.command, Command::Serve) {
        return server::run(&config).await;
    }

    let engine = ReconcileEngine::from_config(&config).await?;
    run_command(&engine, cli.command).await
}

async fn run_command(engine: &ReconcileEngine, command: Command) -> Result<()> {
    match command {
        Command::Serve => unreachable!("handled before engine construction"),
        Command::SyncAll => print_outcome(&engine.sync_all_tenants().await?),
        Command::SyncTenant { tenant_id } => print_outcome(&engine.sync_tenant(&tenant_id).await?),
        Command::SyncEnv { tenant_id } => {
            print_outcome(&engine.sync_env_vars(tenant_id.as_deref()).await?)
        }
        Command::SyncDeployments { tenant_id } => {
            print_outcome(&engine.sync_deployments(tenant_id.as_deref()).await?)
        }
        Command::CancelDeployments { tenant_id } => {
            print_outcome(&engine.cancel_deployments(&tenant_id).await?)
        }
        Command::CreateTenant { name, repo, branch } => {
            let git_repo = parse_repo_slug(repo.as_deref(), branch)?;
            let tenant = engine.create_tenant(&name, git_repo).await?;
            println!("{}", tenant.id);
            Ok(())
        }
        Command::ApproveTenant { tenant_id } => {
            let tenant = engine.approve_tenant(&tenant_id).await?;
            println!(
                "{} -> {}",
                tenant.id,
                tenant.remote_project_id.unwrap_or_default()
            );
            Ok(())
        }
        Command::CreateDeployment {
            tenant_id,
            target,
            branch,
        } => {
            let deployment = engine
                .create_deployment(
                    &tenant_id,
                    Some(DeploymentOverrides {
                        target,
                        git_branch: branch,
                    }),
                )
                .await?;
            println!("{}", deployment.id);
            Ok(())
        }
        Command::DeleteTenant { tenant_id } => {
            print_outcome(&engine.delete_tenant(&tenant_id).await?)
        }
    }
}

fn print_outcome(outcome: &SyncOutcome) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(outcome)?);
    Ok(())
}

fn parse_repo_slug(repo: Option<&str>, branch: Option<String>) -> Result<Option<GitRepoSpec>> {
    let Some(repo) = repo else {
        return Ok(None);
    };

    let (owner, name) = repo
        .split_once('/')
        .context("repository must be an owner/name slug")?;

    Ok(Some(GitRepoSpec {
        owner: owner.to_string(),
        name: name.to_string(),
        branch,
    }))
}
