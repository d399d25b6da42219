mod asset;
mod changes;
mod config;
mod digest;
mod error;
mod local_index;
mod login;
mod logging;
mod pathutil;
mod project;
mod remote_project;
mod session;
mod token_store;
mod transfer;

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use config::{Config, ConfigOverrides};
use digest::Algorithm;
use project::Project;
use remote_project::RemoteProject;
use session::Session;
use token_store::TokenStore;

#[derive(Parser, Debug)]
#[command(name = "osfsync", version)]
struct Cli {
    /// Path to config file (default ~/.osfsync/config.json)
    #[arg(short = 'c', long = "config")]
    config: Option<PathBuf>,

    /// OSF API base URL override
    #[arg(long = "api-base")]
    api_base: Option<String>,

    /// Content digest algorithm: md5 or sha256
    #[arg(long = "hash")]
    hash: Option<String>,

    /// Transfer chunk size in bytes
    #[arg(long = "chunk-size")]
    chunk_size: Option<u64>,

    /// Per-user data directory override (default ~/.osfsync)
    #[arg(long = "datadir")]
    datadir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Log in to OSF, reusing a stored token when possible.
    Login {
        /// Account id to authenticate as / look up in the token store.
        #[arg(long = "account")]
        account_id: String,

        /// Suppress the "already logged in"/"logged in" banner.
        #[arg(short = 'q', long = "quiet", default_value_t = false)]
        quiet: bool,
    },

    /// Reconcile a local directory with a remote OSF project.
    Sync {
        /// Local root directory to sync.
        root: PathBuf,

        /// Remote OSF project (node) id.
        #[arg(long = "project")]
        project_id: String,

        /// Account id whose stored token authenticates the session.
        #[arg(long = "account")]
        account_id: String,

        /// Compute and print the change set without applying it.
        #[arg(long = "dry-run", default_value_t = false)]
        dry_run: bool,
    },

    /// Show the last-synced index summary for a project.
    Status {
        /// Remote OSF project (node) id.
        #[arg(long = "project")]
        project_id: String,

        /// Account id (only used to locate the right project file).
        #[arg(long = "account")]
        account_id: String,
    },

    /// Token store inspection.
    Token {
        #[command(subcommand)]
        command: TokenCommands,
    },
}

#[derive(Subcommand, Debug)]
enum TokenCommands {
    /// Print whether a stored token exists for an account (never the token itself).
    Show {
        #[arg(long = "account")]
        account_id: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let hash_algorithm = cli
        .hash
        .as_deref()
        .map(str::parse::<Algorithm>)
        .transpose()
        .context("--hash")?;

    let overrides = ConfigOverrides {
        api_base: cli.api_base.clone(),
        hash_algorithm,
        chunk_size: cli.chunk_size,
        data_dir: cli.datadir.clone(),
        config_path: cli.config.clone(),
    };
    let cfg = Config::load_with_overrides(&overrides)?;
    logging::init_log_file(&cfg.data_dir.join("osfsync.log"))?;

    match cli.command {
        Commands::Login { account_id, quiet } => {
            login::run_login(&cfg, login::LoginArgs { account_id, quiet }).await
        }
        Commands::Sync {
            root,
            project_id,
            account_id,
            dry_run,
        } => run_sync(&cfg, root, project_id, account_id, dry_run).await,
        Commands::Status {
            project_id,
            account_id,
        } => run_status(&cfg, project_id, account_id),
        Commands::Token { command } => match command {
            TokenCommands::Show { account_id } => run_token_show(&cfg, account_id),
        },
    }
}

async fn authenticate(cfg: &Config, account_id: &str) -> Result<Session> {
    let store = TokenStore::load(&cfg.token_store_path()).context("load token store")?;
    let token = store
        .get(account_id)
        .ok_or_else(|| anyhow::anyhow!("no stored token for account {account_id}; run `osfsync login` first"))?
        .to_string();

    let mut session = Session::new(&cfg.api_base).context("build http session")?;
    session
        .login_with_stored_token(&token)
        .await
        .context("validate stored token")?;
    Ok(session)
}

async fn run_sync(
    cfg: &Config,
    root: PathBuf,
    project_id: String,
    account_id: String,
    dry_run: bool,
) -> Result<()> {
    let session = authenticate(cfg, &account_id).await?;

    let root_links =
        remote_project::resolve_root_files_url(&session, &cfg.api_base, &project_id).await?;
    let mut remote = RemoteProject::new(root_links, cfg.hash_algorithm);

    let project_path = cfg.project_file_path(&project_id);
    let mut project = Project::load(&project_path, &root, &project_id, &account_id)
        .context("load project file")?;

    logging::info(format!(
        "sync start project={project_id} root={} dry_run={dry_run}",
        root.display()
    ));

    let report = project
        .sync(&session, &mut remote, cfg.hash_algorithm, cfg.chunk_size, dry_run)
        .await
        .context("sync project")?;

    if dry_run {
        if report.dry_run_lines.is_empty() {
            println!("up to date");
        } else {
            for line in &report.dry_run_lines {
                println!("{line}");
            }
        }
        return Ok(());
    }

    println!(
        "sync complete: {} operation(s) applied",
        report.applied_paths.len()
    );
    logging::info(format!(
        "sync complete project={project_id} applied={}",
        report.applied_paths.len()
    ));
    Ok(())
}

fn run_status(cfg: &Config, project_id: String, account_id: String) -> Result<()> {
    let project_path = cfg.project_file_path(&project_id);
    let project = Project::load(&project_path, &PathBuf::new(), &project_id, &account_id)
        .context("load project file")?;

    println!("project: {project_id}");
    println!("account: {}", project.account_id());
    println!("root: {}", project.root_path().display());
    if let Some(name) = project.name() {
        println!("name: {name}");
    }
    println!("last synced entries: {}", project.last_index().len());
    Ok(())
}

fn run_token_show(cfg: &Config, account_id: String) -> Result<()> {
    let store = TokenStore::load(&cfg.token_store_path()).context("load token store")?;
    match store.get(&account_id) {
        Some(_) => println!("account {account_id}: token stored"),
        None => println!("account {account_id}: no token stored"),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_requires_a_subcommand() {
        assert!(Cli::try_parse_from(["osfsync"]).is_err());
    }

    #[test]
    fn sync_subcommand_parses_dry_run_flag() {
        let cli = Cli::try_parse_from([
            "osfsync",
            "sync",
            "/tmp/root",
            "--project",
            "abcd1",
            "--account",
            "acct-1",
            "--dry-run",
        ])
        .unwrap();
        match cli.command {
            Commands::Sync { dry_run, .. } => assert!(dry_run),
            _ => panic!("expected Sync command"),
        }
    }
}
