//! # bigmodel
//!
//! Command-line front end for the BigModel task engine.

use anyhow::{bail, Context};
use bigmodel_engine::config::EngineConfig;
use bigmodel_engine::db::{DatabaseConnection, SqliteTaskStore};
use bigmodel_engine::{CreateTaskRequest, Engine, StreamEvent, TaskStore};
use bigmodel_providers::TaskType;
use clap::{Parser, Subcommand};
use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "bigmodel")]
#[command(about = "Run and inspect BigModel generation tasks", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file (defaults to BIGMODEL_CONFIG, then config/bigmodel.toml)
    #[arg(short, long, global = true, env = "BIGMODEL_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create a task, stream its output, and wait for the result
    Run {
        /// Submitting user
        #[arg(short, long)]
        user: String,

        /// glm, llama or text_to_image
        #[arg(short, long)]
        task_type: TaskType,

        /// Prompt or image description
        #[arg(short, long)]
        desc: String,

        /// Image style
        #[arg(short, long, default_value = "")]
        style: String,
    },

    /// Show a stored task
    Status {
        /// Task id
        id: i64,
    },

    /// List a user's tasks, newest first
    List {
        #[arg(short, long)]
        user: String,
    },

    /// Validate configuration and print the endpoint pools
    CheckConfig,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let rust_log = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(rust_log))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = load_config(cli.config.as_ref())?;

    match cli.command {
        Commands::Run {
            user,
            task_type,
            desc,
            style,
        } => {
            let request = CreateTaskRequest::new(user, task_type, desc).with_style(style);
            run_task(config, request).await?;
        }
        Commands::Status { id } => {
            let store = open_store(&config).await?;
            let task = store.get_by_id(id).await?;
            println!("{}", serde_json::to_string_pretty(&task)?);
        }
        Commands::List { user } => {
            let store = open_store(&config).await?;
            for task in store.list_by_user(&user).await? {
                println!(
                    "{:>6}  {:<13} {:<8}  {}",
                    task.id,
                    task.task_type.as_str(),
                    task.status.as_str(),
                    task.created_at.to_rfc3339()
                );
            }
        }
        Commands::CheckConfig => check_config(&config)?,
    }

    Ok(())
}

fn load_config(path: Option<&PathBuf>) -> anyhow::Result<EngineConfig> {
    let config = match path {
        Some(path) => {
            let mut config = EngineConfig::from_file(path)?;
            config.apply_overrides(|key| std::env::var(key).ok())?;
            config.validate()?;
            config
        }
        None => EngineConfig::load()?,
    };
    Ok(config)
}

async fn open_store(config: &EngineConfig) -> anyhow::Result<SqliteTaskStore> {
    let db = DatabaseConnection::open(&config.database.path)
        .await
        .with_context(|| format!("Failed to open database {}", config.database.path))?;
    Ok(SqliteTaskStore::new(db.pool().clone()))
}

fn check_config(config: &EngineConfig) -> anyhow::Result<()> {
    let routers = config.routers()?;
    if routers.is_empty() {
        bail!("no endpoint pools configured");
    }

    println!("Database: {}", config.database.path);
    println!("Moderation every {} tokens", config.relay.skip_step);
    for (task_type, router) in &routers {
        for pool in router.pools() {
            println!(
                "{:<13} {:<22} {} endpoint(s)",
                task_type.as_str(),
                pool.name(),
                pool.capacity()
            );
        }
    }
    Ok(())
}

async fn run_task(config: EngineConfig, request: CreateTaskRequest) -> anyhow::Result<()> {
    let engine = Engine::start(config).await.context("Failed to start engine")?;
    let (tx, mut rx) = mpsc::channel(64);
    let task = engine
        .service()
        .create_task_with_observer(request, tx)
        .await?;
    tracing::info!("Created task {}", task.id);

    let mut stdout = std::io::stdout();
    loop {
        tokio::select! {
            event = rx.recv() => match event {
                Some(StreamEvent::Token(text)) => {
                    write!(stdout, "{}", text)?;
                    stdout.flush()?;
                }
                Some(StreamEvent::Done(completion)) => {
                    writeln!(stdout)?;
                    for (index, link) in &completion.links {
                        writeln!(stdout, "{}: {}", index, link)?;
                    }
                    break;
                }
                Some(StreamEvent::Failure(reason)) => {
                    writeln!(stdout)?;
                    eprintln!("Task {} failed: {}", task.id, reason);
                    break;
                }
                None => break,
            },
            _ = tokio::signal::ctrl_c() => {
                tracing::warn!("Interrupted, cancelling task {}", task.id);
                if !engine.service().cancel(task.id) {
                    break;
                }
            }
        }
    }
    drop(rx);

    let mut final_task = engine.service().get_task(task.id).await?;
    for _ in 0..50 {
        if final_task.status.is_terminal() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
        final_task = engine.service().get_task(task.id).await?;
    }
    match &final_task.error_message {
        Some(error) => println!("Task {} {}: {}", final_task.id, final_task.status, error),
        None => println!("Task {} {}", final_task.id, final_task.status),
    }

    engine.shutdown().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_run_command() {
        let cli = Cli::try_parse_from([
            "bigmodel",
            "run",
            "--user",
            "alice",
            "--task-type",
            "text_to_image",
            "--desc",
            "a cat",
            "--style",
            "cartoon",
        ])
        .unwrap();

        match cli.command {
            Commands::Run {
                user,
                task_type,
                desc,
                style,
            } => {
                assert_eq!(user, "alice");
                assert_eq!(task_type, TaskType::TextToImage);
                assert_eq!(desc, "a cat");
                assert_eq!(style, "cartoon");
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_parse_rejects_unknown_task_type() {
        let result = Cli::try_parse_from([
            "bigmodel", "run", "--user", "alice", "--task-type", "gpt", "--desc", "hi",
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn test_parse_status_with_config() {
        let cli =
            Cli::try_parse_from(["bigmodel", "status", "42", "--config", "/etc/bigmodel.toml"])
                .unwrap();
        assert_eq!(cli.config, Some(PathBuf::from("/etc/bigmodel.toml")));
        assert!(matches!(cli.command, Commands::Status { id: 42 }));
    }

    #[test]
    fn test_load_config_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bigmodel.toml");
        std::fs::write(
            &path,
            r#"
[database]
path = "tasks.db"

[pools.glm]
short = ["http://glm-1"]
"#,
        )
        .unwrap();

        let config = load_config(Some(&path)).unwrap();
        assert!(config.pools.contains_key("glm"));
        assert!(check_config(&config).is_ok());
    }

    #[test]
    fn test_check_config_requires_pools() {
        let config = EngineConfig::default();
        assert!(check_config(&config).is_err());
    }
}
