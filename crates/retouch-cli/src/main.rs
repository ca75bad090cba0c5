//! Retouch CLI
//!
//! Runs the chat image-edit pipeline from a terminal and manages its
//! configuration and logs

mod logging;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use retouch_config::{Config, API_KEY_ENV};
use retouch_core::{
    EditRequest, EditService, ImageSegment, IncomingMessage, MessageQuery, OneBotHttpApi,
    OutgoingImage, ReplySegment, ReplySink, Segment, Submission,
};
use serde_json::json;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

const EXAMPLE_CONFIG: &str = include_str!("../../../config/retouch.example.toml");

#[derive(Parser)]
#[command(name = "retouch")]
#[command(about = "Image editing relay for chat bots", long_about = None)]
#[command(version)]
#[command(disable_help_subcommand = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file path
    #[arg(short, long)]
    config: Option<String>,

    /// Log level (overrides core.log_level)
    #[arg(short, long)]
    log_level: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Edit an image with a text prompt
    Edit {
        /// What to change
        #[arg(short, long)]
        prompt: String,
        /// Image file path or http(s) URL; repeat for more
        #[arg(short, long)]
        image: Vec<String>,
        /// Quoted message id to fetch the image from (needs [onebot])
        #[arg(short, long)]
        reply_to: Option<String>,
        /// Group the request counts against
        #[arg(short, long)]
        group: Option<String>,
        /// Requesting user id
        #[arg(short, long, default_value = "local")]
        user: String,
        /// Directory that receives edited image files
        #[arg(short, long, default_value = ".")]
        out: PathBuf,
    },

    /// Show configuration status and check the API
    Check {
        /// Run as this user (must be an admin); omit to run as the local operator
        #[arg(short, long)]
        user: Option<String>,
    },

    /// Show chat command help
    Help,

    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigCommands,
    },

    /// Log file management
    Logs {
        #[command(subcommand)]
        action: LogCommands,
    },
}

#[derive(Subcommand)]
enum ConfigCommands {
    /// Write the example configuration
    Init {
        /// Overwrite an existing file
        #[arg(short, long)]
        force: bool,
    },
    /// Show current configuration (secrets redacted)
    Show,
    /// Validate configuration
    Validate,
    /// Print the configuration file path
    Path,
}

#[derive(Subcommand)]
enum LogCommands {
    /// Show log files and sizes
    List,
    /// Remove old log files
    Clean {
        /// Keep only N days of logs
        #[arg(short, long, default_value_t = logging::LOG_RETENTION_DAYS)]
        days: u64,
    },
}

/// Prints replies to stdout and copies delivered files into `out_dir`.
struct ConsoleSink {
    out_dir: PathBuf,
}

#[async_trait::async_trait]
impl ReplySink for ConsoleSink {
    async fn send_text(&self, text: &str) -> Result<()> {
        println!("{}", text);
        Ok(())
    }

    async fn send_images(&self, images: &[OutgoingImage]) -> Result<()> {
        for image in images {
            match image {
                OutgoingImage::Url(url) => println!("image: {}", url),
                OutgoingImage::File(path) => {
                    let saved = copy_into(Path::new(path), &self.out_dir).await?;
                    println!("image: {}", saved.display());
                }
            }
        }
        Ok(())
    }
}

async fn copy_into(source: &Path, out_dir: &Path) -> Result<PathBuf> {
    let name = source
        .file_name()
        .ok_or_else(|| anyhow!("delivered path has no file name: {}", source.display()))?;
    tokio::fs::create_dir_all(out_dir).await?;
    let target = out_dir.join(name);
    tokio::fs::copy(source, &target)
        .await
        .with_context(|| format!("failed to copy {} to {}", source.display(), target.display()))?;
    Ok(target)
}

fn build_message(
    user: &str,
    group: Option<String>,
    prompt: &str,
    images: &[String],
    reply_to: Option<String>,
) -> IncomingMessage {
    let mut message = IncomingMessage::new(user, group);
    if let Some(id) = reply_to {
        message = message.with_segment(Segment::Reply(ReplySegment::to(id)));
    }
    for image in images {
        let segment = if image.starts_with("http://") || image.starts_with("https://") {
            ImageSegment::from_url(image.as_str())
        } else {
            ImageSegment::from_path(image.as_str())
        };
        message = message.with_segment(Segment::Image(segment));
    }
    message.with_segment(Segment::Text(prompt.to_string()))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Edit {
            prompt,
            image,
            reply_to,
            group,
            user,
            out,
        } => {
            let config = load_config(cli.config.clone())?;
            let level = cli
                .log_level
                .clone()
                .unwrap_or_else(|| config.log_level().to_string());
            let _logging_guard = logging::init_logging(&config.logs_dir(), &level)?;

            let query: Option<Arc<dyn MessageQuery>> = match &config.onebot {
                Some(onebot) => Some(Arc::new(OneBotHttpApi::new(onebot)?)),
                None => None,
            };
            let service = Arc::new(EditService::from_config(Arc::new(config))?);
            let sink = Arc::new(ConsoleSink { out_dir: out });

            let message = build_message(&user, group, &prompt, &image, reply_to);
            let submission = service
                .submit_edit(EditRequest::new(message, prompt), query, sink)
                .await?;
            let outcome = match submission {
                Submission::Rejected(_) => Err(anyhow!("Edit request was rejected")),
                Submission::Accepted { task_id, handle } => {
                    info!(task_id = %task_id, "Waiting for edit task");
                    handle
                        .await
                        .map_err(|e| anyhow!("Edit task {} aborted: {}", task_id, e))
                }
            };
            service.shutdown().await;
            outcome?;
        }

        Commands::Check { user } => {
            let config = load_config(cli.config.clone())?;
            let level = cli
                .log_level
                .clone()
                .unwrap_or_else(|| config.log_level().to_string());
            let _logging_guard = logging::init_logging(&config.logs_dir(), &level)?;

            let service = EditService::from_config(Arc::new(config))?;
            let report = match user {
                Some(user) => service.status_for(&user).await,
                None => service.status_report().await,
            };
            println!("{}", report);
        }

        Commands::Help => {
            println!("{}", EditService::help_text());
        }

        Commands::Config { action } => match action {
            ConfigCommands::Init { force } => {
                let path = config_path(cli.config)?;
                if path.exists() && !force {
                    anyhow::bail!(
                        "Configuration already exists at {} (use --force to overwrite)",
                        path.display()
                    );
                }
                if let Some(parent) = path.parent() {
                    fs::create_dir_all(parent)?;
                }
                fs::write(&path, EXAMPLE_CONFIG)?;
                println!("Configuration created at: {}", path.display());
                println!(
                    "\nSet {} or edit api.api_key, then run `retouch check`.",
                    API_KEY_ENV
                );
            }
            ConfigCommands::Show => match load_config(cli.config) {
                Ok(config) => {
                    println!("Current configuration:");
                    println!("{}", serde_json::to_string_pretty(&redacted(&config)?)?);
                }
                Err(e) => eprintln!("Error loading config: {}", e),
            },
            ConfigCommands::Validate => match load_config(cli.config) {
                Ok(_) => println!("Configuration is valid."),
                Err(e) => eprintln!("Configuration is invalid: {}", e),
            },
            ConfigCommands::Path => {
                println!("{}", config_path(cli.config)?.display());
            }
        },

        Commands::Logs { action } => {
            let config = load_config(cli.config)?;
            let manager = logging::LogManager::new(config.logs_dir());
            match action {
                LogCommands::List => {
                    let files = manager.log_files()?;
                    println!(
                        "Log files ({} total):\n",
                        logging::LogManager::format_size(manager.total_size()?)
                    );
                    for file in files {
                        let metadata = fs::metadata(&file)?;
                        let modified: chrono::DateTime<chrono::Local> = metadata.modified()?.into();
                        println!(
                            "  {} ({}, modified {})",
                            file.file_name()
                                .map(|n| n.to_string_lossy().to_string())
                                .unwrap_or_default(),
                            logging::LogManager::format_size(metadata.len()),
                            modified.format("%Y-%m-%d %H:%M:%S")
                        );
                    }
                }
                LogCommands::Clean { days } => {
                    let removed = manager.clean_older_than(days)?;
                    println!("Cleaned {} old log file(s)", removed);
                }
            }
        }
    }

    Ok(())
}

/// Explicit path, else the default path when it exists, else built-in
/// defaults with the environment key applied.
fn load_config(config_path: Option<String>) -> Result<Config> {
    if let Some(path) = config_path {
        return Config::load(&path);
    }
    match Config::default_path() {
        Some(path) if path.exists() => Config::load(&path),
        _ => {
            let mut config = Config::default();
            config.apply_env_overrides(std::env::var(API_KEY_ENV).ok());
            config.validate()?;
            Ok(config)
        }
    }
}

fn config_path(config_path: Option<String>) -> Result<PathBuf> {
    match config_path {
        Some(path) => Ok(PathBuf::from(path)),
        None => Config::default_path().ok_or_else(|| anyhow!("No config directory available")),
    }
}

fn redacted(config: &Config) -> Result<serde_json::Value> {
    let mut value = serde_json::to_value(config)?;
    if let Some(key) = value.get_mut("api").and_then(|api| api.get_mut("api_key")) {
        if key.as_str().is_some_and(|k| !k.is_empty()) {
            *key = json!("***REDACTED***");
        }
    }
    if let Some(token) = value
        .get_mut("onebot")
        .and_then(|onebot| onebot.get_mut("access_token"))
    {
        if !token.is_null() {
            *token = json!("***REDACTED***");
        }
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_carries_reply_images_and_prompt() {
        let message = build_message(
            "alice",
            Some("g1".into()),
            "add a hat",
            &["https://x/a.png".to_string(), "/tmp/b.jpg".to_string()],
            Some("42".into()),
        );
        assert_eq!(message.sender_id, "alice");
        assert_eq!(message.group_id.as_deref(), Some("g1"));
        assert_eq!(message.reply_ids(), vec!["42"]);
        assert_eq!(message.text(), "add a hat");
        assert_eq!(
            message.segments[1],
            Segment::Image(ImageSegment::from_url("https://x/a.png"))
        );
        assert_eq!(
            message.segments[2],
            Segment::Image(ImageSegment::from_path("/tmp/b.jpg"))
        );
    }

    #[test]
    fn secrets_are_redacted() {
        let mut config = Config::default();
        config.api.api_key = "sk-secret".to_string();
        config.onebot = Some(retouch_config::OneBotConfig {
            api_url: "http://127.0.0.1:3000".to_string(),
            access_token: Some("token".to_string()),
        });
        let value = redacted(&config).expect("redact");
        assert_eq!(value["api"]["api_key"], "***REDACTED***");
        assert_eq!(value["onebot"]["access_token"], "***REDACTED***");
        assert_eq!(value["api"]["model_id"], "grok-imagine-0.9");
    }

    #[test]
    fn empty_key_is_shown_as_empty() {
        let value = redacted(&Config::default()).expect("redact");
        assert_eq!(value["api"]["api_key"], "");
    }

    #[tokio::test]
    async fn console_sink_copies_files_into_out_dir() {
        let src = tempfile::tempdir().expect("tempdir");
        let out = tempfile::tempdir().expect("tempdir");
        let file = src.path().join("retouch_x.png");
        fs::write(&file, b"png").expect("write");

        let sink = ConsoleSink {
            out_dir: out.path().join("results"),
        };
        sink.send_images(&[
            OutgoingImage::Url("https://x/a.png".to_string()),
            OutgoingImage::File(file.to_string_lossy().to_string()),
        ])
        .await
        .expect("deliver");

        let copied = out.path().join("results").join("retouch_x.png");
        assert_eq!(fs::read(copied).expect("read"), b"png");
    }

    #[test]
    fn cli_parses_edit_flags() {
        let cli = Cli::try_parse_from([
            "retouch", "edit", "--prompt", "blue sky", "--image", "a.png", "--image", "b.png",
            "--group", "g1",
        ])
        .expect("parse");
        let Commands::Edit {
            prompt,
            image,
            group,
            user,
            out,
            ..
        } = cli.command
        else {
            panic!("expected edit");
        };
        assert_eq!(prompt, "blue sky");
        assert_eq!(image, vec!["a.png", "b.png"]);
        assert_eq!(group.as_deref(), Some("g1"));
        assert_eq!(user, "local");
        assert_eq!(out, PathBuf::from("."));
    }

    #[test]
    fn command_definition_is_consistent() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }

    #[test]
    fn cli_parses_help_command() {
        let cli = Cli::try_parse_from(["retouch", "help"]).expect("parse");
        assert!(matches!(cli.command, Commands::Help));

        let err = Cli::try_parse_from(["retouch", "--help"])
            .err()
            .expect("--help prints usage");
        assert_eq!(err.kind(), clap::error::ErrorKind::DisplayHelp);
    }
}
