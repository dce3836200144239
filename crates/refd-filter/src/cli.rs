use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use crate::channel::ConsumerPort;
use crate::config::FilterConfig;
use crate::pipeline::Pipeline;
use crate::request::{Access, CreateParams};
use crate::volume::{LocalHost, LocalVolume};

#[derive(Parser)]
#[command(name = "refd-filter")]
#[command(about = "Run file operations through the REFD filter pipeline", long_about = None)]
pub struct Cli {
    /// TOML configuration file
    #[arg(short, long, env = "REFD_CONFIG")]
    pub config: Option<PathBuf>,

    /// Overrides the configured backup root
    #[arg(long, env = "REFD_BACKUP_ROOT")]
    pub backup_root: Option<PathBuf>,

    /// Emit logs as JSON
    #[arg(long)]
    pub json: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Clone)]
pub enum Command {
    /// Replace the contents of an existing file
    Overwrite {
        path: PathBuf,
        #[arg(long, conflicts_with = "text")]
        data_file: Option<PathBuf>,
        #[arg(long)]
        text: Option<String>,
    },
    /// Append text to a file
    Append { path: PathBuf, text: String },
    /// Write through a shared mapping of the file
    MapWrite { path: PathBuf, text: String },
    /// Rename a file; relative targets stay in the same directory
    Rename { from: PathBuf, to: String },
    /// Delete a file on close
    Delete { path: PathBuf },
    /// Print the effective configuration
    ShowConfig,
}

impl Cli {
    pub fn load_config(&self) -> Result<FilterConfig> {
        let mut config = match &self.config {
            Some(path) => FilterConfig::load(path)
                .with_context(|| format!("loading config {}", path.display()))?,
            None => FilterConfig::default(),
        };
        if let Some(root) = &self.backup_root {
            config.backup.root = root.clone();
        }
        config.validate()?;
        Ok(config)
    }

    pub async fn run(self) -> Result<()> {
        let config = self.load_config()?;
        if let Command::ShowConfig = self.command {
            println!("{}", toml::to_string_pretty(&config)?);
            return Ok(());
        }

        let pipeline = Arc::new(Pipeline::builder(config, Arc::new(LocalHost::new())).build()?);
        pipeline.start()?;
        let port = pipeline.connect()?;

        let stop = Arc::new(AtomicBool::new(false));
        let consumer = tokio::task::spawn_blocking({
            let stop = stop.clone();
            move || consume(port, &stop)
        });

        let volume = LocalVolume::new(pipeline.clone());
        let command = self.command.clone();
        let outcome = tokio::task::spawn_blocking(move || execute(&volume, &command)).await?;

        stop.store(true, Ordering::SeqCst);
        let delivered = consumer.await??;
        pipeline.stop();

        tracing::info!(delivered, "consumer finished");
        println!("{}", serde_json::to_string_pretty(&pipeline.stats())?);
        outcome
    }
}

/// Prints each message as a JSON line until `stop` is set and the channel is idle.
fn consume(port: ConsumerPort, stop: &AtomicBool) -> Result<usize> {
    let mut delivered = 0;
    loop {
        match port.recv_timeout(Duration::from_millis(100))? {
            Some(message) => {
                println!("{}", serde_json::to_string(&message)?);
                delivered += 1;
            }
            None if stop.load(Ordering::SeqCst) => return Ok(delivered),
            None => {}
        }
    }
}

fn execute(volume: &LocalVolume, command: &Command) -> Result<()> {
    let pid = std::process::id();
    let rw = CreateParams {
        access: Access::read_write(),
        ..CreateParams::default()
    };

    match command {
        Command::Overwrite {
            path,
            data_file,
            text,
        } => {
            let data = match (data_file, text) {
                (Some(file), _) => std::fs::read(file)
                    .with_context(|| format!("reading {}", file.display()))?,
                (None, Some(text)) => text.clone().into_bytes(),
                (None, None) => anyhow::bail!("overwrite needs --data-file or --text"),
            };
            let h = volume.open(pid, path, rw)?;
            volume.write(h, 0, &data)?;
            volume.set_end_of_file(h, data.len() as u64)?;
            volume.close(h)?;
        }
        Command::Append { path, text } => {
            let h = volume.open(
                pid,
                path,
                CreateParams {
                    access: Access::append(),
                    ..CreateParams::default()
                },
            )?;
            volume.write(h, 0, text.as_bytes())?;
            volume.close(h)?;
        }
        Command::MapWrite { path, text } => {
            let h = volume.open(pid, path, rw)?;
            volume.write_mapped(h, 0, text.as_bytes())?;
            volume.close(h)?;
        }
        Command::Rename { from, to } => {
            let h = volume.open(
                pid,
                from,
                CreateParams {
                    access: Access::delete(),
                    ..CreateParams::default()
                },
            )?;
            volume.rename(h, to, false)?;
            volume.close(h)?;
        }
        Command::Delete { path } => {
            let h = volume.open(
                pid,
                path,
                CreateParams {
                    access: Access::delete(),
                    ..CreateParams::default()
                },
            )?;
            volume.set_delete(h, true)?;
            volume.close(h)?;
        }
        Command::ShowConfig => {}
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_overwrite() {
        let cli = Cli::try_parse_from([
            "refd-filter",
            "--backup-root",
            "/tmp/refd",
            "overwrite",
            "/data/a.txt",
            "--text",
            "hello",
        ])
        .unwrap();
        assert!(matches!(cli.command, Command::Overwrite { .. }));
        let config = cli.load_config().unwrap();
        assert_eq!(config.backup.root, PathBuf::from("/tmp/refd"));
    }

    #[test]
    fn test_overwrite_sources_conflict() {
        let result = Cli::try_parse_from([
            "refd-filter",
            "overwrite",
            "/data/a.txt",
            "--text",
            "x",
            "--data-file",
            "/tmp/x",
        ]);
        assert!(result.is_err());
    }
}
