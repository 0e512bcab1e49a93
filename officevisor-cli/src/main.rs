//! Officevisor CLI main entry point

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use std::path::PathBuf;
use tracing::{debug, info, warn};

use officevisor_config::{ConfigLoader, LogLevel, OfficevisorConfig};
use officevisor_logging::init_logging_from_config;

mod cli;
mod commands;

use cli::{Cli, Commands};

/// Where the configuration comes from
#[derive(Debug, PartialEq, Eq)]
enum ConfigSource {
    File(PathBuf),
    /// A file was named but does not exist; environment and defaults apply
    MissingFile(PathBuf),
    Environment,
}

impl ConfigSource {
    fn resolve(config_path: Option<&PathBuf>) -> Self {
        match config_path {
            Some(path) if path.exists() => Self::File(path.clone()),
            Some(path) => Self::MissingFile(path.clone()),
            None => Self::Environment,
        }
    }

    /// Logged once logging is up
    fn report(&self) {
        match self {
            Self::File(path) => debug!("Loaded configuration from {:?}", path),
            Self::MissingFile(path) => {
                warn!("Configuration file not found: {:?}. Using defaults.", path)
            }
            Self::Environment => {
                debug!("No configuration file specified. Loaded from environment or defaults.")
            }
        }
    }
}

/// Load configuration from file or use defaults
fn load_config(source: &ConfigSource) -> Result<OfficevisorConfig> {
    let loader = ConfigLoader::new();

    match source {
        ConfigSource::File(path) => loader
            .from_file(path)
            .with_context(|| format!("Failed to load configuration from {:?}", path)),
        ConfigSource::MissingFile(_) | ConfigSource::Environment => loader
            .from_env()
            .context("Failed to load configuration from environment"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if cli.command == Commands::SampleConfig {
        return commands::sample_config_command();
    }

    let source = ConfigSource::resolve(cli.config.as_ref());
    let mut config = load_config(&source)?;
    if let Some(level) = &cli.log_level {
        config.logging.level = level.parse::<LogLevel>().map_err(|e| anyhow!(e))?;
    }
    init_logging_from_config(&config.logging)?;
    source.report();

    info!("Officevisor starting");

    match cli.command {
        Commands::Run => commands::run_command(config).await,
        Commands::Probe => commands::probe_command(config).await,
        Commands::CheckConfig => commands::check_config_command(&config),
        Commands::SampleConfig => commands::sample_config_command(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;
    use tempfile::TempDir;

    fn write_config(dir: &Path, body: &str) -> PathBuf {
        let office = dir.join("office");
        let executable = officevisor_config::domains::office::office_executable_in(&office);
        std::fs::create_dir_all(executable.parent().unwrap()).unwrap();
        std::fs::write(&executable, "").unwrap();

        let path = dir.join("officevisor.yaml");
        let yaml = format!(
            "office:\n  office_location: {}\n  work_dir: {}\n{}",
            office.display(),
            dir.display(),
            body
        );
        std::fs::write(&path, yaml).unwrap();
        path
    }

    #[test]
    fn test_load_config_from_file() {
        let dir = TempDir::new().unwrap();
        let path = write_config(
            dir.path(),
            "  port_numbers: [2010, 2011]\n  process_start_timeout: 30s\n",
        );

        let config = load_config(&ConfigSource::resolve(Some(&path))).unwrap();

        assert_eq!(config.office.port_numbers, vec![2010, 2011]);
        assert_eq!(
            config.office.process_start_timeout,
            std::time::Duration::from_secs(30)
        );
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let dir = TempDir::new().unwrap();
        let path = write_config(dir.path(), "  port_numbers: [2010, 2010]\n");

        let error = load_config(&ConfigSource::resolve(Some(&path))).unwrap_err();
        assert!(format!("{:#}", error).contains("duplicate port number 2010"));
    }

    #[test]
    fn test_missing_config_file_is_remembered_for_reporting() {
        let dir = TempDir::new().unwrap();
        let missing = dir.path().join("absent.yaml");
        let present = write_config(dir.path(), "");

        assert_eq!(
            ConfigSource::resolve(Some(&missing)),
            ConfigSource::MissingFile(missing.clone())
        );
        assert_eq!(
            ConfigSource::resolve(Some(&present)),
            ConfigSource::File(present.clone())
        );
        assert_eq!(ConfigSource::resolve(None), ConfigSource::Environment);
    }
}
