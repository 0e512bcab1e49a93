use anyhow::{Context, Result};

use officevisor_config::OfficevisorConfig;

/// Print the validated configuration, defaults and overrides applied
pub fn check_config_command(config: &OfficevisorConfig) -> Result<()> {
    let yaml = render(config)?;
    println!("# Configuration is valid");
    print!("{}", yaml);
    Ok(())
}

pub fn sample_config_command() -> Result<()> {
    print!("{}", OfficevisorConfig::generate_sample());
    Ok(())
}

fn render(config: &OfficevisorConfig) -> Result<String> {
    serde_yaml::to_string(config).context("Failed to render configuration")
}
