use reps_core::config::BackendConfig;

use crate::cli::ConfigCommands;
use crate::config_profiles::{mask_secret, BackendSettings, CliConfig};
use crate::error::CliError;

pub fn run_config(command: ConfigCommands) -> Result<(), CliError> {
    match command {
        ConfigCommands::Init { api_url, api_key } => run_config_init(api_url, api_key),
        ConfigCommands::Show => run_config_show(),
    }
}

pub fn run_config_init(api_url: String, api_key: String) -> Result<(), CliError> {
    let backend = BackendConfig::new(api_url, api_key)?;

    let mut config = CliConfig::load().map_err(CliError::Config)?;
    config.backend = Some(BackendSettings {
        api_url: Some(backend.base_url.clone()),
        api_key: Some(backend.api_key),
    });
    let path = config.save().map_err(CliError::Config)?;

    println!("Saved backend {} to {}", backend.base_url, path.display());
    Ok(())
}

pub fn run_config_show() -> Result<(), CliError> {
    let mut config = CliConfig::load().map_err(CliError::Config)?;
    if let Some(backend) = config.backend.as_mut() {
        backend.api_key = backend.api_key.as_deref().map(mask_secret);
    }
    println!("{}", serde_json::to_string_pretty(&config)?);
    Ok(())
}
