//! `parley config`: Print configuration.

use parley_config::AppConfig;

pub fn run(config: &AppConfig, current: bool) -> Result<(), Box<dyn std::error::Error>> {
    if current {
        let mut shown = config.clone();
        if shown.engine.api_key.is_some() {
            shown.engine.api_key = Some("***".into());
        }
        println!("{}", toml::to_string_pretty(&shown)?);
        println!("# {}", AppConfig::config_dir().join("config.toml").display());
    } else {
        println!("{}", AppConfig::default_toml());
    }
    Ok(())
}
