use crate::config::generate::generate_starter_config;
use std::fs;
use std::path::PathBuf;

pub fn init(stdout: bool) -> Result<(), Box<dyn std::error::Error>> {
    let config_content = generate_starter_config();
    if stdout {
        print!("{}", config_content);
        return Ok(());
    }

    // Try ~/.config/logpipe/config.yml first
    let config_path = dirs::home_dir()
        .map(|home| home.join(".config/logpipe/config.yml"))
        .and_then(|path| match path.parent().map(fs::create_dir_all) {
            Some(Err(_)) => {
                eprintln!("Warning: Could not create {}", path.display());
                eprintln!("Falling back to /etc/logpipe/config.yml");
                None
            }
            _ => Some(path),
        })
        .unwrap_or_else(|| PathBuf::from("/etc/logpipe/config.yml"));

    if config_path.exists() {
        return Err(format!(
            "Config file already exists at {}. Remove it first or use --stdout to print the config",
            config_path.display()
        )
        .into());
    }

    if let Some(parent) = config_path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(&config_path, config_content)?;

    println!("Config file written to {}", config_path.display());
    Ok(())
}
