use anyhow::{Context, Result};
use toml_edit::{value, DocumentMut};

use anchorage_store::{config, Config};

/// Top-level keys accepted by `config get` and `config set`.
const KEYS: &[&str] = &[
    "mode",
    "url",
    "api_key",
    "preferred_port",
    "port_range_start",
    "port_range_end",
    "data_dir",
    "container_name",
    "image",
    "health_check_interval_ms",
    "health_check_timeout_secs",
    "degraded_timeout_secs",
    "probe_interval_secs",
    "shutdown_grace_secs",
    "request_timeout_secs",
    "persistence_retries",
    "metadata_collection",
    "default_distance",
    "embedding_url",
    "embedding_api_key",
    "search_limit",
    "max_batch_size",
];

fn check_key(key: &str) -> Result<()> {
    if KEYS.contains(&key) {
        Ok(())
    } else {
        anyhow::bail!("Unknown config key: {}\n\nValid keys: {}", key, KEYS.join(", "))
    }
}

/// Show the current effective configuration.
pub fn show_config() -> Result<()> {
    let config = Config::load()?;

    println!("Current Configuration");
    println!("=====================\n");

    println!("Config file: {}", config::config_file_path().display());

    let exists = config::config_file_path().exists();
    println!("File exists: {}\n", if exists { "yes" } else { "no (using defaults)" });

    println!("Settings:");
    let rendered = toml::to_string_pretty(&config).context("Failed to render configuration")?;
    for line in rendered.lines().filter(|l| !l.trim().is_empty()) {
        println!("  {}", line);
    }
    println!("  logging.level: {:?}", config.logging.level());
    println!("  logging.coloured: {}", config.logging.coloured());
    println!("  logging.output: {:?}", config.logging.output());

    println!("\nPriority: CLI args > ENV vars (ANCHOR_*) > Config file > Defaults");

    Ok(())
}

/// Get a specific config value.
pub fn get_config(key: Option<String>) -> Result<()> {
    let Some(key) = key else {
        // No key provided, show entire config file contents
        let config_path = config::config_file_path();

        if config_path.exists() {
            let contents =
                std::fs::read_to_string(&config_path).context("Failed to read config file")?;
            print!("{}", contents);
        } else {
            println!("Config file does not exist: {}", config_path.display());
            println!("\nRun 'anchorage config init' to create it.");
        }
        return Ok(());
    };

    check_key(&key)?;
    let config = Config::load()?;
    let rendered = toml::Value::try_from(&config).context("Failed to render configuration")?;
    match rendered.get(&key) {
        Some(toml::Value::String(s)) => println!("{}", s),
        Some(other) => println!("{}", other),
        None => println!("<not set>"),
    }

    Ok(())
}

/// Turn a command-line value into the TOML type it most likely means.
fn parse_value(raw: &str) -> toml_edit::Item {
    if let Ok(n) = raw.parse::<i64>() {
        value(n)
    } else if let Ok(b) = raw.parse::<bool>() {
        value(b)
    } else {
        value(raw)
    }
}

/// Set a config value, keeping the rest of the file (comments included).
pub fn set_config(key: &str, raw: &str) -> Result<()> {
    check_key(key)?;
    let config_path = config::config_file_path();

    config::ensure_config_file()?;

    let contents = std::fs::read_to_string(&config_path).context("Failed to read config file")?;
    let mut doc: DocumentMut = contents.parse().context("Config file is not valid TOML")?;
    doc[key] = parse_value(raw);

    let updated = doc.to_string();
    let candidate: Config = toml::from_str(&updated)
        .with_context(|| format!("Invalid value for {}: {}", key, raw))?;
    candidate.validate()?;

    std::fs::write(&config_path, updated).context("Failed to write config file")?;

    println!("✓ Updated {} = {}", key, raw);
    println!("  in {}", config_path.display());

    Ok(())
}

/// Show the config file path.
pub fn show_path() -> Result<()> {
    let config_path = config::config_file_path();
    println!("{}", config_path.display());
    Ok(())
}

/// Show example configuration.
pub fn show_example() -> Result<()> {
    print!("{}", config::example_config());
    Ok(())
}

/// Initialize config file with defaults.
pub fn init_config() -> Result<()> {
    let created = config::ensure_config_file()?;
    let config_path = config::config_file_path();

    if created {
        println!("✓ Created config file: {}", config_path.display());
        println!("\nEdit this file to configure anchorage.");
    } else {
        println!("Config file already exists: {}", config_path.display());
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_key() {
        assert!(check_key("preferred_port").is_ok());
        assert!(check_key("database_path").is_err());
    }

    #[test]
    fn test_every_key_is_a_config_field() {
        let config = Config {
            url: Some("http://db:6333".to_string()),
            api_key: Some("k".to_string()),
            embedding_url: Some("http://localhost:1234".to_string()),
            embedding_api_key: Some("sk".to_string()),
            ..Config::default()
        };
        let rendered = toml::Value::try_from(&config).unwrap();
        for key in KEYS {
            assert!(rendered.get(*key).is_some(), "missing {key}");
        }
    }

    #[test]
    fn test_parse_value_types() {
        assert_eq!(parse_value("6400").as_integer(), Some(6400));
        assert_eq!(parse_value("true").as_bool(), Some(true));
        assert_eq!(parse_value("external").as_str(), Some("external"));
    }

    #[test]
    fn test_set_preserves_comments() {
        let mut doc: DocumentMut = config::example_config().parse().unwrap();
        doc["preferred_port"] = parse_value("6400");
        let updated = doc.to_string();
        assert!(updated.contains("# Anchorage Configuration File"));
        let parsed: Config = toml::from_str(&updated).unwrap();
        assert_eq!(parsed.preferred_port, 6400);
    }
}
