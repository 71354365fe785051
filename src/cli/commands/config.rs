//! Config command - show or edit configuration

use crate::cli::args::{ConfigAction, ConfigArgs};
use crate::config::{Config, ConfigManager};
use crate::error::{StrataError, StrataResult};
use crate::ui::{self, UiContext};
use std::path::PathBuf;

/// Keys accepted by `config set`
const VALID_KEYS: &[&str] = &[
    "general.log_format",
    "general.history_log",
    "cache.path",
    "cache.auto_prune",
    "cache.eviction.max_entries",
    "cache.eviction.max_total_mb",
    "cache.eviction.max_age_days",
    "cost.base_image_bytes",
    "cost.run_command_bytes",
    "cost.metadata_bytes",
    "build.parallel_stages",
    "build.fail_fast",
    "build.timeout_secs",
];

/// Execute the config command
pub async fn execute(args: ConfigArgs, manager: &ConfigManager, config: &Config) -> StrataResult<()> {
    match args.action {
        None | Some(ConfigAction::Show) => show_config(config)?,
        Some(ConfigAction::Path) => println!("{}", manager.path().display()),
        Some(ConfigAction::Init { force }) => init_config(manager, force).await?,
        Some(ConfigAction::Set { key, value }) => {
            let mut config = config.clone();
            set_value(&mut config, &key, &value)?;
            manager.save(&config).await?;
            ui::step_ok(&UiContext::detect(), &format!("Set {} = {}", key, value));
        }
    }

    Ok(())
}

fn show_config(config: &Config) -> StrataResult<()> {
    println!("{}", toml::to_string_pretty(config)?);
    Ok(())
}

async fn init_config(manager: &ConfigManager, force: bool) -> StrataResult<()> {
    let ctx = UiContext::detect();
    let path = manager.path();

    if path.exists() && !force {
        ui::step_warn_hint(
            &ctx,
            &format!("Config already exists at {}", path.display()),
            "Use --force to overwrite",
        );
        return Ok(());
    }

    manager.save(&Config::default()).await?;
    ui::step_ok_detail(&ctx, "Configuration initialized", &path.display().to_string());
    Ok(())
}

/// Apply a dotted key to the config
fn set_value(config: &mut Config, key: &str, value: &str) -> StrataResult<()> {
    let parts: Vec<&str> = key.split('.').collect();

    match parts.as_slice() {
        ["general", "log_format"] => match value {
            "text" | "json" => config.general.log_format = value.to_string(),
            _ => {
                return Err(StrataError::User(format!(
                    "Invalid log format: {}. Use text or json",
                    value
                )))
            }
        },
        ["general", "history_log"] => config.general.history_log = parse_bool(value)?,

        ["cache", "path"] => {
            config.cache.path = match value {
                "" => None,
                _ => Some(PathBuf::from(value)),
            }
        }
        ["cache", "auto_prune"] => config.cache.auto_prune = parse_bool(value)?,
        ["cache", "eviction", "max_entries"] => {
            config.cache.eviction.max_entries = parse_number(value)?
        }
        ["cache", "eviction", "max_total_mb"] => {
            config.cache.eviction.max_total_mb = parse_number(value)?
        }
        ["cache", "eviction", "max_age_days"] => {
            config.cache.eviction.max_age_days = parse_number(value)?
        }

        ["cost", "base_image_bytes"] => config.cost.base_image_bytes = parse_number(value)?,
        ["cost", "run_command_bytes"] => config.cost.run_command_bytes = parse_number(value)?,
        ["cost", "metadata_bytes"] => config.cost.metadata_bytes = parse_number(value)?,

        ["build", "parallel_stages"] => config.build.parallel_stages = parse_bool(value)?,
        ["build", "fail_fast"] => config.build.fail_fast = parse_bool(value)?,
        ["build", "timeout_secs"] => config.build.timeout_secs = parse_number(value)?,

        _ => {
            return Err(StrataError::User(format!(
                "Unknown config key: {} (valid keys: {})",
                key,
                VALID_KEYS.join(", ")
            )))
        }
    }
    Ok(())
}

fn parse_bool(value: &str) -> StrataResult<bool> {
    match value.to_lowercase().as_str() {
        "true" | "1" | "yes" => Ok(true),
        "false" | "0" | "no" => Ok(false),
        _ => Err(StrataError::User(format!(
            "Invalid boolean value: {}. Use true/false",
            value
        ))),
    }
}

fn parse_number<T: std::str::FromStr>(value: &str) -> StrataResult<T> {
    value
        .parse()
        .map_err(|_| StrataError::User(format!("Invalid number: {}", value)))
}
