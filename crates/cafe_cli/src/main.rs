mod bot;
mod logging;

use std::path::{Path, PathBuf};

use cafe_core::config::BotConfig;
use clap::{Parser, Subcommand};
use miette::{IntoDiagnostic, Result};
use tracing::info;

const DEFAULT_CONFIG_FILE: &str = "cafe-bot.toml";

#[derive(Parser, Debug)]
#[command(name = "cafe-bot")]
#[command(about = "Café Cloud community bot")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Configuration file path
    #[arg(long, short = 'c', global = true)]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(long, global = true)]
    debug: bool,
}

#[derive(Subcommand, Debug, PartialEq, Eq)]
enum Commands {
    /// Connect to Discord and serve the community (default)
    Run,
    /// Load and validate the configuration, then print it
    CheckConfig,
}

/// Explicit path wins; otherwise use `cafe-bot.toml` in `dir` when present.
fn resolve_config_path(explicit: Option<PathBuf>, dir: &Path) -> Option<PathBuf> {
    explicit.or_else(|| {
        let candidate = dir.join(DEFAULT_CONFIG_FILE);
        candidate.is_file().then_some(candidate)
    })
}

fn load_config(path: Option<&Path>) -> Result<BotConfig> {
    let mut config = match path {
        Some(path) => BotConfig::load(path)?,
        None => BotConfig::default(),
    };
    config.apply_env()?;
    config.validate()?;
    Ok(config)
}

fn presence(value: &Option<String>) -> &'static str {
    match value {
        Some(v) if !v.trim().is_empty() => "set",
        _ => "missing",
    }
}

fn check_config(config: &BotConfig, path: Option<&Path>) -> Result<()> {
    match path {
        Some(path) => println!("# Loaded from {}", path.display()),
        None => println!("# No config file, defaults plus environment"),
    }
    println!("# DISCORD_TOKEN: {}", presence(&config.discord.token));
    println!("# OPENROUTER_API_KEY: {}", presence(&config.ai.api_key));
    println!("{}", toml::to_string_pretty(config).into_diagnostic()?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if it exists
    let _ = dotenvy::dotenv();
    miette::set_hook(Box::new(|_| {
        Box::new(
            miette::MietteHandlerOpts::new()
                .terminal_links(true)
                .rgb_colors(miette::RgbColors::Preferred)
                .with_cause_chain()
                .color(true)
                .context_lines(5)
                .tab_width(2)
                .break_words(true)
                .build(),
        )
    }))?;
    miette::set_panic_hook();
    let cli = Cli::parse();

    let cwd = std::env::current_dir().into_diagnostic()?;
    let config_path = resolve_config_path(cli.config, &cwd);
    let config = load_config(config_path.as_deref())?;

    match cli.command.unwrap_or(Commands::Run) {
        Commands::CheckConfig => check_config(&config, config_path.as_deref()),
        Commands::Run => {
            let _guard = logging::init(cli.debug, &config.logging);
            if let Some(path) = &config_path {
                info!("Using config {}", path.display());
            }
            bot::run(config).await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_run_is_the_default_command() {
        let cli = Cli::try_parse_from(["cafe-bot"]).unwrap();
        assert!(cli.command.is_none());
        assert!(!cli.debug);

        let cli = Cli::try_parse_from(["cafe-bot", "check-config", "-c", "bot.toml"]).unwrap();
        assert_eq!(cli.command, Some(Commands::CheckConfig));
        assert_eq!(cli.config, Some(PathBuf::from("bot.toml")));

        let cli = Cli::try_parse_from(["cafe-bot", "--debug", "run"]).unwrap();
        assert_eq!(cli.command, Some(Commands::Run));
        assert!(cli.debug);
    }

    #[test]
    fn test_config_path_resolution() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(resolve_config_path(None, dir.path()), None);

        let explicit = PathBuf::from("/etc/cafe/bot.toml");
        assert_eq!(
            resolve_config_path(Some(explicit.clone()), dir.path()),
            Some(explicit)
        );

        let local = dir.path().join(DEFAULT_CONFIG_FILE);
        std::fs::write(&local, "").unwrap();
        assert_eq!(resolve_config_path(None, dir.path()), Some(local));
    }

    #[test]
    fn test_load_config_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(DEFAULT_CONFIG_FILE);
        std::fs::write(&path, "[xp]\ncooldown_secs = 30\n").unwrap();

        let config = load_config(Some(&path)).unwrap();
        assert_eq!(config.xp.cooldown_secs, 30);
    }

    #[test]
    fn test_presence_hides_values() {
        assert_eq!(presence(&Some("secret".to_string())), "set");
        assert_eq!(presence(&Some("  ".to_string())), "missing");
        assert_eq!(presence(&None), "missing");
    }
}
