use cafe_core::config::LoggingConfig;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

const DEFAULT_FILTER: &str = "info,cafe_core=info,cafe_discord=info,cafe_cli=info";
const DEBUG_FILTER: &str = "info,cafe_core=debug,cafe_discord=debug,cafe_cli=debug";

/// Directive for the terminal: `RUST_LOG`, then the config, then the
/// built-in default.
pub fn terminal_directive(debug: bool, configured: Option<&str>, rust_log: Option<&str>) -> String {
    if let Some(env) = rust_log.filter(|s| !s.trim().is_empty()) {
        return env.to_string();
    }
    if debug {
        return DEBUG_FILTER.to_string();
    }
    configured
        .filter(|s| !s.trim().is_empty())
        .unwrap_or(DEFAULT_FILTER)
        .to_string()
}

/// Install the global subscriber. Keep the returned guard alive for the
/// life of the process or buffered file logs are lost.
pub fn init(debug: bool, config: &LoggingConfig) -> Option<WorkerGuard> {
    let rust_log = std::env::var("RUST_LOG").ok();
    let env_filter = EnvFilter::new(terminal_directive(
        debug,
        config.filter.as_deref(),
        rust_log.as_deref(),
    ));

    let terminal_layer = if debug {
        fmt::layer()
            .with_file(true)
            .with_line_number(true)
            .with_thread_ids(false)
            .boxed()
    } else {
        fmt::layer()
            .with_target(false)
            .with_thread_ids(false)
            .compact()
            .boxed()
    };

    let (file_layer, guard) = match &config.directory {
        Some(dir) => {
            // Ensure log directory exists
            std::fs::create_dir_all(dir).ok();
            let (writer, guard) = tracing_appender::non_blocking(rolling::daily(dir, "cafe-bot.log"));
            let layer = fmt::layer()
                .with_file(true)
                .with_line_number(true)
                .with_thread_ids(true)
                .with_ansi(false)
                .with_writer(writer)
                .with_filter(EnvFilter::new(DEBUG_FILTER));
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(terminal_layer.with_filter(env_filter))
        .with(file_layer)
        .init();

    if let Some(dir) = &config.directory {
        tracing::info!("Logs are also written to {:?}", dir.join("cafe-bot.log"));
    }
    guard
}
