pub use slog::{debug, error, info, o, trace, warn, Logger};

use sloggers::{Config, LoggerConfig};

/// Build a root logger. Level is one of the `sloggers` level strings ("trace", "debug",
/// "info", "warning", "error", "critical").
pub fn init(level: &str) -> Logger {
    let toml = format!(
        r#"
type = "terminal"
level = "{}"
destination = "stderr"
"#,
        level
    );

    let config: LoggerConfig =
        serdeconv::from_toml_str(&toml).expect("invalid built-in logger config");

    config.build_logger().expect("failed to build logger")
}

/// A logger that discards everything, for tests and default-constructed components that
/// haven't been wired up to the real logger yet.
pub fn discard() -> Logger {
    Logger::root(slog::Discard, o!())
}
