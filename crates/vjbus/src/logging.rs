//! Tracing setup shared by the binaries.

use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, fmt};

/// Install the global subscriber.
///
/// `RUST_LOG` wins when set. Otherwise `VJBUS_LOG` (debug|info|warn|error)
/// picks the level for the vjbus targets, `info` by default.
/// `LOG_FORMAT=json` switches to JSON lines. Output goes to stderr so stdout
/// stays free for command output.
pub fn init_tracing() {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let level = base_level(std::env::var("VJBUS_LOG").ok().as_deref());
        EnvFilter::new(format!(
            "vjbus={level},vjbus_cli={level},vjbus_echo_worker={level}"
        ))
    };

    let use_json = std::env::var("LOG_FORMAT").as_deref() == Ok("json");

    if use_json {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    } else {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    }
}

fn base_level(setting: Option<&str>) -> &'static str {
    match setting {
        Some("debug") => "debug",
        Some("warn") | Some("warning") => "warn",
        Some("error") => "error",
        _ => "info",
    }
}
