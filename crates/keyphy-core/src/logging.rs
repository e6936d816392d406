//! Logger setup for keyphy binaries.
//!
//! Keyphy's own crates log at the requested level. Everything else (the DNS
//! codec, udev) is held at `warn` so a busy resolver does not drown the
//! security alerts.

use env_logger::Env;
use serde_json::json;
use std::env;
use std::io::Write;
use std::sync::OnceLock;

static INIT: OnceLock<()> = OnceLock::new();

const FORMAT_ENV: &str = "KEYPHY_LOG_FORMAT";
const LEVEL_ENV: &str = "KEYPHY_LOG_LEVEL";

/// Log targets of the keyphy workspace.
const KEYPHY_TARGETS: &[&str] = &["keyphy_core", "keyphy_dns", "keyphy_usb", "keyphyd"];

/// Filter applied when `RUST_LOG` is unset.
pub fn default_filter(level: &str) -> String {
    let level = level.trim().to_ascii_lowercase();
    let mut filter = String::from("warn");
    for target in KEYPHY_TARGETS {
        filter.push_str(&format!(",{target}={level}"));
    }
    filter
}

/// Initialize the global logger once; later calls are no-ops.
///
/// `RUST_LOG` wins when set. Otherwise [`default_filter`] is built from
/// `KEYPHY_LOG_LEVEL`, falling back to `default_level`. Output is JSON lines
/// unless `KEYPHY_LOG_FORMAT=plain`.
pub fn init(default_level: &str) {
    let _ = INIT.get_or_init(|| configure(default_level));
}

fn configure(default_level: &str) {
    let level = env::var(LEVEL_ENV).unwrap_or_else(|_| default_level.to_string());
    let env = Env::default().default_filter_or(default_filter(&level));

    let plain = env::var(FORMAT_ENV).is_ok_and(|format| format.eq_ignore_ascii_case("plain"));

    let mut builder = env_logger::Builder::from_env(env);
    if plain {
        builder.format(|buf, record| {
            writeln!(
                buf,
                "{} {:<5} {} - {}",
                buf.timestamp(),
                record.level().to_string().to_lowercase(),
                record.target(),
                record.args()
            )
        });
    } else {
        builder.format(|buf, record| {
            let message = record.args().to_string();
            let alert = message.starts_with("SECURITY ALERT");
            let mut payload = json!({
                "timestamp": buf.timestamp().to_string(),
                "level": record.level().to_string().to_lowercase(),
                "target": record.target(),
                "message": message,
            });
            if alert {
                payload["alert"] = json!(true);
            }
            writeln!(buf, "{payload}")
        });
    }

    if let Err(err) = builder.try_init() {
        eprintln!("failed to initialize logger: {err}");
    }
}
