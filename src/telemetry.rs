use std::io;
use std::sync::OnceLock;
use tracing::Level;
use tracing_subscriber::fmt::time::UtcTime;

static TRACING_INIT: OnceLock<()> = OnceLock::new();

/// Install the global tracing subscriber once. Logs go to stderr so a
/// client writing results to stdout stays pipeable.
pub fn init_tracing(debug: bool, quiet: bool, json: bool) {
    let level = if debug {
        Level::DEBUG
    } else if quiet {
        Level::WARN
    } else {
        Level::INFO
    };

    let _ = TRACING_INIT.get_or_init(|| {
        let builder = tracing_subscriber::fmt()
            .with_max_level(level)
            .with_timer(UtcTime::rfc_3339())
            .with_writer(io::stderr);
        let _ = if json {
            tracing::subscriber::set_global_default(builder.json().finish())
        } else {
            tracing::subscriber::set_global_default(builder.finish())
        };
    });
}
