use std::sync::Once;

use log::LevelFilter;

static LOGGER_INIT: Once = Once::new();

// Set up a logger that logs all log messages with level `level` and above. Safe to call from every test.
pub(crate) fn setup_logger(level: LevelFilter) {
    LOGGER_INIT.call_once(|| {
        ddrp_rs::logging::setup_logger(level).unwrap();
    })
}

// Log a test step, prefixed with the test's name so interleaved output stays readable.
pub(crate) fn log_with_context(context: Option<&str>, message: &str) {
    match context {
        Some(context) => log::info!("[{}] {}", context, message),
        None => log::info!("{}", message),
    }
}
