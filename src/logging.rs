//! Thin facade over the `slog` ecosystem so the rest of the crate imports a
//! single module for both the macros and logger construction.

pub use slog::{debug, error, info, o, trace, warn, Discard, Logger};

use crate::support::{ErrorType, TransportError, TransportResult};

/// Builds the root logger from a TOML logger description understood by
/// `sloggers`, e.g.
///
/// ```toml
/// type = "terminal"
/// level = "debug"
/// destination = "stderr"
/// ```
pub fn from_toml(toml: &str) -> TransportResult<Logger> {
    use sloggers::{Config, LoggerConfig};

    let config: LoggerConfig =
        serdeconv::from_toml_str(toml).map_err(|_| TransportError::Fatal(ErrorType::Corrupt))?;

    config
        .build_logger()
        .map_err(|_| TransportError::Fatal(ErrorType::Corrupt))
}

/// Default terminal logger at debug level.
pub fn term() -> TransportResult<Logger> {
    from_toml(
        r#"
type = "terminal"
level = "debug"
destination = "stderr"
"#,
    )
}

/// A logger that drops everything. Used by tests and as the fallback when
/// the embedding runtime supplies no logger of its own.
pub fn discard() -> Logger {
    Logger::root(Discard, o!())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_toml() {
        let log = from_toml(
            r#"
type = "terminal"
level = "info"
destination = "stderr"
"#,
        )
        .unwrap();

        info!(log, "logger built"; "context" => "test");
    }

    #[test]
    fn test_bad_toml_is_rejected() {
        assert!(from_toml("type = \"no-such-drain\"").is_err());
    }
}
