use anyhow::anyhow;
use tracing_subscriber::filter::LevelFilter;

use crate::config::{Config, LogFormat};

const DEFAULT_LEVEL: LevelFilter = LevelFilter::INFO;
const LEVEL_NAMES: &str = "trace, debug, info, warn, error, off";

/// Effective logging setup after merging `[logging]` with the CLI flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogSettings {
    pub level: LevelFilter,
    pub format: LogFormat,
}

impl LogSettings {
    pub fn resolve(config: &Config, cli_level: Option<&str>) -> anyhow::Result<Self> {
        let logging = config.logging.as_ref();
        let level = match cli_level.or_else(|| logging.and_then(|logging| logging.level.as_deref()))
        {
            Some(raw) => parse_level(raw)?,
            None => DEFAULT_LEVEL,
        };
        let format = logging
            .and_then(|logging| logging.format)
            .unwrap_or(LogFormat::Json);
        Ok(Self { level, format })
    }
}

fn parse_level(raw: &str) -> anyhow::Result<LevelFilter> {
    raw.trim()
        .to_ascii_lowercase()
        .parse()
        .map_err(|_| anyhow!("invalid log level `{raw}`; expected one of {LEVEL_NAMES}"))
}

/// Installs the global subscriber on stderr; stdout carries run summaries.
/// JSON events include the enclosing `connection`/`session` span so every
/// line names its peer.
pub fn init(config: &Config, cli_level: Option<&str>) -> anyhow::Result<()> {
    let settings = LogSettings::resolve(config, cli_level)?;
    let builder = tracing_subscriber::fmt()
        .with_max_level(settings.level)
        .with_writer(std::io::stderr);

    match settings.format {
        LogFormat::Json => builder
            .json()
            .with_current_span(true)
            .with_span_list(false)
            .try_init(),
        LogFormat::Pretty => builder.pretty().try_init(),
    }
    .map_err(|err| anyhow!("install tracing subscriber: {err}"))
}

#[cfg(test)]
mod tests {
    use std::{
        io,
        sync::{Arc, Mutex},
    };

    use serde_json::Value;
    use tracing_subscriber::filter::LevelFilter;

    use super::LogSettings;
    use crate::config::{Config, LogFormat};

    #[derive(Clone, Default)]
    struct Captured(Arc<Mutex<Vec<u8>>>);

    impl io::Write for Captured {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn config(toml: &str) -> Config {
        Config::from_toml_str(toml).expect("config should parse")
    }

    #[test]
    fn defaults_are_info_and_json() {
        let settings = LogSettings::resolve(&Config::default(), None).unwrap();
        assert_eq!(settings.level, LevelFilter::INFO);
        assert_eq!(settings.format, LogFormat::Json);
    }

    #[test]
    fn config_section_sets_level_and_format() {
        let config = config("[logging]\nlevel = \"warn\"\nformat = \"pretty\"\n");
        let settings = LogSettings::resolve(&config, None).unwrap();
        assert_eq!(settings.level, LevelFilter::WARN);
        assert_eq!(settings.format, LogFormat::Pretty);
    }

    #[test]
    fn cli_level_wins_and_is_case_insensitive() {
        let config = config("[logging]\nlevel = \"warn\"\n");
        let settings = LogSettings::resolve(&config, Some(" Trace ")).unwrap();
        assert_eq!(settings.level, LevelFilter::TRACE);
    }

    #[test]
    fn unknown_level_names_the_accepted_values() {
        let err = LogSettings::resolve(&Config::default(), Some("loud")).unwrap_err();
        let message = err.to_string();
        assert!(message.contains("`loud`"), "{message}");
        assert!(message.contains("trace, debug"), "{message}");

        let config = config("[logging]\nlevel = \"chatty\"\n");
        assert!(LogSettings::resolve(&config, None).is_err());
    }

    #[test]
    fn json_events_carry_fields_and_enclosing_span() {
        let captured = Captured::default();
        let writer = captured.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_max_level(LevelFilter::DEBUG)
            .json()
            .with_current_span(true)
            .with_span_list(false)
            .with_writer(move || writer.clone())
            .finish();

        tracing::subscriber::with_default(subscriber, || {
            let span = tracing::info_span!("session", peer = "127.0.0.1:4001");
            let _entered = span.enter();
            tracing::info!(sent = 3u64, skipped = 0u64, "session finished");
        });

        let bytes = captured.0.lock().unwrap().clone();
        let output = String::from_utf8(bytes).unwrap();
        let event: Value = serde_json::from_str(output.lines().next().expect("one event"))
            .expect("event should be JSON");

        assert_eq!(event["level"], "INFO", "{event}");
        assert_eq!(event["fields"]["message"], "session finished", "{event}");
        assert_eq!(event["fields"]["sent"], 3, "{event}");
        assert_eq!(event["span"]["name"], "session", "{event}");
        assert_eq!(event["span"]["peer"], "127.0.0.1:4001", "{event}");
    }
}
