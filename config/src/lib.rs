use std::{path::Path, str::FromStr};

use thiserror::Error;
use tracing::level_filters::LevelFilter;
use tracing_appender::{non_blocking, rolling};
use tracing_subscriber::fmt;

pub mod mapping;
pub mod registry;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Error, Debug)]
#[error("unknown log format `{0}`, expected `text` or `json`")]
pub struct ParseLogFormatError(String);

impl FromStr for LogFormat {
    type Err = ParseLogFormatError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "text" => Ok(Self::Text),
            "json" => Ok(Self::Json),
            _ => Err(ParseLogFormatError(s.to_owned())),
        }
    }
}

pub fn setup_tracing_to_stdout(
    filter: impl Into<LevelFilter>,
    format: LogFormat,
) -> anyhow::Result<()> {
    let builder = fmt().with_max_level(filter);

    match format {
        LogFormat::Text => builder.try_init(),
        LogFormat::Json => builder.json().try_init(),
    }
    .map_err(|e| anyhow::anyhow!(e))
}

pub fn setup_tracing_to_file(
    directory: impl AsRef<Path>,
    file_name_prefix: impl AsRef<Path>,
    filter: impl Into<LevelFilter>,
    format: LogFormat,
) -> anyhow::Result<non_blocking::WorkerGuard> {
    let file_appender = rolling::daily(directory, file_name_prefix);
    let (non_blocking, guard) = non_blocking(file_appender);
    let builder = fmt()
        .with_writer(non_blocking)
        .with_ansi(false)
        .with_max_level(filter);

    match format {
        LogFormat::Text => builder.try_init(),
        LogFormat::Json => builder.json().try_init(),
    }
    .map_err(|e| anyhow::anyhow!(e))?;

    Ok(guard)
}

#[cfg(test)]
mod tests {
    use tracing::Level;

    use super::*;

    #[test]
    fn parse_log_format() {
        assert_eq!("text".parse::<LogFormat>().unwrap(), LogFormat::Text);
        assert_eq!("JSON".parse::<LogFormat>().unwrap(), LogFormat::Json);
        assert!("yaml".parse::<LogFormat>().is_err());
    }

    #[tokio::test]
    async fn test_setup_tracing_to_file() {
        let dir = tempfile::tempdir().unwrap();
        let guard =
            setup_tracing_to_file(dir.path(), "vipgate.log", Level::DEBUG, LogFormat::Text)
                .unwrap();
        tracing::debug!("Hello, world!");
        drop(guard);

        let current_date = chrono::Utc::now().format("%Y-%m-%d");
        let file_name = dir.path().join(format!("vipgate.log.{}", current_date));
        assert!(file_name.exists());

        let file_content = std::fs::read_to_string(&file_name).unwrap();
        assert!(file_content.contains("Hello, world!"));
    }
}
