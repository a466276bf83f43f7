//! Tracing subscriber setup.
//!
//! The level filter sits behind a reload layer so the `log_level` command can
//! change verbosity while the worker is running. Log lines always go to
//! stderr so they never mix with data written to stdout.

use std::io::IsTerminal;

use tracing::{info, Subscriber};
use tracing_subscriber::{
    fmt::{self, MakeWriter},
    layer::SubscriberExt,
    registry::LookupSpan,
    reload,
    util::SubscriberInitExt,
    EnvFilter, Layer, Registry,
};

use crate::config::{is_valid_log_level, LoggingConfig};
use crate::error::{AppResult, SpectroError};

/// Handle for changing the active log filter at runtime.
#[derive(Clone, Debug)]
pub struct LogHandle {
    inner: reload::Handle<EnvFilter, Registry>,
}

impl LogHandle {
    /// Replace the active filter with `level` (a level name or directive).
    pub fn set_level(&self, level: &str) -> AppResult<()> {
        if !is_valid_log_level(level) {
            return Err(SpectroError::Logging(format!("unknown log level '{level}'")));
        }
        let filter = EnvFilter::try_new(level.to_ascii_lowercase())
            .map_err(|e| SpectroError::Logging(e.to_string()))?;
        self.inner
            .reload(filter)
            .map_err(|e| SpectroError::Logging(e.to_string()))?;
        info!(level, "log level changed");
        Ok(())
    }

    /// The filter currently in effect, rendered as directives.
    pub fn current(&self) -> Option<String> {
        self.inner.with_current(|filter| filter.to_string()).ok()
    }
}

/// Install the global subscriber.
///
/// `RUST_LOG` wins over the configured level when it is set. Fails if a global
/// subscriber is already installed.
pub fn init(config: &LoggingConfig) -> AppResult<LogHandle> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .map_err(|e| SpectroError::Logging(e.to_string()))?;
    let (filter, handle) = reload::Layer::new(filter);

    let fmt_layer = output_layer(
        config.json,
        std::io::stderr().is_terminal(),
        std::io::stderr,
    );

    Registry::default()
        .with(filter)
        .with(fmt_layer)
        .try_init()
        .map_err(|e| SpectroError::Logging(e.to_string()))?;

    Ok(LogHandle { inner: handle })
}

/// Text or JSON formatting layer writing to `writer`.
fn output_layer<S, W>(json: bool, ansi: bool, writer: W) -> Box<dyn Layer<S> + Send + Sync>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    let layer = fmt::layer().with_target(true).with_writer(writer);
    if json {
        layer.json().boxed()
    } else {
        layer.with_ansi(ansi).boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;
    use std::sync::{Arc, Mutex};

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

    #[test]
    fn json_lines_go_to_the_given_writer() {
        let captured = Captured::default();
        let sink = captured.clone();
        let subscriber = Registry::default().with(output_layer(true, false, move || sink.clone()));
        tracing::subscriber::with_default(subscriber, || {
            info!(frames = 3, "average complete");
        });

        let text = String::from_utf8(captured.0.lock().unwrap().clone()).unwrap();
        let line: serde_json::Value = serde_json::from_str(text.trim()).unwrap();
        assert_eq!(line["fields"]["message"], "average complete");
        assert_eq!(line["fields"]["frames"], 3);
        assert_eq!(line["target"], "spectro_daq::logging");
    }

    #[test]
    fn set_level_reloads_filter() {
        let (layer, inner) = reload::Layer::new(EnvFilter::new("info"));
        let _subscriber = Registry::default().with(layer);
        let handle = LogHandle { inner };

        handle.set_level("DEBUG").unwrap();
        assert_eq!(handle.current().as_deref(), Some("debug"));

        assert!(matches!(
            handle.set_level("chatty"),
            Err(SpectroError::Logging(_))
        ));
        assert_eq!(handle.current().as_deref(), Some("debug"));
    }
}
