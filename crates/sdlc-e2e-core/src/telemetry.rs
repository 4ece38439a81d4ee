//! Tracing initialisation for the verifier binary.
//!
//! [`init_tracing`] installs the global subscriber with an `EnvFilter` and
//! optional JSON output. Only the first call takes effect. Events always go
//! to standard error; standard output carries only command results.

use tracing::{Level, Subscriber};
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::{fmt, EnvFilter};

/// Install the global subscriber.
///
/// `RUST_LOG` wins when set; otherwise `level` is the default verbosity.
/// With `json` every event is a newline-delimited JSON object, which keeps
/// CI logs machine-readable.
pub fn init_tracing(json: bool, level: Level) {
    tracing::subscriber::set_global_default(subscriber(json, level, std::io::stderr)).ok();
}

fn subscriber<W>(json: bool, level: Level, writer: W) -> Box<dyn Subscriber + Send + Sync>
where
    W: for<'a> MakeWriter<'a> + Send + Sync + 'static,
{
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.as_str()));

    let registry = tracing_subscriber::registry().with(env_filter);
    if json {
        Box::new(
            registry.with(
                fmt::layer()
                    .with_target(false)
                    .json()
                    .with_current_span(true)
                    .with_writer(writer),
            ),
        )
    } else {
        Box::new(registry.with(fmt::layer().with_target(false).with_writer(writer)))
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
    fn test_init_twice_is_harmless() {
        init_tracing(false, Level::WARN);
        init_tracing(true, Level::DEBUG);
        tracing::info!("still logging");
    }

    #[test]
    fn test_json_events_use_the_log_writer() {
        let captured = Captured::default();
        let sink = captured.clone();
        let subscriber = subscriber(true, Level::INFO, move || sink.clone());

        tracing::subscriber::with_default(subscriber, || {
            tracing::warn!(step = "scm.install", "step started");
        });

        let output = String::from_utf8(captured.0.lock().unwrap().clone()).unwrap();
        let line = output.lines().next().expect("one event written");
        let event: serde_json::Value = serde_json::from_str(line).unwrap();
        assert_eq!(event["fields"]["step"], "scm.install");
        assert_eq!(event["level"], "WARN");
    }
}
