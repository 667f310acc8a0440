use tracing::Subscriber;
use tracing_subscriber::layer::{Context, SubscriberExt};
use tracing_subscriber::{EnvFilter, Layer};

/// Counts ERROR events per target module so alerting can key off error
/// volume without scraping log lines.
struct ErrorTally;

impl<S> Layer<S> for ErrorTally
where
    S: Subscriber,
{
    fn on_event(&self, event: &tracing::Event<'_>, _ctx: Context<'_, S>) {
        let meta = event.metadata();
        if *meta.level() == tracing::Level::ERROR {
            metrics::counter!("tracing_error_events", "target" => meta.target()).increment(1);
        }
    }
}

/// Dispatcher wiring shared by the daemon and one-shot CLI runs: flattened
/// JSON lines on stdout, `RUST_LOG` overriding `default_level`, and the
/// error tally stacked on top.
pub fn build_dispatch(default_level: &str) -> tracing::Dispatch {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .json()
        .flatten_event(true);

    let subscriber = tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .with(ErrorTally);

    tracing::Dispatch::new(subscriber)
}
