use tracing_subscriber::Layer as _;
use tracing_subscriber::layer::SubscriberExt as _;
use tracing_subscriber::util::SubscriberInitExt as _;

fn env_filter() -> tracing_subscriber::EnvFilter {
    tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"))
}

fn fmt_layer<S>(json_logs: bool) -> Box<dyn tracing_subscriber::Layer<S> + Send + Sync>
where
    S: tracing::Subscriber + for<'a> tracing_subscriber::registry::LookupSpan<'a>,
{
    if json_logs {
        tracing_subscriber::fmt::layer()
            .json()
            .with_target(false)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer().with_target(false).boxed()
    }
}

/// Installs the global subscriber: `RUST_LOG` filter (default `info`) and a
/// plain or JSON formatter.
pub fn init_tracing(json_logs: bool) -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(env_filter())
        .with(fmt_layer(json_logs))
        .try_init()?;
    Ok(())
}

#[cfg(feature = "otel")]
pub use otel::{OtelGuard, init_tracing_with_otel};

#[cfg(feature = "otel")]
mod otel {
    use opentelemetry::global;
    use opentelemetry::trace::TracerProvider as _;
    use opentelemetry_otlp::SpanExporter;
    use opentelemetry_otlp::WithExportConfig as _;
    use opentelemetry_sdk::Resource;
    use tracing_subscriber::layer::SubscriberExt as _;
    use tracing_subscriber::util::SubscriberInitExt as _;

    /// Flushes and shuts the span exporter down on drop.
    #[derive(Debug)]
    pub struct OtelGuard {
        provider: opentelemetry_sdk::trace::SdkTracerProvider,
    }

    impl Drop for OtelGuard {
        fn drop(&mut self) {
            if let Err(err) = self.provider.shutdown() {
                eprintln!("otel shutdown failed: {err}");
            }
        }
    }

    pub fn init_tracing_with_otel(
        service_name: &str,
        endpoint: Option<&str>,
        json_logs: bool,
    ) -> Result<OtelGuard, Box<dyn std::error::Error>> {
        let mut exporter = SpanExporter::builder().with_http();
        if let Some(endpoint) = endpoint {
            exporter = exporter.with_endpoint(endpoint.to_string());
        }
        let exporter = exporter.build()?;

        let provider = opentelemetry_sdk::trace::SdkTracerProvider::builder()
            .with_batch_exporter(exporter)
            .with_resource(
                Resource::builder_empty()
                    .with_service_name(service_name.to_string())
                    .build(),
            )
            .build();
        global::set_tracer_provider(provider.clone());

        let tracer = provider.tracer(service_name.to_string());
        let otel_layer = tracing_opentelemetry::layer().with_tracer(tracer);

        tracing_subscriber::registry()
            .with(super::env_filter())
            .with(super::fmt_layer(json_logs))
            .with(otel_layer)
            .try_init()?;

        Ok(OtelGuard { provider })
    }
}
