//! Observability hooks: OpenTelemetry metrics (`metrics` feature) and tracing spans
//! (`tracing` feature).

#[cfg(feature = "metrics")]
pub use self::otel::{LifeguardMetrics, METRICS};

#[cfg(feature = "metrics")]
mod otel {
    use once_cell::sync::Lazy;
    use opentelemetry::{
        global,
        metrics::{Counter, Histogram},
    };
    use opentelemetry_prometheus::PrometheusExporter;
    use std::time::Duration;

    pub static METRICS: Lazy<LifeguardMetrics> = Lazy::new(LifeguardMetrics::init);

    pub struct LifeguardMetrics {
        /// `None` when the Prometheus exporter could not be installed; instruments still work.
        pub exporter: Option<PrometheusExporter>,
        pub queries_total: Counter<u64>,
        pub query_errors_total: Counter<u64>,
        pub query_duration: Histogram<f64>,
        pub cascades_total: Counter<u64>,
        pub cascade_rollbacks_total: Counter<u64>,
    }

    impl LifeguardMetrics {
        pub fn init() -> Self {
            let exporter = match opentelemetry_prometheus::exporter().build() {
                Ok(exporter) => Some(exporter),
                Err(e) => {
                    log::warn!("prometheus exporter unavailable: {e}");
                    None
                }
            };
            let meter = global::meter("lifeguard");

            let queries_total = meter
                .u64_counter("lifeguard_queries_total")
                .with_description("Total statements executed")
                .build();

            let query_errors_total = meter
                .u64_counter("lifeguard_query_errors_total")
                .with_description("Statements that returned an error")
                .build();

            let query_duration = meter
                .f64_histogram("lifeguard_query_duration_seconds")
                .with_description("Duration of statements")
                .build();

            let cascades_total = meter
                .u64_counter("lifeguard_nested_mutations_total")
                .with_description("Nested mutation cascades started")
                .build();

            let cascade_rollbacks_total = meter
                .u64_counter("lifeguard_nested_mutation_rollbacks_total")
                .with_description("Nested mutation cascades rolled back")
                .build();

            Self {
                exporter,
                queries_total,
                query_errors_total,
                query_duration,
                cascades_total,
                cascade_rollbacks_total,
            }
        }

        pub fn record_query_duration(&self, elapsed: Duration) {
            self.queries_total.add(1, &[]);
            self.query_duration.record(elapsed.as_secs_f64(), &[]);
        }

        pub fn record_query_error(&self) {
            self.query_errors_total.add(1, &[]);
        }

        pub fn record_cascade(&self) {
            self.cascades_total.add(1, &[]);
        }

        pub fn record_cascade_rollback(&self) {
            self.cascade_rollbacks_total.add(1, &[]);
        }
    }
}

#[cfg(feature = "tracing")]
pub mod tracing_helpers {
    use tracing::{info_span, Span};

    pub fn execute_query_span(sql: &str) -> Span {
        info_span!("lifeguard.execute_query", db.statement = %sql)
    }

    pub fn begin_transaction_span() -> Span {
        info_span!("lifeguard.begin_transaction")
    }

    pub fn commit_transaction_span() -> Span {
        info_span!("lifeguard.commit_transaction")
    }

    pub fn rollback_transaction_span() -> Span {
        info_span!("lifeguard.rollback_transaction")
    }

    pub fn nested_mutation_span(entity: &str, operation: &'static str) -> Span {
        info_span!("lifeguard.nested_mutation", entity = %entity, operation = operation)
    }
}
