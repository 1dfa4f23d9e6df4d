// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! Log subscriber and trace propagation setup for the worker binary.

use opentelemetry::global;
use opentelemetry_sdk::propagation::TraceContextPropagator;
use std::sync::OnceLock;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

static LOGGING_INIT: OnceLock<()> = OnceLock::new();
static PROPAGATION_INIT: OnceLock<()> = OnceLock::new();

/// Installs the global subscriber: `RUST_LOG` filter (default `info`) and the
/// fmt layer, along with the trace context propagator. Later calls do nothing.
pub fn init_logging() {
    LOGGING_INIT.get_or_init(|| {
        init_propagation();

        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
        let fmt_layer = tracing_subscriber::fmt::layer().with_target(false);

        let _ = tracing_subscriber::registry()
            .with(filter)
            .with(fmt_layer)
            .try_init();
    });
}

/// Installs the W3C `traceparent`/`tracestate` propagator used to carry the
/// trace context through AMQP headers. Later calls do nothing.
pub fn init_propagation() {
    PROPAGATION_INIT.get_or_init(|| {
        global::set_text_map_propagator(TraceContextPropagator::new());
    });
}
