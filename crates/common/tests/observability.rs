use metrics_exporter_prometheus::PrometheusBuilder;

// Exercises the dispatcher through `common::observability` the way the
// binaries wire it, rather than poking at the layer directly.

#[test]
fn error_events_are_counted_per_target() {
    let recorder = PrometheusBuilder::new().build_recorder();
    let handle = recorder.handle();

    metrics::with_local_recorder(&recorder, || {
        let dispatch = common::observability::build_dispatch("info");

        tracing::dispatcher::with_default(&dispatch, || {
            tracing::error!(wallet = "0xabc", "chain lookup failed");
            let span = tracing::info_span!("job_run", job = "wallet_scan");
            let _guard = span.enter();
            tracing::error!(source = "data_api", "trade source request failed");
        });
    });

    // Integration tests compile as their own crate, so the events' target
    // is this file's crate name.
    let rendered = handle.render();
    assert!(
        rendered.contains(r#"tracing_error_events{target="observability"} 2"#),
        "expected tracing_error_events to count both errors, got:\n{rendered}"
    );
}

#[test]
fn lower_levels_never_touch_the_error_counter() {
    let recorder = PrometheusBuilder::new().build_recorder();
    let handle = recorder.handle();

    metrics::with_local_recorder(&recorder, || {
        let dispatch = common::observability::build_dispatch("info");

        tracing::dispatcher::with_default(&dispatch, || {
            tracing::warn!(source = "activity", "rate limited, caller should back off");
            tracing::info!(wallet = "0xabc", "wallet scored");
        });
    });

    // The counter registers on first increment, so it must be absent.
    let rendered = handle.render();
    assert!(
        !rendered.contains("tracing_error_events"),
        "warn/info must not touch the error counter, got:\n{rendered}"
    );
}
