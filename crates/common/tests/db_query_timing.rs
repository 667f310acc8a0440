use metrics_exporter_prometheus::PrometheusBuilder;

#[test]
fn call_named_labels_latency_by_operation_and_status() {
    let recorder = PrometheusBuilder::new().build_recorder();
    let handle = recorder.handle();

    let rt = tokio::runtime::Runtime::new().unwrap();
    metrics::with_local_recorder(&recorder, || {
        rt.block_on(async {
            let tmp = tempfile::NamedTempFile::new().unwrap();
            let db = common::db::AsyncDb::open(tmp.path().to_str().unwrap())
                .await
                .unwrap();

            // Migrations have run, so the wallets table exists.
            let wallets: i64 = db
                .call_named("wallets.count", |conn| {
                    Ok(conn.query_row("SELECT COUNT(*) FROM wallets", [], |row| row.get(0))?)
                })
                .await
                .unwrap();
            assert_eq!(wallets, 0);
        });
    });

    let rendered = handle.render();
    assert!(
        rendered.contains("scanner_db_query_latency_ms"),
        "expected a latency sample in rendered metrics, got:\n{rendered}"
    );
    assert!(
        rendered.contains(r#"op="wallets.count""#) && rendered.contains(r#"status="ok""#),
        "expected the sample labeled by operation and status, got:\n{rendered}"
    );
    assert!(
        !rendered.contains("scanner_db_query_errors_total"),
        "a successful query must not count as an error, got:\n{rendered}"
    );
}

#[test]
fn call_named_counts_errors_per_operation() {
    let recorder = PrometheusBuilder::new().build_recorder();
    let handle = recorder.handle();

    let rt = tokio::runtime::Runtime::new().unwrap();
    metrics::with_local_recorder(&recorder, || {
        rt.block_on(async {
            let tmp = tempfile::NamedTempFile::new().unwrap();
            let db = common::db::AsyncDb::open(tmp.path().to_str().unwrap())
                .await
                .unwrap();

            let err: anyhow::Result<()> = db
                .call_named("boom.select", |conn| {
                    let _ = conn.execute("SELECT * FROM definitely_missing_table", [])?;
                    Ok(())
                })
                .await;
            assert!(err.is_err());
        });
    });

    let rendered = handle.render();
    assert!(
        rendered.contains(r#"scanner_db_query_errors_total{op="boom.select"} 1"#),
        "expected the error counter keyed by operation, got:\n{rendered}"
    );
    assert!(
        rendered.contains(r#"status="err""#),
        "expected the latency sample tagged status=err, got:\n{rendered}"
    );
}
