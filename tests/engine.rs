//! End-to-end engine tests against an in-process mock WAF.

use axum::body::Body;
use axum::extract::Request;
use axum::http::StatusCode;
use axum::Router;
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::watch;

use waf_comparison::classify::{Classification, VerdictContract};
use waf_comparison::config::RunConfig;
use waf_comparison::runner::RunController;
use waf_comparison::store::{HealthState, ResultStore};

/// Mock WAF: blocks any request whose URL or body mentions "script" or
/// "attack" (matching survives percent-encoding), stalls on "hang", allows
/// everything else. `blocking = false` simulates detection-only mode.
fn mock_waf(blocking: bool, corpus_hits: Arc<AtomicUsize>) -> Router {
    Router::new().fallback(move |req: Request<Body>| {
        let corpus_hits = corpus_hits.clone();
        async move {
            let uri = req.uri().to_string();
            let body = axum::body::to_bytes(req.into_body(), usize::MAX)
                .await
                .unwrap_or_default();
            let payload = format!("{uri} {}", String::from_utf8_lossy(&body));

            // Corpus records all use the /?p= shape; health and canary
            // probes do not, so this counts real dispatches only.
            if uri.starts_with("/?p=") {
                corpus_hits.fetch_add(1, Ordering::SeqCst);
            }

            if payload.contains("hang") {
                tokio::time::sleep(Duration::from_secs(2)).await;
            } else if payload.contains("slow") {
                tokio::time::sleep(Duration::from_millis(150)).await;
            }

            if blocking && (payload.contains("script") || payload.contains("attack")) {
                StatusCode::FORBIDDEN
            } else {
                StatusCode::OK
            }
        }
    })
}

async fn spawn_mock(blocking: bool, corpus_hits: Arc<AtomicUsize>) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = mock_waf(blocking, corpus_hits);
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}")
}

fn write_corpus(datasets_dir: &Path, corpus: &str, file: &str, paths: &[&str]) {
    let dir = datasets_dir.join(corpus);
    fs::create_dir_all(&dir).unwrap();
    let records: Vec<String> = paths
        .iter()
        .map(|p| {
            format!(
                r#"{{"method":"GET","url":"{p}","headers":{{"User-Agent":"mock-test","Connection":"close"}},"data":""}}"#
            )
        })
        .collect();
    fs::write(dir.join(file), format!("[{}]", records.join(","))).unwrap();
}

fn run_config(workspace: &TempDir, target_url: &str, fresh: bool) -> RunConfig {
    RunConfig {
        targets: vec![("Mock WAF".to_string(), target_url.to_string())],
        max_workers: 4,
        fast_mode: false,
        fresh_run: fresh,
        datasets_dir: workspace.path().join("datasets"),
        database_url: format!("sqlite://{}", workspace.path().join("waf_comparison.db").display()),
        request_timeout: Duration::from_millis(300),
    }
}

async fn run(config: RunConfig) -> waf_comparison::runner::RunReport {
    let (_abort_tx, abort_rx) = watch::channel(false);
    RunController::new(config, VerdictContract::default(), abort_rx)
        .run()
        .await
        .unwrap()
}

#[tokio::test]
async fn scores_the_two_by_two_scenario() {
    let workspace = TempDir::new().unwrap();
    let datasets = workspace.path().join("datasets");
    // m1 blocked, m2 allowed; l1 blocked (looks attacky), l2 allowed.
    write_corpus(&datasets, "Malicious", "xss.json", &["/?p=<script>x</script>", "/?p=benignish"]);
    write_corpus(&datasets, "Legitimate", "browse.json", &["/?p=attack-of-the-clones", "/?p=hello"]);

    let hits = Arc::new(AtomicUsize::new(0));
    let url = spawn_mock(true, hits.clone()).await;

    let report = run(run_config(&workspace, &url, true)).await;

    assert_eq!(report.results.len(), 1);
    assert!(report.skipped.is_empty());
    let (_, metrics) = &report.results[0];
    assert_eq!(
        (metrics.tp, metrics.fne, metrics.fp, metrics.tn, metrics.error_count),
        (1, 1, 1, 1, 0)
    );
    assert_eq!(metrics.tpr, Some(0.5));
    assert_eq!(metrics.tnr, Some(0.5));
    assert_eq!(metrics.balanced_accuracy, Some(0.5));
    // Every dispatched record landed in exactly one cell.
    assert_eq!(metrics.total, hits.load(Ordering::SeqCst) as i64);
}

#[tokio::test]
async fn detection_only_target_is_skipped_with_zero_observations() {
    let workspace = TempDir::new().unwrap();
    let datasets = workspace.path().join("datasets");
    write_corpus(&datasets, "Malicious", "xss.json", &["/?p=<script>x</script>"]);
    write_corpus(&datasets, "Legitimate", "browse.json", &["/?p=hello"]);

    let hits = Arc::new(AtomicUsize::new(0));
    // Reachable, but lets the canary through.
    let url = spawn_mock(false, hits.clone()).await;

    let config = run_config(&workspace, &url, true);
    let database_url = config.database_url.clone();
    let report = run(config).await;

    assert!(report.results.is_empty());
    assert_eq!(report.skipped.len(), 1);
    assert_eq!(report.skipped[0].health_state, HealthState::NotInPreventionMode);

    let store = ResultStore::connect(&database_url).await.unwrap();
    assert!(store.query("Mock WAF").await.unwrap().is_empty());
    assert_eq!(hits.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn resume_dispatches_only_the_gap() {
    let workspace = TempDir::new().unwrap();
    let datasets = workspace.path().join("datasets");
    write_corpus(
        &datasets,
        "Malicious",
        "set.json",
        &["/?p=<script>1</script>", "/?p=<script>2</script>", "/?p=<script>3</script>"],
    );
    write_corpus(&datasets, "Legitimate", "browse.json", &["/?p=hello"]);

    let hits = Arc::new(AtomicUsize::new(0));
    let url = spawn_mock(true, hits.clone()).await;

    run(run_config(&workspace, &url, true)).await;
    let after_first = hits.load(Ordering::SeqCst);
    assert_eq!(after_first, 4);

    // The corpus grows by two records; the original three keep their ids.
    write_corpus(
        &datasets,
        "Malicious",
        "set.json",
        &[
            "/?p=<script>1</script>",
            "/?p=<script>2</script>",
            "/?p=<script>3</script>",
            "/?p=<script>4</script>",
            "/?p=<script>5</script>",
        ],
    );

    let report = run(run_config(&workspace, &url, false)).await;

    // Only the two new records were dispatched on resume.
    assert_eq!(hits.load(Ordering::SeqCst), after_first + 2);
    let (_, metrics) = &report.results[0];
    assert_eq!(metrics.total, 6);
    assert_eq!(metrics.tp, 5);
}

#[tokio::test]
async fn abort_drains_in_flight_and_stops_admission() {
    let workspace = TempDir::new().unwrap();
    let datasets = workspace.path().join("datasets");
    let paths: Vec<String> =
        (0..12).map(|n| format!("/?p=<script>slow{n}</script>")).collect();
    let refs: Vec<&str> = paths.iter().map(String::as_str).collect();
    write_corpus(&datasets, "Malicious", "drain.json", &refs);

    let hits = Arc::new(AtomicUsize::new(0));
    let url = spawn_mock(true, hits.clone()).await;

    let mut config = run_config(&workspace, &url, true);
    config.max_workers = 2;
    config.request_timeout = Duration::from_secs(2);
    let database_url = config.database_url.clone();

    let (abort_tx, abort_rx) = watch::channel(false);
    let controller = RunController::new(config, VerdictContract::default(), abort_rx);
    let handle = tokio::spawn(async move { controller.run().await.unwrap() });

    // Wait until corpus requests are actually in flight, then abort.
    while hits.load(Ordering::SeqCst) == 0 {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    abort_tx.send(true).unwrap();

    let report = handle.await.unwrap();

    // Admission stopped partway through, but everything admitted before the
    // abort was drained to completion and persisted.
    let store = ResultStore::connect(&database_url).await.unwrap();
    let rows = store.query("Mock WAF").await.unwrap();
    assert_eq!(rows.len(), hits.load(Ordering::SeqCst));
    assert!(!rows.is_empty());
    assert!(rows.len() < 12);

    let (_, metrics) = &report.results[0];
    assert_eq!(metrics.total, rows.len() as i64);
}

#[tokio::test]
async fn timed_out_record_counts_as_attempted() {
    let workspace = TempDir::new().unwrap();
    let datasets = workspace.path().join("datasets");
    // Only a malicious corpus: the missing legitimate corpus is skipped
    // without failing the run.
    write_corpus(&datasets, "Malicious", "slow.json", &["/?p=hang", "/?p=<script>x</script>"]);

    let hits = Arc::new(AtomicUsize::new(0));
    let url = spawn_mock(true, hits.clone()).await;

    let config = run_config(&workspace, &url, true);
    let database_url = config.database_url.clone();
    let report = run(config).await;

    let (_, metrics) = &report.results[0];
    assert_eq!(metrics.error_count, 1);
    assert_eq!(metrics.tp, 1);
    // TPR excludes the error row entirely.
    assert_eq!(metrics.tpr, Some(1.0));

    let store = ResultStore::connect(&database_url).await.unwrap();
    let rows = store.query("Mock WAF").await.unwrap();
    let error_row = rows.iter().find(|o| o.classification == Classification::Error).unwrap();
    assert!(error_row.http_status.is_none());

    // An error observation is "already attempted": resuming does not
    // re-dispatch it.
    let before = hits.load(Ordering::SeqCst);
    run(run_config(&workspace, &url, false)).await;
    assert_eq!(hits.load(Ordering::SeqCst), before);
}
