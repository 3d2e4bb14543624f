//! API Regression Tests
//!
//! In-process tests that build the Axum app via `create_app()` and walk the
//! ingest → monitor → delete → retrain flow using `tower::ServiceExt::oneshot()`.
//! No binary spawn, no network port.

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use ndarray::Array1;
use sha2::{Digest, Sha256};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;

use vibe_guard::api::create_app;
use vibe_guard::config::{GuardConfig, PreprocessSettings, StorageConfig};
use vibe_guard::model::{
    derive_threshold, ArtifactStore, FrozenAutoencoder, ModelBundle, ModelError, ThresholdMethod,
};
use vibe_guard::processing::FeatureStats;
use vibe_guard::retrain::{RetrainError, RetrainJob};
use vibe_guard::service::GuardService;
use vibe_guard::storage::SampleStore;

fn test_config(root: &Path) -> GuardConfig {
    let mut config = GuardConfig::default();
    config.preprocess = PreprocessSettings {
        source_rate_hz: 1_000.0,
        target_rate_hz: 1_000.0,
        window_seconds: 0.016,
        hop_seconds: 0.008,
        decimate: false,
        channels: 1,
        max_windows_per_file: None,
    };
    config.rpm.operating_points = vec!["800".to_string(), "1000".to_string()];
    config.storage = StorageConfig::rooted_at(root);
    config
}

fn bundle(config: &GuardConfig, rpm: &str, version: &str) -> Result<ModelBundle, ModelError> {
    let preprocess = vibe_guard::processing::PreprocessConfig::from_settings(&config.preprocess)?;
    let dim = preprocess.feature_dim();
    let stats = FeatureStats {
        mean: Array1::zeros(dim),
        std: Array1::ones(dim),
    };
    let network = FrozenAutoencoder::initialize(dim, &[4], 11)?;
    let baseline: Vec<f64> = (0..50).map(|i| 0.5 + f64::from(i) * 0.01).collect();
    let threshold = derive_threshold(rpm, &baseline, ThresholdMethod::P95, &[0])?;
    ModelBundle::new(rpm, version, preprocess, stats, network, threshold, baseline)
}

/// Retrain job that takes a while and then rebuilds the same geometry.
struct SlowJob {
    config: GuardConfig,
    delay: Duration,
}

impl RetrainJob for SlowJob {
    fn build(
        &self,
        rpm: &str,
        version: &str,
        cancel: &CancellationToken,
    ) -> Result<ModelBundle, RetrainError> {
        let deadline = Instant::now() + self.delay;
        while Instant::now() < deadline {
            if cancel.is_cancelled() {
                return Err(ModelError::Cancelled.into());
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        Ok(bundle(&self.config, rpm, version)?)
    }
}

struct TestApp {
    _dir: tempfile::TempDir,
    service: GuardService,
}

impl TestApp {
    fn new() -> Self {
        let dir = tempfile::tempdir().expect("tmpdir");
        let config = test_config(dir.path());
        ArtifactStore::from_config(&config.storage)
            .save_versioned(&bundle(&config, "800", "v-initial").expect("bundle"))
            .expect("save");

        let store = SampleStore::open_temporary().expect("store");
        let job = Arc::new(SlowJob {
            config: config.clone(),
            delay: Duration::from_millis(400),
        });
        let service = GuardService::new(config, store, job).expect("service");
        Self { _dir: dir, service }
    }

    fn router(&self) -> Router {
        create_app(self.service.clone())
    }

    async fn call(&self, request: Request<Body>) -> (StatusCode, serde_json::Value) {
        let response = self.router().oneshot(request).await.expect("response");
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("body");
        let json = if bytes.is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::from_slice(&bytes).expect("json")
        };
        (status, json)
    }
}

fn upload(filename: &str, rpm: &str, body: &str) -> Request<Body> {
    let boundary = "vibeguardboundary";
    let payload = format!(
        "--{boundary}\r\nContent-Disposition: form-data; name=\"file\"; filename=\"{filename}\"\r\n\
         Content-Type: text/csv\r\n\r\n{body}\r\n\
         --{boundary}\r\nContent-Disposition: form-data; name=\"rpm\"\r\n\r\n{rpm}\r\n\
         --{boundary}\r\nContent-Disposition: form-data; name=\"user_id\"\r\n\r\n7\r\n\
         --{boundary}--\r\n"
    );
    Request::builder()
        .method("POST")
        .uri("/predict")
        .header(
            "content-type",
            format!("multipart/form-data; boundary={boundary}"),
        )
        .body(Body::from(payload))
        .expect("request")
}

/// `rows` samples of a sine with the given DC offset, one value per line.
fn sine_csv(rows: usize, offset: f64) -> String {
    (0..rows)
        .map(|i| format!("{}\n", (i as f64 * 0.4).sin() + offset))
        .collect()
}

fn sha256_hex(body: &str) -> String {
    hex::encode(Sha256::digest(body.as_bytes()))
}

#[tokio::test]
async fn test_ingest_then_latest_analysis() {
    let app = TestApp::new();
    let csv = sine_csv(128, 0.0);

    let (status, v) = app.call(upload("run_01.csv", "800", &csv)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(v["status"], "success");
    assert_eq!(v["is_saved"], true);
    assert_eq!(v["verdict"]["windows"], 15);
    assert_eq!(v["retrain"]["count"], 1);
    assert_eq!(v["retrain"]["dispatched"], false);

    let (status, v) = app
        .call(
            Request::get("/api/monitoring/latest-analysis")
                .body(Body::empty())
                .expect("request"),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(v["rpm"], "800");
    assert_eq!(v["filename"], "run_01.csv");
    assert!(v["metrics"]["limit"].as_f64().is_some());
    assert_eq!(v["chartData"].as_array().map(Vec::len), Some(5));

    let (_, health) = app
        .call(Request::get("/health").body(Body::empty()).expect("request"))
        .await;
    assert_eq!(health["rpms"][0]["validated_samples"], 1);
    assert_eq!(health["rpms"][0]["version"], "v-initial");
    assert_eq!(health["rpms"][1]["model_loaded"], false);
}

#[tokio::test]
async fn test_mean_shift_is_scored_but_not_stored() {
    let app = TestApp::new();

    let (_, first) = app.call(upload("a.csv", "800", &sine_csv(128, 0.0))).await;
    assert_eq!(first["is_saved"], true);

    let (status, shifted) = app.call(upload("b.csv", "800", &sine_csv(128, 10.0))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(shifted["is_saved"], false);
    assert!(shifted["mean_diff"].as_f64().is_some_and(|d| d >= 5.0));
    assert_eq!(shifted["data"].as_array().map(Vec::len), Some(15));
    assert!(shifted.get("retrain").is_none());
    assert_eq!(app.service.store().count("800"), 1);
}

#[tokio::test]
async fn test_delete_sample_by_hash() {
    let app = TestApp::new();
    let csv = sine_csv(96, 0.0);
    let (_, v) = app.call(upload("doomed.csv", "800", &csv)).await;
    assert_eq!(v["is_saved"], true);

    let uri = format!("/monitoring/delete-anomaly?sha256={}", sha256_hex(&csv));
    let (status, v) = app
        .call(Request::delete(&uri).body(Body::empty()).expect("request"))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(v["status"], "success");
    assert_eq!(v["deleted"], 1);
    assert_eq!(v["files_removed"], 1);
    assert_eq!(app.service.registry().slot("800").count(), 0);
    assert!(app.service.registry().recent_errors("800").is_empty());

    let (status, v) = app
        .call(Request::delete(&uri).body(Body::empty()).expect("request"))
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(v["code"], "NOT_FOUND");
}

#[tokio::test]
async fn test_delete_rejects_non_hex_digest() {
    let app = TestApp::new();
    let (status, v) = app
        .call(
            Request::delete("/monitoring/delete-anomaly?sha256=not-a-hash")
                .body(Body::empty())
                .expect("request"),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(v["code"], "INVALID_INPUT");
}

#[tokio::test]
async fn test_short_upload_is_unprocessable() {
    let app = TestApp::new();
    let (status, v) = app.call(upload("short.csv", "800", &sine_csv(8, 0.0))).await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(v["status"], "error");
    assert_eq!(v["code"], "INSUFFICIENT_DATA");
}

#[tokio::test]
async fn test_missing_file_field() {
    let app = TestApp::new();
    let boundary = "b0";
    let payload =
        format!("--{boundary}\r\nContent-Disposition: form-data; name=\"rpm\"\r\n\r\n800\r\n--{boundary}--\r\n");
    let request = Request::builder()
        .method("POST")
        .uri("/predict")
        .header(
            "content-type",
            format!("multipart/form-data; boundary={boundary}"),
        )
        .body(Body::from(payload))
        .expect("request");
    let (status, v) = app.call(request).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(v["status"], "error");
}

#[tokio::test]
async fn test_manual_retrain_conflict_then_swap() {
    let app = TestApp::new();
    let retrain = || {
        Request::post("/api/retrain/800")
            .body(Body::empty())
            .expect("request")
    };

    let (status, v) = app.call(retrain()).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(v["status"], "accepted");

    let (status, v) = app.call(retrain()).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(v["code"], "RETRAIN_IN_PROGRESS");

    let deadline = Instant::now() + Duration::from_secs(10);
    while app.service.scheduler().is_retraining("800") {
        assert!(Instant::now() < deadline, "retrain did not finish");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    let (_, health) = app
        .call(Request::get("/health").body(Body::empty()).expect("request"))
        .await;
    assert_ne!(health["rpms"][0]["version"], "v-initial");
    assert_eq!(health["rpms"][0]["retraining"], false);
}

#[tokio::test]
async fn test_upload_for_unknown_rpm_is_rejected() {
    let app = TestApp::new();
    let before = app.service.registry().rpms();

    let (status, v) = app.call(upload("x.csv", "4200", &sine_csv(128, 0.0))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(v["code"], "UNSUPPORTED_RPM");
    assert_eq!(app.service.registry().rpms(), before);
    assert_eq!(app.service.store().count("4200"), 0);
}

#[tokio::test]
async fn test_retrain_unknown_rpm() {
    let app = TestApp::new();
    let (status, v) = app
        .call(
            Request::post("/api/retrain/4200")
                .body(Body::empty())
                .expect("request"),
        )
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(v["code"], "UNSUPPORTED_RPM");
}
