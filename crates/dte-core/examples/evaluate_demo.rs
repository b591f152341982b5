//! Minimal wiring demo: initialize against an in-memory object store and
//! evaluate one bid request.
//!
//! Run with: cargo run --example evaluate_demo

use chrono::Utc;
use std::sync::Arc;

use dte_core::{
    BidRequestEvaluatorInput, DemandTrafficEvaluator, EvaluatorSettings, InMemoryObjectStore,
    SystemClock,
};

const SSP: &str = "ssp-demo";
const MODEL: &str = "adsp_low-value_v2";

const MODEL_CONFIG: &str = r#"{
    "modelDefinitionByIdentifier": {
        "adsp_low-value_v2": {
            "identifier": "adsp_low-value_v2",
            "type": "LowValue",
            "featureExtractorType": "JsonExtractor",
            "features": [
                {"name": "country", "fields": ["$.device.geo.country"], "transformation": []},
                {"name": "size",
                 "fields": ["$.imp[0].banner.w", "$.imp[0].banner.h"],
                 "transformation": ["ConcatenateByPair"]}
            ]
        }
    }
}"#;

const EXPERIMENT_CONFIG: &str = r#"{
    "experimentDefinitionByName": {
        "DemandDrivenTrafficEvaluatorSoftFilter": {
            "name": "DemandDrivenTrafficEvaluatorSoftFilter",
            "type": "soft-filter",
            "treatments": [{"treatmentCode": "T", "weight": 80},
                           {"treatmentCode": "C", "weight": 20}]
        }
    },
    "modelToExperiment": {"adsp_low-value_v2": "DemandDrivenTrafficEvaluatorSoftFilter"}
}"#;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let store = Arc::new(InMemoryObjectStore::new());
    store.insert(
        "demo-bucket",
        &format!("{SSP}/configuration/model/config.json"),
        "model-etag-1",
        MODEL_CONFIG,
    );
    store.insert(
        "demo-bucket",
        &format!("{SSP}/configuration/experiment/config.json"),
        "experiment-etag-1",
        EXPERIMENT_CONFIG,
    );
    let now = Utc::now();
    store.insert(
        "demo-bucket",
        &format!("{SSP}/{}/{}/{MODEL}.csv", now.format("%Y-%m-%d"), now.format("%H")),
        "rows-etag-1",
        "US|300x250,0.013\nDE|728x90,0.021\n",
    );

    let settings = EvaluatorSettings {
        ssp_identifier: SSP.to_string(),
        folder_prefix: "s3://demo-bucket".to_string(),
        region: "us-east-1".to_string(),
        refresh_interval_ms: 60_000,
    };
    let evaluator =
        DemandTrafficEvaluator::with_parts(settings, store, Arc::new(SystemClock))?;
    let failures = evaluator.init().await;
    if !failures.is_empty() {
        anyhow::bail!("initialization failed: {failures:?}");
    }

    let input = BidRequestEvaluatorInput {
        open_rtb_request: r#"{
            "id": "req-demo-1",
            "device": {"geo": {"country": "US"}},
            "imp": [{"banner": {"w": 300, "h": 250}}]
        }"#
        .to_string(),
        ..Default::default()
    };
    let output = evaluator.evaluate(Some(&input));

    println!("filter decision: {}", output.response.slots[0].filter_decision);
    println!("slot ext:        {}", output.response.slots[0].ext);
    println!("response ext:    {}", output.response.ext);

    evaluator.shutdown();
    Ok(())
}
