//! Benchmarks for the request evaluation hot path
//!
//! The pipeline is initialized once against an in-memory object store; the
//! measured call is the synchronous warm-cache evaluation an SSP performs on
//! every inbound bid request.

use chrono::{TimeZone, Utc};
use criterion::{black_box, criterion_group, criterion_main, Criterion};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::runtime::Runtime;

use dte_core::{
    BidRequestEvaluatorInput, DemandTrafficEvaluator, EvaluatorSettings, FixedClock,
    InMemoryObjectStore,
};

const SSP: &str = "ssp-bench";
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

const OPEN_RTB_REQUEST: &str = r#"{
    "id": "req-bench",
    "device": {"geo": {"country": "US"}, "ua": "Mozilla/5.0"},
    "imp": [{"banner": {"w": 300, "h": 250}}],
    "app": {"bundle": "com.example.game"}
}"#;

fn build_evaluator(rt: &Runtime) -> DemandTrafficEvaluator {
    let store = Arc::new(InMemoryObjectStore::new());
    store.insert(
        "bench-bucket",
        &format!("{SSP}/configuration/model/config.json"),
        "model-etag-1",
        MODEL_CONFIG,
    );
    store.insert(
        "bench-bucket",
        &format!("{SSP}/configuration/experiment/config.json"),
        "experiment-etag-1",
        EXPERIMENT_CONFIG,
    );
    store.insert(
        "bench-bucket",
        &format!("{SSP}/2026-08-02/07/{MODEL}.csv"),
        "rows-etag-1",
        "US|300x250,0.013\nDE|300x250,0.021\nUS|728x90,0.007\n",
    );

    let settings = EvaluatorSettings {
        ssp_identifier: SSP.to_string(),
        folder_prefix: "s3://bench-bucket".to_string(),
        region: "us-east-1".to_string(),
        refresh_interval_ms: 3_600_000,
    };
    let clock = FixedClock(Utc.with_ymd_and_hms(2026, 8, 2, 7, 0, 0).unwrap());
    let evaluator =
        DemandTrafficEvaluator::with_parts(settings, store, Arc::new(clock)).unwrap();
    let failures = rt.block_on(evaluator.init());
    assert!(failures.is_empty(), "init failed: {failures:?}");
    evaluator
}

fn bench_evaluation(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let evaluator = build_evaluator(&rt);

    let raw_input = BidRequestEvaluatorInput {
        open_rtb_request: OPEN_RTB_REQUEST.to_string(),
        ..Default::default()
    };
    c.bench_function("evaluate_raw_request", |b| {
        b.iter(|| black_box(evaluator.evaluate(Some(black_box(&raw_input)))))
    });

    let map_input = BidRequestEvaluatorInput {
        open_rtb_request_map: HashMap::from([
            ("$.device.geo.country".to_string(), "US".to_string()),
            ("$.imp[0].banner.w".to_string(), "300".to_string()),
            ("$.imp[0].banner.h".to_string(), "250".to_string()),
        ]),
        ..Default::default()
    };
    c.bench_function("evaluate_pre_extracted_map", |b| {
        b.iter(|| black_box(evaluator.evaluate(Some(black_box(&map_input)))))
    });

    c.bench_function("evaluate_default_path", |b| {
        b.iter(|| black_box(evaluator.evaluate(None)))
    });

    evaluator.shutdown();
}

criterion_group!(benches, bench_evaluation);
criterion_main!(benches);
