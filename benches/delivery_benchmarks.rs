//! Benchmarks for the per-delivery hot path.
//!
//! Signing and verification run once per attempt and per subscriber check,
//! filter evaluation once per candidate endpoint at dispatch.

use std::{hint::black_box, time::Duration};

use chrono::Utc;
use courier_core::{
    Delivery, Endpoint, EventId, EventLog, FilterCondition, FilterConditions, TenantId,
};
use courier_delivery::{
    client::WebhookRequest,
    retry::backoff_delay,
    signing::{sign, verify_signature},
};
use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use serde_json::{json, Value};

const SECRET: &str = "whsec_0f5bb3b1c2d8e4f6a7b8c9d0e1f2a3b4c5d6e7f8a9b0c1d2e3f4a5b6c7d8e9f0";

fn payload_of_size(size: usize) -> Vec<u8> {
    let filler = "x".repeat(size.saturating_sub(32));
    json!({"event": "bench", "data": filler}).to_string().into_bytes()
}

/// Benchmarks HMAC signing and constant-time verification.
fn bench_signing(c: &mut Criterion) {
    let mut group = c.benchmark_group("signing");

    for size in [256, 4 * 1024, 64 * 1024] {
        let body = payload_of_size(size);
        group.throughput(Throughput::Bytes(body.len() as u64));

        group.bench_with_input(BenchmarkId::new("sign", size), &body, |b, body| {
            b.iter(|| black_box(sign(black_box(body), SECRET).unwrap()));
        });

        let signature = sign(&body, SECRET).unwrap();
        group.bench_with_input(
            BenchmarkId::new("verify", size),
            &(body, signature),
            |b, (body, signature)| {
                b.iter(|| black_box(verify_signature(black_box(body), signature, SECRET)));
            },
        );
    }

    group.finish();
}

/// Benchmarks payload filter evaluation against growing condition sets.
fn bench_filter_evaluation(c: &mut Criterion) {
    let mut group = c.benchmark_group("filter");

    let payload: Value = json!({
        "status": "critical",
        "region": "eu-west-1",
        "tags": ["db", "primary", "paging"],
        "quantity": 2,
        "item_code": "SKU-1182",
    });

    let mut conditions = FilterConditions::new();
    let candidates = [
        ("status", FilterCondition::equals("critical")),
        ("region", FilterCondition::contains("eu")),
        ("tags", FilterCondition::contains("paging")),
        ("quantity", FilterCondition::not_equals(10)),
        ("missing", FilterCondition::equals("ignored")),
    ];
    for (count, (field, condition)) in candidates.into_iter().enumerate() {
        conditions = conditions.with(field, condition);
        group.bench_with_input(
            BenchmarkId::new("matches", count + 1),
            &conditions,
            |b, conditions| {
                b.iter(|| black_box(conditions.matches(black_box(&payload))));
            },
        );
    }

    group.finish();
}

/// Benchmarks building the signed outbound request.
fn bench_request_build(c: &mut Criterion) {
    let now = Utc::now();
    let endpoint = Endpoint::new(TenantId::new(), "bench", "https://bench.example.com", SECRET, now);
    let log = EventLog::new(
        EventId::new(),
        endpoint.tenant_id,
        "transaction.completed",
        json!({"amount": 1999, "currency": "USD", "lines": (0..20).collect::<Vec<_>>()}),
        None,
        now,
    );
    let delivery = Delivery::new(&endpoint, &log, now);

    c.bench_function("request_build", |b| {
        b.iter(|| black_box(WebhookRequest::build(&endpoint, &delivery, now)));
    });
}

/// Benchmarks the capped exponential backoff schedule.
fn bench_backoff(c: &mut Criterion) {
    c.bench_function("backoff_schedule", |b| {
        b.iter(|| {
            for attempt in 1..=12 {
                black_box(backoff_delay(black_box(Duration::from_secs(60)), attempt));
            }
        });
    });
}

criterion_group!(benches, bench_signing, bench_filter_evaluation, bench_request_build, bench_backoff);
criterion_main!(benches);
