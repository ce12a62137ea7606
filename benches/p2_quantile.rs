//! Throughput of the P² streaming median estimator and the incremental
//! extractor against a synthetic large `in_network` array. Instrumented
//! rather than gated on a pass/fail threshold.

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use cpt_compare::aggregate::P2Quantile;
use cpt_compare::extractor::JsonItemExtractor;
use std::io::Cursor;

fn lcg_stream(seed: u64, n: usize) -> Vec<f64> {
    let mut state = seed;
    (0..n)
        .map(|_| {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            (state % 1_000_000) as f64 / 1000.0
        })
        .collect()
}

fn bench_p2_quantile(c: &mut Criterion) {
    let values = lcg_stream(88172645463325252, 10_000);

    c.bench_function("p2_quantile update 10k uniform", |b| {
        b.iter(|| {
            let mut p2 = P2Quantile::new();
            for v in &values {
                p2.update(black_box(*v));
            }
            black_box(p2.estimate())
        })
    });
}

fn synthetic_document(item_count: usize) -> Vec<u8> {
    let mut body = String::from(r#"{"reporting_entity_name":"bench","in_network":["#);
    for i in 0..item_count {
        if i > 0 {
            body.push(',');
        }
        body.push_str(&format!(
            r#"{{"billing_code_type":"CPT","billing_code":"{:05}","description":"synthetic procedure {i}","negotiated_rates":[{{"negotiated_prices":[{{"negotiated_type":"negotiated","negotiated_rate":{:.2},"billing_class":"professional","service_code":["11"],"billing_code_modifier":[]}}]}}]}}"#,
            10000 + (i % 900),
            100.0 + (i % 500) as f64
        ));
    }
    body.push_str("]}");
    body.into_bytes()
}

fn bench_extractor_throughput(c: &mut Criterion) {
    let doc = synthetic_document(50_000);

    c.bench_function("extractor drain 50k in_network items", |b| {
        b.iter(|| {
            let mut extractor = JsonItemExtractor::new(Cursor::new(doc.clone()));
            extractor.detect().unwrap();
            let mut count = 0usize;
            while extractor.next_item().unwrap().is_some() {
                count += 1;
            }
            black_box(count)
        })
    });
}

criterion_group!(benches, bench_p2_quantile, bench_extractor_throughput);
criterion_main!(benches);
