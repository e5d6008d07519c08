//! Envelope benchmark suite.
//!
//! Benchmarks outbound message accounting at different payload sizes:
//! - Payload sizes: 64 B, 4 KiB, 60 KiB
//! - Size accounting vs full serialization
//! - End-to-end `send_client_message` over the in-memory transport
//!
//! Run with: cargo bench --bench envelope
//! Results saved to: target/criterion/

use std::hint::black_box;

use criterion::{BatchSize, BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use rtvi_client::RtviClient;
use rtvi_client::protocol::{RtviMessage, size_of};
use rtvi_client::transport::MemoryTransport;
use serde_json::{Value, json};
use tokio::runtime::Runtime;

// ============================================================================
// Benchmark Parameters
// ============================================================================

const PAYLOAD_SIZES: &[usize] = &[64, 4 * 1024, 60 * 1024];

fn payload(bytes: usize) -> Value {
    json!({
        "text": "x".repeat(bytes),
        "nested": { "unicode": "héllo wörld ✓", "numbers": [1, 2.5, -3] },
    })
}

// ============================================================================
// Benchmark: Size Accounting
// ============================================================================

fn bench_size_of(c: &mut Criterion) {
    let mut group = c.benchmark_group("size_of");

    for &bytes in PAYLOAD_SIZES {
        let message = RtviMessage::client_message("bench", payload(bytes));
        group.throughput(Throughput::Bytes(bytes as u64));

        group.bench_with_input(BenchmarkId::new("count", bytes), &message, |b, message| {
            b.iter(|| size_of(black_box(message)).expect("size"));
        });

        group.bench_with_input(BenchmarkId::new("serialize", bytes), &message, |b, message| {
            b.iter(|| black_box(message).serialize().expect("serialize").len());
        });
    }

    group.finish();
}

// ============================================================================
// Benchmark: Client Send
// ============================================================================

fn bench_send_client_message(c: &mut Criterion) {
    let rt = Runtime::new().expect("runtime");

    let (client, remote) = rt.block_on(async {
        let (transport, remote) = MemoryTransport::new();
        let client = RtviClient::builder()
            .transport(transport)
            .build()
            .expect("client");
        client.connect(None).await.expect("connect");
        (client, remote)
    });

    let mut group = c.benchmark_group("send_client_message");

    for &bytes in PAYLOAD_SIZES {
        let data = payload(bytes);
        group.throughput(Throughput::Bytes(bytes as u64));

        group.bench_with_input(BenchmarkId::new("send", bytes), &data, |b, data| {
            b.iter_batched(
                || {
                    remote.clear_sent();
                    data.clone()
                },
                |data| {
                    client
                        .send_client_message("bench", black_box(data))
                        .expect("send");
                },
                BatchSize::PerIteration,
            );
        });
    }

    group.finish();
}

criterion_group!(benches, bench_size_of, bench_send_client_message);
criterion_main!(benches);
