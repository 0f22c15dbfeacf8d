//! Secure session benchmarks over the mock provider
//!
//! Measures the cost of the session layer itself, without a real cipher:
//! - Record framing (encode and peek)
//! - Handshake setup over an in-memory pipe
//! - Echo round trips for small and large payloads
//!
//! Run with: cargo bench --bench record_throughput

use bytes::BytesMut;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use secio::sio::mock::record::{self, ContentType, Peeked};
use secio::sio::mock::{self, MockBackend, MockMode, MockPeer, MockSession, PeerConfig};
use secio::sio::{ReadStatus, SecureSession, TlsConfig};
use std::time::Duration;

fn bench_record_framing(c: &mut Criterion) {
    let mut group = c.benchmark_group("record_framing");
    let payload = vec![0x42u8; record::MAX_FRAGMENT];
    group.throughput(Throughput::Bytes(payload.len() as u64));

    group.bench_function("encode_full_record", |b| {
        let mut out = BytesMut::with_capacity(record::MAX_FRAGMENT + 16);
        b.iter(|| {
            out.clear();
            record::encode(ContentType::ApplicationData, black_box(&payload), &mut out);
            black_box(out.len());
        });
    });

    let mut encoded = BytesMut::new();
    record::encode(ContentType::ApplicationData, &payload, &mut encoded);
    group.bench_function("peek_full_record", |b| {
        b.iter(|| match record::peek(black_box(&encoded)).unwrap() {
            Peeked::Record(rec, used) => black_box((rec.payload.len(), used)),
            Peeked::Incomplete(_) => unreachable!(),
        });
    });

    group.finish();
}

fn open() -> (MockSession, MockPeer) {
    let backend = MockBackend::new(MockMode::Normal);
    let config = TlsConfig::default();
    mock::connect(&backend, &config, PeerConfig::new("bench.test"), "bench.test").unwrap()
}

fn bench_handshake(c: &mut Criterion) {
    c.bench_function("mock_handshake", |b| {
        b.iter(|| {
            let (session, _peer) = open();
            black_box(session.is_negotiated());
        });
    });
}

fn echo(session: &mut MockSession, peer: &mut MockPeer, data: &[u8], buf: &mut [u8]) -> usize {
    session.write(data).unwrap();
    peer.poll().unwrap();
    let mut got = 0;
    while got < data.len() {
        match session.read(buf).unwrap() {
            ReadStatus::Data(n) => got += n,
            ReadStatus::WouldBlock => peer.poll().unwrap(),
            ReadStatus::Eof => break,
        }
    }
    got
}

fn bench_echo(c: &mut Criterion) {
    let mut group = c.benchmark_group("echo_round_trip");

    for size in [64usize, 4096, 65536, 262144] {
        let data = vec![0x5au8; size];
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &data, |b, data| {
            let (mut session, mut peer) = open();
            let mut buf = vec![0u8; 16384];
            b.iter(|| black_box(echo(&mut session, &mut peer, data, &mut buf)));
        });
    }

    group.finish();
}

criterion_group! {
    name = framing;
    config = Criterion::default()
        .measurement_time(Duration::from_secs(5))
        .sample_size(500);
    targets = bench_record_framing
}

criterion_group! {
    name = sessions;
    config = Criterion::default()
        .measurement_time(Duration::from_secs(10))
        .sample_size(100);
    targets =
        bench_handshake,
        bench_echo
}

criterion_main!(framing, sessions);
