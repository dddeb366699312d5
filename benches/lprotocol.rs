//! Criterion benchmarks for the L-protocol framing paths.
//!
//! Every flow controller exchange encodes one frame and parses one reply while
//! the bus lock is held, so these set the floor for per-exchange overhead.
//!
//! Run with: cargo bench --bench lprotocol

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use labctl::adapters::MockTransport;
use labctl::channel::{Channel, ChannelParams};
use labctl::protocol::lprotocol::{
    self, checksum, encode_setpoint, functions, parse_reply, Access, Expect, Frame, RetryPolicy,
    ACK,
};

fn reply_frame(data_len: usize) -> Vec<u8> {
    let mut frame = Frame::write(0x20, functions::DETAILS, vec![0x5A; data_len]).encode().unwrap();
    frame[2] = Access::Read.code();
    let last = frame.len() - 1;
    frame[last] = checksum(&frame[1..last]);
    frame
}

/// Encoding a setpoint write, the most frequent request.
fn frame_encode(c: &mut Criterion) {
    c.bench_function("lprotocol_encode_setpoint", |b| {
        b.iter(|| {
            let mut data = vec![0x01];
            data.extend_from_slice(&encode_setpoint(black_box(23.7), 50.0).to_le_bytes());
            data.extend_from_slice(&500u16.to_le_bytes());
            Frame::write(black_box(0x20), functions::SETPOINT_IMMEDIATE, data).encode()
        });
    });
}

/// Reply validation for various data sizes.
fn reply_parse(c: &mut Criterion) {
    let mut group = c.benchmark_group("lprotocol_parse_reply");
    for data_len in [2usize, 16, 64] {
        let frame = reply_frame(data_len);
        group.throughput(Throughput::Bytes(frame.len() as u64));
        group.bench_with_input(BenchmarkId::from_parameter(data_len), &frame, |b, frame| {
            b.iter(|| parse_reply(black_box(frame), 0x20).unwrap());
        });
    }
    group.finish();
}

/// Full exchange against an emulated controller, lock included.
fn exchange_roundtrip(c: &mut Criterion) {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .build()
        .unwrap();
    let mock = MockTransport::new("rs485").with_responder(|w: &[u8]| {
        if w == [ACK] {
            return Vec::new();
        }
        let mut chunk = vec![ACK];
        chunk.extend(reply_frame(2));
        vec![chunk]
    });
    let channel = Channel::new("rs485", Box::new(mock.clone()), ChannelParams::default());
    let frame = Frame::read(0x20, functions::DETAILS);

    c.bench_function("lprotocol_exchange", |b| {
        b.iter(|| {
            mock.clear_log();
            runtime
                .block_on(channel.with_exclusive_access(|port| {
                    let frame = frame.clone();
                    Box::pin(async move {
                        lprotocol::exchange(
                            port,
                            &frame,
                            Expect::Packet { data_len: 2 },
                            RetryPolicy::Monitored(3),
                        )
                        .await
                    })
                }))
                .unwrap()
        });
    });
}

criterion_group!(benches, frame_encode, reply_parse, exchange_roundtrip);
criterion_main!(benches);
