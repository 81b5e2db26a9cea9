//! Benchmarks for control setup encoding and BOS decoding
//!
//! Measures:
//! - Control transfer buffer construction (IN and OUT)
//! - String descriptor decoding
//! - BOS descriptor walks of increasing size

use bytes::Bytes;
use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use protocol::{
    ControlData, DeviceCapability, decode_bos_descriptor, decode_string_descriptor,
    encode_control_transfer,
};

fn benchmark_control_setup(c: &mut Criterion) {
    let mut group = c.benchmark_group("control_setup");

    group.bench_function("encode_in_255", |b| {
        b.iter(|| {
            encode_control_transfer(
                black_box(0x80),
                0x06,
                0x0304,
                0x0409,
                ControlData::In(255),
            )
        })
    });

    for size in [8usize, 64, 1024, 4096] {
        let payload = Bytes::from(vec![0xA5u8; size]);
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::new("encode_out", size), &payload, |b, payload| {
            b.iter(|| encode_control_transfer(0x40, 0x01, 0, 0, ControlData::Out(payload.clone())))
        });
    }

    group.finish();
}

fn benchmark_string_descriptor(c: &mut Criterion) {
    let mut raw = vec![0x00, 0x03];
    for ch in "Example Manufacturer Incorporated".encode_utf16() {
        raw.extend_from_slice(&ch.to_le_bytes());
    }
    raw[0] = raw.len() as u8;

    c.bench_function("decode_string_descriptor", |b| {
        b.iter(|| decode_string_descriptor(black_box(&raw)))
    });
}

fn make_bos(records: usize) -> Bytes {
    let record = [0x0A, 0x10, 0x03, 0x00, 0x0E, 0x00, 0x01, 0x0A, 0xFF, 0x07];
    let total = 5 + records * record.len();
    let mut raw = vec![0x05, 0x0F, total as u8, (total >> 8) as u8, records as u8];
    for _ in 0..records {
        raw.extend_from_slice(&record);
    }
    Bytes::from(raw)
}

fn benchmark_bos(c: &mut Criterion) {
    let mut group = c.benchmark_group("bos_descriptor");

    for records in [1usize, 4, 16] {
        let raw = make_bos(records);
        group.throughput(Throughput::Bytes(raw.len() as u64));
        group.bench_with_input(BenchmarkId::new("decode", records), &raw, |b, raw| {
            b.iter(|| decode_bos_descriptor(raw.clone()))
        });
        group.bench_with_input(BenchmarkId::new("decode_typed", records), &raw, |b, raw| {
            b.iter(|| {
                let bos = decode_bos_descriptor(raw.clone()).unwrap();
                bos.capabilities
                    .iter()
                    .map(|c| DeviceCapability::decode(c).unwrap())
                    .count()
            })
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    benchmark_control_setup,
    benchmark_string_descriptor,
    benchmark_bos
);
criterion_main!(benches);
