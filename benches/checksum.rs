//! Checksum and frame-scan benchmarks

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};

use modmon_core::protocol::checksum::{crc16_modbus, lrc};
use modmon_core::protocol::frame::wrap_rtu;
use modmon_core::protocol::scanner::RtuScanner;

fn checksum_benchmark(c: &mut Criterion) {
    let data: Vec<u8> = (0..256).map(|i| (i % 256) as u8).collect();

    let mut group = c.benchmark_group("checksum");
    group.throughput(Throughput::Bytes(data.len() as u64));

    group.bench_function("crc16_modbus", |b| {
        b.iter(|| black_box(crc16_modbus(black_box(&data))))
    });

    group.bench_function("lrc", |b| b.iter(|| black_box(lrc(black_box(&data)))));

    group.finish();
}

fn scanner_benchmark(c: &mut Criterion) {
    // A realistic poll cycle: noise, then a full FC03 response
    let mut stream = vec![0xFF, 0xFF, 0x00];
    let mut payload = vec![0x01, 0x03, 0x7C];
    payload.extend((0..124).map(|i| i as u8));
    stream.extend_from_slice(&wrap_rtu(&payload));

    let mut group = c.benchmark_group("scanner");
    group.throughput(Throughput::Bytes(stream.len() as u64));

    group.bench_function("rtu_resync_scan", |b| {
        b.iter(|| {
            let mut scanner = RtuScanner::new();
            black_box(scanner.push(black_box(&stream)))
        })
    });

    group.finish();
}

criterion_group!(benches, checksum_benchmark, scanner_benchmark);
criterion_main!(benches);
