//! Integrity and Reassembly Benchmarks
//!
//! CRC16 throughput over resource-sized and module-sized buffers, and the
//! cost of reassembling a module from MTU-sized frames.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use wasmlink_core::session::TransferSession;
use wasmlink_core::wire::{chunk_module, UploadPacket};
use wasmlink_core::{crc16_ccitt, EngineConfig};

fn bench_crc16(c: &mut Criterion) {
    let mut group = c.benchmark_group("crc16_ccitt");
    for size in [32usize, 1024, 32 * 1024] {
        let data: Vec<u8> = (0..size).map(|i| (i * 31) as u8).collect();
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &data, |b, data| {
            b.iter(|| crc16_ccitt(black_box(data)))
        });
    }
    group.finish();
}

fn bench_reassembly(c: &mut Criterion) {
    let mut group = c.benchmark_group("reassembly");
    let module: Vec<u8> = (0..16 * 1024).map(|i| (i % 253) as u8).collect();
    group.throughput(Throughput::Bytes(module.len() as u64));

    // Default and a typical negotiated MTU.
    for mtu in [23u16, 247] {
        let Ok(frames) = chunk_module(&module, EngineConfig::max_write_len(mtu)) else {
            // Too many frames for the 8-bit sequence at this MTU.
            continue;
        };
        group.bench_with_input(BenchmarkId::new("mtu", mtu), &frames, |b, frames| {
            let mut session = TransferSession::new(EngineConfig::default().buffer_capacity);
            b.iter(|| {
                for frame in frames {
                    let Ok(packet) = UploadPacket::decode(frame) else {
                        continue;
                    };
                    if packet.sequence == 0 {
                        let _ = session.start(packet.total_size);
                    }
                    let _ = session.accept_chunk(packet.sequence, packet.data);
                }
                black_box(session.take_payload())
            })
        });
    }
    group.finish();
}

criterion_group!(benches, bench_crc16, bench_reassembly);
criterion_main!(benches);
