//! Benchmarks for the receive path
//!
//! Measures the two hot operations on a busy MIDI stream:
//! - Decoding a full bulk packet of USB-MIDI event packets
//! - Walking a class-compliant configuration descriptor

use criterion::{Criterion, Throughput, black_box, criterion_group, criterion_main};
use protocol::{ConfigDescriptor, decode_packets, midi_device_config};

fn benchmark_packet_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("packet_decode");

    // 16 packets = one full-speed 64-byte bulk transfer
    let mut dense = Vec::with_capacity(64);
    for i in 0..16u8 {
        dense.extend_from_slice(&[0x09, 0x90, 0x30 + i, 0x64]);
    }
    group.throughput(Throughput::Bytes(dense.len() as u64));
    group.bench_function("dense_note_on_64", |b| {
        b.iter(|| decode_packets(black_box(&dense)).count())
    });

    // Mostly clock and padding, as a sequencer idling
    let mut sparse = Vec::with_capacity(64);
    for i in 0..16u8 {
        if i % 8 == 0 {
            sparse.extend_from_slice(&[0x0B, 0xB0, 0x40, 0x7F]);
        } else if i % 2 == 0 {
            sparse.extend_from_slice(&[0x0F, 0xF8, 0x00, 0x00]);
        } else {
            sparse.extend_from_slice(&[0x00, 0x00, 0x00, 0x00]);
        }
    }
    group.bench_function("sparse_clock_64", |b| {
        b.iter(|| decode_packets(black_box(&sparse)).count())
    });

    group.finish();
}

fn benchmark_descriptor_walk(c: &mut Criterion) {
    let bytes = midi_device_config(64);

    c.bench_function("walk_midi_config", |b| {
        b.iter(|| {
            let config = ConfigDescriptor::new(black_box(&bytes)).unwrap();
            config.walk().count()
        })
    });
}

criterion_group!(benches, benchmark_packet_decode, benchmark_descriptor_walk);
criterion_main!(benches);
