//! Criterion benchmarks for frame buffer hot paths.
//!
//! Key metrics:
//! - Reserve/commit round trip on both sides for various frame sizes
//! - Producer/consumer throughput across two tokio tasks
//!
//! Run with: cargo bench --bench frame_buffer

use bytes::Bytes;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::sync::Arc;
use std::time::Duration;
use ultra_daq::data::{FrameBuffer, OverflowPolicy, RawFrame};

fn frame(width: u32) -> RawFrame {
    RawFrame::new(width, 1, 16, 0, Bytes::from(vec![0u8; width as usize * 2]))
}

/// Write then read one frame at a time on a single thread.
fn frame_buffer_round_trip(c: &mut Criterion) {
    let mut group = c.benchmark_group("frame_buffer_round_trip");

    // 512 pixels is the Ultra head width
    for width in [512u32, 4096, 65_536] {
        let buffer = FrameBuffer::new(64, OverflowPolicy::Block);
        let template = frame(width);

        group.throughput(Throughput::Bytes(template.data.len() as u64));
        group.bench_with_input(BenchmarkId::new("write_read", width), &width, |b, _| {
            b.iter(|| {
                let write = buffer.try_reserve_for_write().unwrap();
                buffer.commit_write(write, template.clone()).unwrap();
                let read = buffer.try_reserve_for_read().unwrap();
                black_box(read.record().frame.data.len());
                buffer.commit_read(read).unwrap();
            });
        });
    }

    group.finish();
}

/// Under `DropOldest` a full buffer reclaims the oldest slot on every write.
fn frame_buffer_drop_oldest(c: &mut Criterion) {
    let buffer = FrameBuffer::new(16, OverflowPolicy::DropOldest);
    let template = frame(512);
    for _ in 0..16 {
        let write = buffer.try_reserve_for_write().unwrap();
        buffer.commit_write(write, template.clone()).unwrap();
    }

    c.bench_function("frame_buffer_drop_oldest_write", |b| {
        b.iter(|| {
            let write = buffer.try_reserve_for_write().unwrap();
            black_box(write.reclaimed());
            buffer.commit_write(write, template.clone()).unwrap();
        });
    });
}

/// Producer and consumer tasks moving 1000 frames through 64 slots.
fn frame_buffer_concurrent(c: &mut Criterion) {
    let runtime = tokio::runtime::Runtime::new().unwrap();
    let frames = 1000u64;

    let mut group = c.benchmark_group("frame_buffer_concurrent");
    group.throughput(Throughput::Elements(frames));
    group.bench_function("producer_consumer", |b| {
        b.iter(|| {
            runtime.block_on(async {
                let buffer = Arc::new(FrameBuffer::new(64, OverflowPolicy::Block));
                let template = frame(512);

                let consumer = {
                    let buffer = Arc::clone(&buffer);
                    tokio::spawn(async move {
                        let mut read = 0u64;
                        while let Ok(reservation) =
                            buffer.reserve_for_read(Duration::from_secs(1)).await
                        {
                            buffer.commit_read(reservation).unwrap();
                            read += 1;
                        }
                        read
                    })
                };

                for _ in 0..frames {
                    let write = buffer
                        .reserve_for_write(Duration::from_secs(1))
                        .await
                        .unwrap();
                    buffer.commit_write(write, template.clone()).unwrap();
                }
                buffer.finish_writes();
                assert_eq!(consumer.await.unwrap(), frames);
            });
        });
    });
    group.finish();
}

criterion_group!(
    benches,
    frame_buffer_round_trip,
    frame_buffer_drop_oldest,
    frame_buffer_concurrent
);
criterion_main!(benches);
