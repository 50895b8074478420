use std::hint::black_box;

use criterion::{criterion_group, criterion_main, Criterion};

use osmium::frag::Cache;
use osmium::frame::{FragHeader, SegmentDesc, HDR_SIZE, HDR_TYPE_SEND, SEG_SIZE};
use osmium::logging;
use osmium::pool::FragPools;
use osmium::TransportConfig;

fn bench_pool(c: &mut Criterion) {
    let pools = FragPools::new(&TransportConfig::default(), &logging::discard());

    c.bench_function("pool_alloc_release_eager", |b| {
        b.iter(|| {
            let frag = pools.eager.alloc().unwrap();
            pools.release(black_box(frag));
        })
    });

    c.bench_function("pool_alloc_release_max", |b| {
        b.iter(|| {
            let frag = pools.max.alloc().unwrap();
            pools.release(black_box(frag));
        })
    });
}

fn bench_wire_codec(c: &mut Criterion) {
    c.bench_function("header_encode_decode", |b| {
        let hdr = FragHeader::new(HDR_TYPE_SEND, 1, 7, 65536, 0);
        let mut buf = [0u8; HDR_SIZE];
        b.iter(|| {
            hdr.encode(&mut buf);
            black_box(FragHeader::decode(&buf))
        })
    });

    c.bench_function("segment_encode_decode", |b| {
        let seg = SegmentDesc::new(0xDEAD_BEEF_0000, 4096, 17);
        let mut buf = [0u8; SEG_SIZE];
        b.iter(|| {
            seg.encode(&mut buf);
            black_box(SegmentDesc::decode(&buf))
        })
    });
}

fn bench_cache_window(c: &mut Criterion) {
    c.bench_function("cache_produce_consume_4k", |b| {
        let mut cache = Cache::new(30 * 1024);
        b.iter(|| {
            cache.free_slice()[..4096].copy_from_slice(&[0x42; 4096]);
            cache.produce(4096);
            black_box(cache.readable());
            cache.consume(4096);
        })
    });
}

criterion_group!(benches, bench_pool, bench_wire_codec, bench_cache_window);
criterion_main!(benches);
