#[macro_use]
extern crate criterion;

use bytes::BytesMut;
use criterion::Criterion;
use tokio_util::codec::Decoder;

use sedum::protocol::redis::RespCodec;
use sedum::utils::{crc16, trim_hash_tag};

fn bench_codec(c: &mut Criterion) {
    c.bench_function("resp decode simple", |b| {
        let data: &[u8] = b"+OK\r\n";
        b.iter(|| {
            let mut codec = RespCodec;
            let mut buf = BytesMut::from(data);
            codec.decode(&mut buf).unwrap()
        })
    });

    c.bench_function("resp decode bulk", |b| {
        let data: &[u8] = b"$5\r\nojbK\n\r\n";
        b.iter(|| {
            let mut codec = RespCodec;
            let mut buf = BytesMut::from(data);
            codec.decode(&mut buf).unwrap()
        })
    });

    c.bench_function("resp decode command", |b| {
        let data: &[u8] = b"*3\r\n$3\r\nSET\r\n$8\r\nuser:123\r\n$5\r\nvalue\r\n";
        b.iter(|| {
            let mut codec = RespCodec;
            let mut buf = BytesMut::from(data);
            codec.decode(&mut buf).unwrap()
        })
    });
}

fn bench_hash(c: &mut Criterion) {
    c.bench_function("crc16 slot", |b| {
        b.iter(|| crc16(b"user:123456789") as usize % 16384)
    });

    c.bench_function("crc16 tagged slot", |b| {
        b.iter(|| crc16(trim_hash_tag(b"{user:42}:profile:name", Some(b"{}"))))
    });
}

criterion_group!(benches, bench_codec, bench_hash);
criterion_main!(benches);
