use std::hint::black_box;

use criterion::{criterion_group, criterion_main, Criterion};
use objsync_wire::frame::{self, MaskPolicy, OpCode};
use objsync_wire::mask::apply_mask;
use objsync_wire::Event;

const KEY: [u8; 4] = [0x37, 0xfa, 0x21, 0x3d];

fn bench_encode(c: &mut Criterion) {
    let small = vec![b'x'; 100];
    let large = vec![b'x'; 64 * 1024];

    c.bench_function("frame_encode_100B", |b| {
        b.iter(|| black_box(frame::encode(OpCode::Text, true, black_box(&small), KEY).unwrap()))
    });
    c.bench_function("frame_encode_64KiB", |b| {
        b.iter(|| black_box(frame::encode(OpCode::Text, true, black_box(&large), KEY).unwrap()))
    });
}

fn bench_decode(c: &mut Criterion) {
    let small = frame::encode_unmasked(OpCode::Text, true, &[b'x'; 100]).unwrap();
    let large = frame::encode_unmasked(OpCode::Text, true, &vec![b'x'; 64 * 1024]).unwrap();

    c.bench_function("frame_decode_100B", |b| {
        b.iter(|| black_box(frame::decode(black_box(&small), MaskPolicy::RejectMasked).unwrap()))
    });
    c.bench_function("frame_decode_64KiB", |b| {
        b.iter(|| black_box(frame::decode(black_box(&large), MaskPolicy::RejectMasked).unwrap()))
    });
}

fn bench_mask(c: &mut Criterion) {
    let mut data = vec![0u8; 1024 * 1024];
    c.bench_function("mask_1MiB", |b| {
        b.iter(|| apply_mask(black_box(&mut data), KEY))
    });
}

fn bench_event_parse(c: &mut Criterion) {
    let text = r#"{"messageType":"data","event":"update","meta":{"requestId":"5b0f"},
        "data":{"id":"51d2","objectType":"objects.todos","title":"buy milk","completed":false}}"#;
    c.bench_function("event_parse", |b| {
        b.iter(|| black_box(Event::from_json(black_box(text)).unwrap()))
    });
}

criterion_group!(benches, bench_encode, bench_decode, bench_mask, bench_event_parse);
criterion_main!(benches);
