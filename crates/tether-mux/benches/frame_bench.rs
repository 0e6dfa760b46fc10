use criterion::{Criterion, Throughput, black_box, criterion_group, criterion_main};
use tether_mux::{Frame, FrameType, MAX_PAYLOAD_SIZE, Namespace};

fn bench_frame_decode(c: &mut Criterion) {
    let sizes: Vec<(usize, &str)> = vec![
        (0, "empty"),
        (64, "64_bytes"),
        (1024, "1024_bytes"),
        (MAX_PAYLOAD_SIZE, "max_payload"),
    ];

    let mut group = c.benchmark_group("frame_decode");

    for (size, name) in sizes {
        let bytes = Frame::data(Namespace::Sender, "example", vec![0xAA; size])
            .encode()
            .unwrap();

        group.throughput(Throughput::Bytes(bytes.len() as u64));
        group.bench_function(name, |b| b.iter(|| Frame::decode(black_box(&bytes))));
    }

    group.finish();
}

fn bench_frame_encode(c: &mut Criterion) {
    let frame = Frame::data(Namespace::Shared, "example", vec![0xBB; 1200]);

    let mut group = c.benchmark_group("frame_encode");
    group.throughput(Throughput::Bytes(1200));

    group.bench_function("data_1200_bytes", |b| {
        b.iter(|| black_box(&frame).encode())
    });
    group.bench_function("control_open", |b| {
        b.iter(|| Frame::control(FrameType::Open, Namespace::Sender, black_box("example")).encode())
    });

    group.finish();
}

criterion_group!(benches, bench_frame_decode, bench_frame_encode);
criterion_main!(benches);
