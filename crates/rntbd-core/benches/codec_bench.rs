//! Benchmarks for request encoding and response decoding

use bytes::{Bytes, BytesMut};
use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use rntbd_core::{
    FrameDecoder, Operation, OperationType, Request, RequestHeader, ResourceType, Response,
    ResponseHeader, TokenStream, ContextResponse,
};
use uuid::Uuid;

fn sample_response(payload_size: usize) -> Response {
    let mut headers = TokenStream::<ResponseHeader>::new();
    headers
        .set(ResponseHeader::RequestCharge, 2.38f64)
        .unwrap()
        .set(ResponseHeader::SessionToken, "0:-1#4711")
        .unwrap()
        .set(ResponseHeader::Lsn, 4711i64)
        .unwrap()
        .set(ResponseHeader::ETag, "\"00000000-0000-0000-0000-000000000000\"")
        .unwrap()
        .set(ResponseHeader::ItemCount, 1u32)
        .unwrap();
    Response::new(
        Uuid::new_v4(),
        200,
        headers,
        Some(Bytes::from(vec![b'x'; payload_size])),
    )
    .unwrap()
}

fn bench_request_encode(c: &mut Criterion) {
    let mut group = c.benchmark_group("request_encode");

    for size in [0usize, 1024, 64 * 1024] {
        let operation = Operation::new(OperationType::Read, ResourceType::Document)
            .with_header(RequestHeader::ResourceId, vec![0u8; 8])
            .unwrap()
            .with_header(RequestHeader::SessionToken, "0:-1#4711")
            .unwrap()
            .with_header(RequestHeader::PartitionKey, "[\"tenant-42\"]")
            .unwrap()
            .with_payload(vec![b'y'; size]);
        let request = Request::new(Uuid::new_v4(), operation).unwrap();

        group.throughput(Throughput::Bytes((request.encoded_length() + size) as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &request, |b, request| {
            let mut out = BytesMut::with_capacity(request.encoded_length() + size + 4);
            b.iter(|| {
                out.clear();
                request.encode(&mut out).unwrap();
                black_box(out.len())
            });
        });
    }

    group.finish();
}

fn bench_response_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("response_decode");

    for size in [0usize, 1024, 64 * 1024] {
        let mut encoded = BytesMut::new();
        sample_response(size).encode(&mut encoded).unwrap();
        let encoded = encoded.freeze();

        group.throughput(Throughput::Bytes(encoded.len() as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &encoded, |b, encoded| {
            b.iter(|| {
                let mut buf = BytesMut::from(&encoded[..]);
                let response = Response::decode(&mut buf).unwrap().unwrap();
                black_box(response.status_code())
            });
        });
    }

    group.finish();
}

fn bench_frame_decoder_stream(c: &mut Criterion) {
    let mut stream = BytesMut::new();
    ContextResponse::accepted(Uuid::new_v4(), "bench", "1.0")
        .unwrap()
        .encode(&mut stream)
        .unwrap();
    for _ in 0..64 {
        sample_response(256).encode(&mut stream).unwrap();
    }
    let stream = stream.freeze();

    let mut group = c.benchmark_group("frame_decoder");
    group.throughput(Throughput::Bytes(stream.len() as u64));
    group.bench_function("64_responses", |b| {
        b.iter(|| {
            let mut decoder = FrameDecoder::new();
            let mut buf = BytesMut::from(&stream[..]);
            let mut frames = 0;
            while let Some(frame) = decoder.decode(&mut buf).unwrap() {
                frames += 1;
                black_box(frame);
            }
            frames
        });
    });
    group.finish();
}

criterion_group!(
    benches,
    bench_request_encode,
    bench_response_decode,
    bench_frame_decoder_stream
);
criterion_main!(benches);
