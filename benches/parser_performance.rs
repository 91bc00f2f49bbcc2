//! Parser performance benchmarks
//!
//! Measures the hot path of the proxy: splitting client bytes into head and
//! content events, resolving the upstream and re-encoding the forwarded head.
//!
//! Run with: cargo bench --bench parser_performance

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use hotspot_proxy::proxy::{parser, ChannelKind, Headers, MessageParser, ParseEvent};
use std::time::Duration;

const SIMPLE_GET: &[u8] = b"GET http://example.com/index.html HTTP/1.1\r\n\
Host: example.com\r\n\
User-Agent: bench/1.0\r\n\
Accept: */*\r\n\r\n";

const CONNECT: &[u8] = b"CONNECT example.com:443 HTTP/1.1\r\nHost: example.com:443\r\n\r\n";

fn browser_request(extra_headers: usize) -> Vec<u8> {
    let mut wire = b"GET http://example.com/search?q=rust HTTP/1.1\r\nHost: example.com\r\n".to_vec();
    for i in 0..extra_headers {
        wire.extend_from_slice(format!("X-Header-{}: value-{}\r\n", i, i).as_bytes());
    }
    wire.extend_from_slice(b"\r\n");
    wire
}

fn post_request(body_len: usize) -> Vec<u8> {
    let mut wire = format!(
        "POST /upload HTTP/1.1\r\nHost: example.com:8080\r\nContent-Length: {}\r\n\r\n",
        body_len
    )
    .into_bytes();
    wire.resize(wire.len() + body_len, b'x');
    wire
}

/// Parse every event in `input`, returning how many were produced
fn parse_all(parser: &mut MessageParser, input: &[u8]) -> usize {
    let mut pos = 0;
    let mut events = 0;
    loop {
        match parser.next_event(input, &mut pos) {
            ParseEvent::NeedMore => return events,
            event => {
                black_box(&event);
                events += 1;
            }
        }
    }
}

fn bench_request_heads(c: &mut Criterion) {
    let mut group = c.benchmark_group("request_head");

    group.bench_function("simple_get", |b| {
        b.iter(|| {
            let mut parser = MessageParser::new(ChannelKind::Request, 4096);
            black_box(parse_all(&mut parser, black_box(SIMPLE_GET)));
        });
    });

    group.bench_function("connect", |b| {
        b.iter(|| {
            let mut parser = MessageParser::new(ChannelKind::Request, 4096);
            black_box(parse_all(&mut parser, black_box(CONNECT)));
        });
    });

    for count in [4, 16, 64] {
        let wire = browser_request(count);
        group.throughput(Throughput::Bytes(wire.len() as u64));
        group.bench_with_input(BenchmarkId::new("headers", count), &wire, |b, wire| {
            b.iter(|| {
                let mut parser = MessageParser::new(ChannelKind::Request, 4096);
                black_box(parse_all(&mut parser, wire));
            });
        });
    }

    group.finish();
}

fn bench_fragmented_feed(c: &mut Criterion) {
    let mut group = c.benchmark_group("fragmented_feed");
    let wire = browser_request(16);

    for chunk in [1, 16, 256] {
        group.bench_with_input(BenchmarkId::new("chunk", chunk), &chunk, |b, &chunk| {
            b.iter(|| {
                let mut parser = MessageParser::new(ChannelKind::Request, 4096);
                for piece in wire.chunks(chunk) {
                    black_box(parse_all(&mut parser, piece));
                }
            });
        });
    }

    group.finish();
}

fn bench_request_bodies(c: &mut Criterion) {
    let mut group = c.benchmark_group("request_body");

    for size in [1024, 64 * 1024, 1024 * 1024] {
        let wire = post_request(size);
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::new("post", size), &wire, |b, wire| {
            b.iter(|| {
                let mut parser = MessageParser::new(ChannelKind::Request, 4096);
                black_box(parse_all(&mut parser, wire));
            });
        });
    }

    group.finish();
}

fn bench_forwarded_head(c: &mut Criterion) {
    let mut group = c.benchmark_group("forwarded_head");

    let wire = browser_request(16);
    let mut parsed = MessageParser::new(ChannelKind::Request, 4096);
    parse_all(&mut parsed, &wire);

    group.bench_function("resolve_and_encode", |b| {
        b.iter(|| {
            let host = parsed.resolve_host().map(str::to_string);
            black_box(host);
            black_box(parser::encode_head(&parsed.request_line(), parsed.headers()));
        });
    });

    let mut headers = Headers::new();
    for i in 0..16 {
        headers.insert(format!("X-Header-{}", i), format!("value-{}", i));
    }
    group.bench_function("header_string", |b| {
        b.iter(|| black_box(headers.to_header_string()));
    });

    group.finish();
}

criterion_group! {
    name = parsing;
    config = Criterion::default()
        .measurement_time(Duration::from_secs(5))
        .sample_size(200);
    targets =
        bench_request_heads,
        bench_fragmented_feed,
        bench_request_bodies
}

criterion_group! {
    name = forwarding;
    config = Criterion::default()
        .measurement_time(Duration::from_secs(5));
    targets = bench_forwarded_head
}

criterion_main!(parsing, forwarding);
