//! Throughput Benchmark for the FlashKV driver
//!
//! Measures the hot paths of the driver that do not touch the network:
//! slot hashing, command encoding, queue churn and reply parsing.

use bytes::{Bytes, BytesMut};
use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use flashkv_driver::cluster::hash_slot;
use flashkv_driver::command::{Command, RedisCommand, SharedCommand, StatusOutput, ValueOutput};
use flashkv_driver::endpoint::CommandQueue;
use flashkv_driver::protocol::{RespParser, RespValue};

/// Benchmark slot hashing
fn bench_hash_slot(c: &mut Criterion) {
    let mut group = c.benchmark_group("hash_slot");
    group.throughput(Throughput::Elements(1));

    group.bench_function("plain_key", |b| {
        let mut i = 0u64;
        b.iter(|| {
            let key = format!("user:{}", i);
            black_box(hash_slot(key.as_bytes()));
            i += 1;
        });
    });

    group.bench_function("hash_tag", |b| {
        let mut i = 0u64;
        b.iter(|| {
            let key = format!("{{user:{}}}:profile", i % 1000);
            black_box(hash_slot(key.as_bytes()));
            i += 1;
        });
    });

    group.finish();
}

/// Benchmark command encoding
fn bench_encode(c: &mut Criterion) {
    let mut group = c.benchmark_group("encode");
    group.throughput(Throughput::Elements(1));

    group.bench_function("get", |b| {
        let (command, _handle) = Command::new("GET", ValueOutput::new())
            .key_arg("user:101")
            .prepare();
        let mut buf = BytesMut::with_capacity(64);
        b.iter(|| {
            buf.clear();
            command.encode(&mut buf).unwrap();
            black_box(buf.len());
        });
    });

    group.bench_function("set_1kb", |b| {
        let (command, _handle) = Command::new("SET", StatusOutput::new())
            .key_arg("user:101")
            .arg(Bytes::from("x".repeat(1024)))
            .prepare();
        let mut buf = BytesMut::with_capacity(2048);
        b.iter(|| {
            buf.clear();
            command.encode(&mut buf).unwrap();
            black_box(buf.len());
        });
    });

    group.finish();
}

/// Benchmark enqueue / dequeue pairs
fn bench_queue(c: &mut Criterion) {
    let mut group = c.benchmark_group("queue");
    group.throughput(Throughput::Elements(100));

    group.bench_function("enqueue_dequeue_100", |b| {
        let mut queue = CommandQueue::new();
        let commands: Vec<SharedCommand> = (0..100)
            .map(|_| {
                let (command, _handle) = Command::new("PING", StatusOutput::new()).prepare();
                let shared: SharedCommand = command;
                shared
            })
            .collect();
        b.iter(|| {
            for command in &commands {
                queue.enqueue(command.clone()).unwrap();
            }
            while let Some(command) = queue.dequeue_matching_reply() {
                black_box(command);
            }
        });
    });

    group.finish();
}

/// Benchmark reply parsing
fn bench_parse(c: &mut Criterion) {
    let mut group = c.benchmark_group("parse");
    group.throughput(Throughput::Elements(1));

    let status = RespValue::simple_string("OK").serialize();
    let bulk = RespValue::bulk_string(Bytes::from("x".repeat(1024))).serialize();
    let array = RespValue::array(
        (0..100)
            .map(|i| RespValue::bulk_string(format!("value:{}", i)))
            .collect(),
    )
    .serialize();

    group.bench_function("status", |b| {
        let mut parser = RespParser::new();
        b.iter(|| black_box(parser.parse(&status).unwrap()));
    });

    group.bench_function("bulk_1kb", |b| {
        let mut parser = RespParser::new();
        b.iter(|| black_box(parser.parse(&bulk).unwrap()));
    });

    group.bench_function("array_100", |b| {
        let mut parser = RespParser::new();
        b.iter(|| black_box(parser.parse(&array).unwrap()));
    });

    group.finish();
}

criterion_group!(benches, bench_hash_slot, bench_encode, bench_queue, bench_parse);

criterion_main!(benches);
