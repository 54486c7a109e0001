//! Frame Codec Benchmarks
//!
//! Body push/pop, header encode/decode and the inbound queue hand-off: the
//! per-message work done on the pumps and by the application.

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use num_enum::{IntoPrimitive, TryFromPrimitive};
use std::sync::Arc;
use std::thread;
use transport::{Message, MessageHeader, OwnedMessage, TsQueue};

#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
enum Tag {
    Ping = 2,
    Quote = 5,
}

fn bench_push_pop(c: &mut Criterion) {
    let mut group = c.benchmark_group("body");
    group.throughput(Throughput::Elements(1));

    group.bench_function("push_pop_scalars", |b| {
        b.iter(|| {
            let mut msg = Message::new(Tag::Quote);
            msg.push(&black_box(42u32))
                .push(&black_box(1.25f64))
                .push(&black_box(7u64));
            let seq: u64 = msg.pop().unwrap();
            let price: f64 = msg.pop().unwrap();
            let qty: u32 = msg.pop().unwrap();
            black_box((seq, price, qty))
        })
    });

    group.bench_function("push_1k_u32", |b| {
        b.iter(|| {
            let mut msg = Message::new(Tag::Quote);
            for i in 0..1024u32 {
                msg.push(&i);
            }
            black_box(msg.size())
        })
    });

    group.finish();
}

fn bench_header(c: &mut Criterion) {
    let mut group = c.benchmark_group("header");
    group.throughput(Throughput::Elements(1));

    let mut ping = Message::new(Tag::Ping);
    ping.push(&123_456_789u64);
    let encoded = ping.header().encode();

    group.bench_function("encode", |b| {
        b.iter(|| black_box(ping.header().encode()))
    });

    group.bench_function("decode", |b| {
        b.iter(|| black_box(MessageHeader::<Tag>::decode(black_box(&encoded)).unwrap()))
    });

    group.finish();
}

fn bench_queue(c: &mut Criterion) {
    let mut group = c.benchmark_group("queue");

    group.throughput(Throughput::Elements(1));
    group.bench_function("push_pop_uncontended", |b| {
        let queue = TsQueue::new();
        b.iter(|| {
            queue.push_back(OwnedMessage {
                remote: None,
                msg: Message::new(Tag::Ping),
            });
            black_box(queue.pop_front())
        })
    });

    const BATCH: u64 = 10_000;
    group.throughput(Throughput::Elements(BATCH));
    group.bench_function("producer_consumer_10k", |b| {
        b.iter(|| {
            let queue = Arc::new(TsQueue::new());
            let producer = {
                let queue = Arc::clone(&queue);
                thread::spawn(move || {
                    for seq in 0..BATCH {
                        queue.push_back(seq);
                    }
                })
            };

            let mut received = 0;
            while received < BATCH {
                queue.wait();
                while queue.pop_front().is_some() {
                    received += 1;
                }
            }
            producer.join().unwrap();
            black_box(received)
        })
    });

    group.finish();
}

criterion_group!(benches, bench_push_pop, bench_header, bench_queue);
criterion_main!(benches);
