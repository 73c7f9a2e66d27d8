// f2fstream channel benchmarks using criterion.
//
// Measures:
//   - Service data frame encode / decode throughput
//   - Token bucket enqueue + drain
//   - Endpoint write / acknowledge round trip

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use f2fstream::buffer::PooledBuffer;
use f2fstream::delegate::ChannelDelegate;
use f2fstream::endpoint::{ChannelEndpoint, EndpointConfig};
use f2fstream::frame::{DataMessage, Frame, MAX_DATAGRAM_SIZE};
use f2fstream::limiter::TokenBucketLimiter;
use f2fstream::link::NetworkLink;
use f2fstream::readiness::ReadyEvent;
use f2fstream::scheduler::TokioScheduler;
use f2fstream::send_queue::SendQueue;
use f2fstream::sequence::SequenceNumber;
use tokio::sync::oneshot;

// ---------------------------------------------------------------------------
// Frame encode / decode throughput
// ---------------------------------------------------------------------------

fn bench_frame_codec(c: &mut Criterion) {
    let sizes: &[usize] = &[64, 512, 1024];

    let mut group = c.benchmark_group("service_data_codec");
    for &size in sizes {
        let payload = PooledBuffer::from(Bytes::from(vec![0xABu8; size]));
        let frame = Frame::ServiceData(DataMessage::data(1, SequenceNumber::new(2, 42), payload));
        let encoded = frame.encode();
        group.throughput(Throughput::Bytes(encoded.len() as u64));
        group.bench_with_input(BenchmarkId::new("encode", size), &frame, |b, f| {
            b.iter(|| {
                black_box(f.encode());
            });
        });
        group.bench_with_input(BenchmarkId::new("decode", size), &encoded, |b, data| {
            b.iter(|| {
                black_box(Frame::decode(black_box(data)).unwrap());
            });
        });
    }
    group.finish();
}

// ---------------------------------------------------------------------------
// Token bucket pacing
// ---------------------------------------------------------------------------

fn bench_limiter(c: &mut Criterion) {
    c.bench_function("limiter_enqueue_drain_16", |b| {
        let sink = Arc::new(SendQueue::new());
        let limiter = TokenBucketLimiter::new(1, Arc::clone(&sink));
        let payload = PooledBuffer::from(Bytes::from(vec![0u8; 1000]));

        b.iter(|| {
            for num in 0..16 {
                limiter.enqueue(DataMessage::data(
                    1,
                    SequenceNumber::new(1, num),
                    payload.clone(),
                ));
                limiter.refill(MAX_DATAGRAM_SIZE);
            }
            while let Some(d) = sink.pop() {
                black_box(d);
            }
        });
    });
}

// ---------------------------------------------------------------------------
// Endpoint write / ack
// ---------------------------------------------------------------------------

#[derive(Default)]
struct NullLink {
    ready: ReadyEvent,
}

impl NetworkLink for NullLink {
    fn send(&self, message: DataMessage) -> bool {
        black_box(message);
        true
    }
    fn potential_capacity(&self, _channel_id: u32) -> usize {
        64 * 1024
    }
    fn current_capacity(&self, _channel_id: u32) -> usize {
        64 * 1024
    }
    fn update_backpressure(&self, _channel_id: u32, _window: i32) {}
    fn handshake_received(&self) -> bool {
        true
    }
    fn is_ready_for_write(&self) -> bool {
        self.ready.is_fired()
    }
    fn ready_for_write(&self) -> oneshot::Receiver<()> {
        self.ready.wait()
    }
}

struct Sink;

impl ChannelDelegate for Sink {
    fn channel_is_ready(&self, _endpoint: &ChannelEndpoint) {}
    fn channel_got_message(&self, _endpoint: &ChannelEndpoint, _message: &DataMessage) -> bool {
        true
    }
    fn channel_did_close(&self, _endpoint: &ChannelEndpoint) {}
    fn queue_capacity(&self, _endpoint: &ChannelEndpoint) -> i32 {
        1 << 16
    }
    fn writes_messages(&self) -> bool {
        true
    }
}

fn bench_endpoint(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let endpoint = ChannelEndpoint::new(
        EndpointConfig::default(),
        Arc::new(NullLink::default()),
        Arc::new(TokioScheduler::new(rt.handle().clone())),
    );
    endpoint.register_delegate(1, Arc::new(Sink)).unwrap();
    let payload = PooledBuffer::from(Bytes::from(vec![0u8; 512]));

    let mut counter = 0u32;
    c.bench_function("endpoint_write_then_ack", |b| {
        b.iter(|| {
            endpoint.write(1, counter, Some(payload.clone()), false).unwrap();
            black_box(endpoint.forget(SequenceNumber::new(1, counter)));
            counter = counter.wrapping_add(1);
        });
    });

    c.bench_function("endpoint_receive_and_ack", |b| {
        let frame = Frame::ServiceData(DataMessage::data(
            0,
            SequenceNumber::new(1, 7),
            payload.clone(),
        ));
        b.iter(|| {
            endpoint.on_receive(black_box(frame.clone()));
        });
    });
}

// ---------------------------------------------------------------------------
// Criterion harness
// ---------------------------------------------------------------------------

criterion_group! {
    name = channel_benches;
    config = Criterion::default()
        .sample_size(100)
        .measurement_time(Duration::from_secs(5));
    targets =
        bench_frame_codec,
        bench_limiter,
        bench_endpoint
}

criterion_main!(channel_benches);
