use criterion::{BenchmarkId, Criterion, Throughput};
use libiot_mqtt::network::application::mqtt::packets::{Encode, Packet, Publish};
use libiot_mqtt::network::application::mqtt::{Framer, QoS, RawPacket};
use std::hint::black_box;

const PAYLOAD_SIZES: [usize; 3] = [16, 256, 1024];

fn publish(size: usize) -> Publish {
    let payload = vec![0xA5; size];
    Publish::new("sensors/node-1/temperature", &payload, QoS::AtLeastOnce, false, 42).unwrap()
}

pub fn bench_encode(c: &mut Criterion) {
    let mut group = c.benchmark_group("encode_publish");
    for size in PAYLOAD_SIZES {
        let packet = publish(size);
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &packet, |b, packet| {
            b.iter(|| black_box(packet.encode().unwrap()))
        });
    }
    group.finish();
}

pub fn bench_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("decode_publish");
    for size in PAYLOAD_SIZES {
        let raw: RawPacket = publish(size).encode().unwrap();
        group.throughput(Throughput::Bytes(raw.len() as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &raw, |b, raw| {
            b.iter(|| black_box(Packet::decode(raw).unwrap()))
        });
    }
    group.finish();
}

pub fn bench_framer(c: &mut Criterion) {
    let mut stream = Vec::new();
    for size in PAYLOAD_SIZES {
        for _ in 0..8 {
            stream.extend_from_slice(publish(size).encode().unwrap().as_bytes());
        }
    }

    let mut group = c.benchmark_group("framer");
    group.throughput(Throughput::Bytes(stream.len() as u64));
    for chunk in [1, 64, 1460] {
        group.bench_with_input(BenchmarkId::new("chunk", chunk), &chunk, |b, &chunk| {
            b.iter(|| {
                let mut framer = Framer::default();
                let mut count = 0;
                for part in stream.chunks(chunk) {
                    framer.feed(part, |packet| {
                        black_box(packet);
                        count += 1;
                    });
                }
                count
            })
        });
    }
    group.finish();
}
