use criterion::{criterion_group, criterion_main};

mod network;

criterion_group!(
    benches,
    network::application::mqtt::codec::bench_encode,
    network::application::mqtt::codec::bench_decode,
    network::application::mqtt::codec::bench_framer
);
criterion_main!(benches);
