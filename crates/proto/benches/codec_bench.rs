//! SSH codec benchmarks.
//!
//! Packet framing throughput per cipher suite, channel message decoding and
//! algorithm negotiation.
//!
//! Run with: `cargo bench --bench codec_bench`

use bytes::{BufMut, Bytes, BytesMut};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use fjord_proto::ssh::algorithms::{CipherAlgorithm, CompressionAlgorithm, MacAlgorithm};
use fjord_proto::ssh::connection::messages::ConnectionMessage;
use fjord_proto::ssh::packet::{build_keys, DirectionKeys, PacketDecoder, PacketEncoder};
use fjord_proto::ssh::proposal::negotiate_algorithm;

const PAYLOAD_SIZES: [usize; 3] = [64, 1024, 32 * 1024];

/// Builds a matching encoder and decoder for one suite.
fn codec_pair(cipher: CipherAlgorithm, mac: MacAlgorithm) -> (PacketEncoder, PacketDecoder) {
    let key = [7u8; 32];
    let iv = [3u8; 12];
    let mac_key = [5u8; 64];
    let keys = || -> DirectionKeys {
        build_keys(
            cipher,
            &key,
            &iv,
            mac.create(&mac_key).unwrap(),
            CompressionAlgorithm::None,
        )
        .unwrap()
    };
    let mut encoder = PacketEncoder::new();
    let mut decoder = PacketDecoder::new();
    encoder.set_keys(keys());
    decoder.set_keys(keys());
    (encoder, decoder)
}

/// A CHANNEL_DATA payload with `len` data bytes.
fn channel_data(len: usize) -> Bytes {
    let mut payload = BytesMut::with_capacity(len + 9);
    payload.put_u8(94);
    payload.put_u32(0);
    payload.put_u32(len as u32);
    payload.put_slice(&vec![0xA5u8; len]);
    payload.freeze()
}

fn bench_packet_roundtrip(c: &mut Criterion) {
    let suites = [
        ("none", CipherAlgorithm::None, MacAlgorithm::None),
        ("aes256-gcm", CipherAlgorithm::Aes256Gcm, MacAlgorithm::None),
        ("aes128-gcm", CipherAlgorithm::Aes128Gcm, MacAlgorithm::None),
        ("none+hmac-sha2-256", CipherAlgorithm::None, MacAlgorithm::HmacSha256),
    ];
    let mut group = c.benchmark_group("packet_roundtrip");
    for (name, cipher, mac) in suites {
        for size in PAYLOAD_SIZES {
            let payload = channel_data(size);
            group.throughput(Throughput::Bytes(payload.len() as u64));
            group.bench_with_input(BenchmarkId::new(name, size), &payload, |b, payload| {
                let (mut encoder, mut decoder) = codec_pair(cipher, mac);
                let mut input = BytesMut::new();
                b.iter(|| {
                    let wire = encoder.encode(payload.clone()).unwrap();
                    input.extend_from_slice(&wire);
                    black_box(decoder.decode(&mut input).unwrap())
                });
            });
        }
    }
    group.finish();
}

fn bench_message_decode(c: &mut Criterion) {
    let payload = channel_data(1024);
    c.bench_function("decode_channel_data", |b| {
        b.iter(|| ConnectionMessage::decode(black_box(payload.clone())).unwrap())
    });
}

fn bench_negotiation(c: &mut Criterion) {
    let client: Vec<String> = (0..20).map(|i| format!("alg-{}@client", i)).collect();
    let mut server: Vec<String> = (0..20).map(|i| format!("alg-{}@server", i)).collect();
    server.push("alg-19@client".to_string());
    c.bench_function("negotiate_last_match", |b| {
        b.iter(|| negotiate_algorithm(black_box(&client), black_box(&server)))
    });
}

criterion_group!(
    benches,
    bench_packet_roundtrip,
    bench_message_decode,
    bench_negotiation
);
criterion_main!(benches);
