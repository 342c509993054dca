//! BitBuffer 읽기/쓰기와 데이터그램 인코딩 벤치마크

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use slnet::buffer::BitBuffer;
use slnet::message::{DeliveryMethod, MessageType};
use slnet::pool::SharedPayload;
use slnet::wire::{decode_datagram, pack_datagrams, WireMessage};

fn bench_write_mixed(c: &mut Criterion) {
    c.bench_function("bit_buffer_write_mixed", |b| {
        b.iter(|| {
            let mut buffer = BitBuffer::with_capacity(256);
            for i in 0..32u32 {
                buffer.write_bool(i % 3 == 0);
                buffer.write_bits(i as u64, 5);
                buffer.write_var_u32(i * 1000);
                buffer.write_f32(i as f32 * 0.5);
            }
            buffer.write_string("player position update");
            black_box(buffer)
        })
    });
}

fn bench_read_mixed(c: &mut Criterion) {
    let mut source = BitBuffer::with_capacity(256);
    for i in 0..32u32 {
        source.write_bool(i % 3 == 0);
        source.write_bits(i as u64, 5);
        source.write_var_u32(i * 1000);
        source.write_f32(i as f32 * 0.5);
    }

    c.bench_function("bit_buffer_read_mixed", |b| {
        b.iter(|| {
            let mut buffer = source.clone();
            let mut sum = 0u64;
            for _ in 0..32 {
                sum += buffer.read_bool().unwrap() as u64;
                sum += buffer.read_bits(5).unwrap();
                sum += buffer.read_var_u32().unwrap() as u64;
                sum += buffer.read_f32().unwrap() as u64;
            }
            black_box(sum)
        })
    });
}

fn bench_datagram_round_trip(c: &mut Criterion) {
    let mut group = c.benchmark_group("datagram_pack_decode");

    for payload_size in [16usize, 128, 512] {
        let messages: Vec<WireMessage> = (0..64u16)
            .map(|seq| WireMessage {
                message_type: MessageType::user(DeliveryMethod::ReliableOrdered, 0),
                sequence: seq,
                fragment: None,
                payload: SharedPayload::from_bytes(&vec![seq as u8; payload_size]),
            })
            .collect();

        group.throughput(Throughput::Bytes((payload_size * messages.len()) as u64));
        group.bench_with_input(BenchmarkId::from_parameter(payload_size), &messages, |b, messages| {
            b.iter(|| {
                let datagrams = pack_datagrams(messages.iter(), 1408);
                let mut decoded = 0;
                for datagram in &datagrams {
                    decoded += decode_datagram(datagram).unwrap().len();
                }
                black_box(decoded)
            })
        });
    }

    group.finish();
}

criterion_group!(benches, bench_write_mixed, bench_read_mixed, bench_datagram_round_trip);
criterion_main!(benches);
