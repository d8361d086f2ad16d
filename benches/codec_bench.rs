use bytes::Bytes;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use watchlink::blobdb::content_hash;
use watchlink::ppog::PpogPacket;
use watchlink::protocol::{
    BlobCommand, BlobDatabase, BlobOp, Origin, Packet, PacketAssembler, PutBytesCommand,
};

fn blob_insert(value_len: usize) -> Packet {
    Packet::BlobCommand(BlobCommand {
        token: 0x1234,
        database: BlobDatabase::Notification,
        op: BlobOp::Insert {
            key: Bytes::from_static(&[0xAB; 16]),
            value: Bytes::from(vec![0x5A; value_len]),
        },
    })
}

fn bench_blob_frames(c: &mut Criterion) {
    let mut group = c.benchmark_group("blobdb_frame");

    for value_len in [64usize, 512, 2048].iter() {
        let packet = blob_insert(*value_len);
        let encoded = packet.encode();
        group.throughput(Throughput::Bytes(encoded.len() as u64));

        group.bench_with_input(BenchmarkId::new("encode", value_len), &packet, |b, packet| {
            b.iter(|| black_box(packet).encode());
        });
        group.bench_with_input(BenchmarkId::new("decode", value_len), &encoded, |b, encoded| {
            b.iter(|| {
                let mut assembler = PacketAssembler::default();
                for raw in assembler.push(black_box(encoded)) {
                    black_box(Packet::decode(Origin::Phone, raw).unwrap());
                }
            });
        });
    }
    group.finish();
}

fn bench_reassembly(c: &mut Criterion) {
    let mut group = c.benchmark_group("frame_reassembly");
    let stream: Vec<u8> = (0..64)
        .flat_map(|i| {
            Packet::PutBytesCommand(PutBytesCommand::Put {
                cookie: i,
                data: Bytes::from(vec![i as u8; 2000]),
            })
            .encode()
        })
        .collect();
    group.throughput(Throughput::Bytes(stream.len() as u64));

    // chunk sizes of typical BLE MTUs
    for chunk in [20usize, 181, 509].iter() {
        group.bench_with_input(BenchmarkId::from_parameter(chunk), chunk, |b, chunk| {
            b.iter(|| {
                let mut assembler = PacketAssembler::default();
                let mut frames = 0;
                for piece in stream.chunks(*chunk) {
                    frames += assembler.push(black_box(piece)).len();
                }
                assert_eq!(frames, 64);
            });
        });
    }
    group.finish();
}

fn bench_ppog_packets(c: &mut Criterion) {
    let packet = PpogPacket::Data {
        seq: 17,
        payload: Bytes::from(vec![0x42; 180]),
    };
    let encoded = packet.encode();
    c.bench_function("ppog_data_encode", |b| b.iter(|| black_box(&packet).encode()));
    c.bench_function("ppog_data_decode", |b| {
        b.iter(|| PpogPacket::decode(black_box(encoded.clone())).unwrap())
    });
}

fn bench_record_hash(c: &mut Criterion) {
    let mut group = c.benchmark_group("record_hash");
    for len in [32usize, 512, 4096].iter() {
        let value = vec![0x33u8; *len];
        group.throughput(Throughput::Bytes(*len as u64));
        group.bench_with_input(BenchmarkId::from_parameter(len), &value, |b, value| {
            b.iter(|| content_hash(black_box(value)));
        });
    }
    group.finish();
}

criterion_group!(
    benches,
    bench_blob_frames,
    bench_reassembly,
    bench_ppog_packets,
    bench_record_hash
);
criterion_main!(benches);
