use criterion::{black_box, criterion_group, criterion_main, Criterion};
use framecast::modules::crypto::{self, SessionKey};
use framecast::modules::framing;
use framecast::{FramePacket, StreamDescriptor};

fn bench_framing(c: &mut Criterion) {
    let payload = vec![0x5au8; 64 * 1024];
    let runtime = tokio::runtime::Builder::new_current_thread()
        .build()
        .unwrap();

    c.bench_function("framing_send_recv_64k", |b| {
        b.iter(|| {
            runtime.block_on(async {
                let mut wire = Vec::with_capacity(payload.len() + framecast::HEADER_WIDTH);
                framing::send(&mut wire, black_box(&payload)).await.unwrap();
                let received = framing::recv(&mut wire.as_slice()).await.unwrap();
                assert_eq!(received.len(), payload.len());
            })
        })
    });

    c.bench_function("decode_header", |b| {
        b.iter(|| framing::decode_header(black_box(b"00065536")).unwrap())
    });
}

fn bench_cipher(c: &mut Criterion) {
    let key = SessionKey::from_bytes([7u8; 32]);
    // Typical 640x360 JPEG frame packet
    let frame = vec![0xA5u8; 48 * 1024];
    let envelope = crypto::encrypt(&key, &frame).unwrap();

    c.bench_function("encrypt_48k", |b| {
        b.iter(|| crypto::encrypt(&key, black_box(&frame)).unwrap())
    });
    c.bench_function("decrypt_48k", |b| {
        b.iter(|| crypto::decrypt(&key, black_box(&envelope)).unwrap())
    });
}

fn bench_packets(c: &mut Criterion) {
    let packet = FramePacket {
        frame: vec![0xFFu8; 48 * 1024],
        audio: Some(vec![0u8; 5880]),
        frame_number: 1234,
    };
    let encoded = packet.encode().unwrap();
    let descriptor = StreamDescriptor {
        width: 640,
        height: 360,
        fps: 30.0,
        total_frames: 900,
        audio_sample_rate: 44_100,
        audio_channels: 2,
        samples_per_frame: 1470,
        has_audio: true,
    };

    c.bench_function("frame_packet_encode", |b| {
        b.iter(|| black_box(&packet).encode().unwrap())
    });
    c.bench_function("frame_packet_decode", |b| {
        b.iter(|| FramePacket::decode(black_box(&encoded)).unwrap())
    });
    c.bench_function("descriptor_encode", |b| {
        b.iter(|| black_box(&descriptor).encode().unwrap())
    });
}

criterion_group!(benches, bench_framing, bench_cipher, bench_packets);
criterion_main!(benches);
