use criterion::{criterion_group, criterion_main, Criterion, Throughput};
use keel::crypto::{BbCipher, BbKeyFile, Cipher, GcCipher, PcCipher, BB_SEED_SIZE};

fn bench_ciphers(c: &mut Criterion) {
    let mut group = c.benchmark_group("cipher");
    group.throughput(Throughput::Bytes(0x8000));

    group.bench_function("pc_encrypt_32k", |b| {
        let mut cipher = PcCipher::new(0x12345678);
        let mut data = vec![0u8; 0x8000];
        b.iter(|| cipher.encrypt(&mut data).unwrap());
    });

    group.bench_function("gc_encrypt_32k", |b| {
        let mut cipher = GcCipher::new(0x12345678);
        let mut data = vec![0u8; 0x8000];
        b.iter(|| cipher.encrypt(&mut data).unwrap());
    });

    group.bench_function("bb_encrypt_32k", |b| {
        let mut initial_keys = [0u32; 18];
        let mut private_keys = [0u32; 1024];
        for (x, word) in initial_keys.iter_mut().enumerate() {
            *word = x as u32;
        }
        for (x, word) in private_keys.iter_mut().enumerate() {
            *word = (x as u32).wrapping_mul(0x01000193);
        }
        let key = BbKeyFile { initial_keys, private_keys };
        let mut cipher = BbCipher::new(&key, &[0u8; BB_SEED_SIZE]).unwrap();
        let mut data = vec![0u8; 0x8000];
        b.iter(|| cipher.encrypt(&mut data).unwrap());
    });

    group.finish();
}

criterion_group!(benches, bench_ciphers);
criterion_main!(benches);
