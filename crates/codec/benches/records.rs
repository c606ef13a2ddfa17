use criterion::{Criterion, criterion_group, criterion_main};
use rdma_server_codec::{ParamsRecord, Psn, PsnRecord};

fn criterion_benchmark(c: &mut Criterion) {
    let params = ParamsRecord {
        qp_num: 0x112233,
        lid: 7,
        gid: [0xab; 16],
        psn: Psn::new(0x2807d5).unwrap(),
    };

    let mut encoded = Vec::with_capacity(ParamsRecord::SIZE);
    params.encode(&mut encoded);

    c.bench_function("encode_params_record", |b| {
        let mut buf = Vec::with_capacity(ParamsRecord::SIZE);
        b.iter(|| {
            buf.clear();
            params.encode(&mut buf);
        })
    });

    c.bench_function("decode_params_record", |b| {
        b.iter(|| ParamsRecord::decode(&encoded).unwrap())
    });

    c.bench_function("decode_psn_record", |b| {
        let buf = [0xd5, 0x07, 0x28, 0x00];
        b.iter(|| PsnRecord::decode(&buf).unwrap())
    });
}

criterion_group!(benches, criterion_benchmark);
criterion_main!(benches);
