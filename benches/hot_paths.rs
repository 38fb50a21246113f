use criterion::{black_box, criterion_group, criterion_main, Criterion};

use pirate::message::Metric;
use pirate::parser::decode_message;
use pirate::template::{PathTemplate, ResolveContext};

fn datagram(metrics: usize) -> Vec<u8> {
    let mut buf = Vec::with_capacity(64 + metrics * 32);
    buf.extend_from_slice(b"project=my_proj; version=1.2.3\n");
    for i in 0..metrics {
        buf.extend_from_slice(format!("fps {} 1711000000\n", i % 120).as_bytes());
    }
    buf
}

fn bench_decode_message(c: &mut Criterion) {
    let single = datagram(1);
    let batch = datagram(100);

    c.bench_function("decode_message_single", |b| {
        b.iter(|| decode_message(black_box(&single)))
    });

    c.bench_function("decode_message_batch_100", |b| {
        b.iter(|| decode_message(black_box(&batch)))
    });
}

fn bench_template_resolve(c: &mut Criterion) {
    let tpl = PathTemplate::parse("servers.{attr.version}.{metric.name}").expect("parse");

    let mut attrs = pirate::message::Header::new();
    attrs.insert("version".to_string(), b"1.2.3".to_vec());
    let metric = Metric::new(b"fps".to_vec(), b"30".to_vec(), b"1711000000".to_vec());

    c.bench_function("template_resolve", |b| {
        b.iter(|| {
            tpl.resolve(black_box(&ResolveContext {
                attrs: &attrs,
                metric: &metric,
            }))
        })
    });
}

criterion_group!(benches, bench_decode_message, bench_template_resolve);
criterion_main!(benches);
