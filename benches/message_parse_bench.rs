use criterion::{Criterion, criterion_group, criterion_main};
use ipfix_parser::json::{JsonBuffer, JsonFlags, record_to_json};
use ipfix_parser::template_mgr::SessionType;
use ipfix_parser::SessionParser;
use std::hint::black_box;

fn message() -> Vec<u8> {
    let mut msg = vec![
        0, 10, 0, 0, // version, length patched below
        1, 2, 3, 4, // export time
        0, 0, 0, 0, // sequence number
        0, 0, 0, 1, // observation domain
        // Template set: template 256 with 3 fields
        0, 2, 0, 20, 1, 0, 0, 3, 0, 8, 0, 4, 0, 12, 0, 4, 0, 2, 0, 4,
        // Data set: two 12-byte records
        1, 0, 0, 28,
    ];
    msg.extend_from_slice(&[10, 0, 0, 1, 10, 0, 0, 2, 0, 0, 1, 0]);
    msg.extend_from_slice(&[10, 0, 0, 3, 10, 0, 0, 4, 0, 0, 2, 0]);
    let len = msg.len() as u16;
    msg[2..4].copy_from_slice(&len.to_be_bytes());
    msg
}

fn criterion_benchmark(c: &mut Criterion) {
    let msg = message();

    c.bench_function("message parse", |b| {
        b.iter(|| {
            let mut parser = SessionParser::new(SessionType::Udp);
            parser.process_message(black_box(&msg)).unwrap();
        })
    });

    c.bench_function("message parse and render", |b| {
        b.iter(|| {
            let mut parser = SessionParser::new(SessionType::Udp);
            let parsed = parser.process_message(black_box(&msg)).unwrap();
            let mut buf = JsonBuffer::growable();
            for set in &parsed.data_sets {
                for record in parsed.records(set).unwrap() {
                    buf.clear();
                    record_to_json(&record.unwrap(), JsonFlags::empty(), None, &mut buf)
                        .unwrap();
                }
            }
        })
    });
}

criterion_group!(benches, criterion_benchmark);
criterion_main!(benches);
