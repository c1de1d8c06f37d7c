//! Codec benchmarks: frame decode/encode on the control protocol hot path.

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use renode_gateway::protocol::{Event, Message, Response};
use serde_json::json;

fn bench_decode(c: &mut Criterion) {
    let frame = json!({
        "version": "1.1.0",
        "action": "exec-monitor",
        "id": 42,
        "payload": {"commands": ["mach create", "machine LoadPlatformDescription @platforms/cpus/stm32f4.repl"]},
    })
    .to_string();

    c.bench_function("decode_request", |b| {
        b.iter(|| Message::from_json(black_box(&frame)).unwrap())
    });
}

fn bench_encode(c: &mut Criterion) {
    let mut response = Response::failure();
    response.id = Some(42);
    response.succeed();
    response.data = serde_json::Value::from(vec!["ok"; 16]);

    c.bench_function("encode_response", |b| b.iter(|| black_box(&response).to_json()));

    let event = Event::from_child(
        json!({"event": "uart-opened", "port": 3456, "name": "sysbus.uart0", "machineName": "machine-0"})
            .as_object()
            .unwrap()
            .clone(),
    )
    .unwrap();

    c.bench_function("encode_event", |b| b.iter(|| black_box(&event).to_json()));
}

criterion_group!(benches, bench_decode, bench_encode);
criterion_main!(benches);
