use criterion::{criterion_group, criterion_main, Criterion, Throughput};

use vitalbus::transport::memory::InMemoryBus;
use vitalbus::{AlertCategory, DeviceIdentity, DeviceSession, Reading, SessionConfig};

fn make_session() -> (InMemoryBus, DeviceSession) {
    let bus = InMemoryBus::new();
    let mut session = DeviceSession::start(SessionConfig::default(), bus.transport()).unwrap();
    session.set_identity(DeviceIdentity::new("bench-device"));
    session.write_device_identity().unwrap();
    (bus, session)
}

fn bench_numeric(c: &mut Criterion) {
    let (bus, mut session) = make_session();
    let key = session.metric_key("HR", "vHR").with_unit("bpm");
    let reading = Reading::now();
    let mut holder = session.numeric_sample(None, Some(60.0), &key, &reading).unwrap();

    let mut group = c.benchmark_group("numeric");
    group.throughput(Throughput::Elements(1));
    group.bench_function("steady_state_write", |b| {
        let mut value = 60.0_f32;
        b.iter(|| {
            value += 1.0;
            holder = session
                .numeric_sample(holder.take(), Some(value), &key, &reading)
                .unwrap();
            // Keep the recorder from growing without bound.
            if bus.numeric.write_count() > 10_000 {
                bus.numeric.clear_ops();
            }
        });
    });
    group.finish();
}

fn bench_waveform(c: &mut Criterion) {
    let (bus, mut session) = make_session();
    let key = session.metric_key("PLETH", "vPleth").at_frequency(125);
    let samples: Vec<f32> = (0..125u8).map(f32::from).collect();
    let reading = Reading::now();
    let mut holder = None;

    let mut group = c.benchmark_group("waveform");
    group.throughput(Throughput::Elements(samples.len() as u64));
    group.bench_function("batch_125hz", |b| {
        b.iter(|| {
            holder = session
                .sample_array_sample(holder.take(), Some(samples.as_slice()), &key, &reading)
                .unwrap();
            if bus.sample_array.write_count() > 1_000 {
                bus.sample_array.clear_ops();
            }
        });
    });
    group.finish();
}

fn bench_alert_pass(c: &mut Criterion) {
    let (bus, mut session) = make_session();
    let alerts: Vec<(String, String)> = (0..32).map(|i| (format!("ALERT_{i}"), format!("text {i}"))).collect();

    c.bench_function("alert_pass_32_unchanged", |b| {
        b.iter(|| {
            session
                .alerts_mut(AlertCategory::Technical)
                .reconcile(alerts.iter().map(|(id, text)| (id.as_str(), text.as_str())))
                .unwrap();
        });
    });
    assert_eq!(bus.technical_alert.register_count(), 32);
}

criterion_group!(benches, bench_numeric, bench_waveform, bench_alert_pass);
criterion_main!(benches);
