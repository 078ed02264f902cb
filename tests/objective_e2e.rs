use std::sync::Arc;
use std::time::{Duration, Instant};

use vitalbus::transport::memory::InMemoryBus;
use vitalbus::transport::{InstanceState, SampleInfo, ViewState};
use vitalbus::{
    AlarmObjectiveListener, DeviceIdentity, DeviceSession, EventLoop, GlobalAlarmObjective, InstanceHandle,
    ObjectiveUpdate, SessionConfig, TransportError,
};

fn session(bus: &InMemoryBus) -> DeviceSession {
    let event_loop = Arc::new(EventLoop::start("objective-events", 64).unwrap());
    let mut session = DeviceSession::new(SessionConfig::default(), bus.transport(), event_loop).unwrap();
    session.set_identity(DeviceIdentity::new("dev1"));
    session.write_device_identity().unwrap();
    session
}

/// Drain queued updates until `want` have arrived or two seconds pass.
fn collect(session: &DeviceSession, want: usize) -> Vec<ObjectiveUpdate> {
    let mut updates = Vec::new();
    let deadline = Instant::now() + Duration::from_secs(2);
    while updates.len() < want && Instant::now() < deadline {
        session.apply_pending_objectives(&mut updates);
        std::thread::sleep(Duration::from_millis(5));
    }
    updates
}

/// Loans are returned after dispatch, so wait for the loop to finish the cycle.
fn wait_for_loans(bus: &InMemoryBus) -> usize {
    let deadline = Instant::now() + Duration::from_secs(2);
    while bus.objectives.outstanding_loans() > 0 && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(5));
    }
    bus.objectives.outstanding_loans()
}

fn placeholder() -> GlobalAlarmObjective {
    GlobalAlarmObjective::new("", 0.0, 0.0)
}

#[test]
fn objectives_are_set_then_unset() {
    let bus = InMemoryBus::new();
    let session = session(&bus);

    bus.objectives.remote_write(11, GlobalAlarmObjective::new("HR", 45.0, 130.0));
    bus.objectives.remote_dispose(11, placeholder());

    let updates = collect(&session, 2);
    assert_eq!(
        updates,
        vec![
            ObjectiveUpdate::Set(GlobalAlarmObjective::new("HR", 45.0, 130.0)),
            ObjectiveUpdate::Unset {
                metric_id: "HR".to_string()
            },
        ]
    );
    assert_eq!(wait_for_loans(&bus), 0);
}

#[test]
fn unbound_disposal_is_skipped() {
    let bus = InMemoryBus::new();
    let session = session(&bus);

    bus.objectives.deliver(
        SampleInfo {
            instance_handle: InstanceHandle::from_raw(99),
            view_state: ViewState::NotNew,
            instance_state: InstanceState::NotAlive,
            valid_data: false,
        },
        placeholder(),
    );
    bus.objectives.remote_write(12, GlobalAlarmObjective::new("RR", 6.0, 30.0));

    // RR was delivered after the disposal, so its set means the disposal was handled.
    let updates = collect(&session, 1);
    assert_eq!(updates, vec![ObjectiveUpdate::Set(GlobalAlarmObjective::new("RR", 6.0, 30.0))]);
    std::thread::sleep(Duration::from_millis(20));
    assert_eq!(session.pending_objectives(), 0);
}

#[test]
fn read_failures_do_not_leak_loans() {
    let bus = InMemoryBus::new();
    let session = session(&bus);

    bus.objectives.fail_next_read(TransportError::backend("link down"));
    bus.objectives.remote_write(3, GlobalAlarmObjective::new("HR", 50.0, 120.0));
    bus.objectives.remote_write(3, GlobalAlarmObjective::new("HR", 55.0, 120.0));

    let deadline = Instant::now() + Duration::from_secs(2);
    while bus.objectives.reads() < 2 && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(5));
    }
    let _ = collect(&session, 2);
    assert_eq!(wait_for_loans(&bus), 0);
}

struct Limits {
    applied: Vec<(String, Option<(f32, f32)>)>,
}

impl AlarmObjectiveListener for Limits {
    fn on_set(&mut self, objective: &GlobalAlarmObjective) {
        self.applied
            .push((objective.metric_id.clone(), Some((objective.lower, objective.upper))));
    }

    fn on_unset(&mut self, metric_id: &str) {
        self.applied.push((metric_id.to_string(), None));
    }
}

#[test]
fn objectives_apply_on_the_device_thread() {
    let bus = InMemoryBus::new();
    let mut session = session(&bus);
    bus.objectives.remote_write(21, GlobalAlarmObjective::new("SpO2", 90.0, 100.0));

    let deadline = Instant::now() + Duration::from_secs(2);
    while session.pending_objectives() == 0 && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(5));
    }

    let mut limits = Limits { applied: Vec::new() };
    assert_eq!(session.apply_pending_objectives(&mut limits), 1);
    let (metric, bounds) = limits.applied[0].clone();
    let (lower, upper) = bounds.unwrap();

    // Echo the accepted objective back out as this device's own limits.
    session
        .alarm_settings_sample(None, Some(lower), Some(upper), &metric)
        .unwrap();
    assert_eq!(bus.alarm_settings.writes()[0].bounds.lower, 90.0);
}
