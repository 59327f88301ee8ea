//! Whole runs over scripted workloads whose operations take a precise amount of time on a
//! manually advanced clock.
//!
//! The contexts run on real threads, so these tests are ignored under Miri.

#![allow(
    clippy::float_cmp,
    reason = "we use absolute error, which is the right thing to do"
)]

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

use exclusive_turns::{ContextId, ContextModel};
use interconnect_check::{
    Aggregate, DeviceError, DeviceErrorKind, DeviceId, ManualClock, MeasurementMode, Plan,
    RunError, SizeClass, Topology, Workload, run_contexts,
};
use new_zealand::nz;
use testing::{ExclusivityProbe, f64_diff_abs, with_watchdog};

const MODELS: [ContextModel; 2] = [ContextModel::Threads, ContextModel::MessagePassing];

/// Every timed operation advances the shared clock by a fixed amount.
#[derive(Debug)]
struct Scripted {
    context: ContextId,
    clock: ManualClock,
    per_operation: Duration,
    probe: ExclusivityProbe,
    operations: Arc<AtomicUsize>,
    fail_on_operation: Option<usize>,
    operations_so_far: usize,
}

impl Scripted {
    fn new(context: ContextId, clock: &ManualClock, per_operation: Duration) -> Self {
        Self {
            context,
            clock: clock.clone(),
            per_operation,
            probe: ExclusivityProbe::new(),
            operations: Arc::new(AtomicUsize::new(0)),
            fail_on_operation: None,
            operations_so_far: 0,
        }
    }
}

impl Workload for Scripted {
    fn transfer_multiplier(&self) -> u32 {
        1
    }

    fn warm_up(&mut self, _device: DeviceId) -> Result<(), DeviceError> {
        let _active = self.probe.enter(self.context.get());
        Ok(())
    }

    fn run_once(&mut self, device: DeviceId, _size: Option<SizeClass>) -> Result<(), DeviceError> {
        let _active = self.probe.enter(self.context.get());

        self.operations_so_far += 1;
        self.operations.fetch_add(1, Ordering::Relaxed);

        if self.fail_on_operation == Some(self.operations_so_far) {
            return Err(DeviceError::new(
                DeviceErrorKind::Launch,
                device,
                "launch kernel",
                "injected failure",
            ));
        }

        // Gives an overlapping context a chance to be observed.
        thread::yield_now();

        self.clock.advance(self.per_operation);
        Ok(())
    }

    fn synchronize(&mut self, _device: DeviceId) -> Result<(), DeviceError> {
        Ok(())
    }
}

fn run_scripted(
    model: ContextModel,
    per_context: &[Duration],
    plan: &Plan,
    probe: &ExclusivityProbe,
) -> Result<Aggregate, RunError> {
    let clock = ManualClock::new();
    let context_count = per_context.len().try_into().unwrap();

    run_contexts(
        model,
        context_count,
        &Topology::current(),
        |context| {
            let mut workload =
                Scripted::new(context, &clock, *per_context.get(context.get()).unwrap());
            workload.probe = probe.clone();
            workload
        },
        &clock,
        plan,
    )
}

#[cfg_attr(miri, ignore)]
#[test]
fn two_context_latency() {
    with_watchdog(|| {
        for model in MODELS {
            let probe = ExclusivityProbe::new();
            let plan = Plan::new(MeasurementMode::Latency, nz!(5), vec![None], nz!(1)).unwrap();

            let aggregate = run_scripted(
                model,
                &[Duration::from_micros(100), Duration::from_micros(50)],
                &plan,
                &probe,
            )
            .unwrap();

            let values = aggregate.values();
            let first = values.get(ContextId::new(0), DeviceId::new(0), 0);
            let second = values.get(ContextId::new(1), DeviceId::new(0), 0);

            assert_eq!(f64_diff_abs(first, 100.0, 1e-6), 0.0, "{model}");
            assert_eq!(f64_diff_abs(second, 50.0, 1e-6), 0.0, "{model}");

            // The minimum is one of the measured values, not a computation on them.
            assert_eq!(aggregate.minimum().get(0).to_bits(), second.to_bits());

            let relative = aggregate.relative();
            let relative_first = relative.get(ContextId::new(0), DeviceId::new(0), 0).unwrap();
            let relative_second = relative.get(ContextId::new(1), DeviceId::new(0), 0).unwrap();

            assert_eq!(f64_diff_abs(relative_first, 2.0, 1e-6), 0.0);
            assert_eq!(f64_diff_abs(relative_second, 1.0, 1e-12), 0.0);

            assert_eq!(probe.max_concurrency(), 1);
            assert_eq!(aggregate.model(), model);
        }
    });
}

#[cfg_attr(miri, ignore)]
#[test]
fn four_context_bandwidth() {
    with_watchdog(|| {
        for model in MODELS {
            let probe = ExclusivityProbe::new();

            // One megabyte per operation at 10, 20, 5 and 40 MB/s.
            let plan = Plan::new(
                MeasurementMode::Bandwidth,
                nz!(2),
                vec![Some(SizeClass::new(1_000_000))],
                nz!(1),
            )
            .unwrap();
            let per_context = [10.0, 20.0, 5.0, 40.0].map(|mbps| Duration::from_secs_f64(1.0 / mbps));

            let aggregate = run_scripted(model, &per_context, &plan, &probe).unwrap();

            let relative = aggregate.relative();

            for (context, (expected_value, expected_relative)) in
                [(10.0, 2.0), (20.0, 4.0), (5.0, 1.0), (40.0, 8.0)]
                    .into_iter()
                    .enumerate()
            {
                let context = ContextId::new(context);
                let value = aggregate.values().get(context, DeviceId::new(0), 0);
                let ratio = relative.get(context, DeviceId::new(0), 0).unwrap();

                assert_eq!(f64_diff_abs(value, expected_value, 1e-6), 0.0, "{model}");
                assert_eq!(f64_diff_abs(ratio, expected_relative, 1e-6), 0.0, "{model}");
                assert!(ratio >= 1.0);
            }

            assert_eq!(f64_diff_abs(aggregate.minimum().get(0), 5.0, 1e-6), 0.0);
            assert_eq!(probe.max_concurrency(), 1);
        }
    });
}

#[cfg_attr(miri, ignore)]
#[test]
fn contexts_take_turns_in_order() {
    with_watchdog(|| {
        let probe = ExclusivityProbe::new();
        let plan = Plan::new(
            MeasurementMode::Bandwidth,
            nz!(2),
            vec![Some(SizeClass::new(1_000)), Some(SizeClass::new(2_000))],
            nz!(2),
        )
        .unwrap();

        run_scripted(
            ContextModel::Threads,
            &[Duration::from_micros(1); 3],
            &plan,
            &probe,
        )
        .unwrap();

        // Warm-up visits every device once per context, then every context measures
        // two size classes on two devices with two repetitions each.
        let expected = [0, 1, 2]
            .into_iter()
            .flat_map(|context| [context; 2])
            .chain([0, 1, 2].into_iter().flat_map(|context| [context; 8]))
            .collect::<Vec<_>>();

        assert_eq!(probe.visits(), expected);
        assert_eq!(probe.max_concurrency(), 1);
    });
}

#[cfg_attr(miri, ignore)]
#[test]
fn failure_in_third_operation_stops_the_run() {
    with_watchdog(|| {
        for model in MODELS {
            let clock = ManualClock::new();
            let operations_by_context = (0..3)
                .map(|_| Arc::new(AtomicUsize::new(0)))
                .collect::<Vec<_>>();
            let plan = Plan::new(MeasurementMode::Latency, nz!(5), vec![None], nz!(1)).unwrap();

            let result = run_contexts(
                model,
                nz!(3),
                &Topology::current(),
                |context| {
                    let mut workload = Scripted::new(context, &clock, Duration::from_micros(10));
                    workload.operations = Arc::clone(operations_by_context.get(context.get()).unwrap());

                    if context.get() == 1 {
                        workload.fail_on_operation = Some(3);
                    }

                    workload
                },
                &clock,
                &plan,
            );

            match result {
                Err(RunError::Device(e)) => {
                    assert_eq!(e.kind(), DeviceErrorKind::Launch, "{model}");
                    assert_eq!(e.operation(), "launch kernel");
                }
                other => panic!("expected the injected device error with {model}, got {other:?}"),
            }

            let counts = operations_by_context
                .iter()
                .map(|count| count.load(Ordering::Relaxed))
                .collect::<Vec<_>>();

            // Context 0 finished its turn, context 1 failed in its third operation and
            // context 2 never got a turn.
            assert_eq!(counts, vec![5, 3, 0], "{model}");
        }
    });
}
