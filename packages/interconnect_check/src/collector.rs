use std::num::NonZero;
use std::time::Duration;

use exclusive_turns::ContextId;
use tracing::info;

use crate::{Clock, DeviceError, DeviceId, MeasurementMode, SizeClass, Workload};

/// The outcome of timing one (context, device, size class) combination.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Sample {
    elapsed_secs: f64,
    value: f64,
}

impl Sample {
    /// Derives a sample from the total time `elapsed` spent on `repetitions` operations.
    ///
    /// In latency mode the value is the average time per operation in microseconds. In bandwidth
    /// mode it is `size * transfer_multiplier / average` in megabytes per second, or positive
    /// infinity if either the payload or the average time is zero, since such a measurement is
    /// dominated by latency and has no meaningful bandwidth.
    #[must_use]
    pub fn from_elapsed(
        mode: MeasurementMode,
        elapsed: Duration,
        repetitions: NonZero<u32>,
        size: Option<SizeClass>,
        transfer_multiplier: u32,
    ) -> Self {
        let elapsed_secs = elapsed.as_secs_f64() / f64::from(repetitions.get());

        let value = match mode {
            MeasurementMode::Latency => elapsed_secs * 1e6,
            MeasurementMode::Bandwidth => {
                let megabytes = size.map_or(0.0, SizeClass::megabytes);

                if megabytes <= 0.0 || elapsed_secs <= 0.0 {
                    f64::INFINITY
                } else {
                    megabytes * f64::from(transfer_multiplier) / elapsed_secs
                }
            }
        };

        Self {
            elapsed_secs,
            value,
        }
    }

    /// Creates a sample from already derived numbers.
    #[must_use]
    pub fn new(elapsed_secs: f64, value: f64) -> Self {
        Self {
            elapsed_secs,
            value,
        }
    }

    /// Average seconds per operation.
    #[must_use]
    pub fn elapsed_secs(&self) -> f64 {
        self.elapsed_secs
    }

    /// Microseconds per operation (latency) or megabytes per second (bandwidth).
    #[must_use]
    pub fn value(&self) -> f64 {
        self.value
    }
}

/// The samples one context produced, indexed by device and size class.
///
/// Every slot is written exactly once, during the owning context's measurement turn.
#[derive(Clone, Debug, PartialEq)]
pub struct LocalSamples {
    context: ContextId,
    device_count: usize,
    size_count: usize,

    // Size-major: all devices of the first size class, then all devices of the next.
    samples: Vec<Option<Sample>>,
}

impl LocalSamples {
    /// Creates an empty container for `device_count` devices and `size_count` size classes.
    #[must_use]
    pub fn new(context: ContextId, device_count: NonZero<usize>, size_count: NonZero<usize>) -> Self {
        let slots = device_count
            .checked_mul(size_count)
            .expect("device and size counts are small enough to multiply");

        Self {
            context,
            device_count: device_count.get(),
            size_count: size_count.get(),
            samples: vec![None; slots.get()],
        }
    }

    /// The context that produced the samples.
    #[must_use]
    pub fn context(&self) -> ContextId {
        self.context
    }

    /// The number of devices the container has room for.
    #[must_use]
    pub fn device_count(&self) -> usize {
        self.device_count
    }

    /// The number of size classes the container has room for.
    #[must_use]
    pub fn size_count(&self) -> usize {
        self.size_count
    }

    /// Stores the sample for `device` and the size class at `size_index`.
    ///
    /// # Panics
    ///
    /// Panics if the slot does not exist or already holds a sample.
    pub fn record(&mut self, device: DeviceId, size_index: usize, sample: Sample) {
        let index = self
            .index(device, size_index)
            .expect("sample coordinates must be within the container");

        let slot = self
            .samples
            .get_mut(index)
            .expect("index was computed within bounds");

        assert!(
            slot.is_none(),
            "a sample for device {device} and size class {size_index} was already recorded"
        );

        *slot = Some(sample);
    }

    /// The sample for `device` and the size class at `size_index`, if recorded.
    #[must_use]
    pub fn get(&self, device: DeviceId, size_index: usize) -> Option<&Sample> {
        self.index(device, size_index)
            .and_then(|index| self.samples.get(index))
            .and_then(Option::as_ref)
    }

    /// Whether every slot holds a sample.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.samples.iter().all(Option::is_some)
    }

    /// The smallest value of each size class across all devices, or positive infinity for a
    /// size class without samples.
    #[must_use]
    pub fn minimum_per_size(&self) -> Vec<f64> {
        (0..self.size_count)
            .map(|size_index| {
                (0..self.device_count)
                    .filter_map(|device| self.get(DeviceId::new(device), size_index))
                    .map(Sample::value)
                    .fold(f64::INFINITY, f64::min)
            })
            .collect()
    }

    fn index(&self, device: DeviceId, size_index: usize) -> Option<usize> {
        if device.get() >= self.device_count || size_index >= self.size_count {
            return None;
        }

        size_index
            .checked_mul(self.device_count)
            .and_then(|base| base.checked_add(device.get()))
    }
}

/// Times repeated operations of a workload.
#[derive(Debug)]
pub struct Collector<'a, C>
where
    C: Clock,
{
    clock: &'a C,
    mode: MeasurementMode,
    repetitions: NonZero<u32>,
}

impl<'a, C> Collector<'a, C>
where
    C: Clock,
{
    /// Creates a collector that times `repetitions` operations per sample.
    #[must_use]
    pub fn new(clock: &'a C, mode: MeasurementMode, repetitions: NonZero<u32>) -> Self {
        Self {
            clock,
            mode,
            repetitions,
        }
    }

    /// Takes one sample of `workload` on `device`.
    ///
    /// Preparation and release happen outside the timed region. The device is synchronized once,
    /// after the last operation and before the end timestamp.
    ///
    /// # Errors
    ///
    /// Returns the first error reported by the workload.
    pub fn measure<W>(
        &self,
        workload: &mut W,
        device: DeviceId,
        size: Option<SizeClass>,
    ) -> Result<Sample, DeviceError>
    where
        W: Workload + ?Sized,
    {
        workload.prepare(device, size)?;

        let start = self.clock.now();

        for _ in 0..self.repetitions.get() {
            workload.run_once(device, size)?;
        }

        workload.synchronize(device)?;

        let end = self.clock.now();

        workload.release(device)?;

        Ok(Sample::from_elapsed(
            self.mode,
            end.saturating_duration_since(start),
            self.repetitions,
            size,
            workload.transfer_multiplier(),
        ))
    }

    /// Takes one sample per (size class, device) combination, size classes in the outer loop,
    /// logging each sample as it is produced.
    ///
    /// # Errors
    ///
    /// Returns the first error reported by the workload. Samples taken before the error are
    /// discarded.
    pub fn measure_all<W>(
        &self,
        workload: &mut W,
        context: ContextId,
        device_count: NonZero<usize>,
        sizes: &[Option<SizeClass>],
    ) -> Result<LocalSamples, DeviceError>
    where
        W: Workload + ?Sized,
    {
        let size_count =
            NonZero::new(sizes.len()).expect("a measurement plan always has a size class");
        let mut samples = LocalSamples::new(context, device_count, size_count);

        for (size_index, size) in sizes.iter().enumerate() {
            for device in (0..device_count.get()).map(DeviceId::new) {
                let sample = self.measure(workload, device, *size)?;

                info!(
                    %context,
                    size_mb = size.map(SizeClass::megabytes),
                    %device,
                    value = sample.value(),
                    unit = self.mode.unit(),
                    "sample"
                );

                samples.record(device, size_index, sample);
            }
        }

        Ok(samples)
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::float_cmp, reason = "we use absolute error, which is the right thing to do")]

    use std::time::Instant;

    use mockall::Sequence;
    use mockall::predicate::eq;
    use new_zealand::nz;
    use testing::f64_diff_abs;

    use super::*;
    use crate::{DeviceErrorKind, ManualClock, MockClock, MockWorkload};

    const TOLERANCE: f64 = 1e-9;

    fn fixed_latency_workload(clock: &ManualClock, latency: Duration) -> MockWorkload {
        let mut workload = MockWorkload::new();
        let clock = clock.clone();

        workload.expect_prepare().returning(|_, _| Ok(()));
        workload.expect_run_once().returning(move |_, _| {
            clock.advance(latency);
            Ok(())
        });
        workload.expect_synchronize().returning(|_| Ok(()));
        workload.expect_release().returning(|_| Ok(()));
        workload.expect_transfer_multiplier().return_const(2_u32);

        workload
    }

    #[test]
    fn average_is_independent_of_repetitions() {
        for repetitions in [nz!(1), nz!(5), nz!(1000)] {
            let clock = ManualClock::new();
            let mut workload = fixed_latency_workload(&clock, Duration::from_micros(100));

            let collector = Collector::new(&clock, MeasurementMode::Latency, repetitions);
            let sample = collector
                .measure(&mut workload, DeviceId::new(0), None)
                .unwrap();

            assert_eq!(f64_diff_abs(sample.value(), 100.0, TOLERANCE), 0.0);
            assert_eq!(f64_diff_abs(sample.elapsed_secs(), 100e-6, TOLERANCE), 0.0);
        }
    }

    #[test]
    fn bandwidth_counts_round_trips() {
        let clock = ManualClock::new();
        let mut workload = fixed_latency_workload(&clock, Duration::from_millis(10));

        let collector = Collector::new(&clock, MeasurementMode::Bandwidth, nz!(10));
        let sample = collector
            .measure(&mut workload, DeviceId::new(0), Some(SizeClass::new(10_000_000)))
            .unwrap();

        // 10 MB there and back in 10 ms.
        assert_eq!(f64_diff_abs(sample.value(), 2000.0, TOLERANCE), 0.0);
    }

    #[test]
    fn call_order_brackets_the_timed_region() {
        let mut sequence = Sequence::new();
        let mut workload = MockWorkload::new();
        let mut clock = MockClock::new();
        let origin = Instant::now();

        let mut readings = 0_u64;
        clock.expect_now().times(2).returning(move || {
            readings += 1;
            if readings == 1 {
                origin
            } else {
                origin + Duration::from_secs(3)
            }
        });

        workload
            .expect_prepare()
            .with(eq(DeviceId::new(1)), eq(Some(SizeClass::new(64))))
            .times(1)
            .in_sequence(&mut sequence)
            .returning(|_, _| Ok(()));
        workload
            .expect_run_once()
            .times(3)
            .in_sequence(&mut sequence)
            .returning(|_, _| Ok(()));
        workload
            .expect_synchronize()
            .times(1)
            .in_sequence(&mut sequence)
            .returning(|_| Ok(()));
        workload
            .expect_release()
            .times(1)
            .in_sequence(&mut sequence)
            .returning(|_| Ok(()));
        workload.expect_transfer_multiplier().return_const(1_u32);

        let collector = Collector::new(&clock, MeasurementMode::Bandwidth, nz!(3));
        let sample = collector
            .measure(&mut workload, DeviceId::new(1), Some(SizeClass::new(64)))
            .unwrap();

        assert_eq!(f64_diff_abs(sample.elapsed_secs(), 1.0, TOLERANCE), 0.0);
    }

    #[test]
    fn zero_payload_is_unbounded_bandwidth() {
        let sample = Sample::from_elapsed(
            MeasurementMode::Bandwidth,
            Duration::from_millis(5),
            nz!(5),
            Some(SizeClass::new(0)),
            2,
        );

        assert!(sample.value().is_infinite() && sample.value() > 0.0);
    }

    #[test]
    fn zero_time_is_unbounded_bandwidth() {
        let sample = Sample::from_elapsed(
            MeasurementMode::Bandwidth,
            Duration::ZERO,
            nz!(5),
            Some(SizeClass::new(1_000)),
            2,
        );

        assert!(sample.value().is_infinite() && sample.value() > 0.0);
        assert_eq!(sample.elapsed_secs(), 0.0);
    }

    #[test]
    fn failure_stops_the_sample() {
        let clock = ManualClock::new();
        let mut workload = MockWorkload::new();
        let mut calls = 0;

        workload.expect_prepare().returning(|_, _| Ok(()));
        workload.expect_run_once().times(3).returning(move |device, _| {
            calls += 1;
            if calls == 3 {
                Err(DeviceError::new(
                    DeviceErrorKind::Launch,
                    device,
                    "launch kernel",
                    "injected",
                ))
            } else {
                Ok(())
            }
        });
        workload.expect_synchronize().never();
        workload.expect_release().never();

        let collector = Collector::new(&clock, MeasurementMode::Latency, nz!(10));
        let error = collector
            .measure(&mut workload, DeviceId::new(0), None)
            .unwrap_err();

        assert_eq!(error.kind(), DeviceErrorKind::Launch);
    }

    #[test]
    fn measure_all_fills_every_slot() {
        let clock = ManualClock::new();
        let mut workload = fixed_latency_workload(&clock, Duration::from_micros(10));
        let sizes = [Some(SizeClass::new(1_000)), Some(SizeClass::new(2_000))];

        let collector = Collector::new(&clock, MeasurementMode::Bandwidth, nz!(2));
        let samples = collector
            .measure_all(&mut workload, ContextId::new(3), nz!(3), &sizes)
            .unwrap();

        assert!(samples.is_complete());
        assert_eq!(samples.context(), ContextId::new(3));
        assert_eq!(samples.device_count(), 3);
        assert_eq!(samples.size_count(), 2);

        // The larger payload moves twice the data in the same time.
        let small = samples.get(DeviceId::new(2), 0).unwrap().value();
        let large = samples.get(DeviceId::new(2), 1).unwrap().value();
        assert_eq!(f64_diff_abs(large, small * 2.0, 1e-6), 0.0);
    }

    #[test]
    fn local_samples_minimum_per_size() {
        let mut samples = LocalSamples::new(ContextId::new(0), nz!(2), nz!(2));

        samples.record(DeviceId::new(0), 0, Sample::new(1.0, 30.0));
        samples.record(DeviceId::new(1), 0, Sample::new(1.0, 10.0));
        samples.record(DeviceId::new(0), 1, Sample::new(1.0, 5.0));

        assert!(!samples.is_complete());
        assert_eq!(samples.minimum_per_size(), vec![10.0, 5.0]);
        assert_eq!(samples.get(DeviceId::new(1), 1), None);
        assert_eq!(samples.get(DeviceId::new(2), 0), None);
    }

    #[test]
    #[should_panic]
    fn local_samples_reject_second_write() {
        let mut samples = LocalSamples::new(ContextId::new(0), nz!(1), nz!(1));

        samples.record(DeviceId::new(0), 0, Sample::new(1.0, 1.0));
        samples.record(DeviceId::new(0), 0, Sample::new(1.0, 2.0));
    }
}
