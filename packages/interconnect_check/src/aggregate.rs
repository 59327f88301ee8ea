use std::any::type_name;
use std::fmt;

use exclusive_turns::{CommunicationError, Communicator, ContextId, ContextModel};
use tracing::debug;

use crate::{DeviceId, LocalSamples, MeasurementMode, RunError, Sample, SizeClass};

/// A dense matrix of one number per (context, device, size class).
#[derive(Clone, PartialEq)]
pub struct ResultMatrix {
    context_count: usize,
    device_count: usize,
    size_count: usize,

    // Context-major, then size class, then device.
    values: Vec<f64>,
}

impl ResultMatrix {
    fn from_samples<F>(samples: &[LocalSamples], mut select: F) -> Self
    where
        F: FnMut(&Sample) -> f64,
    {
        let first = samples
            .first()
            .expect("a run always has at least one context");

        let device_count = first.device_count();
        let size_count = first.size_count();

        let values = samples
            .iter()
            .flat_map(|local| {
                (0..size_count).flat_map(move |size_index| {
                    (0..device_count).map(move |device| (local, DeviceId::new(device), size_index))
                })
            })
            .map(|(local, device, size_index)| {
                local
                    .get(device, size_index)
                    .map(&mut select)
                    .expect("completeness was checked before building the matrix")
            })
            .collect();

        Self {
            context_count: samples.len(),
            device_count,
            size_count,
            values,
        }
    }

    /// The number of contexts (first dimension).
    #[must_use]
    pub fn context_count(&self) -> usize {
        self.context_count
    }

    /// The number of devices (second dimension).
    #[must_use]
    pub fn device_count(&self) -> usize {
        self.device_count
    }

    /// The number of size classes (third dimension).
    #[must_use]
    pub fn size_count(&self) -> usize {
        self.size_count
    }

    /// The value for one (context, device, size class) tuple.
    ///
    /// # Panics
    ///
    /// Panics if any coordinate is out of range.
    #[must_use]
    pub fn get(&self, context: ContextId, device: DeviceId, size_index: usize) -> f64 {
        assert!(
            context.get() < self.context_count
                && device.get() < self.device_count
                && size_index < self.size_count,
            "({context}, {device}, {size_index}) is outside a {}x{}x{} matrix",
            self.context_count,
            self.device_count,
            self.size_count
        );

        let index = context
            .get()
            .checked_mul(self.size_count)
            .and_then(|i| i.checked_add(size_index))
            .and_then(|i| i.checked_mul(self.device_count))
            .and_then(|i| i.checked_add(device.get()))
            .expect("coordinates were range-checked above");

        *self
            .values
            .get(index)
            .expect("coordinates were range-checked above")
    }

    /// The smallest value of each size class across all contexts and devices.
    fn minimum_per_size(&self) -> Vec<f64> {
        (0..self.size_count)
            .map(|size_index| {
                (0..self.context_count)
                    .flat_map(|context| {
                        (0..self.device_count).map(move |device| {
                            self.get(ContextId::new(context), DeviceId::new(device), size_index)
                        })
                    })
                    .fold(f64::INFINITY, f64::min)
            })
            .collect()
    }
}

impl fmt::Debug for ResultMatrix {
    #[cfg_attr(test, mutants::skip)] // No API contract to test.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct(type_name::<Self>())
            .field("context_count", &self.context_count)
            .field("device_count", &self.device_count)
            .field("size_count", &self.size_count)
            .finish_non_exhaustive()
    }
}

/// The smallest measured value of each size class across every (context, device) pair.
#[derive(Clone, Debug, PartialEq)]
pub struct MinimumVector(Vec<f64>);

impl MinimumVector {
    /// The minimum of the size class at `size_index`.
    ///
    /// # Panics
    ///
    /// Panics if the size class does not exist.
    #[must_use]
    pub fn get(&self, size_index: usize) -> f64 {
        *self
            .0
            .get(size_index)
            .expect("size class index must be within the minimum vector")
    }

    /// The minima, one per size class.
    #[must_use]
    pub fn as_slice(&self) -> &[f64] {
        &self.0
    }
}

/// Every value of a [`ResultMatrix`] divided by the minimum of its size class.
#[derive(Clone, Copy, Debug)]
pub struct RelativeMatrix<'a> {
    values: &'a ResultMatrix,
    minimum: &'a MinimumVector,
}

impl RelativeMatrix<'_> {
    /// The ratio for one (context, device, size class) tuple.
    ///
    /// Returns `None` if the minimum of the size class is not a positive finite number, in which
    /// case the ratio has no meaning.
    #[must_use]
    pub fn get(&self, context: ContextId, device: DeviceId, size_index: usize) -> Option<f64> {
        let minimum = self.minimum.get(size_index);

        if !minimum.is_finite() || minimum <= 0.0 {
            return None;
        }

        Some(self.values.get(context, device, size_index) / minimum)
    }
}

/// The combined results of every context, available on the coordinator after a run.
#[derive(Clone, Debug)]
pub struct Aggregate {
    model: ContextModel,
    mode: MeasurementMode,
    sizes: Vec<Option<SizeClass>>,
    times: ResultMatrix,
    values: ResultMatrix,
    minimum: MinimumVector,
}

impl Aggregate {
    /// How the contexts that produced the results relate to each other.
    #[must_use]
    pub fn model(&self) -> ContextModel {
        self.model
    }

    /// Whether the values are latencies or bandwidths.
    #[must_use]
    pub fn mode(&self) -> MeasurementMode {
        self.mode
    }

    /// The size classes, in measurement order. Latency runs have one size class without payload.
    #[must_use]
    pub fn sizes(&self) -> &[Option<SizeClass>] {
        &self.sizes
    }

    /// Average seconds per operation.
    #[must_use]
    pub fn times(&self) -> &ResultMatrix {
        &self.times
    }

    /// Microseconds per operation (latency) or megabytes per second (bandwidth).
    #[must_use]
    pub fn values(&self) -> &ResultMatrix {
        &self.values
    }

    /// The minimum value of each size class.
    #[must_use]
    pub fn minimum(&self) -> &MinimumVector {
        &self.minimum
    }

    /// The values relative to the minimum of their size class.
    #[must_use]
    pub fn relative(&self) -> RelativeMatrix<'_> {
        RelativeMatrix {
            values: &self.values,
            minimum: &self.minimum,
        }
    }
}

/// Combines the samples of every context on the coordinator.
///
/// Every context must call this with its own samples. Each context contributes an owned copy of
/// its container. In the message-passing model the minimum is computed by a MIN-reduction of the
/// per-context minima; in the threads model the coordinator scans the gathered matrix.
///
/// Returns the aggregate on the coordinator and `None` on every other context.
///
/// # Errors
///
/// Fails if a collective operation fails or a context contributed samples of a different shape.
pub fn aggregate<C>(
    comm: &C,
    mode: MeasurementMode,
    sizes: &[Option<SizeClass>],
    local: &LocalSamples,
) -> Result<Option<Aggregate>, RunError>
where
    C: Communicator,
{
    let gathered = comm.gather(local.clone())?;

    let reduced = if comm.model() == ContextModel::MessagePassing {
        comm.reduce_min(&local.minimum_per_size())?
    } else {
        None
    };

    let Some(gathered) = gathered else {
        return Ok(None);
    };

    validate(&gathered, local, sizes.len())?;

    let times = ResultMatrix::from_samples(&gathered, Sample::elapsed_secs);
    let values = ResultMatrix::from_samples(&gathered, Sample::value);

    let minimum = reduced.unwrap_or_else(|| values.minimum_per_size());

    debug!(
        model = %comm.model(),
        contexts = gathered.len(),
        ?minimum,
        "aggregated samples"
    );

    Ok(Some(Aggregate {
        model: comm.model(),
        mode,
        sizes: sizes.to_vec(),
        times,
        values,
        minimum: MinimumVector(minimum),
    }))
}

fn validate(
    gathered: &[LocalSamples],
    coordinator: &LocalSamples,
    size_count: usize,
) -> Result<(), CommunicationError> {
    let expected_slots = coordinator
        .device_count()
        .checked_mul(size_count)
        .expect("device and size counts are small enough to multiply");

    for (ordinal, samples) in gathered.iter().enumerate() {
        let context = ContextId::new(ordinal);

        if samples.context() != context {
            return Err(CommunicationError::ProtocolViolation {
                context: ContextId::COORDINATOR,
                expected: "samples ordered by context",
            });
        }

        let actual_slots = samples
            .device_count()
            .checked_mul(samples.size_count())
            .expect("device and size counts are small enough to multiply");

        if samples.device_count() != coordinator.device_count()
            || samples.size_count() != size_count
        {
            return Err(CommunicationError::ShapeMismatch {
                context,
                expected: expected_slots,
                actual: actual_slots,
            });
        }

        if !samples.is_complete() {
            return Err(CommunicationError::ProtocolViolation {
                context: ContextId::COORDINATOR,
                expected: "a sample for every device and size class",
            });
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    #![allow(clippy::float_cmp, reason = "minimum is an exact selection, not arithmetic")]

    use std::num::NonZero;
    use std::thread;

    use exclusive_turns::{MessageWorld, ThreadTeam};
    use new_zealand::nz;
    use testing::{f64_diff_abs, with_watchdog};

    use super::*;

    fn single_value(context: usize, value: f64) -> LocalSamples {
        let mut samples = LocalSamples::new(ContextId::new(context), nz!(1), nz!(1));
        samples.record(DeviceId::new(0), 0, Sample::new(1.0 / value, value));
        samples
    }

    fn aggregate_everywhere<C>(endpoints: Box<[C]>, values: &[f64]) -> Aggregate
    where
        C: Communicator + 'static,
    {
        let sizes = vec![Some(SizeClass::new(1_000_000))];
        let values = values.to_vec();

        let threads = endpoints
            .into_iter()
            .map(|comm| {
                let sizes = sizes.clone();
                let value = *values
                    .get(comm.context().get())
                    .expect("one value per context");

                thread::spawn(move || {
                    let local = single_value(comm.context().get(), value);
                    aggregate(&comm, MeasurementMode::Bandwidth, &sizes, &local).unwrap()
                })
            })
            .collect::<Vec<_>>();

        let mut results = threads
            .into_iter()
            .map(|thread| thread.join().unwrap())
            .collect::<Vec<_>>();

        assert!(results.iter().skip(1).all(Option::is_none));
        results.swap_remove(0).unwrap()
    }

    fn context_count(values: &[f64]) -> NonZero<usize> {
        NonZero::new(values.len()).unwrap()
    }

    #[test]
    fn four_context_bandwidth_relative_to_minimum() {
        with_watchdog(|| {
            let values = [10.0, 20.0, 5.0, 40.0];

            for aggregate in [
                aggregate_everywhere(ThreadTeam::new(context_count(&values)).into_members(), &values),
                aggregate_everywhere(MessageWorld::new(context_count(&values)).into_ranks(), &values),
            ] {
                assert_eq!(aggregate.minimum().as_slice(), &[5.0]);

                let relative = aggregate.relative();
                let ratios = (0..4)
                    .map(|c| relative.get(ContextId::new(c), DeviceId::new(0), 0).unwrap())
                    .collect::<Vec<_>>();

                for (ratio, expected) in ratios.iter().zip([2.0, 4.0, 1.0, 8.0]) {
                    assert_eq!(f64_diff_abs(*ratio, expected, 1e-12), 0.0);
                }
            }
        });
    }

    #[test]
    fn minimum_is_exact_selection_of_matrix() {
        with_watchdog(|| {
            let values = [3.25, 1.125, 7.5];

            let aggregate =
                aggregate_everywhere(MessageWorld::new(context_count(&values)).into_ranks(), &values);

            assert_eq!(aggregate.minimum().get(0), 1.125);
            assert_eq!(
                aggregate.values().get(ContextId::new(1), DeviceId::new(0), 0),
                aggregate.minimum().get(0)
            );
            assert_eq!(aggregate.model(), ContextModel::MessagePassing);
        });
    }

    #[test]
    fn relative_is_undefined_for_degenerate_minimum() {
        with_watchdog(|| {
            let values = [f64::INFINITY, f64::INFINITY];

            let aggregate =
                aggregate_everywhere(ThreadTeam::new(context_count(&values)).into_members(), &values);

            assert!(aggregate.minimum().get(0).is_infinite());
            assert_eq!(
                aggregate.relative().get(ContextId::new(0), DeviceId::new(0), 0),
                None
            );
        });
    }

    #[test]
    fn matrix_layout() {
        let mut first = LocalSamples::new(ContextId::new(0), nz!(2), nz!(2));
        let mut second = LocalSamples::new(ContextId::new(1), nz!(2), nz!(2));

        for (samples, base) in [(&mut first, 0.0), (&mut second, 100.0)] {
            for device in 0..2 {
                for size_index in 0..2 {
                    #[expect(clippy::cast_precision_loss, reason = "tiny test numbers")]
                    let value = base + (device * 10 + size_index) as f64;
                    samples.record(DeviceId::new(device), size_index, Sample::new(0.0, value));
                }
            }
        }

        let matrix = ResultMatrix::from_samples(&[first, second], Sample::value);

        assert_eq!(matrix.context_count(), 2);
        assert_eq!(matrix.device_count(), 2);
        assert_eq!(matrix.size_count(), 2);
        assert_eq!(matrix.get(ContextId::new(1), DeviceId::new(1), 0), 110.0);
        assert_eq!(matrix.get(ContextId::new(0), DeviceId::new(0), 1), 1.0);
        assert_eq!(matrix.minimum_per_size(), vec![0.0, 1.0]);
    }

    #[test]
    fn validate_rejects_incomplete_samples() {
        let complete = single_value(0, 1.0);
        let incomplete = LocalSamples::new(ContextId::new(1), nz!(1), nz!(1));

        let result = validate(&[complete.clone(), incomplete], &complete, 1);

        assert!(matches!(
            result,
            Err(CommunicationError::ProtocolViolation { .. })
        ));
    }

    #[test]
    fn validate_rejects_shape_mismatch() {
        let complete = single_value(0, 1.0);
        let wider = LocalSamples::new(ContextId::new(1), nz!(2), nz!(1));

        let result = validate(&[complete.clone(), wider], &complete, 1);

        assert_eq!(
            result,
            Err(CommunicationError::ShapeMismatch {
                context: ContextId::new(1),
                expected: 1,
                actual: 2,
            })
        );
    }
}
