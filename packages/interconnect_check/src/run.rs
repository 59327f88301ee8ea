use std::num::NonZero;

use exclusive_turns::{
    CommunicationError, Communicator, ContextId, ContextModel, MessageWorld, Phase, ThreadTeam,
    Turnstile,
};
use tracing::{error, info};

use crate::{
    Adapter, Aggregate, Clock, Collector, Config, ConfigError, DeviceError, DeviceId, DeviceSet, LocalSamples,
    MeasurementMode, Placement, RealClock, RunError, SizeClass, Topology, Workload, aggregate,
};

/// What every context measures. All contexts of a run must use the same plan.
#[derive(Clone, Debug, PartialEq)]
pub struct Plan {
    mode: MeasurementMode,
    repetitions: NonZero<u32>,
    sizes: Vec<Option<SizeClass>>,
    device_count: NonZero<usize>,
}

impl Plan {
    /// Creates a plan that takes one sample per size class and device, size classes in the outer
    /// loop. Latency plans use a single `None` size class.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::EmptySizeList`] if `sizes` is empty.
    pub fn new(
        mode: MeasurementMode,
        repetitions: NonZero<u32>,
        sizes: Vec<Option<SizeClass>>,
        device_count: NonZero<usize>,
    ) -> Result<Self, ConfigError> {
        if sizes.is_empty() {
            return Err(ConfigError::EmptySizeList);
        }

        Ok(Self {
            mode,
            repetitions,
            sizes,
            device_count,
        })
    }

    /// The plan described by a configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::EmptySizeList`] if the configuration has no size class.
    pub fn from_config(config: &Config) -> Result<Self, ConfigError> {
        Self::new(
            config.mode(),
            config.repetitions(),
            config.size_classes(),
            config.device_count(),
        )
    }

    /// What is measured.
    #[must_use]
    pub fn mode(&self) -> MeasurementMode {
        self.mode
    }

    /// Timed operations per sample.
    #[must_use]
    pub fn repetitions(&self) -> NonZero<u32> {
        self.repetitions
    }

    /// The size classes, in measurement order.
    #[must_use]
    pub fn sizes(&self) -> &[Option<SizeClass>] {
        &self.sizes
    }

    /// The number of devices each context measures.
    #[must_use]
    pub fn device_count(&self) -> NonZero<usize> {
        self.device_count
    }
}

/// Executes the whole run from the point of view of one context.
///
/// The contexts first agree on the device count, then take turns reporting their placement,
/// warming up every device and measuring every (size class, device) combination. At most one
/// context touches the devices at any time. Finally the samples are combined on the coordinator.
///
/// Returns the aggregate on the coordinator and `None` on every other context.
///
/// # Errors
///
/// Fails with the device error if this context's workload fails, and with a communication error
/// if the contexts disagree on the topology or another context failed.
pub fn run_context<Comm, W, C>(
    comm: &Comm,
    workload: &mut W,
    clock: &C,
    plan: &Plan,
) -> Result<Option<Aggregate>, RunError>
where
    Comm: Communicator,
    W: Workload + ?Sized,
    C: Clock,
{
    workload.set_up();

    agree_on_device_count(comm, plan.device_count)?;

    let me = comm.context();

    if me.is_coordinator() {
        info!(
            model = %comm.model(),
            mode = %plan.mode,
            sizes = plan.sizes.len(),
            contexts = comm.context_count().get(),
            devices = plan.device_count.get(),
            repetitions = plan.repetitions.get(),
            "starting run"
        );
    }

    let mut turnstile = Turnstile::new(comm);

    turnstile.run_phase(Phase::Affinity, |meta| {
        info!(context = %meta.context(), placement = %Placement::current(), "context placement");
        Ok::<(), DeviceError>(())
    })?;

    if me.is_coordinator() {
        info!("warming up");
    }

    turnstile.run_phase(Phase::WarmUp, |_| {
        for device in (0..plan.device_count.get()).map(DeviceId::new) {
            workload.warm_up(device)?;
        }

        Ok::<(), DeviceError>(())
    })?;

    if me.is_coordinator() {
        info!("measuring");
    }

    let collector = Collector::new(clock, plan.mode, plan.repetitions);
    let mut local: Option<LocalSamples> = None;

    turnstile.run_phase(Phase::Measure, |meta| {
        local = Some(collector.measure_all(
            workload,
            meta.context(),
            plan.device_count,
            &plan.sizes,
        )?);

        Ok::<(), DeviceError>(())
    })?;

    turnstile.finish();

    let local = local.expect("the measure phase always runs the turn of every context");

    aggregate(comm, plan.mode, &plan.sizes, &local)
}

/// Every context must see the same number of devices, otherwise the gathered matrices would not
/// line up. The coordinator decides and broadcasts the verdict.
fn agree_on_device_count<Comm>(comm: &Comm, device_count: NonZero<usize>) -> Result<(), RunError>
where
    Comm: Communicator,
{
    let verdict = comm.gather(device_count.get())?.map(|counts| {
        counts
            .iter()
            .enumerate()
            .find(|(_, count)| **count != device_count.get())
            .map(|(context, count)| {
                format!(
                    "context {context} sees {count} devices but the coordinator sees {device_count}"
                )
            })
    });

    match comm.broadcast(verdict)? {
        Some(detail) => Err(CommunicationError::TopologyMismatch {
            what: "device count",
            detail,
        }
        .into()),
        None => Ok(()),
    }
}

/// Hosts `context_count` contexts on pinned threads and runs [`run_context()`] on each of them.
///
/// `workload_factory` is called once per context, before its thread starts. The workload is set up
/// on the context's thread.
///
/// # Errors
///
/// Returns the error that caused the run to fail. When several contexts fail, an error that
/// originated in a context is preferred over the errors its peers observed as a consequence.
pub fn run_contexts<W, F, C>(
    model: ContextModel,
    context_count: NonZero<usize>,
    topology: &Topology,
    workload_factory: F,
    clock: &C,
    plan: &Plan,
) -> Result<Aggregate, RunError>
where
    W: Workload + Send + 'static,
    F: FnMut(ContextId) -> W,
    C: Clock + Clone + 'static,
{
    match model {
        ContextModel::Threads => spawn_all(
            ThreadTeam::new(context_count).into_members(),
            topology,
            workload_factory,
            clock,
            plan,
        ),
        // Every other model is hosted as message-passing ranks.
        _ => spawn_all(
            MessageWorld::new(context_count).into_ranks(),
            topology,
            workload_factory,
            clock,
            plan,
        ),
    }
}

fn spawn_all<Comm, W, F, C>(
    endpoints: Box<[Comm]>,
    topology: &Topology,
    mut workload_factory: F,
    clock: &C,
    plan: &Plan,
) -> Result<Aggregate, RunError>
where
    Comm: Communicator + 'static,
    W: Workload + Send + 'static,
    F: FnMut(ContextId) -> W,
    C: Clock + Clone + 'static,
{
    let threads = endpoints
        .into_iter()
        .map(|comm| {
            let context = comm.context();
            let mut workload = workload_factory(context);
            let clock = clock.clone();
            let plan = plan.clone();

            let handle = topology.spawn_context(context.get(), move || {
                run_context(&comm, &mut workload, &clock, &plan)
            });

            (context, handle)
        })
        .collect::<Vec<_>>();

    let mut aggregate = None;
    let mut failure: Option<RunError> = None;

    for (context, handle) in threads {
        let outcome = match handle.join() {
            Ok(outcome) => outcome,
            Err(_payload) => Err(RunError::ContextPanicked { context }),
        };

        match outcome {
            Ok(Some(result)) => aggregate = Some(result),
            Ok(None) => {}
            Err(e) => {
                let replace = failure
                    .as_ref()
                    .is_none_or(|current| current.is_secondary() && !e.is_secondary());

                if replace {
                    failure = Some(e);
                }
            }
        }
    }

    if let Some(e) = failure {
        error!(error = %e, "run failed");
        return Err(e);
    }

    Ok(aggregate.expect("the coordinator returns the aggregate of a successful run"))
}

/// Runs the configured measurement against freshly started emulated devices.
///
/// # Errors
///
/// Returns the error that caused the run to fail.
#[cfg_attr(test, mutants::skip)] // Covered by the end-to-end tests.
pub fn run(config: &Config, topology: &Topology) -> Result<Aggregate, RunError> {
    let plan = Plan::from_config(config)?;
    let devices = DeviceSet::start(config.device_count(), config.device_memory(), topology);

    let adapter = config.adapter();
    let host_buffer_len = config.largest_size();
    let allocation = config.allocation();

    run_contexts(
        config.model(),
        config.context_count(),
        topology,
        |_| Adapter::new(adapter, devices.clone(), host_buffer_len, allocation),
        &RealClock,
        &plan,
    )
}
