//! The workloads that run against emulated devices.

use crate::{
    AdapterKind, AllocationStrategy, DeviceBuffer, DeviceError, DeviceErrorKind, DeviceId,
    DeviceSet, HostBuffer, SizeClass, Stream, Workload,
};

/// A workload selected at configuration time.
#[derive(Debug)]
#[non_exhaustive]
pub enum Adapter {
    /// See [`CopyKernel`].
    CopyKernel(CopyKernel),

    /// See [`OffloadRegion`].
    OffloadRegion(OffloadRegion),

    /// See [`KernelOnly`].
    KernelOnly(KernelOnly),
}

impl Adapter {
    /// Creates the adapter of the given kind for one context, with a host buffer of
    /// `host_buffer_len` bytes that is allocated and zero-initialized by
    /// [`set_up()`][Workload::set_up].
    #[must_use]
    pub fn new(
        kind: AdapterKind,
        devices: DeviceSet,
        host_buffer_len: usize,
        allocation: AllocationStrategy,
    ) -> Self {
        match kind {
            AdapterKind::CopyKernel => Self::CopyKernel(CopyKernel::new(
                devices,
                HostBuffer::new(host_buffer_len),
                allocation,
            )),
            AdapterKind::OffloadRegion => Self::OffloadRegion(OffloadRegion::new(
                devices,
                HostBuffer::new(host_buffer_len),
            )),
            AdapterKind::KernelOnly => Self::KernelOnly(KernelOnly::new(devices)),
        }
    }

    fn as_workload(&mut self) -> &mut dyn Workload {
        match self {
            Self::CopyKernel(w) => w,
            Self::OffloadRegion(w) => w,
            Self::KernelOnly(w) => w,
        }
    }
}

impl Workload for Adapter {
    fn transfer_multiplier(&self) -> u32 {
        match self {
            Self::CopyKernel(w) => w.transfer_multiplier(),
            Self::OffloadRegion(w) => w.transfer_multiplier(),
            Self::KernelOnly(w) => w.transfer_multiplier(),
        }
    }

    fn set_up(&mut self) {
        self.as_workload().set_up();
    }

    fn warm_up(&mut self, device: DeviceId) -> Result<(), DeviceError> {
        self.as_workload().warm_up(device)
    }

    fn prepare(&mut self, device: DeviceId, size: Option<SizeClass>) -> Result<(), DeviceError> {
        self.as_workload().prepare(device, size)
    }

    fn run_once(&mut self, device: DeviceId, size: Option<SizeClass>) -> Result<(), DeviceError> {
        self.as_workload().run_once(device, size)
    }

    fn synchronize(&mut self, device: DeviceId) -> Result<(), DeviceError> {
        self.as_workload().synchronize(device)
    }

    fn release(&mut self, device: DeviceId) -> Result<(), DeviceError> {
        self.as_workload().release(device)
    }
}

/// Per-device state of one context, indexed by device ordinal.
#[derive(Debug)]
struct PerDevice<T> {
    slots: Vec<Option<T>>,
}

impl<T> PerDevice<T> {
    fn new(devices: &DeviceSet) -> Self {
        Self {
            slots: (0..devices.count().get()).map(|_| None).collect(),
        }
    }

    #[track_caller]
    fn slot(&mut self, device: DeviceId) -> Result<&mut Option<T>, DeviceError> {
        let count = self.slots.len();

        match self.slots.get_mut(device.get()) {
            Some(slot) => Ok(slot),
            None => Err(DeviceError::new(
                DeviceErrorKind::InvalidDevice,
                device,
                "select device",
                format!("only {count} devices exist"),
            )),
        }
    }

    #[track_caller]
    fn get(
        &self,
        device: DeviceId,
        operation: &'static str,
        missing: &'static str,
    ) -> Result<&T, DeviceError> {
        match self.slots.get(device.get()).and_then(Option::as_ref) {
            Some(value) => Ok(value),
            None => Err(DeviceError::new(
                DeviceErrorKind::StreamLost,
                device,
                operation,
                missing,
            )),
        }
    }
}

const NO_STREAM: &str = "no stream exists for this context, the warm-up phase did not run";

fn payload_len(size: Option<SizeClass>) -> usize {
    size.map_or(0, SizeClass::bytes)
}

/// Copies the payload to the device, launches an empty kernel on it and copies it back, all
/// asynchronously on the context's stream for that device.
///
/// The payload crosses the interconnect twice per operation.
#[derive(Debug)]
pub struct CopyKernel {
    devices: DeviceSet,
    host: HostBuffer,
    allocation: AllocationStrategy,
    streams: PerDevice<Stream>,
    buffers: PerDevice<DeviceBuffer>,
}

impl CopyKernel {
    /// Creates the workload for one context.
    #[must_use]
    pub fn new(devices: DeviceSet, host: HostBuffer, allocation: AllocationStrategy) -> Self {
        Self {
            streams: PerDevice::new(&devices),
            buffers: PerDevice::new(&devices),
            devices,
            host,
            allocation,
        }
    }

    fn enqueue_round_trip(
        stream: &Stream,
        host: &HostBuffer,
        buffer: &DeviceBuffer,
        len: usize,
    ) -> Result<(), DeviceError> {
        stream.copy_to_device(host, buffer, len)?;
        stream.launch_kernel(Some(buffer))?;
        stream.copy_to_host(buffer, host, len)
    }
}

impl Workload for CopyKernel {
    fn transfer_multiplier(&self) -> u32 {
        2
    }

    fn set_up(&mut self) {
        self.host.initialize();
    }

    fn warm_up(&mut self, device: DeviceId) -> Result<(), DeviceError> {
        let stream = self.devices.device(device)?.create_stream()?;
        stream.launch_kernel(None)?;
        stream.synchronize()?;

        *self.streams.slot(device)? = Some(stream);
        Ok(())
    }

    fn prepare(&mut self, device: DeviceId, size: Option<SizeClass>) -> Result<(), DeviceError> {
        if self.allocation == AllocationStrategy::Preallocated {
            let buffer = self.devices.device(device)?.allocate(payload_len(size))?;
            *self.buffers.slot(device)? = Some(buffer);
        }

        Ok(())
    }

    fn run_once(&mut self, device: DeviceId, size: Option<SizeClass>) -> Result<(), DeviceError> {
        let len = payload_len(size);
        let stream = self.streams.get(device, "copy round trip", NO_STREAM)?;

        match self.allocation {
            AllocationStrategy::Preallocated => {
                let buffer = self.buffers.get(
                    device,
                    "copy round trip",
                    "no device memory was allocated before the timed region",
                )?;

                Self::enqueue_round_trip(stream, &self.host, buffer, len)
            }
            AllocationStrategy::InsideTimedRegion => {
                let target = self.devices.device(device)?;
                let buffer = target.allocate(len)?;

                Self::enqueue_round_trip(stream, &self.host, &buffer, len)?;

                // The memory may only be freed once the stream no longer uses it.
                stream.synchronize()?;
                target.free(buffer)
            }
        }
    }

    fn synchronize(&mut self, device: DeviceId) -> Result<(), DeviceError> {
        self.streams
            .get(device, "synchronize", NO_STREAM)?
            .synchronize()
    }

    fn release(&mut self, device: DeviceId) -> Result<(), DeviceError> {
        match self.buffers.slot(device)?.take() {
            Some(buffer) => self.devices.device(device)?.free(buffer),
            None => Ok(()),
        }
    }
}

/// Executes a synchronous offload region on the device, mapping the payload to the device and
/// back when there is one.
///
/// The payload crosses the interconnect twice per operation. Device memory for the mapping is
/// always allocated inside the region, whatever the allocation strategy.
#[derive(Debug)]
pub struct OffloadRegion {
    devices: DeviceSet,
    host: HostBuffer,
}

impl OffloadRegion {
    /// Creates the workload for one context.
    #[must_use]
    pub fn new(devices: DeviceSet, host: HostBuffer) -> Self {
        Self { devices, host }
    }
}

impl Workload for OffloadRegion {
    fn transfer_multiplier(&self) -> u32 {
        2
    }

    fn set_up(&mut self) {
        self.host.initialize();
    }

    fn warm_up(&mut self, device: DeviceId) -> Result<(), DeviceError> {
        self.devices.device(device)?.run_region(None)
    }

    fn run_once(&mut self, device: DeviceId, size: Option<SizeClass>) -> Result<(), DeviceError> {
        let mapping = size.map(|size| (&self.host, size.bytes()));
        self.devices.device(device)?.run_region(mapping)
    }

    fn synchronize(&mut self, _device: DeviceId) -> Result<(), DeviceError> {
        // Regions complete before `run_once()` returns.
        Ok(())
    }
}

/// Launches an empty kernel asynchronously on the context's stream for the device.
#[derive(Debug)]
pub struct KernelOnly {
    devices: DeviceSet,
    streams: PerDevice<Stream>,
}

impl KernelOnly {
    /// Creates the workload for one context.
    #[must_use]
    pub fn new(devices: DeviceSet) -> Self {
        Self {
            streams: PerDevice::new(&devices),
            devices,
        }
    }
}

impl Workload for KernelOnly {
    fn transfer_multiplier(&self) -> u32 {
        1
    }

    fn warm_up(&mut self, device: DeviceId) -> Result<(), DeviceError> {
        let stream = self.devices.device(device)?.create_stream()?;
        stream.launch_kernel(None)?;
        stream.synchronize()?;

        *self.streams.slot(device)? = Some(stream);
        Ok(())
    }

    fn run_once(&mut self, device: DeviceId, _size: Option<SizeClass>) -> Result<(), DeviceError> {
        self.streams
            .get(device, "launch kernel", NO_STREAM)?
            .launch_kernel(None)
    }

    fn synchronize(&mut self, device: DeviceId) -> Result<(), DeviceError> {
        self.streams
            .get(device, "synchronize", NO_STREAM)?
            .synchronize()
    }
}
