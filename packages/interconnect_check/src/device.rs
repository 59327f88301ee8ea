//! Emulated accelerator devices.
//!
//! Every device is an executor thread that owns the device memory and executes commands in the
//! order they were submitted. Stream operations are asynchronous: submitting one only enqueues
//! it, and failures are recorded on the stream and reported by the next synchronization. Memory
//! management and offload regions are synchronous.

use std::any::type_name;
use std::fmt;
use std::hint::black_box;
use std::num::NonZero;
use std::sync::Arc;
use std::sync::mpsc::{self, Receiver, Sender};
use std::thread::JoinHandle;

use derive_more::Display;
use foldhash::HashMap;
use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use crate::{DeviceError, DeviceErrorKind, Topology};

/// Identifies one device, an ordinal in `[0, device_count)`.
#[derive(Clone, Copy, Debug, Display, Eq, Hash, Ord, PartialEq, PartialOrd)]
#[display("{_0}")]
pub struct DeviceId(usize);

impl DeviceId {
    /// Creates a device identifier from its ordinal.
    #[must_use]
    pub const fn new(ordinal: usize) -> Self {
        Self(ordinal)
    }

    /// The ordinal of the device.
    #[must_use]
    pub const fn get(self) -> usize {
        self.0
    }
}

/// Host memory that device operations copy from and to.
///
/// Cloning shares the same memory. Every context owns one buffer sized for the largest payload.
/// A buffer created with [`new()`][Self::new] has no memory until it is
/// [initialized][Self::initialize], so that the memory can be first touched by the thread that
/// uses it.
#[derive(Clone)]
pub struct HostBuffer {
    len: usize,
    bytes: Arc<Mutex<Vec<u8>>>,
}

impl HostBuffer {
    /// Creates a buffer of `len` bytes without allocating its memory yet.
    #[must_use]
    pub fn new(len: usize) -> Self {
        Self {
            len,
            bytes: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Allocates `len` bytes and zero-initializes them on the calling thread.
    #[must_use]
    pub fn zeroed(len: usize) -> Self {
        let buffer = Self::new(len);
        buffer.initialize();
        buffer
    }

    /// Allocates the memory of the buffer and writes every byte, so that no page of it is
    /// faulted in later by a timed operation. Does nothing if the buffer is already initialized.
    pub fn initialize(&self) {
        let mut bytes = self.bytes.lock();

        if bytes.len() == self.len {
            return;
        }

        // Unlike `vec![0; len]`, which may map lazily zeroed pages, this writes every byte.
        let mut memory = Vec::with_capacity(self.len);
        memory.resize(self.len, 0);
        *bytes = memory;
    }

    /// Whether the memory of the buffer has been allocated and written.
    #[must_use]
    pub fn is_initialized(&self) -> bool {
        self.bytes.lock().len() == self.len
    }

    /// The size of the buffer in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the buffer has no bytes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Overwrites the start of the buffer with `data`.
    ///
    /// # Panics
    ///
    /// Panics if `data` is longer than the initialized buffer.
    pub fn fill_from(&self, data: &[u8]) {
        self.bytes
            .lock()
            .get_mut(..data.len())
            .expect("data must fit into the initialized host buffer")
            .copy_from_slice(data);
    }

    /// Copies out the first `len` bytes of the buffer.
    ///
    /// # Panics
    ///
    /// Panics if `len` is larger than the initialized buffer.
    #[must_use]
    pub fn snapshot(&self, len: usize) -> Vec<u8> {
        self.bytes
            .lock()
            .get(..len)
            .expect("snapshot must not exceed the initialized host buffer")
            .to_vec()
    }
}

impl fmt::Debug for HostBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct(type_name::<Self>())
            .field("len", &self.len)
            .field("initialized", &self.is_initialized())
            .finish()
    }
}

/// A set of running emulated devices, shared by all contexts.
///
/// The executor threads stop when the last clone of the set is dropped.
#[derive(Clone, Debug)]
pub struct DeviceSet {
    inner: Arc<DeviceSetInner>,
}

#[derive(Debug)]
struct DeviceSetInner {
    devices: Box<[Device]>,
    executors: Mutex<Vec<JoinHandle<()>>>,
}

impl DeviceSet {
    /// Starts `count` devices with `capacity_bytes` of memory each, their executor threads
    /// spread over the memory regions of `topology`.
    #[must_use]
    pub fn start(count: NonZero<usize>, capacity_bytes: usize, topology: &Topology) -> Self {
        let (devices, executors): (Vec<_>, Vec<_>) = (0..count.get())
            .map(|ordinal| {
                let id = DeviceId::new(ordinal);
                let (commands_tx, commands_rx) = mpsc::channel();

                let executor = Executor::new(id, capacity_bytes);
                let handle = topology.spawn_device(ordinal, move || executor.run(&commands_rx));

                (
                    Device {
                        id,
                        commands: commands_tx,
                    },
                    handle,
                )
            })
            .unzip();

        debug!(count = count.get(), capacity_bytes, "devices started");

        Self {
            inner: Arc::new(DeviceSetInner {
                devices: devices.into_boxed_slice(),
                executors: Mutex::new(executors),
            }),
        }
    }

    /// The number of devices in the set.
    #[must_use]
    pub fn count(&self) -> NonZero<usize> {
        NonZero::new(self.inner.devices.len()).expect("a device set is created from a non-zero count")
    }

    /// Returns the device with the given identifier.
    ///
    /// # Errors
    ///
    /// Returns [`DeviceErrorKind::InvalidDevice`] if the set has no such device.
    #[track_caller]
    pub fn device(&self, id: DeviceId) -> Result<&Device, DeviceError> {
        match self.inner.devices.get(id.get()) {
            Some(device) => Ok(device),
            None => Err(DeviceError::new(
                DeviceErrorKind::InvalidDevice,
                id,
                "select device",
                format!("only {} devices exist", self.inner.devices.len()),
            )),
        }
    }
}

impl Drop for DeviceSetInner {
    #[cfg_attr(test, mutants::skip)] // Shutdown has no observable effect besides not leaking threads.
    fn drop(&mut self) {
        for device in &self.devices {
            // An executor that already stopped has nothing to shut down.
            drop(device.commands.send(Command::Shutdown));
        }

        for executor in self.executors.get_mut().drain(..) {
            if executor.join().is_err() {
                warn!("device executor thread panicked");
            }
        }
    }
}

/// One emulated device.
#[derive(Debug)]
pub struct Device {
    id: DeviceId,
    commands: Sender<Command>,
}

impl Device {
    /// The identifier of this device.
    #[must_use]
    pub fn id(&self) -> DeviceId {
        self.id
    }

    /// Creates an execution stream whose operations run in submission order.
    ///
    /// # Errors
    ///
    /// Fails if the device is no longer running.
    #[track_caller]
    pub fn create_stream(&self) -> Result<Stream, DeviceError> {
        let id = self.request("create stream", |reply| Command::CreateStream { reply })?;

        Ok(Stream {
            device: self.id,
            id,
            commands: self.commands.clone(),
        })
    }

    /// Allocates `len` bytes of device memory. Its contents are unspecified.
    ///
    /// # Errors
    ///
    /// Returns [`DeviceErrorKind::Allocation`] if the device does not have `len` bytes free.
    #[track_caller]
    pub fn allocate(&self, len: usize) -> Result<DeviceBuffer, DeviceError> {
        let result = self.request("allocate", |reply| Command::Allocate { len, reply })?;

        match result {
            Ok(id) => Ok(DeviceBuffer {
                device: self.id,
                id,
                len,
            }),
            Err(failure) => Err(failure.into_error(self.id, "allocate")),
        }
    }

    /// Returns device memory to the device.
    ///
    /// # Errors
    ///
    /// Fails if the buffer belongs to another device or the device is no longer running.
    #[track_caller]
    pub fn free(&self, buffer: DeviceBuffer) -> Result<(), DeviceError> {
        if buffer.device != self.id {
            return Err(foreign_buffer(self.id, "free", &buffer));
        }

        let result = self.request("free", |reply| Command::Free {
            buffer: buffer.id,
            reply,
        })?;

        match result {
            Ok(()) => Ok(()),
            Err(failure) => Err(failure.into_error(self.id, "free")),
        }
    }

    /// Executes an offload region synchronously.
    ///
    /// With a mapping, the first `len` bytes of the host buffer are copied into temporary device
    /// memory before the region and back to the host after it.
    ///
    /// # Errors
    ///
    /// Fails if the mapping cannot be allocated or does not fit into the host buffer.
    #[track_caller]
    pub fn run_region(&self, mapping: Option<(&HostBuffer, usize)>) -> Result<(), DeviceError> {
        let mapping = mapping.map(|(host, len)| (host.clone(), len));

        let result = self.request("offload region", |reply| Command::Region { mapping, reply })?;

        match result {
            Ok(()) => Ok(()),
            Err(failure) => Err(failure.into_error(self.id, "offload region")),
        }
    }

    /// How many bytes of device memory are currently allocated.
    ///
    /// # Errors
    ///
    /// Fails if the device is no longer running.
    #[track_caller]
    pub fn memory_in_use(&self) -> Result<usize, DeviceError> {
        self.request("query memory", |reply| Command::MemoryInUse { reply })
    }

    #[track_caller]
    fn request<T>(
        &self,
        operation: &'static str,
        command: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, DeviceError> {
        let (reply_tx, reply_rx) = oneshot::channel();

        if self.commands.send(command(reply_tx)).is_err() {
            return Err(executor_gone(self.id, operation));
        }

        match reply_rx.recv() {
            Ok(value) => Ok(value),
            Err(_disconnected) => Err(executor_gone(self.id, operation)),
        }
    }
}

/// A FIFO queue of asynchronous device operations.
///
/// Operations report failures only when the stream is synchronized. After the first failure,
/// the stream skips every later operation and every synchronization reports that failure.
#[derive(Debug)]
pub struct Stream {
    device: DeviceId,
    id: u64,
    commands: Sender<Command>,
}

impl Stream {
    /// Enqueues a copy of the first `len` bytes of `host` into `buffer`.
    ///
    /// # Errors
    ///
    /// Fails immediately if the buffer belongs to another device or the device is no longer
    /// running. Failures of the copy itself are reported by [`synchronize()`][Self::synchronize].
    #[track_caller]
    pub fn copy_to_device(
        &self,
        host: &HostBuffer,
        buffer: &DeviceBuffer,
        len: usize,
    ) -> Result<(), DeviceError> {
        self.check_owner("copy to device", buffer)?;

        self.enqueue(
            "copy to device",
            StreamOperation::CopyToDevice {
                host: host.clone(),
                buffer: buffer.id,
                len,
            },
        )
    }

    /// Enqueues a copy of the first `len` bytes of `buffer` into `host`.
    ///
    /// # Errors
    ///
    /// Fails immediately if the buffer belongs to another device or the device is no longer
    /// running. Failures of the copy itself are reported by [`synchronize()`][Self::synchronize].
    #[track_caller]
    pub fn copy_to_host(
        &self,
        buffer: &DeviceBuffer,
        host: &HostBuffer,
        len: usize,
    ) -> Result<(), DeviceError> {
        self.check_owner("copy to host", buffer)?;

        self.enqueue(
            "copy to host",
            StreamOperation::CopyToHost {
                buffer: buffer.id,
                host: host.clone(),
                len,
            },
        )
    }

    /// Enqueues an empty kernel, optionally taking a device buffer as argument.
    ///
    /// # Errors
    ///
    /// Fails immediately if the buffer belongs to another device or the device is no longer
    /// running. A kernel whose buffer was freed fails at [`synchronize()`][Self::synchronize].
    #[track_caller]
    pub fn launch_kernel(&self, buffer: Option<&DeviceBuffer>) -> Result<(), DeviceError> {
        if let Some(buffer) = buffer {
            self.check_owner("launch kernel", buffer)?;
        }

        self.enqueue(
            "launch kernel",
            StreamOperation::Kernel {
                buffer: buffer.map(|b| b.id),
            },
        )
    }

    /// Blocks until every operation enqueued so far has completed.
    ///
    /// # Errors
    ///
    /// Returns the first failure of any operation on this stream.
    #[track_caller]
    pub fn synchronize(&self) -> Result<(), DeviceError> {
        let (reply_tx, reply_rx) = oneshot::channel();

        let command = Command::Synchronize {
            stream: self.id,
            reply: reply_tx,
        };

        if self.commands.send(command).is_err() {
            return Err(executor_gone(self.device, "synchronize"));
        }

        match reply_rx.recv() {
            Ok(Ok(())) => Ok(()),
            Ok(Err(failure)) => Err(failure.into_error(self.device, "synchronize")),
            Err(_disconnected) => Err(executor_gone(self.device, "synchronize")),
        }
    }

    #[track_caller]
    fn check_owner(&self, operation: &'static str, buffer: &DeviceBuffer) -> Result<(), DeviceError> {
        if buffer.device == self.device {
            Ok(())
        } else {
            Err(foreign_buffer(self.device, operation, buffer))
        }
    }

    #[track_caller]
    fn enqueue(&self, operation: &'static str, op: StreamOperation) -> Result<(), DeviceError> {
        let command = Command::Enqueue {
            stream: self.id,
            operation: op,
        };

        if self.commands.send(command).is_err() {
            return Err(executor_gone(self.device, operation));
        }

        Ok(())
    }
}

impl Drop for Stream {
    fn drop(&mut self) {
        // A device that already stopped has no stream state left to clean up.
        drop(self.commands.send(Command::DestroyStream { stream: self.id }));
    }
}

/// Device memory allocated by [`Device::allocate()`].
///
/// The memory stays allocated until passed to [`Device::free()`] or until the device stops.
#[derive(Debug, Eq, PartialEq)]
pub struct DeviceBuffer {
    device: DeviceId,
    id: u64,
    len: usize,
}

impl DeviceBuffer {
    /// The device that owns the memory.
    #[must_use]
    pub fn device(&self) -> DeviceId {
        self.device
    }

    /// The size of the allocation in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the allocation has no bytes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

#[track_caller]
fn executor_gone(device: DeviceId, operation: &'static str) -> DeviceError {
    DeviceError::new(
        DeviceErrorKind::StreamLost,
        device,
        operation,
        "the device executor is no longer running",
    )
}

#[track_caller]
fn foreign_buffer(device: DeviceId, operation: &'static str, buffer: &DeviceBuffer) -> DeviceError {
    DeviceError::new(
        DeviceErrorKind::InvalidAccess,
        device,
        operation,
        format!("buffer belongs to device {}", buffer.device),
    )
}

enum Command {
    CreateStream {
        reply: oneshot::Sender<u64>,
    },
    DestroyStream {
        stream: u64,
    },
    Allocate {
        len: usize,
        reply: oneshot::Sender<Result<u64, Failure>>,
    },
    Free {
        buffer: u64,
        reply: oneshot::Sender<Result<(), Failure>>,
    },
    Enqueue {
        stream: u64,
        operation: StreamOperation,
    },
    Synchronize {
        stream: u64,
        reply: oneshot::Sender<Result<(), Failure>>,
    },
    Region {
        mapping: Option<(HostBuffer, usize)>,
        reply: oneshot::Sender<Result<(), Failure>>,
    },
    MemoryInUse {
        reply: oneshot::Sender<usize>,
    },
    Shutdown,
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::CreateStream { .. } => "CreateStream",
            Self::DestroyStream { .. } => "DestroyStream",
            Self::Allocate { .. } => "Allocate",
            Self::Free { .. } => "Free",
            Self::Enqueue { .. } => "Enqueue",
            Self::Synchronize { .. } => "Synchronize",
            Self::Region { .. } => "Region",
            Self::MemoryInUse { .. } => "MemoryInUse",
            Self::Shutdown => "Shutdown",
        };

        f.write_str(name)
    }
}

enum StreamOperation {
    CopyToDevice {
        host: HostBuffer,
        buffer: u64,
        len: usize,
    },
    CopyToHost {
        buffer: u64,
        host: HostBuffer,
        len: usize,
    },
    Kernel {
        buffer: Option<u64>,
    },
}

/// A failure observed by the executor, turned into a [`DeviceError`] at the call site that
/// receives it.
#[derive(Clone, Debug)]
struct Failure {
    kind: DeviceErrorKind,
    detail: String,
}

impl Failure {
    fn new(kind: DeviceErrorKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            detail: detail.into(),
        }
    }

    #[track_caller]
    fn into_error(self, device: DeviceId, operation: &'static str) -> DeviceError {
        DeviceError::new(self.kind, device, operation, self.detail)
    }
}

/// Device memory handed out by the executor. The backing memory may be longer than the
/// allocation when it was reused from a larger freed allocation.
struct Allocation {
    memory: Vec<u8>,
    len: usize,
}

impl Allocation {
    fn bytes(&self, len: usize) -> Option<&[u8]> {
        if len > self.len {
            return None;
        }

        self.memory.get(..len)
    }

    fn bytes_mut(&mut self, len: usize) -> Option<&mut [u8]> {
        if len > self.len {
            return None;
        }

        self.memory.get_mut(..len)
    }
}

struct Executor {
    device: DeviceId,
    capacity: usize,
    in_use: usize,

    // Streams and buffers share one handle space.
    next_handle: u64,

    buffers: HashMap<u64, Allocation>,

    // Backing memory of freed buffers, already written once and reused by later allocations.
    spare: Vec<Vec<u8>>,

    // The first failure of each stream. It stays until the stream is destroyed.
    streams: HashMap<u64, Option<Failure>>,
}

impl Executor {
    fn new(device: DeviceId, capacity: usize) -> Self {
        Self {
            device,
            capacity,
            in_use: 0,
            next_handle: 0,
            buffers: HashMap::default(),
            spare: Vec::new(),
            streams: HashMap::default(),
        }
    }

    fn run(mut self, commands: &Receiver<Command>) {
        debug!(device = %self.device, "device executor started");

        // The loop also ends when every sender is gone.
        while let Ok(command) = commands.recv() {
            trace!(device = %self.device, ?command, "executing");

            match command {
                Command::Shutdown => break,
                Command::CreateStream { reply } => {
                    let stream = self.next_handle();
                    self.streams.insert(stream, None);
                    drop(reply.send(stream));
                }
                Command::DestroyStream { stream } => {
                    self.streams.remove(&stream);
                }
                Command::Allocate { len, reply } => {
                    drop(reply.send(self.allocate(len)));
                }
                Command::Free { buffer, reply } => {
                    drop(reply.send(self.free(buffer)));
                }
                Command::Enqueue { stream, operation } => self.execute(stream, operation),
                Command::Synchronize { stream, reply } => {
                    let outcome = match self.streams.get(&stream) {
                        Some(None) => Ok(()),
                        Some(Some(failure)) => Err(failure.clone()),
                        None => Err(Failure::new(
                            DeviceErrorKind::StreamLost,
                            "the stream does not exist",
                        )),
                    };
                    drop(reply.send(outcome));
                }
                Command::Region { mapping, reply } => {
                    drop(reply.send(self.region(mapping)));
                }
                Command::MemoryInUse { reply } => {
                    drop(reply.send(self.in_use));
                }
            }
        }

        debug!(device = %self.device, leaked_bytes = self.in_use, "device executor stopped");
    }

    fn next_handle(&mut self) -> u64 {
        let handle = self.next_handle;
        self.next_handle = self.next_handle.wrapping_add(1);
        handle
    }

    fn allocate(&mut self, len: usize) -> Result<u64, Failure> {
        let free = self.capacity.saturating_sub(self.in_use);

        if len > free {
            return Err(Failure::new(
                DeviceErrorKind::Allocation,
                format!(
                    "requested {len} bytes but only {free} of {} bytes are free",
                    self.capacity
                ),
            ));
        }

        let memory = self.backing_memory(len)?;

        self.in_use = self
            .in_use
            .checked_add(len)
            .expect("allocations are bounded by the capacity");

        let buffer = self.next_handle();
        self.buffers.insert(buffer, Allocation { memory, len });

        Ok(buffer)
    }

    /// The smallest spare memory that fits `len` bytes, or new memory written once here so that
    /// copies into it do not fault pages in.
    fn backing_memory(&mut self, len: usize) -> Result<Vec<u8>, Failure> {
        let fitting = self
            .spare
            .iter()
            .enumerate()
            .filter(|(_, memory)| memory.len() >= len)
            .min_by_key(|(_, memory)| memory.len())
            .map(|(index, _)| index);

        if let Some(index) = fitting {
            return Ok(self.spare.swap_remove(index));
        }

        // Spare memory that fits no request is returned to the host.
        self.spare.clear();

        let mut memory = Vec::new();
        memory.try_reserve_exact(len).map_err(|e| {
            Failure::new(
                DeviceErrorKind::Allocation,
                format!("backing memory for {len} bytes is not available: {e}"),
            )
        })?;
        memory.resize(len, 0);

        Ok(memory)
    }

    fn free(&mut self, buffer: u64) -> Result<(), Failure> {
        let allocation = self.buffers.remove(&buffer).ok_or_else(|| {
            Failure::new(
                DeviceErrorKind::InvalidAccess,
                "the buffer was already freed",
            )
        })?;

        self.in_use = self
            .in_use
            .checked_sub(allocation.len)
            .expect("every allocated byte was counted when it was allocated");

        self.spare.push(allocation.memory);

        Ok(())
    }

    fn execute(&mut self, stream: u64, operation: StreamOperation) {
        let Some(state) = self.streams.get(&stream) else {
            warn!(device = %self.device, stream, "operation submitted to a destroyed stream");
            return;
        };

        if state.is_some() {
            // The stream already failed and skips everything until it is destroyed.
            return;
        }

        let outcome = match operation {
            StreamOperation::CopyToDevice { host, buffer, len } => {
                self.copy_to_device(&host, buffer, len)
            }
            StreamOperation::CopyToHost { buffer, host, len } => {
                self.copy_to_host(buffer, &host, len)
            }
            StreamOperation::Kernel { buffer } => self.kernel(buffer),
        };

        if let Err(failure) = outcome {
            debug!(device = %self.device, stream, detail = %failure.detail, "stream operation failed");
            self.streams.insert(stream, Some(failure));
        }
    }

    fn copy_to_device(&mut self, host: &HostBuffer, buffer: u64, len: usize) -> Result<(), Failure> {
        let allocation = self.buffers.get_mut(&buffer).ok_or_else(freed_buffer)?;
        let host = host.bytes.lock();

        let source = host.get(..len).ok_or_else(|| out_of_bounds("host buffer", len))?;
        let target = allocation
            .bytes_mut(len)
            .ok_or_else(|| out_of_bounds("device buffer", len))?;

        target.copy_from_slice(source);
        Ok(())
    }

    fn copy_to_host(&self, buffer: u64, host: &HostBuffer, len: usize) -> Result<(), Failure> {
        let allocation = self.buffers.get(&buffer).ok_or_else(freed_buffer)?;
        let mut host = host.bytes.lock();

        let source = allocation
            .bytes(len)
            .ok_or_else(|| out_of_bounds("device buffer", len))?;
        let target = host
            .get_mut(..len)
            .ok_or_else(|| out_of_bounds("host buffer", len))?;

        target.copy_from_slice(source);
        Ok(())
    }

    fn kernel(&self, buffer: Option<u64>) -> Result<(), Failure> {
        match buffer {
            Some(buffer) => {
                let allocation = self.buffers.get(&buffer).ok_or_else(|| {
                    Failure::new(
                        DeviceErrorKind::Launch,
                        "kernel argument refers to freed device memory",
                    )
                })?;
                black_box(allocation.len);
            }
            None => black_box(()),
        }

        Ok(())
    }

    fn region(&mut self, mapping: Option<(HostBuffer, usize)>) -> Result<(), Failure> {
        let Some((host, len)) = mapping else {
            black_box(());
            return Ok(());
        };

        let buffer = self.allocate(len)?;

        let outcome = self
            .copy_to_device(&host, buffer, len)
            .and_then(|()| self.kernel(Some(buffer)))
            .and_then(|()| self.copy_to_host(buffer, &host, len));

        self.free(buffer)?;
        outcome
    }
}

fn freed_buffer() -> Failure {
    Failure::new(
        DeviceErrorKind::InvalidAccess,
        "the buffer was freed before the operation executed",
    )
}

fn out_of_bounds(what: &str, len: usize) -> Failure {
    Failure::new(
        DeviceErrorKind::InvalidAccess,
        format!("{len} bytes exceed the size of the {what}"),
    )
}

#[cfg(test)]
mod tests {
    use std::fmt::Debug;

    use new_zealand::nz;
    use static_assertions::assert_impl_all;
    use testing::with_watchdog;

    use super::*;

    assert_impl_all!(DeviceSet: Send, Sync, Clone, Debug);
    assert_impl_all!(Stream: Send, Debug);
    assert_impl_all!(HostBuffer: Send, Sync, Clone, Debug);

    const CAPACITY: usize = 1024;

    fn one_device() -> DeviceSet {
        DeviceSet::start(nz!(1), CAPACITY, &Topology::current())
    }

    #[cfg_attr(miri, ignore)] // Miri cannot pin threads to processors.
    #[test]
    fn round_trip_copies_real_bytes() {
        with_watchdog(|| {
            let devices = one_device();
            let device = devices.device(DeviceId::new(0)).unwrap();
            let stream = device.create_stream().unwrap();

            let host = HostBuffer::zeroed(16);
            host.fill_from(&[1, 2, 3, 4]);
            let buffer = device.allocate(16).unwrap();

            stream.copy_to_device(&host, &buffer, 4).unwrap();
            host.fill_from(&[0, 0, 0, 0]);
            stream.launch_kernel(Some(&buffer)).unwrap();
            stream.copy_to_host(&buffer, &host, 4).unwrap();
            stream.synchronize().unwrap();

            assert_eq!(host.snapshot(4), vec![1, 2, 3, 4]);
            device.free(buffer).unwrap();
        });
    }

    #[cfg_attr(miri, ignore)] // Miri cannot pin threads to processors.
    #[test]
    fn stream_operations_execute_in_order() {
        with_watchdog(|| {
            let devices = one_device();
            let device = devices.device(DeviceId::new(0)).unwrap();
            let stream = device.create_stream().unwrap();

            let first = HostBuffer::zeroed(4);
            let second = HostBuffer::zeroed(4);
            first.fill_from(&[7, 7, 7, 7]);
            let buffer = device.allocate(4).unwrap();

            // The copy back can only observe the data if the copy in already executed.
            stream.copy_to_device(&first, &buffer, 4).unwrap();
            stream.copy_to_host(&buffer, &second, 4).unwrap();
            stream.synchronize().unwrap();

            assert_eq!(second.snapshot(4), vec![7, 7, 7, 7]);
        });
    }

    #[cfg_attr(miri, ignore)] // Miri cannot pin threads to processors.
    #[test]
    fn allocation_beyond_capacity_fails() {
        with_watchdog(|| {
            let devices = one_device();
            let device = devices.device(DeviceId::new(0)).unwrap();

            let most = device.allocate(CAPACITY - 10).unwrap();
            let error = device.allocate(11).unwrap_err();

            assert_eq!(error.kind(), DeviceErrorKind::Allocation);
            assert_eq!(device.memory_in_use().unwrap(), CAPACITY - 10);

            device.free(most).unwrap();
            assert_eq!(device.memory_in_use().unwrap(), 0);

            let all = device.allocate(CAPACITY).unwrap();
            device.free(all).unwrap();
        });
    }

    #[cfg_attr(miri, ignore)] // Miri cannot pin threads to processors.
    #[test]
    fn stream_errors_are_sticky_until_synchronized() {
        with_watchdog(|| {
            let devices = one_device();
            let device = devices.device(DeviceId::new(0)).unwrap();
            let stream = device.create_stream().unwrap();

            let host = HostBuffer::zeroed(8);
            let buffer = device.allocate(8).unwrap();

            // Enqueuing succeeds even though the copy cannot execute.
            stream.copy_to_device(&host, &buffer, 64).unwrap();
            stream.launch_kernel(Some(&buffer)).unwrap();

            let first = stream.synchronize().unwrap_err();
            assert_eq!(first.kind(), DeviceErrorKind::InvalidAccess);
            assert_eq!(first.operation(), "synchronize");

            // Still failed, even without new work.
            let second = stream.synchronize().unwrap_err();
            assert_eq!(second.kind(), DeviceErrorKind::InvalidAccess);

            // Other streams are unaffected.
            let fresh = device.create_stream().unwrap();
            fresh.launch_kernel(Some(&buffer)).unwrap();
            fresh.synchronize().unwrap();
        });
    }

    #[cfg_attr(miri, ignore)] // Miri cannot pin threads to processors.
    #[test]
    fn kernel_on_freed_memory_is_a_launch_failure() {
        with_watchdog(|| {
            let devices = one_device();
            let device = devices.device(DeviceId::new(0)).unwrap();
            let stream = device.create_stream().unwrap();

            let buffer = device.allocate(8).unwrap();
            let stale = DeviceBuffer {
                device: buffer.device,
                id: buffer.id,
                len: buffer.len,
            };
            device.free(buffer).unwrap();

            stream.launch_kernel(Some(&stale)).unwrap();

            assert_eq!(
                stream.synchronize().unwrap_err().kind(),
                DeviceErrorKind::Launch
            );
        });
    }

    #[cfg_attr(miri, ignore)] // Miri cannot pin threads to processors.
    #[test]
    fn buffers_of_other_devices_are_rejected() {
        with_watchdog(|| {
            let devices = DeviceSet::start(nz!(2), CAPACITY, &Topology::current());
            let first = devices.device(DeviceId::new(0)).unwrap();
            let second = devices.device(DeviceId::new(1)).unwrap();

            let buffer = first.allocate(8).unwrap();
            let stream = second.create_stream().unwrap();

            let error = stream.launch_kernel(Some(&buffer)).unwrap_err();
            assert_eq!(error.kind(), DeviceErrorKind::InvalidAccess);
            assert_eq!(error.device(), DeviceId::new(1));

            assert_eq!(
                second.free(buffer).unwrap_err().kind(),
                DeviceErrorKind::InvalidAccess
            );
        });
    }

    #[cfg_attr(miri, ignore)] // Miri cannot pin threads to processors.
    #[test]
    fn offload_region_maps_to_and_from() {
        with_watchdog(|| {
            let devices = one_device();
            let device = devices.device(DeviceId::new(0)).unwrap();

            let host = HostBuffer::zeroed(32);
            host.fill_from(&[9, 8, 7]);

            device.run_region(None).unwrap();
            device.run_region(Some((&host, 32))).unwrap();

            assert_eq!(host.snapshot(3), vec![9, 8, 7]);
            assert_eq!(device.memory_in_use().unwrap(), 0);

            let error = device.run_region(Some((&host, CAPACITY + 1))).unwrap_err();
            assert_eq!(error.kind(), DeviceErrorKind::Allocation);
        });
    }

    #[test]
    fn freed_memory_is_reused_without_writing_it_again() {
        let mut executor = Executor::new(DeviceId::new(0), CAPACITY);

        let first = executor.allocate(256).unwrap();
        let allocation = executor.buffers.get_mut(&first).unwrap();
        allocation.memory.fill(0xAB);
        let address = allocation.memory.as_ptr();
        executor.free(first).unwrap();

        let second = executor.allocate(128).unwrap();
        let allocation = executor.buffers.get(&second).unwrap();

        assert_eq!(allocation.memory.as_ptr(), address);
        assert!(allocation.bytes(128).unwrap().iter().all(|b| *b == 0xAB));
        assert!(allocation.bytes(129).is_none());
        assert_eq!(executor.in_use, 128);
        assert!(executor.spare.is_empty());
    }

    #[test]
    fn spare_memory_too_small_is_released() {
        let mut executor = Executor::new(DeviceId::new(0), CAPACITY);

        let small = executor.allocate(64).unwrap();
        executor.free(small).unwrap();
        assert_eq!(executor.spare.len(), 1);

        let large = executor.allocate(512).unwrap();

        assert!(executor.spare.is_empty());
        assert_eq!(executor.buffers.get(&large).unwrap().memory.len(), 512);
        assert_eq!(executor.in_use, 512);
    }

    #[test]
    fn host_buffer_is_allocated_on_initialization() {
        let buffer = HostBuffer::new(4096);

        assert_eq!(buffer.len(), 4096);
        assert!(!buffer.is_initialized());

        buffer.initialize();
        assert!(buffer.is_initialized());
        assert_eq!(buffer.snapshot(4096), vec![0; 4096]);

        // Initializing again keeps the contents.
        buffer.fill_from(&[5]);
        buffer.initialize();
        assert_eq!(buffer.snapshot(1), vec![5]);
    }

    #[cfg_attr(miri, ignore)] // Miri cannot pin threads to processors.
    #[test]
    fn unknown_device_is_invalid() {
        let devices = one_device();

        let error = devices.device(DeviceId::new(5)).unwrap_err();

        assert_eq!(error.kind(), DeviceErrorKind::InvalidDevice);
        assert_eq!(error.location().file(), file!());
    }
}
