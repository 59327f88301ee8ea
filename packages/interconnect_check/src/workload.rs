use crate::{DeviceError, DeviceId, SizeClass};

/// One kind of device work whose cost is measured.
///
/// A workload instance belongs to one context and is only ever used during that context's
/// turns, apart from [`set_up()`][Self::set_up], which runs once on the context's thread before
/// the first turn. For every sample the collector calls [`prepare()`][Self::prepare] once, then
/// [`run_once()`][Self::run_once] repeatedly between two timestamps, then
/// [`synchronize()`][Self::synchronize] before taking the second timestamp and finally
/// [`release()`][Self::release].
///
/// The size is `None` for latency samples, which carry no payload.
#[cfg_attr(test, mockall::automock)]
pub trait Workload {
    /// How many times the payload crosses the interconnect per timed operation.
    ///
    /// Bandwidth is computed as `payload * multiplier / time`, so a round trip reports 2.
    fn transfer_multiplier(&self) -> u32;

    /// Touches the host memory of the context on the context's own thread, before any phase.
    fn set_up(&mut self) {}

    /// Performs one untimed operation that initializes the device for this context.
    ///
    /// # Errors
    ///
    /// Fails if the device rejects the operation.
    fn warm_up(&mut self, device: DeviceId) -> Result<(), DeviceError>;

    /// Sets up whatever the timed operations need, outside the timed region.
    ///
    /// # Errors
    ///
    /// Fails if the device rejects the operation.
    fn prepare(&mut self, device: DeviceId, size: Option<SizeClass>) -> Result<(), DeviceError> {
        _ = (device, size);
        Ok(())
    }

    /// Issues one timed operation. Asynchronous workloads may return before it completes.
    ///
    /// # Errors
    ///
    /// Fails if the device rejects the operation.
    fn run_once(&mut self, device: DeviceId, size: Option<SizeClass>) -> Result<(), DeviceError>;

    /// Waits until every operation issued so far has completed.
    ///
    /// # Errors
    ///
    /// Fails if any operation issued since the last synchronization failed.
    fn synchronize(&mut self, device: DeviceId) -> Result<(), DeviceError>;

    /// Tears down what [`prepare()`][Self::prepare] set up, outside the timed region.
    ///
    /// # Errors
    ///
    /// Fails if the device rejects the operation.
    fn release(&mut self, device: DeviceId) -> Result<(), DeviceError> {
        _ = device;
        Ok(())
    }
}
