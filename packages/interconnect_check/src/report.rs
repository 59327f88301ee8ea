use std::fmt::{self, Display, Formatter};

use exclusive_turns::{ContextId, ContextModel};
use itertools::Itertools;

use crate::{Aggregate, DeviceId, MeasurementMode, SizeClass};

const SEPARATOR: &str = "---------------------------------------------------------------";

/// Renders an [`Aggregate`] as `;`-separated tables.
///
/// Bandwidth reports contain the absolute times, the absolute bandwidths and the bandwidths
/// relative to the minimum of their size class. Each of these has one block per size class
/// (rows are devices, columns are contexts); the bandwidth sections are followed by one block
/// per context (rows are devices, columns are size classes). Latency reports contain one block
/// of absolute and one block of relative latencies.
///
/// Values without an upper bound are rendered as `unbounded`, relative values without a
/// meaningful minimum as `n/a`.
#[derive(Clone, Copy, Debug)]
pub struct Report<'a> {
    aggregate: &'a Aggregate,
}

impl<'a> Report<'a> {
    /// Creates a report of `aggregate`.
    #[must_use]
    pub fn new(aggregate: &'a Aggregate) -> Self {
        Self { aggregate }
    }

    fn context_label(&self) -> &'static str {
        match self.aggregate.model() {
            ContextModel::Threads => "Core",
            _ => "Process",
        }
    }

    fn heading(f: &mut Formatter<'_>, title: &str) -> fmt::Result {
        writeln!(f, "{SEPARATOR}")?;
        writeln!(f, "{title}")?;
        writeln!(f, "{SEPARATOR}")
    }

    /// One block per size class, contexts as columns.
    fn size_blocks<F>(&self, f: &mut Formatter<'_>, with_size_headings: bool, cell: F) -> fmt::Result
    where
        F: Fn(ContextId, DeviceId, usize) -> Option<f64>,
    {
        let values = self.aggregate.values();
        let label = self.context_label();

        for (size_index, size) in self.aggregate.sizes().iter().enumerate() {
            if with_size_headings {
                writeln!(f, "##### Problem Size: {}", size_label(*size))?;
            }

            writeln!(
                f,
                ";{}",
                (0..values.context_count())
                    .map(|context| format!("{label} {context}"))
                    .join(";")
            )?;

            for device in (0..values.device_count()).map(DeviceId::new) {
                writeln!(
                    f,
                    "GPU {device};{}",
                    (0..values.context_count())
                        .map(|context| render(cell(ContextId::new(context), device, size_index)))
                        .join(";")
                )?;
            }
        }

        Ok(())
    }

    /// One block per context, size classes as columns.
    fn context_blocks<F>(&self, f: &mut Formatter<'_>, cell: F) -> fmt::Result
    where
        F: Fn(ContextId, DeviceId, usize) -> Option<f64>,
    {
        let values = self.aggregate.values();
        let label = self.context_label();

        writeln!(f)?;
        writeln!(f)?;

        for context in (0..values.context_count()).map(ContextId::new) {
            writeln!(f, "##### {label}: {context}")?;
            writeln!(
                f,
                ";{}",
                self.aggregate
                    .sizes()
                    .iter()
                    .map(|size| size_label(*size))
                    .join(";")
            )?;

            for device in (0..values.device_count()).map(DeviceId::new) {
                writeln!(
                    f,
                    "GPU {device};{}",
                    (0..values.size_count())
                        .map(|size_index| render(cell(context, device, size_index)))
                        .join(";")
                )?;
            }
        }

        Ok(())
    }

    fn bandwidth(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let times = self.aggregate.times();
        let values = self.aggregate.values();
        let relative_matrix = self.aggregate.relative();

        let time = |c, d, s| Some(times.get(c, d, s));
        let absolute = |c, d, s| Some(values.get(c, d, s));
        let relative = |c, d, s| relative_matrix.get(c, d, s);

        Self::heading(f, "Absolute times (sec)")?;
        self.size_blocks(f, true, time)?;

        Self::heading(
            f,
            &format!("Absolute measurements ({})", MeasurementMode::Bandwidth.unit()),
        )?;
        self.size_blocks(f, true, absolute)?;
        self.context_blocks(f, absolute)?;

        Self::heading(f, "Relative measurements to minimum bandwidth for size")?;
        self.size_blocks(f, true, relative)?;
        self.context_blocks(f, relative)
    }

    fn latency(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let values = self.aggregate.values();
        let relative = self.aggregate.relative();

        Self::heading(
            f,
            &format!("Absolute measurements ({})", MeasurementMode::Latency.unit()),
        )?;
        self.size_blocks(f, false, |c, d, s| Some(values.get(c, d, s)))?;

        Self::heading(f, "Relative measurements to minimum latency")?;
        self.size_blocks(f, false, |c, d, s| relative.get(c, d, s))
    }
}

impl Display for Report<'_> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self.aggregate.mode() {
            MeasurementMode::Bandwidth => self.bandwidth(f),
            MeasurementMode::Latency => self.latency(f),
        }
    }
}

fn render(value: Option<f64>) -> String {
    match value {
        Some(value) if value.is_finite() => format!("{value:.6}"),
        Some(_) => "unbounded".to_string(),
        None => "n/a".to_string(),
    }
}

fn size_label(size: Option<SizeClass>) -> String {
    size.map_or_else(|| "-".to_string(), |size| size.to_string())
}
