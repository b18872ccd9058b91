//! Progress reporting.
//!
//! Progress is observational only: nothing in the engine reads it back.

/// Receives progress values in `0..=100`.
pub trait ProgressSink {
    fn report(&mut self, value: u8);
}

impl<F> ProgressSink for F
where
    F: FnMut(u8),
{
    fn report(&mut self, value: u8) {
        self(value)
    }
}

/// Discards every value.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoProgress;

impl ProgressSink for NoProgress {
    fn report(&mut self, _value: u8) {}
}

/// Wraps a caller's sink for the lifetime of one call, so the caller only
/// ever sees non-decreasing values capped at 100.
pub struct Monotonic<'a> {
    sink: &'a mut dyn ProgressSink,
    last: Option<u8>,
}

impl<'a> Monotonic<'a> {
    pub fn new(sink: &'a mut dyn ProgressSink) -> Self {
        Self { sink, last: None }
    }

    pub fn report(&mut self, value: u8) {
        let value = value.min(100);
        if self.last.map_or(true, |last| value > last) {
            self.last = Some(value);
            self.sink.report(value);
        }
    }

    /// Maps `step` of `total` onto the `from..=to` band.
    pub fn report_within(&mut self, from: u8, to: u8, step: usize, total: usize) {
        if total == 0 || to <= from {
            self.report(to);
            return;
        }
        let span = (to - from) as usize;
        let offset = span * step.min(total) / total;
        self.report(from + offset as u8);
    }

    pub fn finish(&mut self) {
        self.report(100);
    }
}
