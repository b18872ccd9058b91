//! Quality ladder and best-of-N candidate tracking.
//!
//! The ladder is plain data: an ordered list of JPEG presets. Running it is
//! separated from encoding so the selection policy can be tested with fake
//! encoders.

use std::fmt;

use log::debug;

use crate::error::{CompressError, EncodeError, Result};

/// One lossy encode preset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Preset {
    pub quality: u8,
}

/// Ordered presets, least aggressive first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QualityLadder {
    presets: Vec<Preset>,
}

impl Default for QualityLadder {
    fn default() -> Self {
        Self::new([85, 75, 60, 40])
    }
}

impl QualityLadder {
    pub fn new(qualities: impl IntoIterator<Item = u8>) -> Self {
        Self {
            presets: qualities
                .into_iter()
                .map(|quality| Preset { quality })
                .collect(),
        }
    }

    pub fn presets(&self) -> &[Preset] {
        &self.presets
    }

    pub fn len(&self) -> usize {
        self.presets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.presets.is_empty()
    }

    pub fn validate(&self) -> Result<()> {
        if self.presets.is_empty() {
            return Err(CompressError::InvalidConfig(
                "quality ladder has no presets".to_string(),
            ));
        }
        if let Some(p) = self.presets.iter().find(|p| !(1..=100).contains(&p.quality)) {
            return Err(CompressError::InvalidConfig(format!(
                "quality {} is outside 1..=100",
                p.quality
            )));
        }
        Ok(())
    }

    /// Offers one candidate per preset to `best`, in ladder order.
    ///
    /// A failed encode skips that preset. `on_step` is called after every
    /// preset with its index, whether or not the encode succeeded.
    pub fn run<F, S>(&self, best: &mut BestCandidate, mut encode: F, mut on_step: S) -> LadderReport
    where
        F: FnMut(Preset) -> Result<CompressionCandidate, EncodeError>,
        S: FnMut(usize),
    {
        let mut report = LadderReport::default();
        for (index, preset) in self.presets.iter().enumerate() {
            report.attempted += 1;
            match encode(*preset) {
                Ok(candidate) => {
                    let len = candidate.len();
                    if best.offer(candidate) {
                        debug!("q={} -> {} bytes (best so far)", preset.quality, len);
                    } else {
                        debug!("q={} -> {} bytes", preset.quality, len);
                    }
                }
                Err(e) => {
                    report.failed += 1;
                    debug!("q={} skipped: {}", preset.quality, e);
                }
            }
            on_step(index);
        }
        report
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct LadderReport {
    pub attempted: usize,
    pub failed: usize,
}

impl LadderReport {
    pub fn all_failed(&self) -> bool {
        self.attempted > 0 && self.failed == self.attempted
    }
}

/// How a candidate's bytes were produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoding {
    /// The input bytes, unchanged.
    Original,
    /// Input with droppable metadata segments removed.
    Trimmed,
    Jpeg { quality: u8 },
    Png,
}

impl fmt::Display for Encoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Encoding::Original => write!(f, "original"),
            Encoding::Trimmed => write!(f, "trimmed"),
            Encoding::Jpeg { quality } => write!(f, "JPEG(q={})", quality),
            Encoding::Png => write!(f, "PNG"),
        }
    }
}

/// One attempt's output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompressionCandidate {
    pub data: Vec<u8>,
    pub encoding: Encoding,
    /// The dimension cap the pixels were fitted to, if any.
    pub max_dimension: Option<u32>,
}

impl CompressionCandidate {
    pub fn original(data: Vec<u8>) -> Self {
        Self {
            data,
            encoding: Encoding::Original,
            max_dimension: None,
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Keeps the smallest candidate offered so far.
///
/// The baseline is the size to beat before any candidate has been kept.
/// Ties keep the earlier candidate.
#[derive(Debug)]
pub struct BestCandidate {
    baseline: usize,
    best: Option<CompressionCandidate>,
}

impl BestCandidate {
    pub fn new(baseline: usize) -> Self {
        Self {
            baseline,
            best: None,
        }
    }

    pub fn best_len(&self) -> usize {
        self.best.as_ref().map_or(self.baseline, |c| c.len())
    }

    /// Returns true if `candidate` was retained.
    pub fn offer(&mut self, candidate: CompressionCandidate) -> bool {
        if candidate.len() < self.best_len() {
            self.best = Some(candidate);
            true
        } else {
            false
        }
    }

    pub fn get(&self) -> Option<&CompressionCandidate> {
        self.best.as_ref()
    }

    pub fn into_inner(self) -> Option<CompressionCandidate> {
        self.best
    }
}
