//! Ordered fallback chain over the PDF strategies.
//!
//! Each strategy takes the previous strategy's output. The chain stops at the
//! first output the selector accepts against the original; if none is
//! accepted the original comes back untouched.

use std::fmt;

use log::{info, warn};
use thiserror::Error;

use crate::config::EngineConfig;
use crate::error::CompressError;
use crate::pdf::{aggressive, compact, rewrite, xref};
use crate::progress::Monotonic;
use crate::select;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StrategyKind {
    /// Image splicing, metadata removal and whitespace cleanup on raw bytes.
    Structural,
    /// lopdf load, prune, compress and save.
    ObjectRewrite,
    /// Drops oversized images and repeated metadata objects.
    Aggressive,
}

impl fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StrategyKind::Structural => write!(f, "structural"),
            StrategyKind::ObjectRewrite => write!(f, "object rewrite"),
            StrategyKind::Aggressive => write!(f, "aggressive"),
        }
    }
}

#[derive(Error, Debug)]
pub enum StrategyFailure {
    /// The strategy could not run on this document; the chain moves on.
    #[error("{0} strategy failed: {1}")]
    Failed(StrategyKind, String),

    /// Splice bookkeeping went wrong; the chain stops.
    #[error(transparent)]
    Fault(#[from] CompressError),
}

#[derive(Debug)]
pub struct StrategyOutput {
    pub data: Vec<u8>,
    /// Embedded images decoded and evaluated by this strategy.
    pub processed: usize,
}

#[derive(Debug)]
pub struct ChainOutcome {
    pub data: Vec<u8>,
    pub processed: usize,
    /// The strategy whose output was accepted, if any.
    pub accepted: Option<StrategyKind>,
}

/// Strategies enabled by `config`, in the order they are tried on `buf`.
/// Documents indexed by cross-reference streams go through the object
/// rewrite first, since it re-serialises every offset.
pub fn plan(config: &EngineConfig, buf: &[u8]) -> Vec<StrategyKind> {
    let mut plan = vec![StrategyKind::Structural];
    if config.pdf.object_rewrite {
        if xref::uses_xref_streams(buf) {
            plan.insert(0, StrategyKind::ObjectRewrite);
        } else {
            plan.push(StrategyKind::ObjectRewrite);
        }
    }
    if config.pdf.aggressive {
        plan.push(StrategyKind::Aggressive);
    }
    plan
}

fn apply(
    kind: StrategyKind,
    buf: &[u8],
    config: &EngineConfig,
    progress: &mut Monotonic<'_>,
) -> Result<StrategyOutput, StrategyFailure> {
    match kind {
        StrategyKind::Structural => {
            let compacted = compact::compact(buf, &config.pdf, &config.image.ladder, progress)?;
            let data = if compacted.data == buf {
                compacted.data
            } else {
                xref::rebuild(&compacted.data).unwrap_or(compacted.data)
            };
            Ok(StrategyOutput {
                data,
                processed: compacted.processed,
            })
        }
        StrategyKind::ObjectRewrite => {
            let rewritten = rewrite::rewrite(
                buf,
                &config.image.ladder,
                config.pdf.embedded_accept_ratio,
                config.pdf.parallel,
            )
            .map_err(|e| StrategyFailure::Failed(kind, format!("{:#}", e)))?;
            progress.report(95);
            Ok(StrategyOutput {
                data: rewritten.data,
                processed: rewritten.images_evaluated,
            })
        }
        StrategyKind::Aggressive => {
            let pruned = aggressive::drop_heavy_objects(buf, config.pdf.aggressive_object_ceiling)?;
            let data = xref::rebuild(&pruned.data).unwrap_or(pruned.data);
            progress.report(98);
            Ok(StrategyOutput { data, processed: 0 })
        }
    }
}

/// Runs the chain on `original`.
pub fn run(original: &[u8], config: &EngineConfig, progress: &mut Monotonic<'_>) -> ChainOutcome {
    let threshold = config.pdf.accept_ratio;
    let mut current = original.to_vec();
    let mut processed = 0;

    for kind in plan(config, original) {
        match apply(kind, &current, config, progress) {
            Ok(output) => {
                processed += output.processed;
                if output.data.len() < current.len() {
                    current = output.data;
                }
                if select::accepts(original.len(), current.len(), threshold) {
                    info!(
                        "{} strategy accepted: {} -> {} bytes",
                        kind,
                        original.len(),
                        current.len()
                    );
                    return ChainOutcome {
                        data: current,
                        processed,
                        accepted: Some(kind),
                    };
                }
                info!(
                    "{} strategy not enough: {} -> {} bytes",
                    kind,
                    original.len(),
                    current.len()
                );
            }
            Err(StrategyFailure::Fault(e)) => {
                warn!("{} strategy aborted, keeping original: {}", kind, e);
                return ChainOutcome {
                    data: original.to_vec(),
                    processed: 0,
                    accepted: None,
                };
            }
            Err(failure) => warn!("{}", failure),
        }
    }

    ChainOutcome {
        data: original.to_vec(),
        processed,
        accepted: None,
    }
}
