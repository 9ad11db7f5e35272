//! Symbolic block analysis: the VM contract, segmentation, and re-emission.
//!
//! The flow is `update → prepare → reemit`:
//!
//! 1. [`SymbolicAnalysis::update`] drives the symbolic VM over a block, splitting it
//!    into [`SymbolicSegment`]s wherever an alias or modeling limit stops execution and
//!    spilling un-modelable instructions into per-segment suffixes.
//! 2. [`SymbolicAnalysis::prepare`] simplifies every stored expression and recovers
//!    conditional branches hidden inside arithmetized computed jumps.
//! 3. [`SymbolicAnalysis::reemit`] materializes the post-state of each segment back
//!    into a fresh block (register and memory writes, stack pointer normalization,
//!    suffix replay, branch reconstruction) and swaps it over the input.
//!
//! [`AnalysisCache`] provides the outer concurrency model: parallel across blocks,
//! exclusive per block.

mod analyzer;
mod cache;
mod segment;
mod translator;
mod vm;

pub use analyzer::{AnalyzerConfig, SymbolicAnalysis};
pub use cache::AnalysisCache;
pub use segment::SymbolicSegment;
pub use translator::BatchTranslator;
pub use vm::{execute_default, run, SymbolicVm, VmExitReason};
