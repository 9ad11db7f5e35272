// Copyright 2025-2026 Johann Kempter
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//
// SPDX-License-Identifier: Apache-2.0

#![doc(html_no_source)]
#![deny(missing_docs)]
#![allow(dead_code)]

//! # vmscope
//!
//! A framework for analyzing and rewriting virtualized (VM-obfuscated) code lowered
//! into a virtual instruction list IR. `vmscope` executes basic blocks against a
//! symbolic virtual machine and re-emits semantically equivalent but simplified code,
//! which is the core primitive behind devirtualization and obfuscation removal.
//!
//! # Architecture
//!
//! The library is organized into three layers that work together:
//!
//! - **IR Layer**: The virtual instruction list: bit-granular register slices,
//!   explicit memory instructions, stack pointer tracking, and basic blocks
//! - **Symbolic Layer**: Immutable expression trees with known-bit tracking and value
//!   fingerprints, plus the partial-bit register store and alias-aware memory store
//! - **Analysis Layer**: The symbolic VM adapter, the segmentation algorithm, the
//!   pre-simplifier with conditional-branch recovery, and the re-emitter
//!
//! ## Key Components
//!
//! - [`crate::analysis::SymbolicAnalysis`] - Per-block cached analysis with the
//!   `update → prepare → reemit` flow
//! - [`crate::analysis::AnalysisCache`] - Parallel-across-blocks, exclusive-per-block
//!   orchestration
//! - [`crate::symbolic::SymbolicExpr`] - Reference-counted symbolic expressions
//! - [`crate::ir::BasicBlock`] - The mutable instruction container being rewritten
//! - [`crate::Error`] and [`crate::Result`] - Error handling
//!
//! # Usage Examples
//!
//! ## Simplifying a block
//!
//! ```rust
//! use vmscope::analysis::SymbolicAnalysis;
//! use vmscope::ir::{BasicBlock, Op, Operand, RegisterDesc, RoutineId};
//!
//! let mut block = BasicBlock::new(RoutineId(1), 0x1000);
//! let r0 = RegisterDesc::virtual_reg(0, 64);
//! block.mov(r0, Operand::imm(1, 64))?;
//! block.arith(Op::Add, r0, Operand::imm(2, 64))?;
//! block.vexit(r0)?;
//!
//! let mut analysis = SymbolicAnalysis::new();
//! analysis.update(&block);
//! analysis.prepare(true);
//! analysis.reemit(&mut block)?;
//! # Ok::<(), vmscope::Error>(())
//! ```
//!
//! ## Analyzing many blocks in parallel
//!
//! ```rust,ignore
//! use vmscope::analysis::AnalysisCache;
//!
//! let cache = AnalysisCache::new();
//! cache.update_all(&blocks)?;
//! ```
//!
//! # Thread Safety
//!
//! Expressions are immutable and freely shareable. A [`crate::analysis::SymbolicAnalysis`]
//! owns its segments and is driven through `&mut`; cross-thread use goes through
//! [`crate::analysis::AnalysisCache`], which serializes per block and parallelizes
//! across blocks.

pub mod analysis;
pub mod ir;
pub mod symbolic;

mod error;

pub use error::{Error, Result};

/// Convenient re-exports of the most commonly used types.
pub mod prelude {
    pub use crate::analysis::{AnalysisCache, SymbolicAnalysis, SymbolicVm, VmExitReason};
    pub use crate::ir::{BasicBlock, Instruction, Op, Operand, RegisterDesc, RoutineId};
    pub use crate::symbolic::{Pointer, SymbolicExpr, SymbolicVariable};
    pub use crate::{Error, Result};
}
