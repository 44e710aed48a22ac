//! Optional codegen capability
//!
//! A just-in-time compiler backend can inline a specialized accumulator
//! directly into a generated aggregation loop. Functions opt in by
//! returning true from `is_compilable` and implementing
//! [`CompilableAggregate`]; the general contract works with this entirely
//! absent. The hooks speak to an abstract [`JitBuilder`] so the core stays
//! independent of any particular backend.

use super::contract::AggregateFunction;

/// Backend-neutral handle to a value inside the generated loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JitValue(pub usize);

/// Minimal instruction surface a backend exposes to aggregate codegen.
pub trait JitBuilder {
    fn const_i64(&mut self, value: i64) -> JitValue;

    /// Load an i64 from `state_ptr + offset`.
    fn load_i64(&mut self, state_ptr: JitValue, offset: usize) -> JitValue;

    /// Store an i64 to `state_ptr + offset`.
    fn store_i64(&mut self, value: JitValue, state_ptr: JitValue, offset: usize);

    fn add_i64(&mut self, lhs: JitValue, rhs: JitValue) -> JitValue;
}

/// Codegen hooks for functions that can be specialized by the compiler
/// backend.
pub trait CompilableAggregate: AggregateFunction {
    /// Generate initialization of the state at `state_ptr`.
    fn compile_create(&self, builder: &mut dyn JitBuilder, state_ptr: JitValue);

    /// Generate the per-row state update from already-loaded argument
    /// values.
    fn compile_add(&self, builder: &mut dyn JitBuilder, state_ptr: JitValue, args: &[JitValue]);

    /// Generate merging of the state at `src_ptr` into the one at `dst_ptr`.
    fn compile_merge(&self, builder: &mut dyn JitBuilder, dst_ptr: JitValue, src_ptr: JitValue);

    /// Generate extraction of the final value from the state at `state_ptr`.
    fn compile_get_result(&self, builder: &mut dyn JitBuilder, state_ptr: JitValue) -> JitValue;
}
