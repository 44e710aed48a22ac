//! Aggregate-state execution framework
//!
//! The three layers, bottom up:
//!
//! - [`contract`] defines [`AggregateFunction`], the polymorphic contract of
//!   every accumulator: state lifecycle at caller-owned places, row
//!   ingestion, merging, versioned serialization, finalization.
//! - [`dispatch`] implements every batch/sparse/filtered/grouped variant of
//!   the contract generically over [`TypedAggregate`], monomorphized so
//!   per-row hot loops never pay an indirect call.
//! - [`typed`] binds a concrete state payload type to the contract and
//!   carries the inline lookup-table fast path for small payloads.

pub mod codegen;
pub mod contract;
pub mod dispatch;
pub mod properties;
pub mod simple;
pub mod typed;

pub use codegen::{CompilableAggregate, JitBuilder, JitValue};
pub use contract::{
    AddFn, AggDataPtr, AggregateFunction, AggregateFunctionPtr, ConstAggDataPtr, SparseColumn,
};
pub use properties::AggregateProperties;
pub use typed::{TypedAggregate, INLINE_STATE_BUDGET};
