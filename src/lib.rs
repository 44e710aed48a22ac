//! Aggregate-state execution framework
//!
//! The building blocks a vectorized query engine needs to run aggregate
//! functions over Arrow columns: opaque accumulator states living at
//! caller-owned addresses, batch ingestion kernels, state merging and
//! versioned state serialization, plus a rate-limited progress indicator
//! for client tooling.

pub mod aggregate;
pub mod arena;
pub mod error;
pub mod io;
pub mod progress;

// Re-export main types
pub use aggregate::{
    AddFn, AggDataPtr, AggregateFunction, AggregateFunctionPtr, AggregateProperties,
    CompilableAggregate, ConstAggDataPtr, JitBuilder, JitValue, SparseColumn, TypedAggregate,
};
pub use arena::Arena;
pub use error::{AggError, Result};
pub use io::{write_varint, ByteReader};
pub use progress::ProgressIndication;
