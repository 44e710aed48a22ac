//! Built-in accumulators
//!
//! A small library of concrete aggregate functions. Between them they cover
//! every framework path: fixed inline payloads eligible for the lookup-table
//! fast path (count, sum), an arena-backed variable-length payload with a
//! versioned wire format (collect), and a non-trivially-destructible payload
//! with a thread-pool-capable merge (count distinct).

use crate::arena::Arena;
use crate::error::{AggError, Result};
use crate::io::{write_varint, ByteReader};

use super::codegen::{CompilableAggregate, JitBuilder, JitValue};
use super::properties::AggregateProperties;
use super::typed::TypedAggregate;
use arrow::array::{
    Array, ArrayBuilder, ArrayRef, Float64Array, Float64Builder, Int64Array, Int64Builder,
    ListBuilder, UInt64Array, UInt64Builder,
};
use arrow::datatypes::{DataType, Field};
use hashbrown::HashSet;
use rayon::prelude::*;
use std::mem;
use std::ptr;
use std::slice;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

fn column_as<'a, A: Array + 'static>(
    columns: &'a [ArrayRef],
    pos: usize,
    func: &str,
) -> Result<&'a A> {
    columns
        .get(pos)
        .and_then(|c| c.as_any().downcast_ref::<A>())
        .ok_or_else(|| {
            AggError::InvalidArgument(format!("unexpected argument column {pos} for {func}"))
        })
}

fn builder_as<'a, B: ArrayBuilder>(to: &'a mut dyn ArrayBuilder, func: &str) -> Result<&'a mut B> {
    to.as_any_mut().downcast_mut::<B>().ok_or_else(|| {
        AggError::InvalidArgument(format!("unexpected result builder type for {func}"))
    })
}

/// Running row count. No arguments; counts every row routed to it.
#[derive(Debug, Default, Clone, Copy)]
pub struct Count;

impl TypedAggregate for Count {
    type State = u64;

    fn name(&self) -> &str {
        "count"
    }

    fn argument_types(&self) -> Vec<DataType> {
        Vec::new()
    }

    fn result_type(&self) -> DataType {
        DataType::UInt64
    }

    fn properties(&self) -> AggregateProperties {
        AggregateProperties {
            returns_default_when_only_null: true,
            ..AggregateProperties::default()
        }
    }

    fn new_state(&self) -> u64 {
        0
    }

    fn is_compilable(&self) -> bool {
        true
    }

    fn add(&self, state: &mut u64, _columns: &[ArrayRef], _row: usize, _arena: &Arena) -> Result<()> {
        *state += 1;
        Ok(())
    }

    fn add_many_defaults(
        &self,
        state: &mut u64,
        _columns: &[ArrayRef],
        count: usize,
        _arena: &Arena,
    ) -> Result<()> {
        *state += count as u64;
        Ok(())
    }

    fn merge(&self, state: &mut u64, rhs: &u64, _arena: &Arena) -> Result<()> {
        *state += rhs;
        Ok(())
    }

    fn serialize(&self, state: &u64, sink: &mut Vec<u8>, _version: Option<u64>) -> Result<()> {
        sink.extend_from_slice(&state.to_le_bytes());
        Ok(())
    }

    fn deserialize(
        &self,
        state: &mut u64,
        source: &mut ByteReader<'_>,
        _version: Option<u64>,
        _arena: Option<&Arena>,
    ) -> Result<()> {
        *state = source.read_u64()?;
        Ok(())
    }

    fn insert_result_into(
        &self,
        state: &mut u64,
        to: &mut dyn ArrayBuilder,
        _arena: &Arena,
    ) -> Result<()> {
        builder_as::<UInt64Builder>(to, "count")?.append_value(*state);
        Ok(())
    }
}

impl CompilableAggregate for Count {
    fn compile_create(&self, builder: &mut dyn JitBuilder, state_ptr: JitValue) {
        let zero = builder.const_i64(0);
        builder.store_i64(zero, state_ptr, 0);
    }

    fn compile_add(&self, builder: &mut dyn JitBuilder, state_ptr: JitValue, _args: &[JitValue]) {
        let current = builder.load_i64(state_ptr, 0);
        let one = builder.const_i64(1);
        let next = builder.add_i64(current, one);
        builder.store_i64(next, state_ptr, 0);
    }

    fn compile_merge(&self, builder: &mut dyn JitBuilder, dst_ptr: JitValue, src_ptr: JitValue) {
        let dst = builder.load_i64(dst_ptr, 0);
        let src = builder.load_i64(src_ptr, 0);
        let sum = builder.add_i64(dst, src);
        builder.store_i64(sum, dst_ptr, 0);
    }

    fn compile_get_result(&self, builder: &mut dyn JitBuilder, state_ptr: JitValue) -> JitValue {
        builder.load_i64(state_ptr, 0)
    }
}

/// Sum of a Float64 argument column.
#[derive(Debug, Default, Clone, Copy)]
pub struct SumFloat64;

impl TypedAggregate for SumFloat64 {
    type State = f64;

    fn name(&self) -> &str {
        "sum"
    }

    fn argument_types(&self) -> Vec<DataType> {
        vec![DataType::Float64]
    }

    fn result_type(&self) -> DataType {
        DataType::Float64
    }

    fn new_state(&self) -> f64 {
        0.0
    }

    fn add(&self, state: &mut f64, columns: &[ArrayRef], row: usize, _arena: &Arena) -> Result<()> {
        *state += column_as::<Float64Array>(columns, 0, "sum")?.value(row);
        Ok(())
    }

    fn merge(&self, state: &mut f64, rhs: &f64, _arena: &Arena) -> Result<()> {
        *state += rhs;
        Ok(())
    }

    fn serialize(&self, state: &f64, sink: &mut Vec<u8>, _version: Option<u64>) -> Result<()> {
        sink.extend_from_slice(&state.to_le_bytes());
        Ok(())
    }

    fn deserialize(
        &self,
        state: &mut f64,
        source: &mut ByteReader<'_>,
        _version: Option<u64>,
        _arena: Option<&Arena>,
    ) -> Result<()> {
        *state = source.read_f64()?;
        Ok(())
    }

    fn insert_result_into(
        &self,
        state: &mut f64,
        to: &mut dyn ArrayBuilder,
        _arena: &Arena,
    ) -> Result<()> {
        builder_as::<Float64Builder>(to, "sum")?.append_value(*state);
        Ok(())
    }
}

/// State of [`CollectInt64`]: a growable run of values in arena memory.
///
/// The payload itself is plain-old-data; the arena owns the pointed-to
/// memory for the lifetime of the query, so the destructor is trivial and
/// abandoned capacity after growth is simply left behind in the arena.
#[derive(Clone, Copy)]
pub struct CollectState {
    items: *mut i64,
    len: u32,
    cap: u32,
}

// The pointed-to memory lives in the caller's arena, which is a
// single-writer-at-a-time resource per aggregation context.
unsafe impl Send for CollectState {}

impl CollectState {
    fn items(&self) -> &[i64] {
        if self.len == 0 {
            &[]
        } else {
            unsafe { slice::from_raw_parts(self.items, self.len as usize) }
        }
    }

    fn push(&mut self, value: i64, arena: &Arena) {
        if self.len == self.cap {
            let new_cap = (self.cap * 2).max(8);
            let new_items = arena
                .allocate(new_cap as usize * mem::size_of::<i64>())
                .as_ptr()
                .cast::<i64>();
            if self.len > 0 {
                unsafe { ptr::copy_nonoverlapping(self.items, new_items, self.len as usize) };
            }
            self.items = new_items;
            self.cap = new_cap;
        }
        unsafe { self.items.add(self.len as usize).write(value) };
        self.len += 1;
    }
}

/// Collects every Int64 argument value into an arena-backed array, in row
/// order. Order-dependent; the wire format is versioned.
#[derive(Debug, Default, Clone, Copy)]
pub struct CollectInt64;

/// Wire format v0: fixed u32 count prefix. v1 shrinks it to a varint.
const COLLECT_LATEST_VERSION: u64 = 1;

impl TypedAggregate for CollectInt64 {
    type State = CollectState;

    fn name(&self) -> &str {
        "collect"
    }

    fn argument_types(&self) -> Vec<DataType> {
        vec![DataType::Int64]
    }

    fn result_type(&self) -> DataType {
        DataType::List(Arc::new(Field::new("item", DataType::Int64, true)))
    }

    fn properties(&self) -> AggregateProperties {
        AggregateProperties {
            is_order_dependent: true,
            ..AggregateProperties::default()
        }
    }

    fn new_state(&self) -> CollectState {
        CollectState {
            items: ptr::null_mut(),
            len: 0,
            cap: 0,
        }
    }

    fn allocates_memory_in_arena(&self) -> bool {
        true
    }

    fn is_versioned(&self) -> bool {
        true
    }

    fn default_version(&self) -> u64 {
        COLLECT_LATEST_VERSION
    }

    fn add(
        &self,
        state: &mut CollectState,
        columns: &[ArrayRef],
        row: usize,
        arena: &Arena,
    ) -> Result<()> {
        state.push(column_as::<Int64Array>(columns, 0, "collect")?.value(row), arena);
        Ok(())
    }

    fn merge(&self, state: &mut CollectState, rhs: &CollectState, arena: &Arena) -> Result<()> {
        for &value in rhs.items() {
            state.push(value, arena);
        }
        Ok(())
    }

    fn serialize(
        &self,
        state: &CollectState,
        sink: &mut Vec<u8>,
        version: Option<u64>,
    ) -> Result<()> {
        match version.unwrap_or(0) {
            0 => sink.extend_from_slice(&state.len.to_le_bytes()),
            COLLECT_LATEST_VERSION => write_varint(sink, state.len as u64),
            v => {
                return Err(AggError::NotSupported(format!(
                    "unknown collect state format version {v}"
                )))
            }
        }
        for value in state.items() {
            sink.extend_from_slice(&value.to_le_bytes());
        }
        Ok(())
    }

    fn deserialize(
        &self,
        state: &mut CollectState,
        source: &mut ByteReader<'_>,
        version: Option<u64>,
        arena: Option<&Arena>,
    ) -> Result<()> {
        let arena = arena.ok_or_else(|| {
            AggError::Execution("collect requires an arena to deserialize".to_string())
        })?;
        let count = match version.unwrap_or(0) {
            0 => source.read_u32()? as u64,
            COLLECT_LATEST_VERSION => source.read_varint()?,
            v => {
                return Err(AggError::NotSupported(format!(
                    "unknown collect state format version {v}"
                )))
            }
        };
        // Values are read one by one so a lying count prefix cannot force a
        // huge allocation; truncation surfaces on the first missing value.
        for _ in 0..count {
            state.push(source.read_i64()?, arena);
        }
        Ok(())
    }

    fn insert_result_into(
        &self,
        state: &mut CollectState,
        to: &mut dyn ArrayBuilder,
        _arena: &Arena,
    ) -> Result<()> {
        let builder = builder_as::<ListBuilder<Int64Builder>>(to, "collect")?;
        for &value in state.items() {
            builder.values().append_value(value);
        }
        builder.append(true);
        Ok(())
    }
}

/// Number of shards in a [`DistinctState`]; merges parallelize shard-wise.
const DISTINCT_SHARDS: usize = 4;

/// State of [`CountDistinct`]: the set of seen values, sharded by low key
/// bits so two states can be merged shard-by-shard in parallel.
#[derive(Default)]
pub struct DistinctState {
    shards: [HashSet<u64>; DISTINCT_SHARDS],
}

impl DistinctState {
    fn insert(&mut self, value: u64) {
        self.shards[value as usize % DISTINCT_SHARDS].insert(value);
    }

    fn len(&self) -> u64 {
        self.shards.iter().map(|s| s.len() as u64).sum()
    }
}

/// Exact distinct count of a UInt64 argument column.
///
/// The only built-in whose state is non-trivially destructible, and the
/// only one with a thread-pool-capable merge.
#[derive(Debug, Default, Clone, Copy)]
pub struct CountDistinct;

impl TypedAggregate for CountDistinct {
    type State = DistinctState;

    const PARALLELIZE_MERGE_WITH_KEY: bool = true;

    fn name(&self) -> &str {
        "count_distinct"
    }

    fn argument_types(&self) -> Vec<DataType> {
        vec![DataType::UInt64]
    }

    fn result_type(&self) -> DataType {
        DataType::UInt64
    }

    fn new_state(&self) -> DistinctState {
        DistinctState::default()
    }

    fn is_able_to_parallelize_merge(&self) -> bool {
        true
    }

    fn add(
        &self,
        state: &mut DistinctState,
        columns: &[ArrayRef],
        row: usize,
        _arena: &Arena,
    ) -> Result<()> {
        state.insert(column_as::<UInt64Array>(columns, 0, "count_distinct")?.value(row));
        Ok(())
    }

    fn merge(&self, state: &mut DistinctState, rhs: &DistinctState, _arena: &Arena) -> Result<()> {
        for (dst, src) in state.shards.iter_mut().zip(rhs.shards.iter()) {
            dst.extend(src.iter().copied());
        }
        Ok(())
    }

    fn merge_parallel(
        &self,
        state: &mut DistinctState,
        rhs: &DistinctState,
        pool: &rayon::ThreadPool,
        is_cancelled: &AtomicBool,
        _arena: &Arena,
    ) -> Result<()> {
        let dst_shards = &mut state.shards[..];
        let src_shards = &rhs.shards[..];
        pool.install(|| {
            dst_shards
                .par_iter_mut()
                .zip(src_shards.par_iter())
                .try_for_each(|(dst, src)| {
                    for (n, &value) in src.iter().enumerate() {
                        // Cooperative check between chunks of work, never
                        // preemptive.
                        if n % 1024 == 0 && is_cancelled.load(Ordering::Relaxed) {
                            return Err(AggError::Cancelled);
                        }
                        dst.insert(value);
                    }
                    Ok(())
                })
        })
    }

    fn serialize(
        &self,
        state: &DistinctState,
        sink: &mut Vec<u8>,
        _version: Option<u64>,
    ) -> Result<()> {
        write_varint(sink, state.len());
        for shard in &state.shards {
            for value in shard {
                sink.extend_from_slice(&value.to_le_bytes());
            }
        }
        Ok(())
    }

    fn deserialize(
        &self,
        state: &mut DistinctState,
        source: &mut ByteReader<'_>,
        _version: Option<u64>,
        _arena: Option<&Arena>,
    ) -> Result<()> {
        let count = source.read_varint()?;
        for _ in 0..count {
            state.insert(source.read_u64()?);
        }
        Ok(())
    }

    fn insert_result_into(
        &self,
        state: &mut DistinctState,
        to: &mut dyn ArrayBuilder,
        _arena: &Arena,
    ) -> Result<()> {
        builder_as::<UInt64Builder>(to, "count_distinct")?.append_value(state.len());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn int64_column(values: &[i64]) -> Vec<ArrayRef> {
        vec![Arc::new(Int64Array::from(values.to_vec())) as ArrayRef]
    }

    fn uint64_column(values: &[u64]) -> Vec<ArrayRef> {
        vec![Arc::new(UInt64Array::from(values.to_vec())) as ArrayRef]
    }

    #[test]
    fn test_count_add_and_merge() {
        let func = Count;
        let arena = Arena::new();
        let mut a = func.new_state();
        let mut b = func.new_state();

        for _ in 0..6 {
            func.add(&mut a, &[], 0, &arena).unwrap();
        }
        func.add_many_defaults(&mut b, &[], 4, &arena).unwrap();
        func.merge(&mut a, &b, &arena).unwrap();
        assert_eq!(a, 10);
    }

    #[test]
    fn test_sum_round_trip() {
        let func = SumFloat64;
        let arena = Arena::new();
        let columns = vec![Arc::new(Float64Array::from(vec![1.5, 2.5, -1.0])) as ArrayRef];

        let mut state = func.new_state();
        for row in 0..3 {
            func.add(&mut state, &columns, row, &arena).unwrap();
        }
        assert_eq!(state, 3.0);

        let mut sink = Vec::new();
        func.serialize(&state, &mut sink, None).unwrap();
        let mut restored = func.new_state();
        func.deserialize(&mut restored, &mut ByteReader::new(&sink), None, None)
            .unwrap();
        assert_eq!(restored, 3.0);
    }

    #[test]
    fn test_collect_preserves_row_order() {
        let func = CollectInt64;
        let arena = Arena::new();
        let columns = int64_column(&[7, 3, 9, 3]);

        let mut state = func.new_state();
        for row in 0..4 {
            func.add(&mut state, &columns, row, &arena).unwrap();
        }
        assert_eq!(state.items(), &[7, 3, 9, 3]);
    }

    #[test]
    fn test_collect_serialize_versions() {
        let func = CollectInt64;
        let arena = Arena::new();
        let columns = int64_column(&[1, 2, 3]);

        let mut state = func.new_state();
        for row in 0..3 {
            func.add(&mut state, &columns, row, &arena).unwrap();
        }

        for version in [None, Some(0), Some(1)] {
            let mut sink = Vec::new();
            func.serialize(&state, &mut sink, version).unwrap();
            let mut restored = func.new_state();
            func.deserialize(
                &mut restored,
                &mut ByteReader::new(&sink),
                version,
                Some(&arena),
            )
            .unwrap();
            assert_eq!(restored.items(), &[1, 2, 3], "version {version:?}");
        }

        let mut sink = Vec::new();
        assert!(func.serialize(&state, &mut sink, Some(99)).is_err());
    }

    #[test]
    fn test_collect_deserialize_truncated_input() {
        let func = CollectInt64;
        let arena = Arena::new();

        // Count prefix promises three values, payload carries one.
        let mut sink = Vec::new();
        write_varint(&mut sink, 3);
        sink.extend_from_slice(&1i64.to_le_bytes());

        let mut state = func.new_state();
        let result = func.deserialize(
            &mut state,
            &mut ByteReader::new(&sink),
            Some(1),
            Some(&arena),
        );
        assert!(result.is_err());
        // The state stays valid after the failure.
        assert_eq!(state.items(), &[1]);
    }

    #[test]
    fn test_distinct_state_shard_routing() {
        let mut state = DistinctState::default();
        for value in 0..32u64 {
            state.insert(value);
            state.insert(value);
        }
        assert_eq!(state.len(), 32);
        // Consecutive values spread evenly over every shard.
        for shard in &state.shards {
            assert_eq!(shard.len(), 32 / DISTINCT_SHARDS);
        }
    }

    #[test]
    fn test_count_distinct_merge_matches_parallel_merge() {
        let func = CountDistinct;
        let arena = Arena::new();
        let columns = uint64_column(&[1, 2, 3, 2, 1, 100, 7]);

        let build = |rows: std::ops::Range<usize>| {
            let mut state = func.new_state();
            for row in rows {
                func.add(&mut state, &columns, row, &arena).unwrap();
            }
            state
        };

        let mut sequential = build(0..4);
        let rhs = build(4..7);
        func.merge(&mut sequential, &rhs, &arena).unwrap();

        let pool = rayon::ThreadPoolBuilder::new().num_threads(2).build().unwrap();
        let mut parallel = build(0..4);
        func.merge_parallel(&mut parallel, &rhs, &pool, &AtomicBool::new(false), &arena)
            .unwrap();

        assert_eq!(sequential.len(), 5);
        assert_eq!(parallel.len(), 5);
    }

    #[test]
    fn test_count_distinct_parallel_merge_cancellation() {
        let func = CountDistinct;
        let arena = Arena::new();

        let mut rhs = func.new_state();
        for value in 0..10_000u64 {
            rhs.insert(value);
        }

        let pool = rayon::ThreadPoolBuilder::new().num_threads(2).build().unwrap();
        let mut state = func.new_state();
        let result =
            func.merge_parallel(&mut state, &rhs, &pool, &AtomicBool::new(true), &arena);
        assert!(matches!(result, Err(AggError::Cancelled)));
    }

    #[test]
    fn test_count_codegen_hooks() {
        #[derive(Default)]
        struct RecordingBuilder {
            instructions: Vec<String>,
            next: usize,
        }

        impl RecordingBuilder {
            fn fresh(&mut self) -> JitValue {
                self.next += 1;
                JitValue(self.next)
            }
        }

        impl JitBuilder for RecordingBuilder {
            fn const_i64(&mut self, value: i64) -> JitValue {
                self.instructions.push(format!("const {value}"));
                self.fresh()
            }

            fn load_i64(&mut self, ptr: JitValue, offset: usize) -> JitValue {
                self.instructions.push(format!("load {}+{offset}", ptr.0));
                self.fresh()
            }

            fn store_i64(&mut self, value: JitValue, ptr: JitValue, offset: usize) {
                self.instructions
                    .push(format!("store {} -> {}+{offset}", value.0, ptr.0));
            }

            fn add_i64(&mut self, lhs: JitValue, rhs: JitValue) -> JitValue {
                self.instructions.push(format!("add {} {}", lhs.0, rhs.0));
                self.fresh()
            }
        }

        let func = Count;
        let mut builder = RecordingBuilder::default();
        let state_ptr = JitValue(0);

        func.compile_create(&mut builder, state_ptr);
        func.compile_add(&mut builder, state_ptr, &[]);
        func.compile_merge(&mut builder, state_ptr, state_ptr);
        func.compile_get_result(&mut builder, state_ptr);

        assert_eq!(builder.instructions[0], "const 0");
        assert!(builder.instructions.len() >= 8);
    }
}
