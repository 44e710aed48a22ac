//! Aggregate function contract
//!
//! An [`AggregateFunction`] does not own the data it aggregates. It is a
//! description of one aggregate plus the methods for creating, destroying
//! and mutating accumulator states that live at caller-provided addresses,
//! typically rows of a hash table keyed by group. The executor allocates the
//! state memory and an [`Arena`] for overflow data, calls `create` once per
//! place, streams rows through the `add`/`add_batch*` family, merges partial
//! states across partitions, threads or nodes, and finally materializes a
//! result column with `insert_result_into` followed by `destroy`.

use crate::arena::Arena;
use crate::error::{AggError, Result};
use crate::io::ByteReader;

use super::properties::AggregateProperties;
use arrow::array::{Array, ArrayBuilder, ArrayRef, BooleanArray};
use arrow::datatypes::DataType;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

/// Address of one accumulator state. The memory is owned by the caller; the
/// framework only constructs, mutates and destructs the payload in place.
pub type AggDataPtr = *mut u8;

/// Read-only view of an accumulator state address.
pub type ConstAggDataPtr = *const u8;

/// Shared handle to an aggregate function description.
pub type AggregateFunctionPtr = Arc<dyn AggregateFunction>;

/// Plain function pointer bound to a concrete function's `add`.
///
/// Inner loops that call through this pointer beat calling through the
/// vtable slot: with a virtual call the compiler reloads the slot from
/// memory on every iteration of the loop.
///
/// # Safety
///
/// The first argument must be the same object the pointer was obtained from
/// via [`AggregateFunction::address_of_add_function`], and `place` must hold
/// a live state of that function.
pub type AddFn = unsafe fn(
    func: &dyn AggregateFunction,
    place: AggDataPtr,
    columns: &[ArrayRef],
    row: usize,
    arena: &Arena,
) -> Result<()>;

/// Sparse-encoded argument column: mostly-default values stored as
/// (row, value) pairs.
///
/// The values array carries the implicit default at index 0, so the value
/// for the k-th explicit row lives at index `k + 1`. `offsets` holds the
/// rows that have an explicit value, strictly increasing.
pub struct SparseColumn {
    values: ArrayRef,
    offsets: Vec<u64>,
    len: usize,
}

impl SparseColumn {
    pub fn try_new(values: ArrayRef, offsets: Vec<u64>, len: usize) -> Result<Self> {
        if values.len() != offsets.len() + 1 {
            return Err(AggError::InvalidArgument(format!(
                "sparse column has {} values for {} offsets; expected one extra leading default",
                values.len(),
                offsets.len()
            )));
        }
        if !offsets.windows(2).all(|w| w[0] < w[1]) {
            return Err(AggError::InvalidArgument(
                "sparse column offsets must be strictly increasing".to_string(),
            ));
        }
        if let Some(&last) = offsets.last() {
            if last as usize >= len {
                return Err(AggError::InvalidArgument(format!(
                    "sparse column offset {last} out of bounds for length {len}"
                )));
            }
        }
        Ok(Self {
            values,
            offsets,
            len,
        })
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Values column; index 0 is the implicit default.
    pub fn values(&self) -> &ArrayRef {
        &self.values
    }

    pub fn offsets(&self) -> &[u64] {
        &self.offsets
    }

    /// Iterate `(row, value_index)` over present values starting at the
    /// first explicit row >= `row_begin`.
    pub fn present_values_from(
        &self,
        row_begin: usize,
    ) -> impl Iterator<Item = (usize, usize)> + '_ {
        let start = self.offsets.partition_point(|&row| (row as usize) < row_begin);
        self.offsets[start..]
            .iter()
            .enumerate()
            .map(move |(i, &row)| (row as usize, start + i + 1))
    }

    /// Indexes into `offsets` of the present values inside `[row_begin, row_end)`.
    pub fn present_range(&self, row_begin: usize, row_end: usize) -> (usize, usize) {
        let from = self.offsets.partition_point(|&row| (row as usize) < row_begin);
        let to = self.offsets.partition_point(|&row| (row as usize) < row_end);
        (from, to)
    }
}

/// Downcast a filter argument column to boolean flags.
pub(crate) fn filter_flags(columns: &[ArrayRef], pos: usize) -> Result<&BooleanArray> {
    columns
        .get(pos)
        .and_then(|c| c.as_any().downcast_ref::<BooleanArray>())
        .ok_or_else(|| {
            AggError::InvalidArgument(format!("filter argument {pos} must be a boolean column"))
        })
}

/// The contract every aggregate function implements.
///
/// Most methods taking places are `unsafe fn`: the caller guarantees that
/// each place points to properly aligned, live state memory of this exact
/// function, created by `create` and not yet destroyed. `create` and
/// `destroy` must pair exactly once per place, including on error paths;
/// the batch methods uphold that pairing themselves when they fail midway.
///
/// Concrete functions normally implement [`TypedAggregate`] instead and
/// receive this whole contract through the devirtualized dispatch layer.
/// Combinator wrappers implement it directly, holding the wrapped function
/// by shared ownership and forwarding what they do not change.
///
/// [`TypedAggregate`]: super::typed::TypedAggregate
pub trait AggregateFunction: Send + Sync {
    /// Main function name.
    fn name(&self) -> &str;

    fn argument_types(&self) -> Vec<DataType>;

    fn result_type(&self) -> DataType;

    fn properties(&self) -> AggregateProperties;

    /// Size of the state payload; constant for a given function instance.
    fn size_of_data(&self) -> usize;

    /// Alignment of the state payload.
    fn align_of_data(&self) -> usize;

    /// True if `destroy` is a no-op and may be skipped.
    fn has_trivial_destructor(&self) -> bool;

    /// True if `add`/`merge`/`deserialize` may allocate from the arena.
    /// When false, the function must never allocate state-lifetime memory
    /// outside the place itself.
    fn allocates_memory_in_arena(&self) -> bool;

    /// Tells if the thread-pool `merge_parallel` overload could be used.
    fn is_able_to_parallelize_merge(&self) -> bool;

    /// Allows callers to replace `add_batch` with `add_batch_single_place`
    /// over ranges of consecutive equal keys.
    fn can_optimize_equal_keys_ranges(&self) -> bool {
        true
    }

    /// Whether the wire format carries version variants.
    fn is_versioned(&self) -> bool {
        false
    }

    /// Version to negotiate with peers that understand versioning. An
    /// unpinned version (`None`) on serialize/deserialize always means the
    /// pre-versioning (v0) wire format, for peers that predate it.
    fn default_version(&self) -> u64 {
        0
    }

    /// True for functions whose finalized value is itself an opaque state
    /// that can be merged further (the -State form).
    fn is_state(&self) -> bool {
        false
    }

    /// True for functions that only work as window functions.
    fn is_only_window_function(&self) -> bool {
        self.properties().is_window_function
    }

    /// Whether the codegen hooks of the compiler backend are implemented.
    fn is_compilable(&self) -> bool {
        false
    }

    /// Construct empty state at `place`. No side effects beyond the state.
    unsafe fn create(&self, place: AggDataPtr);

    /// Destruct state at `place`. Never fails.
    unsafe fn destroy(&self, place: AggDataPtr);

    /// Like `destroy`, but for a state built by a combinator stack it only
    /// destroys the layers added after the innermost state-retaining layer,
    /// whose blob the result column now owns.
    unsafe fn destroy_up_to_state(&self, place: AggDataPtr) {
        self.destroy(place);
    }

    /// Ingest one row's argument values into `place`.
    unsafe fn add(
        &self,
        place: AggDataPtr,
        columns: &[ArrayRef],
        row: usize,
        arena: &Arena,
    ) -> Result<()>;

    /// Ingest `count` copies of the row at index 0. Argument defaults must
    /// be at the 0-th positions in `columns`.
    unsafe fn add_many_defaults(
        &self,
        place: AggDataPtr,
        columns: &[ArrayRef],
        count: usize,
        arena: &Arena,
    ) -> Result<()>;

    /// Combine the contribution of `rhs` into `place`. Defined for any two
    /// states of this function regardless of how they were produced.
    unsafe fn merge(&self, place: AggDataPtr, rhs: ConstAggDataPtr, arena: &Arena) -> Result<()>;

    /// Thread-pool-capable merge. Only valid when
    /// [`is_able_to_parallelize_merge`](Self::is_able_to_parallelize_merge)
    /// is true; observably equivalent to the sequential `merge`. Returns
    /// [`AggError::Cancelled`] when the shared flag is raised; the caller
    /// must discard the outcome of a cancelled merge.
    unsafe fn merge_parallel(
        &self,
        place: AggDataPtr,
        rhs: ConstAggDataPtr,
        pool: &rayon::ThreadPool,
        is_cancelled: &AtomicBool,
        arena: &Arena,
    ) -> Result<()>;

    /// Merge each `src[i] + offset` into `dst[i] + offset`, then destroy the
    /// source state. Every source place is destroyed exactly once even when
    /// a merge fails or the flag cancels the batch midway.
    unsafe fn merge_and_destroy_batch(
        &self,
        dst_places: &[AggDataPtr],
        src_places: &[AggDataPtr],
        offset: usize,
        pool: &rayon::ThreadPool,
        is_cancelled: &AtomicBool,
        arena: &Arena,
    ) -> Result<()>;

    /// Serialize state, e.g. to transmit it over the network.
    unsafe fn serialize(
        &self,
        place: ConstAggDataPtr,
        sink: &mut Vec<u8>,
        version: Option<u64>,
    ) -> Result<()>;

    /// Devirtualized loop over `serialize` for `places[row_begin..row_end]`.
    unsafe fn serialize_batch(
        &self,
        places: &[AggDataPtr],
        row_begin: usize,
        row_end: usize,
        sink: &mut Vec<u8>,
        version: Option<u64>,
    ) -> Result<()>;

    /// Deserialize into a freshly created, still-empty state.
    unsafe fn deserialize(
        &self,
        place: AggDataPtr,
        source: &mut ByteReader<'_>,
        version: Option<u64>,
        arena: Option<&Arena>,
    ) -> Result<()>;

    /// Devirtualized create+deserialize of up to `limit` consecutive states
    /// packed `total_size_of_state` bytes apart starting at `place`.
    /// Successfully decoded places are pushed to `out` and stay valid on
    /// failure (the caller owns them); the state that failed to decode is
    /// destroyed before the error propagates.
    unsafe fn create_and_deserialize_batch(
        &self,
        out: &mut Vec<AggDataPtr>,
        place: AggDataPtr,
        total_size_of_state: usize,
        limit: usize,
        source: &mut ByteReader<'_>,
        version: Option<u64>,
        arena: Option<&Arena>,
    ) -> Result<()>;

    /// Append one finalized value to the result column. May rearrange the
    /// state internally (e.g. sort a buffer) but the state stays valid:
    /// subsequent `add`/`merge`/`insert_result_into` calls must remain
    /// correct, as required by incremental and window evaluation.
    unsafe fn insert_result_into(
        &self,
        place: AggDataPtr,
        to: &mut dyn ArrayBuilder,
        arena: &Arena,
    ) -> Result<()>;

    /// Same as `insert_result_into`, except -State functions override it to
    /// insert a fresh default value and merge `place` into it, so the result
    /// column element owns an independent copy instead of aliasing `place`.
    unsafe fn insert_merge_result_into(
        &self,
        place: AggDataPtr,
        to: &mut dyn ArrayBuilder,
        arena: &Arena,
    ) -> Result<()> {
        self.insert_result_into(place, to, arena)
    }

    /// Finalize a contiguous run of places into the result column. Each
    /// successfully inserted place is destroyed up to its -State layer; on
    /// failure at index `i`, places `[i, row_end)` are destroyed before the
    /// error propagates, so no state is leaked or destroyed twice no matter
    /// where the batch fails.
    unsafe fn insert_result_into_batch(
        &self,
        row_begin: usize,
        row_end: usize,
        places: &[AggDataPtr],
        place_offset: usize,
        to: &mut dyn ArrayBuilder,
        arena: &Arena,
    ) -> Result<()>;

    /// Destroy every place in a range without finalizing. Never fails; used
    /// for full cleanup, e.g. on query cancellation.
    unsafe fn destroy_batch(
        &self,
        row_begin: usize,
        row_end: usize,
        places: &[AggDataPtr],
        place_offset: usize,
    );

    /// Obtain the devirtualized `add` pointer for tight per-row loops.
    fn address_of_add_function(&self) -> AddFn;

    /// Loop over `add` for rows in `[row_begin, row_end)`. A null place
    /// skips the row (the row's group may not exist yet); `filter_pos`
    /// optionally names a boolean argument column whose false rows are
    /// skipped as well (conditional aggregation).
    unsafe fn add_batch(
        &self,
        row_begin: usize,
        row_end: usize,
        places: &[AggDataPtr],
        place_offset: usize,
        columns: &[ArrayRef],
        arena: &Arena,
        filter_pos: Option<usize>,
    ) -> Result<()>;

    /// The version of `add_batch` that handles a sparse argument column:
    /// only present values are fed, each into the place of its row.
    unsafe fn add_batch_sparse(
        &self,
        row_begin: usize,
        row_end: usize,
        places: &[AggDataPtr],
        place_offset: usize,
        column: &SparseColumn,
        arena: &Arena,
    ) -> Result<()>;

    /// The same for a single shared place (plain, non-grouped aggregation).
    unsafe fn add_batch_single_place(
        &self,
        row_begin: usize,
        row_end: usize,
        place: AggDataPtr,
        columns: &[ArrayRef],
        arena: &Arena,
        filter_pos: Option<usize>,
    ) -> Result<()>;

    /// Sparse single-place variant: the present run is fed through the
    /// ranged `add_batch_single_place`, the implicit-default remainder
    /// through `add_many_defaults`.
    unsafe fn add_batch_sparse_single_place(
        &self,
        row_begin: usize,
        row_end: usize,
        place: AggDataPtr,
        column: &SparseColumn,
        arena: &Arena,
    ) -> Result<()>;

    /// Single-place ingestion of only the rows whose `null_map` byte is
    /// zero; the condition is combined with the optional filter column.
    unsafe fn add_batch_single_place_not_null(
        &self,
        row_begin: usize,
        row_end: usize,
        place: AggDataPtr,
        columns: &[ArrayRef],
        null_map: &[u8],
        arena: &Arena,
        filter_pos: Option<usize>,
    ) -> Result<()>;

    /// For each row `i`, apply `add` once per raw-argument index in
    /// `[offsets[i-1], offsets[i])` against `places[i]` (row 0 starts at
    /// raw index 0). Supports aggregates applied per array element.
    unsafe fn add_batch_array(
        &self,
        row_begin: usize,
        row_end: usize,
        places: &[AggDataPtr],
        place_offset: usize,
        columns: &[ArrayRef],
        offsets: &[u64],
        arena: &Arena,
    ) -> Result<()>;

    /// Grouped aggregation keyed by a single byte: `map` is a 256-entry
    /// place lookup table indexed directly by `key[row]`; a place is lazily
    /// constructed through `init` on first use of its key.
    unsafe fn add_batch_lookup_table8(
        &self,
        row_begin: usize,
        row_end: usize,
        map: &mut [AggDataPtr; 256],
        place_offset: usize,
        init: &mut dyn FnMut(&mut AggDataPtr),
        key: &[u8],
        columns: &[ArrayRef],
        arena: &Arena,
    ) -> Result<()>;

    /// Merge each `rhs[i]` into `places[i] + place_offset` for non-null
    /// places.
    unsafe fn merge_batch(
        &self,
        row_begin: usize,
        row_end: usize,
        places: &[AggDataPtr],
        place_offset: usize,
        rhs: &[ConstAggDataPtr],
        pool: &rayon::ThreadPool,
        is_cancelled: &AtomicBool,
        arena: &Arena,
    ) -> Result<()>;

    /// Predict result values from a trained model state for rows in
    /// `[offset, offset + limit)`. Extension point for machine learning
    /// functions; everything else reports it as unsupported.
    unsafe fn predict_values(
        &self,
        _place: ConstAggDataPtr,
        _to: &mut dyn ArrayBuilder,
        _arguments: &[ArrayRef],
        _offset: usize,
        _limit: usize,
    ) -> Result<()> {
        Err(AggError::NotSupported(format!(
            "aggregate function {} cannot predict values",
            self.name()
        )))
    }

    /// Return the wrapped function if this is a combinator, else None.
    fn get_nested_function(&self) -> Option<AggregateFunctionPtr> {
        None
    }

    /// By default all NULLs are skipped through a generic null-handling
    /// wrapper. A function that wants different behavior returns its own
    /// adapter here; `nested` is a shared handle to this function itself.
    fn get_own_null_adapter(
        &self,
        _nested: &AggregateFunctionPtr,
        _arguments: &[DataType],
        _properties: &AggregateProperties,
    ) -> Option<AggregateFunctionPtr> {
        None
    }

    /// Argument positions that are allowed to be entirely NULL without
    /// disabling aggregation (e.g. a condition argument).
    fn arguments_that_can_be_only_null(&self) -> Vec<usize> {
        Vec::new()
    }
}
