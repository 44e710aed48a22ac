//! Typed state binding
//!
//! [`TypedAggregate`] is what concrete aggregate functions implement: it
//! binds a concrete state payload type to the contract and expresses the
//! whole single-row behavior against `&mut State` instead of raw places.
//! The dispatch layer derives `create`/`destroy`/`size_of_data`/
//! `align_of_data` from the payload type itself, so the trivial-destructor
//! flag can never disagree with the destructor: both come from
//! `mem::needs_drop` on the same type.
//!
//! This module also holds the bucketed fast path for byte-keyed grouped
//! aggregation over small inline payloads.

use crate::arena::Arena;
use crate::error::{AggError, Result};
use crate::io::ByteReader;

use super::contract::AggDataPtr;
use super::properties::AggregateProperties;
use arrow::array::{ArrayBuilder, ArrayRef};
use arrow::datatypes::DataType;
use std::mem::{self, MaybeUninit};
use std::sync::atomic::AtomicBool;

/// Payloads at or below this size qualify for the inline lookup-table fast
/// path. A heuristic tied to cache-line reasoning, tunable; correctness does
/// not depend on the exact cutoff.
pub const INLINE_STATE_BUDGET: usize = 16;

/// View a place as a mutable typed state reference.
///
/// # Safety
///
/// `place` must point to a live, properly aligned `S` created by this
/// function's `create` and not yet destroyed.
#[inline(always)]
pub unsafe fn state_mut<'a, S>(place: AggDataPtr) -> &'a mut S {
    &mut *place.cast::<S>()
}

/// View a place as a shared typed state reference.
///
/// # Safety
///
/// Same requirements as [`state_mut`].
#[inline(always)]
pub unsafe fn state_ref<'a, S>(place: *const u8) -> &'a S {
    &*place.cast::<S>()
}

/// A concrete aggregate function bound to its state payload type.
///
/// Implementors provide the single-row and single-state operations; every
/// batch, sparse, filtered and grouped variant of the contract is generated
/// from these by the dispatch layer, monomorphized so the hot loop bodies
/// contain only direct calls.
pub trait TypedAggregate: Send + Sync + Sized + 'static {
    /// State payload. Lives at caller-provided addresses; may internally
    /// reference arena memory for variable-length content.
    type State: Send;

    /// Statically selects the keyed parallel merge inside the batch merge
    /// loops; the branch folds away at monomorphization.
    const PARALLELIZE_MERGE_WITH_KEY: bool = false;

    fn name(&self) -> &str;

    fn argument_types(&self) -> Vec<DataType>;

    fn result_type(&self) -> DataType;

    fn properties(&self) -> AggregateProperties {
        AggregateProperties::default()
    }

    /// Build an empty state value.
    fn new_state(&self) -> Self::State;

    fn allocates_memory_in_arena(&self) -> bool {
        false
    }

    fn is_able_to_parallelize_merge(&self) -> bool {
        false
    }

    fn can_optimize_equal_keys_ranges(&self) -> bool {
        true
    }

    fn is_versioned(&self) -> bool {
        false
    }

    fn default_version(&self) -> u64 {
        0
    }

    fn is_state(&self) -> bool {
        false
    }

    fn is_compilable(&self) -> bool {
        false
    }

    /// Ingest one row's argument values.
    fn add(
        &self,
        state: &mut Self::State,
        columns: &[ArrayRef],
        row: usize,
        arena: &Arena,
    ) -> Result<()>;

    /// Ingest `count` copies of the row at index 0.
    fn add_many_defaults(
        &self,
        state: &mut Self::State,
        columns: &[ArrayRef],
        count: usize,
        arena: &Arena,
    ) -> Result<()> {
        for _ in 0..count {
            self.add(state, columns, 0, arena)?;
        }
        Ok(())
    }

    /// Combine `rhs` into `state`.
    fn merge(&self, state: &mut Self::State, rhs: &Self::State, arena: &Arena) -> Result<()>;

    /// Thread-pool-capable merge; override together with
    /// [`is_able_to_parallelize_merge`](Self::is_able_to_parallelize_merge).
    fn merge_parallel(
        &self,
        _state: &mut Self::State,
        _rhs: &Self::State,
        _pool: &rayon::ThreadPool,
        _is_cancelled: &AtomicBool,
        _arena: &Arena,
    ) -> Result<()> {
        Err(AggError::NotSupported(format!(
            "aggregate function {} does not support parallel merge",
            self.name()
        )))
    }

    fn serialize(
        &self,
        state: &Self::State,
        sink: &mut Vec<u8>,
        version: Option<u64>,
    ) -> Result<()>;

    /// Called only on a freshly created, still-empty state.
    fn deserialize(
        &self,
        state: &mut Self::State,
        source: &mut ByteReader<'_>,
        version: Option<u64>,
        arena: Option<&Arena>,
    ) -> Result<()>;

    /// Append one finalized value. May rearrange the state, which must stay
    /// valid for subsequent `add`/`merge`/`insert_result_into`.
    fn insert_result_into(
        &self,
        state: &mut Self::State,
        to: &mut dyn ArrayBuilder,
        arena: &Arena,
    ) -> Result<()>;

    /// -State functions override this to hand the result column an
    /// independent merged copy instead of the finalized value.
    fn insert_merge_result_into(
        &self,
        state: &mut Self::State,
        to: &mut dyn ArrayBuilder,
        arena: &Arena,
    ) -> Result<()> {
        self.insert_result_into(state, to, arena)
    }
}

/// Whether a function's payload qualifies for the inline lookup-table path:
/// small, trivially destructible and free of arena references, so scratch
/// copies can be kept in flat arrays and discarded wholesale.
pub(crate) fn qualifies_for_inline_lookup<T: TypedAggregate>(func: &T) -> bool {
    mem::size_of::<T::State>() <= INLINE_STATE_BUDGET
        && !mem::needs_drop::<T::State>()
        && !func.allocates_memory_in_arena()
}

/// Byte-keyed grouped aggregation over 4 parallel inline lookup tables.
///
/// Instead of one table of place pointers, rows `i` are routed to scratch
/// table `i % 4` of inline payload slots, which removes both the pointer
/// indirection and the lazy-null-check from the unrolled loop. Presence is
/// tracked in a separate flag array so the payload array itself is never
/// zero-initialized. After the unrolled loop every key is scanned once and
/// each present slot is merged into the caller's real table, allocating the
/// real place lazily; remainder rows go directly to the real table.
///
/// # Safety
///
/// Same place-validity requirements as the generic lookup-table loop; must
/// only be called when [`qualifies_for_inline_lookup`] holds.
pub(crate) unsafe fn add_batch_lookup_table8_inline<T: TypedAggregate>(
    func: &T,
    row_begin: usize,
    row_end: usize,
    map: &mut [AggDataPtr; 256],
    place_offset: usize,
    init: &mut dyn FnMut(&mut AggDataPtr),
    key: &[u8],
    columns: &[ArrayRef],
    arena: &Arena,
) -> Result<()> {
    const UNROLL_COUNT: usize = 4;

    let mut scratch: Vec<MaybeUninit<T::State>> = Vec::new();
    scratch.resize_with(256 * UNROLL_COUNT, MaybeUninit::uninit);
    let mut has_data = [false; 256 * UNROLL_COUNT];

    let mut i = row_begin;

    // Aggregate into the scratch tables.
    let unrolled_end = row_begin + (row_end - row_begin) / UNROLL_COUNT * UNROLL_COUNT;
    while i < unrolled_end {
        for j in 0..UNROLL_COUNT {
            let idx = j * 256 + key[i + j] as usize;
            if !has_data[idx] {
                scratch[idx].write(TypedAggregate::new_state(func));
                has_data[idx] = true;
            }
            TypedAggregate::add(func, scratch[idx].assume_init_mut(), columns, i + j, arena)?;
        }
        i += UNROLL_COUNT;
    }

    // Merge every present scratch slot into the final destination.
    for k in 0..256 {
        for j in 0..UNROLL_COUNT {
            let idx = j * 256 + k;
            if has_data[idx] {
                let place = &mut map[k];
                if place.is_null() {
                    init(place);
                }
                TypedAggregate::merge(
                    func,
                    state_mut::<T::State>(place.add(place_offset)),
                    scratch[idx].assume_init_ref(),
                    arena,
                )?;
            }
        }
    }

    // Tail rows go directly to the final destination.
    while i < row_end {
        let place = &mut map[key[i] as usize];
        if place.is_null() {
            init(place);
        }
        TypedAggregate::add(
            func,
            state_mut::<T::State>(place.add(place_offset)),
            columns,
            i,
            arena,
        )?;
        i += 1;
    }

    Ok(())
}
