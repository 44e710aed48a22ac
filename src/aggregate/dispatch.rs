//! Devirtualized batch dispatch
//!
//! One blanket impl hands the whole [`AggregateFunction`] contract to every
//! [`TypedAggregate`]. All batch, sparse, filtered and grouped variants are
//! expressed purely in terms of the typed single-row `add` and single-state
//! `merge`/`serialize` operations, monomorphized per concrete function so
//! the loop bodies compile to direct calls. Virtual dispatch is paid once
//! per batch at the contract boundary, never per row.

use crate::arena::Arena;
use crate::error::{AggError, Result};
use crate::io::ByteReader;

use super::contract::{
    filter_flags, AddFn, AggDataPtr, AggregateFunction, ConstAggDataPtr, SparseColumn,
};
use super::properties::AggregateProperties;
use super::typed::{
    add_batch_lookup_table8_inline, qualifies_for_inline_lookup, state_mut, state_ref,
    TypedAggregate,
};
use arrow::array::{ArrayBuilder, ArrayRef};
use arrow::datatypes::DataType;
use std::mem;
use std::ptr;
use std::sync::atomic::{AtomicBool, Ordering};

/// Free function bound to `T`'s `add`, handed out as the devirtualized add
/// pointer.
///
/// # Safety
///
/// `func` must be the very `T` instance the pointer was obtained from and
/// `place` a live state of it.
unsafe fn add_free<T: TypedAggregate>(
    func: &dyn AggregateFunction,
    place: AggDataPtr,
    columns: &[ArrayRef],
    row: usize,
    arena: &Arena,
) -> Result<()> {
    let func = &*(func as *const dyn AggregateFunction).cast::<T>();
    TypedAggregate::add(func, state_mut::<T::State>(place), columns, row, arena)
}

/// Generic byte-keyed lookup-table loop: 8-way unrolled place resolution to
/// break the dependency between consecutive "maybe init, then add" steps,
/// plus a scalar tail.
unsafe fn add_batch_lookup_table8_generic<T: TypedAggregate>(
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
    const UNROLL_COUNT: usize = 8;

    let mut i = row_begin;

    let unrolled_end = row_begin + (row_end - row_begin) / UNROLL_COUNT * UNROLL_COUNT;
    while i < unrolled_end {
        let mut places = [ptr::null_mut::<u8>(); UNROLL_COUNT];
        for j in 0..UNROLL_COUNT {
            let place = &mut map[key[i + j] as usize];
            if place.is_null() {
                init(place);
            }
            places[j] = *place;
        }

        for j in 0..UNROLL_COUNT {
            TypedAggregate::add(
                func,
                state_mut::<T::State>(places[j].add(place_offset)),
                columns,
                i + j,
                arena,
            )?;
        }
        i += UNROLL_COUNT;
    }

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

impl<T: TypedAggregate> AggregateFunction for T {
    fn name(&self) -> &str {
        TypedAggregate::name(self)
    }

    fn argument_types(&self) -> Vec<DataType> {
        TypedAggregate::argument_types(self)
    }

    fn result_type(&self) -> DataType {
        TypedAggregate::result_type(self)
    }

    fn properties(&self) -> AggregateProperties {
        TypedAggregate::properties(self)
    }

    fn size_of_data(&self) -> usize {
        mem::size_of::<T::State>()
    }

    fn align_of_data(&self) -> usize {
        mem::align_of::<T::State>()
    }

    fn has_trivial_destructor(&self) -> bool {
        !mem::needs_drop::<T::State>()
    }

    fn allocates_memory_in_arena(&self) -> bool {
        TypedAggregate::allocates_memory_in_arena(self)
    }

    fn is_able_to_parallelize_merge(&self) -> bool {
        TypedAggregate::is_able_to_parallelize_merge(self)
    }

    fn can_optimize_equal_keys_ranges(&self) -> bool {
        TypedAggregate::can_optimize_equal_keys_ranges(self)
    }

    fn is_versioned(&self) -> bool {
        TypedAggregate::is_versioned(self)
    }

    fn default_version(&self) -> u64 {
        TypedAggregate::default_version(self)
    }

    fn is_state(&self) -> bool {
        TypedAggregate::is_state(self)
    }

    fn is_compilable(&self) -> bool {
        TypedAggregate::is_compilable(self)
    }

    unsafe fn create(&self, place: AggDataPtr) {
        ptr::write(place.cast::<T::State>(), self.new_state());
    }

    unsafe fn destroy(&self, place: AggDataPtr) {
        if mem::needs_drop::<T::State>() {
            ptr::drop_in_place(place.cast::<T::State>());
        }
    }

    unsafe fn add(
        &self,
        place: AggDataPtr,
        columns: &[ArrayRef],
        row: usize,
        arena: &Arena,
    ) -> Result<()> {
        TypedAggregate::add(self, state_mut::<T::State>(place), columns, row, arena)
    }

    unsafe fn add_many_defaults(
        &self,
        place: AggDataPtr,
        columns: &[ArrayRef],
        count: usize,
        arena: &Arena,
    ) -> Result<()> {
        TypedAggregate::add_many_defaults(
            self,
            state_mut::<T::State>(place),
            columns,
            count,
            arena,
        )
    }

    unsafe fn merge(&self, place: AggDataPtr, rhs: ConstAggDataPtr, arena: &Arena) -> Result<()> {
        TypedAggregate::merge(
            self,
            state_mut::<T::State>(place),
            state_ref::<T::State>(rhs),
            arena,
        )
    }

    unsafe fn merge_parallel(
        &self,
        place: AggDataPtr,
        rhs: ConstAggDataPtr,
        pool: &rayon::ThreadPool,
        is_cancelled: &AtomicBool,
        arena: &Arena,
    ) -> Result<()> {
        TypedAggregate::merge_parallel(
            self,
            state_mut::<T::State>(place),
            state_ref::<T::State>(rhs),
            pool,
            is_cancelled,
            arena,
        )
    }

    unsafe fn merge_and_destroy_batch(
        &self,
        dst_places: &[AggDataPtr],
        src_places: &[AggDataPtr],
        offset: usize,
        pool: &rayon::ThreadPool,
        is_cancelled: &AtomicBool,
        arena: &Arena,
    ) -> Result<()> {
        debug_assert_eq!(dst_places.len(), src_places.len());

        for i in 0..dst_places.len() {
            let dst = dst_places[i].add(offset);
            let src = src_places[i].add(offset);

            let merged = if is_cancelled.load(Ordering::Relaxed) {
                tracing::debug!(
                    function = TypedAggregate::name(self),
                    remaining = dst_places.len() - i,
                    "parallel merge batch cancelled"
                );
                Err(AggError::Cancelled)
            } else if T::PARALLELIZE_MERGE_WITH_KEY {
                TypedAggregate::merge_parallel(
                    self,
                    state_mut::<T::State>(dst),
                    state_ref::<T::State>(src),
                    pool,
                    is_cancelled,
                    arena,
                )
            } else {
                TypedAggregate::merge(
                    self,
                    state_mut::<T::State>(dst),
                    state_ref::<T::State>(src),
                    arena,
                )
            };

            match merged {
                Ok(()) => AggregateFunction::destroy(self, src),
                Err(e) => {
                    // Source states are consumed by this call: each one is
                    // destroyed exactly once even when the batch stops early.
                    for j in i..src_places.len() {
                        AggregateFunction::destroy(self, src_places[j].add(offset));
                    }
                    return Err(e);
                }
            }
        }

        Ok(())
    }

    unsafe fn serialize(
        &self,
        place: ConstAggDataPtr,
        sink: &mut Vec<u8>,
        version: Option<u64>,
    ) -> Result<()> {
        TypedAggregate::serialize(self, state_ref::<T::State>(place), sink, version)
    }

    unsafe fn serialize_batch(
        &self,
        places: &[AggDataPtr],
        row_begin: usize,
        row_end: usize,
        sink: &mut Vec<u8>,
        version: Option<u64>,
    ) -> Result<()> {
        for place in &places[row_begin..row_end] {
            TypedAggregate::serialize(self, state_ref::<T::State>(*place), sink, version)?;
        }
        Ok(())
    }

    unsafe fn deserialize(
        &self,
        place: AggDataPtr,
        source: &mut ByteReader<'_>,
        version: Option<u64>,
        arena: Option<&Arena>,
    ) -> Result<()> {
        TypedAggregate::deserialize(self, state_mut::<T::State>(place), source, version, arena)
    }

    unsafe fn create_and_deserialize_batch(
        &self,
        out: &mut Vec<AggDataPtr>,
        place: AggDataPtr,
        total_size_of_state: usize,
        limit: usize,
        source: &mut ByteReader<'_>,
        version: Option<u64>,
        arena: Option<&Arena>,
    ) -> Result<()> {
        let mut place = place;
        for _ in 0..limit {
            if source.is_empty() {
                break;
            }

            AggregateFunction::create(self, place);
            if let Err(e) =
                AggregateFunction::deserialize(self, place, source, version, arena)
            {
                // The half-decoded state is torn down here; states already
                // pushed to `out` stay valid and belong to the caller.
                AggregateFunction::destroy(self, place);
                return Err(e);
            }

            out.push(place);
            place = place.add(total_size_of_state);
        }
        Ok(())
    }

    unsafe fn insert_result_into(
        &self,
        place: AggDataPtr,
        to: &mut dyn ArrayBuilder,
        arena: &Arena,
    ) -> Result<()> {
        TypedAggregate::insert_result_into(self, state_mut::<T::State>(place), to, arena)
    }

    unsafe fn insert_merge_result_into(
        &self,
        place: AggDataPtr,
        to: &mut dyn ArrayBuilder,
        arena: &Arena,
    ) -> Result<()> {
        TypedAggregate::insert_merge_result_into(self, state_mut::<T::State>(place), to, arena)
    }

    unsafe fn insert_result_into_batch(
        &self,
        row_begin: usize,
        row_end: usize,
        places: &[AggDataPtr],
        place_offset: usize,
        to: &mut dyn ArrayBuilder,
        arena: &Arena,
    ) -> Result<()> {
        for i in row_begin..row_end {
            let place = places[i].add(place_offset);
            match AggregateFunction::insert_result_into(self, place, to, arena) {
                // For a -State function ownership of the inserted blob moves
                // to the result column, so only the layers above it go.
                Ok(()) => AggregateFunction::destroy_up_to_state(self, place),
                Err(e) => {
                    for j in i..row_end {
                        AggregateFunction::destroy(self, places[j].add(place_offset));
                    }
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    unsafe fn destroy_batch(
        &self,
        row_begin: usize,
        row_end: usize,
        places: &[AggDataPtr],
        place_offset: usize,
    ) {
        for place in &places[row_begin..row_end] {
            AggregateFunction::destroy(self, place.add(place_offset));
        }
    }

    fn address_of_add_function(&self) -> AddFn {
        add_free::<T>
    }

    unsafe fn add_batch(
        &self,
        row_begin: usize,
        row_end: usize,
        places: &[AggDataPtr],
        place_offset: usize,
        columns: &[ArrayRef],
        arena: &Arena,
        filter_pos: Option<usize>,
    ) -> Result<()> {
        if let Some(pos) = filter_pos {
            let flags = filter_flags(columns, pos)?;
            for i in row_begin..row_end {
                if flags.value(i) && !places[i].is_null() {
                    TypedAggregate::add(
                        self,
                        state_mut::<T::State>(places[i].add(place_offset)),
                        columns,
                        i,
                        arena,
                    )?;
                }
            }
        } else {
            for i in row_begin..row_end {
                if !places[i].is_null() {
                    TypedAggregate::add(
                        self,
                        state_mut::<T::State>(places[i].add(place_offset)),
                        columns,
                        i,
                        arena,
                    )?;
                }
            }
        }
        Ok(())
    }

    unsafe fn add_batch_sparse(
        &self,
        row_begin: usize,
        row_end: usize,
        places: &[AggDataPtr],
        place_offset: usize,
        column: &SparseColumn,
        arena: &Arena,
    ) -> Result<()> {
        let values = std::slice::from_ref(column.values());
        for (row, value_index) in column.present_values_from(row_begin) {
            if row >= row_end {
                break;
            }
            if places[row].is_null() {
                continue;
            }
            TypedAggregate::add(
                self,
                state_mut::<T::State>(places[row].add(place_offset)),
                values,
                value_index,
                arena,
            )?;
        }
        Ok(())
    }

    unsafe fn add_batch_single_place(
        &self,
        row_begin: usize,
        row_end: usize,
        place: AggDataPtr,
        columns: &[ArrayRef],
        arena: &Arena,
        filter_pos: Option<usize>,
    ) -> Result<()> {
        let state = state_mut::<T::State>(place);
        if let Some(pos) = filter_pos {
            let flags = filter_flags(columns, pos)?;
            for i in row_begin..row_end {
                if flags.value(i) {
                    TypedAggregate::add(self, state, columns, i, arena)?;
                }
            }
        } else {
            for i in row_begin..row_end {
                TypedAggregate::add(self, state, columns, i, arena)?;
            }
        }
        Ok(())
    }

    unsafe fn add_batch_sparse_single_place(
        &self,
        row_begin: usize,
        row_end: usize,
        place: AggDataPtr,
        column: &SparseColumn,
        arena: &Arena,
    ) -> Result<()> {
        let values = std::slice::from_ref(column.values());
        let (from, to) = column.present_range(row_begin, row_end);
        let num_defaults = (row_end - row_begin) - (to - from);

        if from < to {
            // Present values sit one past their offset index in the values
            // column because of the leading implicit default.
            AggregateFunction::add_batch_single_place(
                self,
                from + 1,
                to + 1,
                place,
                values,
                arena,
                None,
            )?;
        }
        if num_defaults > 0 {
            AggregateFunction::add_many_defaults(self, place, values, num_defaults, arena)?;
        }
        Ok(())
    }

    unsafe fn add_batch_single_place_not_null(
        &self,
        row_begin: usize,
        row_end: usize,
        place: AggDataPtr,
        columns: &[ArrayRef],
        null_map: &[u8],
        arena: &Arena,
        filter_pos: Option<usize>,
    ) -> Result<()> {
        let state = state_mut::<T::State>(place);
        if let Some(pos) = filter_pos {
            let flags = filter_flags(columns, pos)?;
            for i in row_begin..row_end {
                if null_map[i] == 0 && flags.value(i) {
                    TypedAggregate::add(self, state, columns, i, arena)?;
                }
            }
        } else {
            for i in row_begin..row_end {
                if null_map[i] == 0 {
                    TypedAggregate::add(self, state, columns, i, arena)?;
                }
            }
        }
        Ok(())
    }

    unsafe fn add_batch_array(
        &self,
        row_begin: usize,
        row_end: usize,
        places: &[AggDataPtr],
        place_offset: usize,
        columns: &[ArrayRef],
        offsets: &[u64],
        arena: &Arena,
    ) -> Result<()> {
        let mut current_offset = if row_begin == 0 {
            0
        } else {
            offsets[row_begin - 1] as usize
        };

        for i in row_begin..row_end {
            let next_offset = offsets[i] as usize;
            if !places[i].is_null() {
                let state = state_mut::<T::State>(places[i].add(place_offset));
                for j in current_offset..next_offset {
                    TypedAggregate::add(self, state, columns, j, arena)?;
                }
            }
            current_offset = next_offset;
        }
        Ok(())
    }

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
    ) -> Result<()> {
        if qualifies_for_inline_lookup(self) {
            add_batch_lookup_table8_inline(
                self,
                row_begin,
                row_end,
                map,
                place_offset,
                init,
                key,
                columns,
                arena,
            )
        } else {
            add_batch_lookup_table8_generic(
                self,
                row_begin,
                row_end,
                map,
                place_offset,
                init,
                key,
                columns,
                arena,
            )
        }
    }

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
    ) -> Result<()> {
        for i in row_begin..row_end {
            if places[i].is_null() {
                continue;
            }
            let dst = state_mut::<T::State>(places[i].add(place_offset));
            let src = state_ref::<T::State>(rhs[i]);
            if T::PARALLELIZE_MERGE_WITH_KEY {
                TypedAggregate::merge_parallel(self, dst, src, pool, is_cancelled, arena)?;
            } else {
                TypedAggregate::merge(self, dst, src, arena)?;
            }
        }
        Ok(())
    }
}
