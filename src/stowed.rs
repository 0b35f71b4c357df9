/// Stowed-object engine: deep copies, element-wise stores, rowing
/// coercions and descriptor-only rewrites over rows, structs and unions.
///
/// Cloning walks source descriptors dimension by dimension with the
/// tuple iterator, so non-contiguous sources (trims, transposes, row and
/// column views) copy correctly. Empty rows still materialise one ghost
/// element so every descriptor stays addressable.

use crate::errors::GenieError;
use crate::mem::{Heap, HeapObj};
use crate::mode::{ModeId, ModeTable};
use crate::value::{Name, RowDesc, Target, Tuple, TupleIter, Value};

// ---------------------------------------------------------------------------
// Deep copy
// ---------------------------------------------------------------------------

/// Deep-copy one value: rows and sound samples are re-materialised in
/// fresh heap storage, united members recurse, everything else copies
/// by value.
pub fn clone_value(heap: &mut Heap, modes: &ModeTable, v: &Value) -> Result<Value, GenieError> {
    match v {
        Value::Row(desc) => {
            let cloned = clone_row(heap, modes, desc, None)?;
            Ok(Value::Row(Box::new(cloned)))
        }
        Value::United(m, slots) => {
            let inner = clone_slots(heap, modes, slots)?;
            Ok(Value::United(*m, inner.into_boxed_slice()))
        }
        Value::Sound(s) => {
            let words = heap.slots(s.samples).to_vec();
            let samples = heap.alloc(crate::mode::M_SOUND, HeapObj::Slots(words))?;
            Ok(Value::Sound(Box::new(crate::value::SoundVal { samples, ..*s.clone() })))
        }
        other => Ok(other.clone()),
    }
}

/// Deep-copy a run of slots (one value of a flattened mode).
pub fn clone_slots(
    heap: &mut Heap,
    modes: &ModeTable,
    src: &[Value],
) -> Result<Vec<Value>, GenieError> {
    let mut out = Vec::with_capacity(src.len());
    for v in src {
        out.push(clone_value(heap, modes, v)?);
    }
    Ok(out)
}

/// Deep-copy a row into fresh contiguous storage. With a destination
/// template the clone adopts the template's bounds; a template that
/// demands elements an empty source cannot supply is the
/// empty-value-from error.
pub fn clone_row(
    heap: &mut Heap,
    modes: &ModeTable,
    src: &RowDesc,
    dst_template: Option<&RowDesc>,
) -> Result<RowDesc, GenieError> {
    let tuples: Vec<Tuple> = match dst_template {
        Some(t) => {
            if src.is_empty_row() && t.tuples.iter().all(|tp| tp.size() > 0) {
                return Err(GenieError::EmptyValueFrom {
                    mode: modes.spell(src.elem_mode),
                });
            }
            fresh_tuples(&t.tuples)
        }
        None => fresh_tuples(&src.tuples),
    };
    let elem_size = src.elem_size;

    // Gather source elements first; nested clones may allocate.
    let mut gathered: Vec<Vec<Value>> = Vec::new();
    for indices in TupleIter::new(src) {
        let at = src.slot_of(&indices)?;
        let slots = heap.slots(src.elems)[at..at + elem_size].to_vec();
        gathered.push(slots);
    }

    let mut flat: Vec<Value> = Vec::with_capacity(gathered.len().max(1) * elem_size);
    for slots in &gathered {
        flat.extend(clone_slots(heap, modes, slots)?);
    }
    if flat.is_empty() {
        // Ghost element keeps the descriptor addressable.
        flat.extend(std::iter::repeat(Value::Empty).take(elem_size.max(1)));
    }

    let elems = heap.alloc(src.elem_mode, HeapObj::Slots(flat))?;
    let out = RowDesc { elem_mode: src.elem_mode, elem_size, field: 0, elems, tuples };
    out.check_size()?;
    Ok(out)
}

/// Fresh row-major tuples with the same bounds.
fn fresh_tuples(bounds: &[Tuple]) -> Vec<Tuple> {
    let mut spans = vec![1i64; bounds.len()];
    for i in (0..bounds.len().saturating_sub(1)).rev() {
        spans[i] = spans[i + 1] * bounds[i + 1].size().max(1);
    }
    bounds
        .iter()
        .zip(spans)
        .map(|(t, span)| Tuple::new(t.lower, t.upper, span))
        .collect()
}

// ---------------------------------------------------------------------------
// Element-wise store
// ---------------------------------------------------------------------------

/// Copy `src` into the existing destination descriptor. Bounds must
/// match exactly.
pub fn store_row(
    heap: &mut Heap,
    modes: &ModeTable,
    dst: &RowDesc,
    src: &RowDesc,
) -> Result<(), GenieError> {
    if dst.dims() != src.dims()
        || dst
            .tuples
            .iter()
            .zip(&src.tuples)
            .any(|(a, b)| a.lower != b.lower || a.upper != b.upper)
    {
        return Err(GenieError::DifferentBounds);
    }
    for indices in TupleIter::new(src) {
        let from = src.slot_of(&indices)?;
        let slots = heap.slots(src.elems)[from..from + src.elem_size].to_vec();
        let cloned = clone_slots(heap, modes, &slots)?;
        let to = dst.slot_of(&indices)?;
        let dst_slots = heap.slots_mut(dst.elems);
        dst_slots[to..to + dst.elem_size].clone_from_slice(&cloned);
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Row construction
// ---------------------------------------------------------------------------

/// Build a 1-D row of `n` values taken from `slots` (n · elem_size of
/// them); elements containing rows are cloned.
pub fn make_row(
    heap: &mut Heap,
    modes: &ModeTable,
    elem_mode: ModeId,
    n: usize,
    slots: &[Value],
) -> Result<RowDesc, GenieError> {
    let elem_size = modes.size(elem_mode).max(1);
    debug_assert_eq!(slots.len(), n * elem_size);
    let mut flat = clone_slots(heap, modes, slots)?;
    if flat.is_empty() {
        flat.extend(std::iter::repeat(Value::Empty).take(elem_size));
    }
    let elems = heap.alloc(elem_mode, HeapObj::Slots(flat))?;
    let desc = RowDesc {
        elem_mode,
        elem_size,
        field: 0,
        elems,
        tuples: vec![Tuple::new(1, n as i64, 1)],
    };
    desc.check_size()?;
    Ok(desc)
}

/// Concatenate `n` equi-shaped rows into one row of rank one higher.
pub fn make_rowrow(
    heap: &mut Heap,
    modes: &ModeTable,
    rows: &[RowDesc],
) -> Result<RowDesc, GenieError> {
    let first = rows.first().ok_or(GenieError::DifferentBounds)?;
    for r in rows.iter().skip(1) {
        if r.dims() != first.dims()
            || r.tuples
                .iter()
                .zip(&first.tuples)
                .any(|(a, b)| a.lower != b.lower || a.upper != b.upper)
        {
            return Err(GenieError::DifferentBounds);
        }
    }

    let elem_size = first.elem_size;
    let inner: i64 = first.elem_count();
    let mut flat: Vec<Value> = Vec::with_capacity((rows.len() as i64 * inner).max(1) as usize * elem_size);
    for r in rows {
        for indices in TupleIter::new(r) {
            let at = r.slot_of(&indices)?;
            let slots = heap.slots(r.elems)[at..at + elem_size].to_vec();
            flat.extend(clone_slots(heap, modes, &slots)?);
        }
    }
    if flat.is_empty() {
        flat.extend(std::iter::repeat(Value::Empty).take(elem_size.max(1)));
    }

    let mut tuples = Vec::with_capacity(first.dims() + 1);
    tuples.push(Tuple::new(1, rows.len() as i64, inner.max(1)));
    tuples.extend(fresh_tuples(&first.tuples));
    let elems = heap.alloc(first.elem_mode, HeapObj::Slots(flat))?;
    let desc = RowDesc { elem_mode: first.elem_mode, elem_size, field: 0, elems, tuples };
    desc.check_size()?;
    Ok(desc)
}

/// Rowing coercion on a name: a `[1:1]` descriptor over the referenced
/// storage. Rowing NIL yields NIL. Heap targets alias; frame targets are
/// first lifted to the heap.
pub fn make_ref_row_of_row(
    heap: &mut Heap,
    modes: &ModeTable,
    name: Name,
    elem_mode: ModeId,
    frame_slots: Option<&[Value]>,
) -> Result<Option<RowDesc>, GenieError> {
    let elem_size = modes.size(elem_mode).max(1);
    match name.target {
        Target::Nil => Ok(None),
        Target::Heap { handle, offset } => Ok(Some(RowDesc {
            elem_mode,
            elem_size,
            field: offset,
            elems: handle,
            tuples: vec![Tuple::new(1, 1, 1)],
        })),
        Target::Frame { .. } => {
            let slots = frame_slots.expect("frame target needs its slots");
            let lifted = clone_slots(heap, modes, &slots[..elem_size])?;
            let elems = heap.alloc(elem_mode, HeapObj::Slots(lifted))?;
            Ok(Some(RowDesc {
                elem_mode,
                elem_size,
                field: 0,
                elems,
                tuples: vec![Tuple::new(1, 1, 1)],
            }))
        }
    }
}

// ---------------------------------------------------------------------------
// Trims and slices
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SliceSpec {
    Index(i64),
    /// [lower : upper @ revised-lower]; absent parts default to the
    /// parent bound, the revised lower defaults to 1.
    Trim { lower: Option<i64>, upper: Option<i64>, at: Option<i64> },
}

/// Revise one tuple under a trimmer, adjusting the shift so indices in
/// the trimmed frame reach the same elements as in the parent.
pub fn trim_tuple(t: &Tuple, lower: Option<i64>, upper: Option<i64>, at: Option<i64>) -> Result<Tuple, GenieError> {
    let lo = lower.unwrap_or(t.lower);
    let up = upper.unwrap_or(t.upper);
    if lo < t.lower || up > t.upper {
        return Err(GenieError::TrimOutOfBounds {
            lower: lo,
            upper: up,
            row_lower: t.lower,
            row_upper: t.upper,
        });
    }
    let revised = at.unwrap_or(1);
    Ok(Tuple {
        lower: revised,
        upper: revised + (up - lo),
        span: t.span,
        shift: t.shift + t.span * (revised - lo),
        k: revised,
    })
}

pub enum Sliced {
    /// All subscripts were indices: the flat slot of the element.
    Element(usize),
    /// At least one trimmer: a sub-descriptor over the same storage.
    SubRow(RowDesc),
}

/// Multi-dimensional subscripting with bounds checks per tuple.
pub fn slice(desc: &RowDesc, specs: &[SliceSpec]) -> Result<Sliced, GenieError> {
    debug_assert_eq!(specs.len(), desc.dims());
    let all_indices = specs.iter().all(|s| matches!(s, SliceSpec::Index(_)));
    if all_indices {
        let indices: Vec<i64> = specs
            .iter()
            .map(|s| match s {
                SliceSpec::Index(i) => *i,
                SliceSpec::Trim { .. } => unreachable!(),
            })
            .collect();
        return Ok(Sliced::Element(desc.slot_of(&indices)?));
    }

    let mut field = desc.field as i64;
    let mut tuples = Vec::new();
    for (t, spec) in desc.tuples.iter().zip(specs) {
        match spec {
            SliceSpec::Index(i) => {
                if !t.contains(*i) {
                    return Err(GenieError::IndexOutOfBounds {
                        index: *i,
                        lower: t.lower,
                        upper: t.upper,
                    });
                }
                field += desc.elem_size as i64 * (t.span * i - t.shift);
            }
            SliceSpec::Trim { lower, upper, at } => {
                tuples.push(trim_tuple(t, *lower, *upper, *at)?);
            }
        }
    }
    Ok(Sliced::SubRow(RowDesc {
        elem_mode: desc.elem_mode,
        elem_size: desc.elem_size,
        field: field as usize,
        elems: desc.elems,
        tuples,
    }))
}

// ---------------------------------------------------------------------------
// Descriptor-only matrix rewrites
// ---------------------------------------------------------------------------

fn want_matrix(desc: &RowDesc) -> Result<(), GenieError> {
    if desc.dims() != 2 {
        return Err(GenieError::Internal(format!(
            "matrix operation on rank-{} row",
            desc.dims()
        )));
    }
    Ok(())
}

/// Swap the two tuples; element storage is untouched.
pub fn transpose(desc: &RowDesc) -> Result<RowDesc, GenieError> {
    want_matrix(desc)?;
    let mut out = desc.clone();
    out.tuples.swap(0, 1);
    Ok(out)
}

/// Main diagonal as a vector view: index j maps to the parent element
/// (t1.lower + j - 1, t2.lower + j - 1).
pub fn diagonal(desc: &RowDesc) -> Result<RowDesc, GenieError> {
    want_matrix(desc)?;
    let t1 = desc.tuples[0];
    let t2 = desc.tuples[1];
    let len = t1.size().min(t2.size());
    let span = t1.span + t2.span;
    let shift = t1.shift + t2.shift - t1.span * (t1.lower - 1) - t2.span * (t2.lower - 1);
    let mut out = desc.clone();
    out.tuples = vec![Tuple { lower: 1, upper: len, span, shift, k: 1 }];
    Ok(out)
}

/// Row `k` of a matrix as a vector view.
pub fn row_view(desc: &RowDesc, k: i64) -> Result<RowDesc, GenieError> {
    want_matrix(desc)?;
    let t1 = desc.tuples[0];
    if !t1.contains(k) {
        return Err(GenieError::IndexOutOfBounds { index: k, lower: t1.lower, upper: t1.upper });
    }
    let mut out = desc.clone();
    out.field = (out.field as i64 + desc.elem_size as i64 * (t1.span * k - t1.shift)) as usize;
    out.tuples = vec![desc.tuples[1]];
    Ok(out)
}

/// Column `k` of a matrix as a vector view.
pub fn column_view(desc: &RowDesc, k: i64) -> Result<RowDesc, GenieError> {
    want_matrix(desc)?;
    let t2 = desc.tuples[1];
    if !t2.contains(k) {
        return Err(GenieError::IndexOutOfBounds { index: k, lower: t2.lower, upper: t2.upper });
    }
    let mut out = desc.clone();
    out.field = (out.field as i64 + desc.elem_size as i64 * (t2.span * k - t2.shift)) as usize;
    out.tuples = vec![desc.tuples[0]];
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mode::{ModeTable, M_INT};

    fn heap() -> Heap {
        Heap::new(100_000)
    }

    fn int_row(heap: &mut Heap, modes: &ModeTable, values: &[i64]) -> RowDesc {
        let slots: Vec<Value> = values.iter().map(|&v| Value::Int(v)).collect();
        make_row(heap, modes, M_INT, values.len(), &slots).unwrap()
    }

    fn read_int(heap: &Heap, desc: &RowDesc, indices: &[i64]) -> i64 {
        let at = desc.slot_of(indices).unwrap();
        match &heap.slots(desc.elems)[at] {
            Value::Int(v) => *v,
            other => panic!("expected INT, found {:?}", other),
        }
    }

    #[test]
    fn make_row_builds_one_based_bounds() {
        let mut h = heap();
        let m = ModeTable::new();
        let d = int_row(&mut h, &m, &[10, 20, 30]);
        assert_eq!(d.tuples[0].lower, 1);
        assert_eq!(d.tuples[0].upper, 3);
        assert_eq!(read_int(&h, &d, &[2]), 20);
    }

    #[test]
    fn empty_rows_keep_a_ghost_element() {
        let mut h = heap();
        let m = ModeTable::new();
        let d = int_row(&mut h, &m, &[]);
        assert_eq!(d.tuples[0].lower, 1);
        assert_eq!(d.tuples[0].upper, 0);
        assert!(!h.slots(d.elems).is_empty(), "ghost element must exist");
    }

    #[test]
    fn clone_then_store_into_fresh_dst_equals_clone() {
        let mut h = heap();
        let m = ModeTable::new();
        let src = int_row(&mut h, &m, &[1, 2, 3]);
        let cloned = clone_row(&mut h, &m, &src, None).unwrap();
        store_row(&mut h, &m, &cloned, &src).unwrap();
        for i in 1..=3 {
            assert_eq!(read_int(&h, &cloned, &[i]), read_int(&h, &src, &[i]));
        }
        assert_ne!(cloned.elems, src.elems, "clone owns fresh storage");
    }

    #[test]
    fn store_rejects_different_bounds() {
        let mut h = heap();
        let m = ModeTable::new();
        let a = int_row(&mut h, &m, &[1, 2, 3]);
        let b = int_row(&mut h, &m, &[1, 2]);
        assert_eq!(store_row(&mut h, &m, &a, &b).unwrap_err(), GenieError::DifferentBounds);
    }

    #[test]
    fn clone_into_demanding_template_from_empty_row_fails() {
        let mut h = heap();
        let m = ModeTable::new();
        let empty = int_row(&mut h, &m, &[]);
        let template = int_row(&mut h, &m, &[0, 0]);
        let err = clone_row(&mut h, &m, &empty, Some(&template)).unwrap_err();
        assert!(matches!(err, GenieError::EmptyValueFrom { .. }));
    }

    #[test]
    fn trimming_rebases_to_one_and_maps_to_parent_elements() {
        let mut h = heap();
        let m = ModeTable::new();
        let d = int_row(&mut h, &m, &[10, 20, 30, 40]);
        let t = trim_tuple(&d.tuples[0], Some(2), Some(4), None).unwrap();
        assert_eq!((t.lower, t.upper), (1, 3));
        let trimmed = RowDesc { tuples: vec![t], ..d.clone() };
        assert_eq!(read_int(&h, &trimmed, &[1]), 20);
        assert_eq!(read_int(&h, &trimmed, &[3]), 40);
    }

    #[test]
    fn trim_at_revises_the_lower_bound() {
        let mut h = heap();
        let m = ModeTable::new();
        let d = int_row(&mut h, &m, &[10, 20, 30, 40]);
        let t = trim_tuple(&d.tuples[0], Some(2), Some(3), Some(5)).unwrap();
        assert_eq!((t.lower, t.upper), (5, 6));
        let trimmed = RowDesc { tuples: vec![t], ..d.clone() };
        assert_eq!(read_int(&h, &trimmed, &[5]), 20);
        assert_eq!(read_int(&h, &trimmed, &[6]), 30);
    }

    #[test]
    fn trim_beyond_parent_bounds_is_an_error() {
        let mut h = heap();
        let m = ModeTable::new();
        let d = int_row(&mut h, &m, &[1, 2]);
        let err = trim_tuple(&d.tuples[0], Some(0), Some(2), None).unwrap_err();
        assert!(matches!(err, GenieError::TrimOutOfBounds { .. }));
    }

    #[test]
    fn rowing_then_slicing_at_one_returns_the_original() {
        let mut h = heap();
        let m = ModeTable::new();
        let slots = [Value::Int(42)];
        let d = make_row(&mut h, &m, M_INT, 1, &slots).unwrap();
        match slice(&d, &[SliceSpec::Index(1)]).unwrap() {
            Sliced::Element(at) => assert_eq!(h.slots(d.elems)[at], Value::Int(42)),
            Sliced::SubRow(_) => panic!("index slice must yield an element"),
        }
    }

    #[test]
    fn matrix_views_share_storage() {
        let mut h = heap();
        let m = ModeTable::new();
        // [1:2, 1:3] from concatenating two vectors.
        let r1 = int_row(&mut h, &m, &[1, 2, 3]);
        let r2 = int_row(&mut h, &m, &[4, 5, 6]);
        let mat = make_rowrow(&mut h, &m, &[r1, r2]).unwrap();
        assert_eq!(read_int(&h, &mat, &[2, 1]), 4);

        let t = transpose(&mat).unwrap();
        assert_eq!(t.elems, mat.elems);
        assert_eq!(read_int(&h, &t, &[1, 2]), 4);
        let tt = transpose(&t).unwrap();
        assert_eq!(tt.tuples, mat.tuples);
        assert_eq!(tt.elems, mat.elems);

        let d = diagonal(&mat).unwrap();
        assert_eq!(read_int(&h, &d, &[1]), 1);
        assert_eq!(read_int(&h, &d, &[2]), 5);

        let row1 = row_view(&mat, 2).unwrap();
        assert_eq!(read_int(&h, &row1, &[3]), 6);
        let col2 = column_view(&mat, 2).unwrap();
        assert_eq!(read_int(&h, &col2, &[1]), 2);
        assert_eq!(read_int(&h, &col2, &[2]), 5);
    }

    #[test]
    fn mixed_slice_produces_a_sub_descriptor() {
        let mut h = heap();
        let m = ModeTable::new();
        let r1 = int_row(&mut h, &m, &[1, 2, 3]);
        let r2 = int_row(&mut h, &m, &[4, 5, 6]);
        let mat = make_rowrow(&mut h, &m, &[r1, r2]).unwrap();
        // mat[2, 1:2] = (4, 5)
        let spec = [
            SliceSpec::Index(2),
            SliceSpec::Trim { lower: Some(1), upper: Some(2), at: None },
        ];
        match slice(&mat, &spec).unwrap() {
            Sliced::SubRow(sub) => {
                assert_eq!(sub.dims(), 1);
                assert_eq!(read_int(&h, &sub, &[1]), 4);
                assert_eq!(read_int(&h, &sub, &[2]), 5);
            }
            Sliced::Element(_) => panic!("trim must yield a sub-row"),
        }
    }

    #[test]
    fn rowrow_requires_shared_bounds() {
        let mut h = heap();
        let m = ModeTable::new();
        let r1 = int_row(&mut h, &m, &[1, 2, 3]);
        let r2 = int_row(&mut h, &m, &[4, 5]);
        let err = make_rowrow(&mut h, &m, &[r1, r2]).unwrap_err();
        assert_eq!(err, GenieError::DifferentBounds);
    }
}
