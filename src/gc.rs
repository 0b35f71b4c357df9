/// Mark-sweep collector over the handle pool.
///
/// Roots: every handle reachable from live frame slots, the typed
/// contents of the expression stack, and pinned handles. Collection runs
/// only at safe points — clause boundaries and allocation — and
/// preemptively once utilisation crosses the configured threshold.

use tracing::debug;

use crate::mem::{Colour, FrameStack, Heap};
use crate::value::{HandleId, Value};

#[derive(Debug, Default, Clone, Copy)]
pub struct Collection {
    pub swept: usize,
    pub slots_reclaimed: usize,
    pub live: usize,
}

/// Should a preemptive collection fire at the next safe point?
pub fn pressure(heap: &Heap, threshold_pct: usize) -> bool {
    heap.utilisation_pct() >= threshold_pct
}

/// One full mark-sweep cycle.
pub fn collect(heap: &mut Heap, frames: &FrameStack, expr_stack: &[Value]) -> Collection {
    let before_used = heap.used_slots;
    let before_handles = heap.handle_count();

    // Mark. Colour every live handle white, then blacken from the roots.
    let mut worklist: Vec<HandleId> = Vec::new();
    let mut pinned: Vec<HandleId> = Vec::new();
    for (id, h) in heap.live_handles() {
        if h.pinned {
            pinned.push(id);
        }
    }
    {
        let mut push = |h: HandleId| worklist.push(h);
        for frame in frames.iter() {
            for v in &frame.slots {
                v.each_handle(&mut push);
            }
        }
        for v in expr_stack {
            v.each_handle(&mut push);
        }
    }
    worklist.extend(pinned);

    // Reset colours, then trace transitively through heap objects.
    let ids: Vec<HandleId> = heap.live_handles().map(|(id, _)| id).collect();
    for id in &ids {
        heap.handle_meta_mut(*id).colour = Colour::White;
    }
    while let Some(id) = worklist.pop() {
        if !heap.is_live(id) {
            continue;
        }
        let meta = heap.handle_meta_mut(id);
        if meta.colour == Colour::Black {
            continue;
        }
        meta.colour = Colour::Black;
        let obj = heap.get(id);
        obj.each_handle(&mut |h| worklist.push(h));
    }

    // Sweep unreachable, unpinned handles.
    for id in ids {
        let meta = heap.handle_meta_mut(id);
        if meta.colour == Colour::White && !meta.pinned {
            heap.release(id);
        }
    }

    heap.stats.collections += 1;
    let out = Collection {
        swept: before_handles - heap.handle_count(),
        slots_reclaimed: before_used - heap.used_slots,
        live: heap.handle_count(),
    };
    debug!(
        swept = out.swept,
        reclaimed = out.slots_reclaimed,
        live = out.live,
        "heap collection"
    );
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conf::Conf;
    use crate::mem::{FrameStack, Heap, HeapObj};
    use crate::mode::{M_INT, M_ROW_INT};
    use crate::tree::no_node;
    use crate::value::{Name, RowDesc, Target, Tuple, Value, PRIMAL_SCOPE};

    fn row_value(elems: HandleId) -> Value {
        Value::Row(Box::new(RowDesc {
            elem_mode: M_INT,
            elem_size: 1,
            field: 0,
            elems,
            tuples: vec![Tuple::new(1, 2, 1)],
        }))
    }

    #[test]
    fn unreachable_handles_are_swept_and_roots_survive() {
        let conf = Conf::default();
        let mut heap = Heap::new(1000);
        let mut frames = FrameStack::default();
        frames.open(&conf, no_node(), 0, 0, 1, None, false, false, 0, 0).unwrap();

        let live = heap.alloc(M_ROW_INT, HeapObj::Slots(vec![Value::Int(1), Value::Int(2)])).unwrap();
        let dead = heap.alloc(M_ROW_INT, HeapObj::Slots(vec![Value::Int(3)])).unwrap();
        frames.frame_mut(0).slots[0] = row_value(live);

        let out = collect(&mut heap, &frames, &[]);
        assert_eq!(out.swept, 1);
        assert!(heap.is_live(live));
        assert!(!heap.is_live(dead));
    }

    #[test]
    fn expression_stack_values_are_roots() {
        let mut heap = Heap::new(1000);
        let frames = FrameStack::default();
        let h = heap.alloc(M_INT, HeapObj::Slots(vec![Value::Int(7)])).unwrap();
        let stack = vec![Value::Name(Name {
            scope: PRIMAL_SCOPE,
            target: Target::Heap { handle: h, offset: 0 },
        })];
        collect(&mut heap, &frames, &stack);
        assert!(heap.is_live(h));
    }

    #[test]
    fn pinned_handles_are_never_collected() {
        let mut heap = Heap::new(1000);
        let frames = FrameStack::default();
        let h = heap.alloc(M_INT, HeapObj::Slots(vec![Value::Char('x')])).unwrap();
        heap.pin(h);
        collect(&mut heap, &frames, &[]);
        assert!(heap.is_live(h));
    }

    #[test]
    fn transitive_reachability_through_heap_objects() {
        let mut heap = Heap::new(1000);
        let frames = FrameStack::default();
        let inner = heap.alloc(M_ROW_INT, HeapObj::Slots(vec![Value::Int(5)])).unwrap();
        let outer = heap.alloc(M_ROW_INT, HeapObj::Slots(vec![row_value(inner)])).unwrap();
        let stack = vec![row_value(outer)];
        let out = collect(&mut heap, &frames, &stack);
        assert_eq!(out.swept, 0);
        assert!(heap.is_live(inner));
    }

    #[test]
    fn pressure_tracks_utilisation() {
        let mut heap = Heap::new(10);
        heap.alloc(M_ROW_INT, HeapObj::Slots(vec![Value::Int(0); 8])).unwrap();
        assert!(pressure(&heap, 75));
        assert!(!pressure(&heap, 90));
    }
}
