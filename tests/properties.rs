//! Property tests for the allocators behind the heap facade.
//!
//! Every case builds a context over a fresh Vec, runs a random sequence of
//! operations and checks the invariants that must hold after each step.

use std::ptr::NonNull;

use nestalloc::{FitPolicy, Heap, HeapError, HeapKind, HeapRef, MemoryContext, ResetEnds};
use proptest::prelude::*;

const ARENA: usize = 256 * 1024;

/// Owns the memory a test context runs on. Must outlive the context.
struct Memory(Vec<usize>);

impl Memory {
    fn new() -> Self {
        Self(vec![0; ARENA / std::mem::size_of::<usize>()])
    }

    fn context(&mut self) -> MemoryContext {
        let start = NonNull::new(self.0.as_mut_ptr().cast::<u8>()).unwrap();
        unsafe { MemoryContext::bootstrap(start, ARENA).unwrap() }
    }
}

#[derive(Debug, Clone)]
enum Op {
    Allocate { size: usize, align: i32 },
    Free { index: usize },
}

fn alignment() -> impl Strategy<Value = i32> {
    prop_oneof![
        Just(4),
        Just(8),
        Just(16),
        Just(64),
        Just(-8),
        Just(-16),
        Just(-128),
    ]
}

fn ops() -> impl Strategy<Value = Vec<Op>> {
    let op = prop_oneof![
        3 => (1usize..700, alignment()).prop_map(|(size, align)| Op::Allocate { size, align }),
        2 => any::<usize>().prop_map(|index| Op::Free { index }),
    ];

    prop::collection::vec(op, 1..120)
}

fn overlaps(a: (usize, usize), b: (usize, usize)) -> bool {
    a.0 < b.1 && b.0 < a.1
}

proptest! {
    /// Live allocations never overlap, honour their alignment, and releasing
    /// everything gives back exactly the memory the heap started with.
    #[test]
    fn expanding_accounting_round_trip(ops in ops(), best_fit in any::<bool>()) {
        let mut memory = Memory::new();
        let mut context = memory.context();
        let root = context.root();

        if best_fit {
            context.expanding_heap_mut(root).unwrap().set_fit_policy(FitPolicy::BestFit);
        }

        let initial = context.heap(root).unwrap().memory_left();
        let mut live: Vec<(NonNull<u8>, usize)> = Vec::new();

        for op in ops {
            match op {
                Op::Allocate { size, align } => {
                    let address = context.allocate(size, align, None).unwrap();
                    let raw = address.as_ptr() as usize;

                    prop_assert_eq!(raw % align.unsigned_abs() as usize, 0);
                    prop_assert!(context.size_of(address).unwrap() >= size);
                    for (other, other_size) in &live {
                        let other = other.as_ptr() as usize;
                        prop_assert!(!overlaps((raw, raw + size), (other, other + other_size)));
                    }

                    live.push((address, size));
                }
                Op::Free { index } if !live.is_empty() => {
                    let (address, _) = live.swap_remove(index % live.len());
                    unsafe { context.deallocate(address, None).unwrap() };
                }
                Op::Free { .. } => {}
            }

            prop_assert!(context.check_integrity());
        }

        for (address, _) in live.drain(..) {
            unsafe { context.deallocate(address, None).unwrap() };
        }

        let heap = context.expanding_heap_mut(root).unwrap();
        prop_assert_eq!(heap.free_nodes(), 1);
        prop_assert_eq!(heap.memory_left(), initial);
    }

    /// After any release the free list holds no two adjacent free nodes, so
    /// releasing neighbours in any order leaves one node behind.
    #[test]
    fn neighbours_coalesce_in_any_order(
        sizes in prop::collection::vec(8usize..300, 2..24),
        order in any::<prop::sample::Index>(),
    ) {
        let mut memory = Memory::new();
        let mut context = memory.context();
        let root = context.root();

        let mut addresses: Vec<_> = sizes
            .iter()
            .map(|size| context.allocate(*size, 8, None).unwrap())
            .collect();

        // Rotate by a random amount, then release from both ends alternately.
        let pivot = order.index(addresses.len());
        addresses.rotate_left(pivot);

        while !addresses.is_empty() {
            let address = if addresses.len() % 2 == 0 {
                addresses.remove(0)
            } else {
                addresses.pop().unwrap()
            };
            unsafe { context.deallocate(address, None).unwrap() };
            prop_assert!(context.check_integrity());
        }

        prop_assert_eq!(context.expanding_heap_mut(root).unwrap().free_nodes(), 1);
    }

    /// First fit takes the lowest hole that fits, best fit the smallest.
    #[test]
    fn fit_policy_picks_the_expected_hole(
        holes in prop::collection::vec((2usize..40).prop_map(|words| words * 8), 1..10),
        request in (1usize..40).prop_map(|words| words * 8),
        best_fit in any::<bool>(),
    ) {
        let mut memory = Memory::new();
        let mut context = memory.context();
        let root = context.root();

        // hole, fence, hole, fence ... so that holes never coalesce.
        let mut placed = Vec::new();
        for size in &holes {
            let hole = context.allocate(*size, 8, None).unwrap();
            context.allocate(8, 8, None).unwrap();
            placed.push((hole, *size));
        }
        for (hole, _) in &placed {
            unsafe { context.deallocate(*hole, None).unwrap() };
        }

        let policy = if best_fit { FitPolicy::BestFit } else { FitPolicy::FirstFit };
        context.expanding_heap_mut(root).unwrap().set_fit_policy(policy);

        let fitting = placed.iter().filter(|(_, size)| *size >= request);
        let expected = match policy {
            FitPolicy::FirstFit => fitting.map(|(hole, _)| *hole).next(),
            FitPolicy::BestFit => fitting
                .fold(None, |best: Option<(NonNull<u8>, usize)>, &(hole, size)| match best {
                    Some((_, best_size)) if best_size <= size => best,
                    _ => Some((hole, size)),
                })
                .map(|(hole, _)| hole),
        };

        let address = context.allocate(request, 8, None).unwrap();

        match expected {
            Some(hole) => prop_assert_eq!(address, hole),
            // Nothing fits in the holes, the request goes past the last fence.
            None => prop_assert!(placed.iter().all(|(hole, _)| address > *hole)),
        }
    }

    /// Both cursors of a solid heap stay in order, nothing handed out
    /// overlaps, and running out of room leaves the cursors untouched.
    #[test]
    fn solid_allocations_stay_between_the_cursors(
        requests in prop::collection::vec((1usize..2000, alignment()), 1..80),
    ) {
        let mut memory = Memory::new();
        let mut context = memory.context();
        let solid = context.create_solid_heap(16 * 1024, None, 8).unwrap();
        let heap = context.solid_heap_mut(solid).unwrap();

        let mut handed_out: Vec<(usize, usize)> = Vec::new();

        for (size, align) in requests {
            let (front, back) = (heap.front(), heap.back());

            match heap.allocate(size, align) {
                Ok(address) => {
                    let raw = address.as_ptr() as usize;
                    prop_assert_eq!(raw % align.unsigned_abs() as usize, 0);
                    prop_assert!(raw >= front && raw + size <= back);
                    for other in &handed_out {
                        prop_assert!(!overlaps((raw, raw + size), *other));
                    }
                    handed_out.push((raw, raw + size));
                }
                Err(HeapError::Exhausted { .. }) => {
                    prop_assert_eq!((heap.front(), heap.back()), (front, back));
                }
                Err(error) => prop_assert!(false, "unexpected error {error}"),
            }

            prop_assert!(heap.front() <= heap.back());
            prop_assert_eq!(heap.memory_left(), heap.back() - heap.front());
            prop_assert!(heap.is_intact());
        }

        heap.reset(ResetEnds::Both).unwrap();
        prop_assert!(heap.is_empty());
    }

    /// Loading a checkpoint puts both cursors back where they were right
    /// before it was saved, whatever happened in between.
    #[test]
    fn checkpoints_restore_cursors(
        before in prop::collection::vec((1usize..500, alignment()), 0..10),
        after in prop::collection::vec((1usize..500, alignment()), 0..30),
        nested_saves in 0u32..4,
    ) {
        let mut memory = Memory::new();
        let mut context = memory.context();
        let solid = context.create_solid_heap(32 * 1024, None, 8).unwrap();
        let heap = context.solid_heap_mut(solid).unwrap();

        for (size, align) in before {
            heap.allocate(size, align).unwrap();
        }

        let saved = (heap.front(), heap.back());
        let left = heap.memory_left();
        heap.save_state(7).unwrap();

        for (step, (size, align)) in after.into_iter().enumerate() {
            heap.allocate(size, align).unwrap();
            if (step as u32) < nested_saves {
                heap.save_state(100 + step as u32).unwrap();
            }
        }

        heap.load_state(7).unwrap();
        prop_assert_eq!((heap.front(), heap.back()), saved);
        prop_assert_eq!(heap.memory_left(), left);
        prop_assert_eq!(heap.saved_states(), 0);
        prop_assert!(heap.is_intact());
    }

    /// Every allocation is found in the heap that made it, however deep the
    /// heap is nested, and tearing the tree down restores the root.
    #[test]
    fn nested_heaps_contain_their_allocations(
        shape in prop::collection::vec((any::<prop::sample::Index>(), any::<bool>(), 1usize..8), 1..12),
    ) {
        let mut memory = Memory::new();
        let mut context = memory.context();
        let root = context.root();
        let initial = context.heap(root).unwrap().memory_left();

        let mut heaps: Vec<HeapRef> = vec![root];
        for (parent, solid, kilobytes) in shape {
            let parent = heaps[parent.index(heaps.len())];
            let kind = if solid { HeapKind::Solid } else { HeapKind::Expanding };

            match context.create_heap(kind, kilobytes * 1024, Some(parent), 8) {
                Ok(heap) => {
                    let outer = context.heap(parent).unwrap();
                    prop_assert!(outer.contains(heap.address()));
                    heaps.push(heap);
                }
                Err(HeapError::Exhausted { .. }) => {}
                Err(error) => prop_assert!(false, "unexpected error {error}"),
            }
        }

        let mut allocations = Vec::new();
        for heap in &heaps {
            let address = context.allocate(24, 8, Some(*heap)).unwrap();
            prop_assert_eq!(context.find_innermost(address), Some(*heap));
            allocations.push(address);
        }

        prop_assert!(context.check_integrity());

        // Children were created after their parents, so tear down in reverse.
        for (heap, address) in heaps.iter().zip(allocations).rev() {
            let kind = context.heap(*heap).unwrap().kind();
            match kind {
                HeapKind::Expanding => unsafe { context.deallocate(address, Some(*heap)).unwrap() },
                HeapKind::Solid => context.heap_mut(*heap).unwrap().deallocate_all().unwrap(),
            }

            if *heap != root {
                context.destroy_heap(*heap).unwrap();
            }
        }

        prop_assert_eq!(context.heaps(), vec![root]);
        prop_assert_eq!(context.heap(root).unwrap().memory_left(), initial);
    }
}
