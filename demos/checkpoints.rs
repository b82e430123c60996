use nestalloc::{Heap, MemoryConfig, MemoryContext, ResetEnds, SolidHeap};

fn print_cursors(label: &str, heap: &SolidHeap) {
    println!(
        "{label:<28} front = {:#x}, back = {:#x}, free = {}, saved states = {}",
        heap.front(),
        heap.back(),
        heap.memory_left(),
        heap.saved_states()
    );
}

fn main() {
    let config = MemoryConfig {
        game_heap_size: 0,
        ..MemoryConfig::default()
    };
    let mut context = MemoryContext::from_config(&config).unwrap();

    // Scratch memory for one frame, pushed as the default heap.
    let scratch = context.push_solid_default(64 * 1024, None, 8).unwrap();

    let heap = context.solid_heap_mut(scratch).unwrap();
    print_cursors("Fresh solid heap:", heap);

    heap.allocate(1024, 8).unwrap();
    heap.allocate(512, -16).unwrap();
    print_cursors("After level data:", heap);

    heap.save_state(1).unwrap();
    print_cursors("Saved state 1:", heap);

    for _ in 0..10 {
        heap.allocate(777, 8).unwrap();
    }
    heap.allocate(4096, -64).unwrap();
    print_cursors("After a frame:", heap);

    heap.save_state(2).unwrap();
    heap.allocate(2048, 8).unwrap();
    print_cursors("Saved state 2 and more:", heap);

    heap.load_state(1).unwrap();
    print_cursors("Loaded state 1:", heap);

    match heap.load_state(2) {
        Ok(()) => println!("State 2 is still there?"),
        Err(error) => println!("Loading state 2 again fails: {error}"),
    }

    let tip = heap.allocate(100, 8).unwrap();
    let grown = unsafe { heap.reallocate(tip, 300).unwrap() };
    println!("Tip allocation at {tip:p} grown to {grown} bytes");
    print_cursors("After growing the tip:", heap);

    heap.reset(ResetEnds::Both).unwrap();
    print_cursors("Reset:", heap);

    let restored = context.restore_from_temporary().unwrap();
    println!("\nDefault heap is the root again: {}", context.default_heap() == context.root());

    context.destroy_heap(restored).unwrap();
    println!("Scratch heap destroyed, {} bytes free at root", context.heap(context.root()).unwrap().memory_left());
}
