use nestalloc::{Heap, HeapRef, MemoryConfig, MemoryContext, DEFAULT_NODE_ID, NESTED_HEAP_NODE_ID};

const CONFIG: &str = r#"
root_arena_size = 4194304
game_heap_size = 241664
fit_policy = "best_fit"

[[heaps]]
name = "sound"
kind = "expanding"
size = 524288

[[heaps]]
name = "level"
kind = "solid"
size = 65536
alignment = -32
parent = "game"
"#;

fn print_heap(context: &MemoryContext, name: &str, heap: HeapRef) {
    let facade = context.heap(heap).unwrap();
    println!(
        "{name:>6}: {:?} heap at {:p}, {} bytes, {} free, biggest block {}",
        facade.kind(),
        heap.address(),
        facade.arena_size(),
        facade.memory_left(),
        facade.max_allocation_unit_size(),
    );
}

fn print_all(context: &MemoryContext) {
    print_heap(context, "root", context.root());
    if let Some(game) = context.game_heap() {
        print_heap(context, "game", game);
    }
    for name in ["sound", "level"] {
        if let Some(heap) = context.named_heap(name) {
            print_heap(context, name, heap);
        }
    }
}

fn main() {
    let config = MemoryConfig::from_toml_str(CONFIG).unwrap();
    let mut context = MemoryContext::from_config(&config).unwrap();

    println!("Heaps after startup:");
    print_all(&context);

    let game = context.game_heap().unwrap();
    let sound = context.named_heap("sound").unwrap();

    println!("\nLoading some sound banks...");
    let banks: Vec<_> = (1..=4)
        .map(|i| context.allocate(i * 10_000, 16, Some(sound)).unwrap())
        .collect();
    for bank in &banks {
        println!("Bank at {bank:p}, {} bytes", context.size_of(*bank).unwrap());
    }

    println!("\nSpawning entities in the game heap through the default heap...");
    {
        let mut scoped = context.scoped_default(game).unwrap();
        for _ in 0..8 {
            scoped.allocate(256, 8, None).unwrap();
        }
    }

    let game_heap = context.expanding_heap_mut(game).unwrap();
    println!(
        "Game heap: {} bytes in entities, {} bytes in nested heaps, {} free nodes",
        game_heap.bytes_with_id(DEFAULT_NODE_ID),
        game_heap.bytes_with_id(NESTED_HEAP_NODE_ID),
        game_heap.free_nodes(),
    );

    println!("\nFreeing banks 2 and 3...");
    unsafe {
        context.free(banks[1]).unwrap();
        context.free(banks[2]).unwrap();
    }

    print_all(&context);
    println!("\nIntegrity check: {}", context.check_integrity());
}
