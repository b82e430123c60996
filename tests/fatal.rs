//! Corruption and abort-on-exhaustion stop the process. Each scenario runs
//! its body in a copy of this test binary and checks how that copy died.

use std::{env, process::Command, ptr::NonNull};

use log::{LevelFilter, Log, Metadata, Record};
use nestalloc::{MemoryConfig, MemoryContext};

const CHILD: &str = "NESTALLOC_FATAL_CHILD";

struct Stderr;

impl Log for Stderr {
    fn enabled(&self, _: &Metadata) -> bool {
        true
    }

    fn log(&self, record: &Record) {
        eprintln!("{} {}", record.level(), record.args());
    }

    fn flush(&self) {}
}

static LOGGER: Stderr = Stderr;

/// Runs `body` in a child process started with only the test `name`
/// selected, and expects the child to abort after logging `message`.
fn aborts_with(name: &str, message: &str, body: impl FnOnce()) {
    if env::var_os(CHILD).is_some() {
        log::set_logger(&LOGGER).unwrap();
        log::set_max_level(LevelFilter::Error);
        body();
        // Returning lets the child pass, which fails the parent below.
        return;
    }

    let output = Command::new(env::current_exe().unwrap())
        .args([name, "--exact", "--nocapture", "--test-threads=1"])
        .env(CHILD, "1")
        .output()
        .unwrap();

    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(!output.status.success(), "child survived, stderr:\n{stderr}");

    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        assert_eq!(output.status.signal(), Some(libc::SIGABRT), "stderr:\n{stderr}");
    }

    assert!(stderr.contains(message), "stderr:\n{stderr}");
}

#[test]
fn double_free_aborts() {
    aborts_with("double_free_aborts", "no allocated node in front of", || {
        let mut memory = vec![0usize; 1024];
        let start = NonNull::new(memory.as_mut_ptr().cast::<u8>()).unwrap();
        let mut context = unsafe { MemoryContext::bootstrap(start, memory.len() * std::mem::size_of::<usize>()).unwrap() };

        let address = context.allocate(64, 8, None).unwrap();
        unsafe {
            context.deallocate(address, None).unwrap();
            let _ = context.deallocate(address, None);
        }
    });
}

#[test]
fn freeing_by_address_twice_aborts() {
    aborts_with("freeing_by_address_twice_aborts", "heap corruption", || {
        let mut context = MemoryContext::from_config(&MemoryConfig::default()).unwrap();
        let game = context.game_heap().unwrap();

        let first = context.allocate(128, 16, Some(game)).unwrap();
        context.allocate(128, 16, Some(game)).unwrap();
        unsafe {
            context.free(first).unwrap();
            let _ = context.free(first);
        }
    });
}

#[test]
fn exhaustion_aborts_when_configured() {
    aborts_with("exhaustion_aborts_when_configured", "exhausted while allocating", || {
        let config = MemoryConfig::from_toml_str(
            r#"
            root_arena_size = 262144
            game_heap_size = 65536
            abort_on_exhaustion = true
            "#,
        )
        .unwrap();
        let mut context = MemoryContext::from_config(&config).unwrap();
        let game = context.game_heap().unwrap();

        context.allocate(1024, 8, Some(game)).unwrap();
        let _ = context.allocate(1 << 20, 8, Some(game));
    });
}

#[test]
fn exhaustion_is_an_error_by_default() {
    let config = MemoryConfig::from_toml_str("root_arena_size = 262144\ngame_heap_size = 65536").unwrap();
    let mut context = MemoryContext::from_config(&config).unwrap();
    let game = context.game_heap().unwrap();

    assert!(context.allocate(1 << 20, 8, Some(game)).is_err());
    assert!(context.allocate(1024, 8, Some(game)).is_ok());
}
