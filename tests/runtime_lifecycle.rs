use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::anyhow;
use kestrel_script::logger::{BufferedLogger, LogLevel};
use kestrel_script::{BridgeError, ContextId, LifecycleEvent, MemoryFileSystem, RuntimeConfig, ScriptRuntime};
use serde_json::json;

fn runtime() -> (ScriptRuntime, Arc<BufferedLogger>) {
    let logger = Arc::new(BufferedLogger::new());
    let mut runtime = ScriptRuntime::new(&RuntimeConfig::default(), Box::new(MemoryFileSystem::new()), logger.clone())
        .expect("create runtime");
    runtime.create_context().expect("create context");
    (runtime, logger)
}

#[test]
fn cross_thread_release_is_deferred_to_update() {
    let (mut runtime, _logger) = runtime();
    let handle = runtime.main_context().expect("main context").eval_handle("({ big: true })").expect("hold value");
    let dropped = runtime.main_context().expect("main context").eval_handle("[1, 2, 3]").expect("hold value");
    assert_eq!(runtime.live_handles(), 2);

    let remote = runtime.handle();
    thread::spawn(move || {
        remote.free_value(handle);
        drop(dropped);
    })
    .join()
    .expect("join worker");

    assert_eq!(runtime.live_handles(), 2, "engine state must not change off-thread");
    assert_eq!(runtime.pending_frees(), 2);
    runtime.update(Duration::ZERO);
    assert_eq!(runtime.pending_frees(), 0);
    assert_eq!(runtime.live_handles(), 0);
}

#[test]
fn update_recycles_buffers_released_on_other_threads() {
    let (mut runtime, _logger) = runtime();
    let pool = runtime.buffers();
    let mut buffer = pool.alloc(4096);
    buffer.extend_from_slice(b"frame data");
    thread::spawn(move || drop(buffer)).join().expect("join worker");
    assert_eq!(pool.pending_returns(), 1);
    assert_eq!(pool.pooled(), 0);

    runtime.update(Duration::ZERO);
    assert_eq!(pool.pending_returns(), 0);
    assert_eq!(pool.pooled(), 1);
    let reused = pool.alloc(1024);
    assert!(reused.is_empty());
    assert!(reused.capacity() >= 4096);
    drop(reused);

    runtime.destroy();
    assert!(pool.is_closed());
    assert_eq!(pool.pooled(), 0);
    assert_eq!(pool.pending_returns(), 0);
}

#[test]
fn duplicated_handles_keep_the_value_until_the_last_release() {
    let (runtime, _logger) = runtime();
    let context = runtime.main_context().expect("main context");
    let original = context.eval_handle("({ name: 'crate' })").expect("hold value");
    let duplicate = runtime.dup_value(&original).expect("dup value");
    assert_eq!(runtime.live_handles(), 1);

    runtime.free_value(original).expect("free original");
    assert_eq!(runtime.live_handles(), 1);
    assert_eq!(context.to_json(&duplicate).expect("read duplicate"), json!({ "name": "crate" }));

    let last = runtime.dup_value(&duplicate).expect("dup again");
    runtime.free_value(duplicate).expect("free duplicate");
    runtime.free_value(last).expect("free last owner");
    assert_eq!(runtime.live_handles(), 0);
}

#[test]
fn handles_outliving_the_runtime_are_stale() {
    let (mut runtime, _logger) = runtime();
    let handle = runtime.main_context().expect("main context").eval_handle("({})").expect("hold value");
    let id = handle.id();
    let stats = runtime.destroy();
    assert_eq!(stats.released_handles, 1);
    assert_eq!(runtime.dup_value(&handle).unwrap_err(), BridgeError::StaleHandle(id));
    assert_eq!(runtime.free_value(handle).unwrap_err(), BridgeError::StaleHandle(id));
    assert_eq!(runtime.pending_frees(), 0);
}

#[test]
fn console_and_print_go_to_the_script_logger() {
    let (runtime, logger) = runtime();
    let context = runtime.main_context().expect("main context");
    context.eval_source(
        "console.log('a', 1, true); console.warn('careful'); print('p'); console.error('bad');",
        "log.js",
    );
    assert_eq!(logger.script_messages(), vec!["a 1 true", "careful", "p", "bad"]);
    assert_eq!(logger.count(LogLevel::Warn), 1);
    assert_eq!(logger.count(LogLevel::Error), 1);

    runtime.enable_stacktrace();
    context.eval_source("print('traced');", "log.js");
    runtime.disable_stacktrace();
    context.eval_source("print('plain');", "log.js");
    let messages = logger.script_messages();
    assert!(messages[4].starts_with("traced"));
    assert_eq!(messages[5], "plain");
}

#[test]
fn source_map_rewrites_logged_frames() {
    let (runtime, logger) = runtime();
    runtime.set_source_map(|function, file, line| format!("{function} ({}:{})", file.replace(".js", ".ts"), line + 10));
    let context = runtime.main_context().expect("main context");
    context.eval_source(
        "var e = new Error('kaboom'); e.stack = '    at explode (game/main.js:2)\\n    at <native>\\n'; throw e;",
        "main.js",
    );
    assert!(logger.contains("Error: kaboom"));
    assert!(logger.contains("    at explode (game/main.ts:12)\n    at <native>"));
}

#[test]
fn update_runs_hooks_then_jobs() {
    let (mut runtime, _logger) = runtime();
    let seen = Rc::new(RefCell::new(Vec::new()));
    let hook_seen = seen.clone();
    runtime.on_update(Box::new(move |elapsed: Duration| hook_seen.borrow_mut().push(elapsed)));
    runtime
        .main_context()
        .expect("main context")
        .eval_source("globalThis.settled = false; Promise.resolve().then(function () { settled = true; });", "jobs.js");
    assert_eq!(runtime.main_context().expect("main context").eval_json("settled").expect("read"), json!(true));

    runtime.update(Duration::from_millis(5));
    runtime.update(Duration::from_millis(7));
    assert_eq!(*seen.borrow(), vec![Duration::from_millis(5), Duration::from_millis(7)]);
}

#[test]
fn destroy_listener_errors_are_logged_not_propagated() {
    let (mut runtime, logger) = runtime();
    let id = runtime.main_context().expect("main context").id();
    let second_ran = Rc::new(Cell::new(false));
    {
        let context = runtime.main_context().expect("main context");
        context.on_destroy(Box::new(|_: ContextId| Err(anyhow!("listener exploded"))));
        let flag = second_ran.clone();
        context.on_destroy(Box::new(move |destroyed: ContextId| {
            flag.set(destroyed.index() > 0);
            Ok(())
        }));
    }
    assert_eq!(runtime.destroy_context(id).expect("destroy context"), 0);
    assert!(second_ran.get());
    assert!(logger.contains("listener exploded"));
    assert!(runtime.main_context().is_none());
    assert_eq!(runtime.destroy_context(id).unwrap_err(), BridgeError::ContextDestroyed(id));
}

#[test]
fn runtime_destroy_is_idempotent_and_emits_lifecycle_events() {
    let (mut runtime, logger) = runtime();
    let first = runtime.main_context().expect("main context").id();
    let second = runtime.create_context().expect("second context");
    runtime.on_lifecycle(Box::new(|event: &LifecycleEvent| match event {
        LifecycleEvent::RuntimeDestroying => Err(anyhow!("refusing to go quietly")),
        _ => Ok(()),
    }));

    let stats = runtime.destroy();
    assert_eq!(stats.contexts, 2);
    assert!(!runtime.is_valid());
    assert!(logger.contains("refusing to go quietly"));
    assert_eq!(runtime.destroy(), Default::default());
    assert_eq!(runtime.create_context().unwrap_err(), BridgeError::RuntimeDestroyed);

    let events = runtime.drain_lifecycle_events();
    assert_eq!(
        events,
        vec![
            LifecycleEvent::ContextCreated { context: first },
            LifecycleEvent::ContextCreated { context: second },
            LifecycleEvent::RuntimeDestroying,
            LifecycleEvent::ContextDestroyed { context: first },
            LifecycleEvent::ContextDestroyed { context: second },
            LifecycleEvent::RuntimeDestroyed,
        ]
    );
}
