use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use kestrel_script::logger::BufferedLogger;
use kestrel_script::{AsyncOperation, MemoryFileSystem, RuntimeConfig, ScriptRuntime, WaitState};
use serde_json::json;

const FRAME: Duration = Duration::from_millis(16);

fn runtime_with_main(source: &str) -> (ScriptRuntime, Arc<BufferedLogger>) {
    let fs = MemoryFileSystem::new().with_file("main.js", source);
    let logger = Arc::new(BufferedLogger::new());
    let mut runtime =
        ScriptRuntime::new(&RuntimeConfig::default(), Box::new(fs), logger.clone()).expect("create runtime");
    runtime.eval_main("main.js").expect("eval main");
    (runtime, logger)
}

fn eval(runtime: &ScriptRuntime, expression: &str) -> serde_json::Value {
    runtime.main_context().expect("main context").eval_json(expression).expect("evaluate expression")
}

#[test]
fn yield_resumes_on_following_updates() {
    let (mut runtime, _logger) = runtime_with_main(
        "globalThis.steps = [];\n(async function () {\n  steps.push('start');\n  await jsb.Yield();\n  steps.push('frame1');\n  await jsb.Yield(null);\n  steps.push('frame2');\n})();",
    );
    assert_eq!(eval(&runtime, "steps"), json!(["start"]));
    runtime.update(FRAME);
    assert_eq!(eval(&runtime, "steps"), json!(["start", "frame1"]));
    runtime.update(FRAME);
    assert_eq!(eval(&runtime, "steps"), json!(["start", "frame1", "frame2"]));
    assert_eq!(runtime.main_context().expect("main context").pending_waits(), 0);
}

#[test]
fn frame_and_delay_waitables_count_updates() {
    let (mut runtime, _logger) = runtime_with_main(
        "globalThis.done = {};\n(async function () { await jsb.Yield(jsb.WaitForFrames(3)); done.frames = true; })();\n(async function () { await jsb.Yield(jsb.WaitForSeconds(0.5)); done.seconds = true; })();",
    );
    let step = Duration::from_millis(200);
    runtime.update(step);
    runtime.update(step);
    assert_eq!(eval(&runtime, "done"), json!({}));
    runtime.update(step);
    assert_eq!(eval(&runtime, "done"), json!({ "frames": true, "seconds": true }));
}

#[test]
fn awaitables_can_only_be_yielded_once() {
    let (runtime, _logger) = runtime_with_main("");
    let thrown = eval(
        &runtime,
        "(function () { var w = jsb.WaitForFrames(1); jsb.Yield(w); try { jsb.Yield(w); return 'accepted'; } catch (e) { return e instanceof TypeError; } })()",
    );
    assert_eq!(thrown, json!(true));
    let thrown = eval(&runtime, "(function () { try { jsb.Yield({}); } catch (e) { return e.message; } })()");
    assert!(thrown.as_str().is_some_and(|message| message.contains("Yield expects an awaitable")));
}

#[test]
fn off_thread_completion_resolves_during_update() {
    let (mut runtime, _logger) = runtime_with_main("");
    let (sender, receiver) = mpsc::channel();
    {
        let context = runtime.main_context().expect("main context");
        let promise = context
            .yield_operation(AsyncOperation::task(move |completer| sender.send(completer).expect("hand off completer")))
            .expect("yield task");
        context.set_global("pending", &promise).expect("expose promise");
        context.eval_source("pending.then(function (value) { globalThis.score = value.score; });", "wait.js");
    }
    let completer = receiver.recv().expect("completer");
    let wait = completer.wait_id();
    assert_eq!(runtime.main_context().expect("main context").wait_state(wait), Some(WaitState::Pending));

    thread::spawn(move || completer.resolve(json!({ "score": 7 }))).join().expect("join worker");
    assert_eq!(runtime.pending_completions(), 1);
    assert_eq!(eval(&runtime, "typeof globalThis.score"), json!("undefined"));

    runtime.update(FRAME);
    assert_eq!(eval(&runtime, "score"), json!(7));
    assert_eq!(runtime.pending_completions(), 0);
    assert_eq!(runtime.main_context().expect("main context").wait_state(wait), None);
}

#[test]
fn rejected_and_dropped_tasks_reject_the_promise() {
    let (mut runtime, _logger) = runtime_with_main("globalThis.reasons = [];");
    let (sender, receiver) = mpsc::channel();
    {
        let context = runtime.main_context().expect("main context");
        for name in ["rejected", "dropped"] {
            let sender = sender.clone();
            let promise = context
                .yield_operation(AsyncOperation::task(move |completer| sender.send(completer).expect("hand off")))
                .expect("yield task");
            context.set_global(name, &promise).expect("expose promise");
        }
        context.eval_source(
            "rejected.catch(function (e) { reasons.push(e.message); });\ndropped.catch(function (e) { reasons.push(e.message); });",
            "wait.js",
        );
    }
    let rejected = receiver.recv().expect("first completer");
    let dropped = receiver.recv().expect("second completer");
    rejected.reject("disk on fire");
    drop(dropped);

    runtime.update(FRAME);
    assert_eq!(eval(&runtime, "reasons"), json!(["disk on fire", "host operation dropped before completing"]));
}

#[test]
fn destroy_cancels_pending_waits_and_leaves_no_frees() {
    let (mut runtime, _logger) = runtime_with_main(
        "globalThis.resumed = 0;\nfor (var i = 0; i < 3; i++) {\n  (async function () { await jsb.Yield(jsb.WaitForSeconds(100)); resumed++; })();\n}",
    );
    let (sender, receiver) = mpsc::channel();
    let orphan = {
        let context = runtime.main_context().expect("main context");
        assert_eq!(context.pending_waits(), 3);
        let promise = context
            .yield_operation(AsyncOperation::task(move |completer| sender.send(completer).expect("hand off")))
            .expect("yield task");
        drop(promise);
        context.eval_handle("({ leaked: true })").expect("hold a value")
    };
    assert_eq!(runtime.pending_frees(), 1);

    let stats = runtime.destroy();
    assert_eq!(stats.contexts, 1);
    assert_eq!(stats.cancelled_waits, 4);
    assert_eq!(stats.released_handles, 1);
    assert_eq!(runtime.pending_frees(), 0);
    assert_eq!(runtime.live_handles(), 0);

    let completer = receiver.recv().expect("completer");
    completer.resolve(json!(null));
    drop(orphan);
    assert_eq!(runtime.pending_frees(), 0);
    assert_eq!(runtime.pending_completions(), 0);
    assert_eq!(runtime.destroy(), Default::default());
}

#[test]
fn timers_fire_from_update() {
    let (mut runtime, logger) = runtime_with_main(
        "globalThis.log = [];\nglobalThis.ticks = 0;\nsetTimeout(function () { log.push('timeout'); }, 100);\nvar id = setInterval(function () { ticks++; if (ticks === 3) clearInterval(id); }, 50);\nvar cancelled = setTimeout(function () { log.push('cancelled'); }, 10);\nclearTimeout(cancelled);\nsetTimeout(function () { throw new Error('timer blew up'); }, 0);",
    );
    for _ in 0..5 {
        runtime.update(Duration::from_millis(60));
    }
    assert_eq!(eval(&runtime, "log"), json!(["timeout"]));
    assert_eq!(eval(&runtime, "ticks"), json!(3));
    assert!(logger.contains("timer blew up"));
}
