//! Built-in utilities and shell special forms (SPEC_FULL.md §4.3, §4.6).
//!
//! Most of these are expressed as `Monitor`/`Printer`/`Caller` adapters —
//! the filters (`grep`, `head`, `tail`) read their arguments back out of
//! `core().args` inside the closure rather than capturing them at
//! construction time, since `spawn` runs before the pipeline's `execute`
//! resolves `$name` substitution and assigns `args`. A few utilities need
//! the storage service, which is async; their `on_execute` kicks off a
//! `tokio::task::spawn_local` (the graph is `Rc`-based, not `Send`) and the
//! spawned task delivers the result by calling `process::write`/`exit` on
//! its own handle once storage resolves — exactly the async-completion
//! path SPEC_FULL.md §5 describes.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use regex::Regex;
use tracing::warn;

use crate::adapters::{Caller, Monitor, Printer};
use crate::error::ServiceError;
use crate::output::Output;
use crate::process::{self, next_id, EofOutcome, ExecuteOutcome, Process, ProcessCore, ProcessHandle};
use crate::services::{self, Storage};
use crate::shell::{ShellEnv, ShellHandle};

/// Resolve a built-in or special-form name to a freshly constructed,
/// not-yet-executed process. `None` means "no such command" (exit 127).
pub fn spawn(
    name: &str,
    shell: &ShellHandle,
    env: &ShellEnv,
    _variables: &HashMap<String, String>,
) -> Option<ProcessHandle> {
    match name {
        "echo" => Some(spawn_echo()),
        "set" => Some(spawn_set(shell.clone())),
        "exit" => Some(spawn_exit(shell.clone(), env.error_sink.clone())),
        "read" => Some(spawn_read(shell.clone())),
        "history" => Some(spawn_history(shell)),
        "cat" => Some(spawn_cat(env.storage.clone(), env.error_sink.clone())),
        "ls" => Some(spawn_ls(env.storage.clone())),
        "mv" => Some(spawn_mv(env.storage.clone(), env.error_sink.clone())),
        "rm" => Some(spawn_rm(env.storage.clone())),
        "curl" => Some(spawn_curl(env.error_sink.clone())),
        "sleep" => Some(spawn_sleep()),
        "clear" => Some(spawn_clear(env.terminal.clone())),
        "tee" => Some(spawn_tee(env.storage.clone())),
        "head" => Some(spawn_head()),
        "tail" => Some(spawn_tail()),
        "grep" => Some(spawn_grep()),
        "ps" => Some(spawn_ps(env.terminal.clone())),
        "vi" => Some(crate::editor::spawn(env.storage.clone(), env.error_sink.clone())),
        "js" => Some(spawn_js()),
        _ => None,
    }
}

fn current_args(handle: &ProcessHandle) -> Vec<String> {
    handle.borrow().core().args.clone()
}

fn forward(handle: &ProcessHandle, payload: Output) {
    let out = handle.borrow().core().stdout.upgrade();
    if let Some(out) = out {
        process::write(&out, payload);
    }
}

fn report_error(error_sink: &ProcessHandle, message: String) {
    process::write(error_sink, Output::text(message));
}

// ── special forms ──────────────────────────────────────────────────────

fn spawn_echo() -> ProcessHandle {
    Caller::new(|handle| {
        let args = current_args(handle);
        forward(handle, Output::text(args.join(" ")));
        0
    })
}

fn spawn_set(shell: ShellHandle) -> ProcessHandle {
    Caller::new(move |handle| {
        let args = current_args(handle);
        let Some(name) = args.first() else {
            return 1;
        };
        let value = args[1..].join(" ");
        shell.borrow_mut().core_mut().variables.insert(name.clone(), value);
        0
    })
}

fn spawn_exit(shell: ShellHandle, error_sink: ProcessHandle) -> ProcessHandle {
    Caller::new(move |handle| {
        let args = current_args(handle);
        let code = match args.first() {
            None => 0,
            Some(s) => match s.parse::<i32>() {
                Ok(n) => n,
                Err(_) => {
                    report_error(&error_sink, format!("exit: {s}: numeric argument required"));
                    shell.borrow_mut().request_exit(2);
                    return 2;
                }
            },
        };
        shell.borrow_mut().request_exit(code);
        code
    })
}

fn spawn_read(shell: ShellHandle) -> ProcessHandle {
    Monitor::new(move |handle, payload| {
        let args = current_args(handle);
        if let Some(name) = args.first() {
            shell
                .borrow_mut()
                .core_mut()
                .variables
                .insert(name.clone(), payload.str());
        }
        false
    })
}

fn spawn_history(shell: &ShellHandle) -> ProcessHandle {
    let text = shell.borrow().core().history.join("\n");
    Printer::new(Output::text(text))
}

// ── storage-backed utilities ────────────────────────────────────────────

fn spawn_cat(storage: Storage, error_sink: ProcessHandle) -> ProcessHandle {
    GenericAsync::new(move |handle| {
        let storage = storage.clone();
        let error_sink = error_sink.clone();
        Box::pin(async move {
            let args = current_args(&handle);
            let Some(path) = args.first().cloned() else {
                report_error(&error_sink, "cat: missing operand".into());
                process::exit(&handle, 1);
                return;
            };
            match storage.read(&path).await {
                Ok(content) => {
                    forward(&handle, Output::text(content));
                    process::exit(&handle, 0);
                }
                Err(_) => {
                    report_error(&error_sink, format!("cat: {path}: no such file"));
                    process::exit(&handle, 1);
                }
            }
        })
    })
}

fn spawn_ls(storage: Storage) -> ProcessHandle {
    GenericAsync::new(move |handle| {
        let storage = storage.clone();
        Box::pin(async move {
            let keys = storage.list("").await.unwrap_or_default();
            let items: Vec<Output> = keys.into_iter().map(Output::text).collect();
            forward(&handle, Output::multicolumn(items));
            process::exit(&handle, 0);
        })
    })
}

fn spawn_mv(storage: Storage, error_sink: ProcessHandle) -> ProcessHandle {
    GenericAsync::new(move |handle| {
        let storage = storage.clone();
        let error_sink = error_sink.clone();
        Box::pin(async move {
            let args = current_args(&handle);
            if args.len() < 2 {
                report_error(&error_sink, "mv: missing operand".into());
                process::exit(&handle, 1);
                return;
            }
            match storage.mv(&args[0], &args[1]).await {
                Ok(()) => process::exit(&handle, 0),
                Err(_) => {
                    report_error(&error_sink, format!("mv: {}: no such file", args[0]));
                    process::exit(&handle, 1);
                }
            }
        })
    })
}

fn spawn_rm(storage: Storage) -> ProcessHandle {
    GenericAsync::new(move |handle| {
        let storage = storage.clone();
        Box::pin(async move {
            let args = current_args(&handle);
            if let Some(path) = args.first() {
                let _ = storage.remove(path).await;
            }
            process::exit(&handle, 0);
        })
    })
}

fn spawn_curl(error_sink: ProcessHandle) -> ProcessHandle {
    GenericAsync::new(move |handle| {
        let error_sink = error_sink.clone();
        Box::pin(async move {
            let args = current_args(&handle);
            let Some(url) = args.first().cloned() else {
                report_error(&error_sink, "curl: missing url".into());
                process::exit(&handle, 1);
                return;
            };
            let result = services::request(reqwest::Method::GET, url, 0).await;
            match result {
                Ok(Ok(body)) => {
                    forward(&handle, Output::text(body));
                    process::exit(&handle, 0);
                }
                Ok(Err(ServiceError::Http(status))) => {
                    report_error(&error_sink, format!("curl: HTTP {status}"));
                    process::exit(&handle, 1);
                }
                Ok(Err(e)) => {
                    report_error(&error_sink, format!("curl: {e}"));
                    process::exit(&handle, 1);
                }
                Err(e) => {
                    warn!(error = %e, "curl task join failed");
                    process::exit(&handle, 1);
                }
            }
        })
    })
}

/// `sleep seconds`: aborts its timer on interrupt or early EOF, per the
/// abortable-handle rule in SPEC_FULL.md §5.
struct Sleep {
    core: ProcessCore,
    abort: Option<tokio::task::AbortHandle>,
}

impl Process for Sleep {
    fn core(&self) -> &ProcessCore {
        &self.core
    }
    fn core_mut(&mut self) -> &mut ProcessCore {
        &mut self.core
    }
    fn on_execute(&mut self, handle: &ProcessHandle, args: &[String]) -> ExecuteOutcome {
        let secs: f64 = args.first().and_then(|s| s.parse().ok()).unwrap_or(0.0);
        let ms = (secs.max(0.0) * 1000.0) as u64;
        let timer = services::timeout(ms);
        self.abort = Some(timer.abort_handle());
        let handle = handle.clone();
        tokio::task::spawn_local(async move {
            if timer.await.is_ok() {
                process::exit(&handle, 0);
            }
        });
        None
    }
    fn on_interrupt(&mut self, _handle: &ProcessHandle) -> crate::process::InterruptOutcome {
        if let Some(abort) = self.abort.take() {
            abort.abort();
        }
        crate::process::InterruptOutcome::PropagateAndExit(130)
    }
    fn on_eof(&mut self, _handle: &ProcessHandle) -> EofOutcome {
        if let Some(abort) = self.abort.take() {
            abort.abort();
        }
        EofOutcome::ExitNormally
    }
}

fn spawn_sleep() -> ProcessHandle {
    Rc::new(RefCell::new(Sleep {
        core: ProcessCore::new(next_id()),
        abort: None,
    }))
}

fn spawn_clear(terminal: crate::terminal::TerminalHandle) -> ProcessHandle {
    Caller::new(move |_handle| {
        terminal.borrow_mut().output_pane.clear();
        0
    })
}

/// Forwards each write downstream unchanged and fire-and-forget appends it
/// to the named file.
fn spawn_tee(storage: Storage) -> ProcessHandle {
    Monitor::new(move |handle, payload| {
        let args = current_args(handle);
        if let Some(path) = args.first() {
            let storage = storage.clone();
            let path = path.clone();
            let line = payload.str();
            tokio::task::spawn_local(async move {
                if let Err(e) = storage.append(&path, &format!("{line}\n")).await {
                    warn!(error = %e, "tee append failed");
                }
            });
        }
        forward(handle, payload.clone());
        true
    })
}

// ── buffering filters ───────────────────────────────────────────────────

/// Buffers every `items()` element it sees and, on EOF (or early once the
/// count is reached), writes a single aggregated `Array` downstream.
fn spawn_head() -> ProcessHandle {
    let seen: Rc<RefCell<Vec<Output>>> = Rc::new(RefCell::new(Vec::new()));
    let w = seen.clone();
    Monitor::with_eof(
        move |handle, payload| {
            let n: usize = current_args(handle)
                .first()
                .and_then(|s| s.parse().ok())
                .unwrap_or(10);
            let mut buf = w.borrow_mut();
            for item in payload.items() {
                if buf.len() >= n {
                    break;
                }
                buf.push(item);
            }
            if buf.len() >= n {
                // Count reached: flush now, since `write`'s `false` path
                // exits this process before any EOF ever reaches it.
                forward(handle, Output::array(buf.clone()));
                false
            } else {
                true
            }
        },
        move |handle| {
            forward(handle, Output::array(seen.borrow().clone()));
            EofOutcome::ExitNormally
        },
    )
}

/// Ring buffer of the last N items, emitted as one `Array` on EOF.
fn spawn_tail() -> ProcessHandle {
    let seen: Rc<RefCell<Vec<Output>>> = Rc::new(RefCell::new(Vec::new()));
    let w = seen.clone();
    Monitor::with_eof(
        move |handle, payload| {
            let n: usize = current_args(handle)
                .first()
                .and_then(|s| s.parse().ok())
                .unwrap_or(10);
            let mut buf = w.borrow_mut();
            for item in payload.items() {
                buf.push(item);
                if buf.len() > n {
                    buf.remove(0);
                }
            }
            true
        },
        move |handle| {
            forward(handle, Output::array(seen.borrow().clone()));
            EofOutcome::ExitNormally
        },
    )
}

/// Filters items by regex against their `str()` form, emitted as one
/// `Array` on EOF.
fn spawn_grep() -> ProcessHandle {
    let matched: Rc<RefCell<Vec<Output>>> = Rc::new(RefCell::new(Vec::new()));
    let w = matched.clone();
    Monitor::with_eof(
        move |handle, payload| {
            let pattern = current_args(handle).first().cloned().unwrap_or_default();
            if let Ok(re) = Regex::new(&pattern) {
                let mut buf = w.borrow_mut();
                for item in payload.items() {
                    if re.is_match(&item.str()) {
                        buf.push(item);
                    }
                }
            }
            true
        },
        move |handle| {
            let buf = matched.borrow();
            if !buf.is_empty() {
                forward(handle, Output::array(buf.clone()));
            }
            EofOutcome::ExitNormally
        },
    )
}

// ── process tree introspection ──────────────────────────────────────────

fn spawn_ps(terminal: crate::terminal::TerminalHandle) -> ProcessHandle {
    Caller::new(move |handle| {
        let root = crate::terminal::Terminal::as_process(&terminal);
        let mut records = Vec::new();
        collect_ps(&root, &mut records);
        forward(handle, Output::Object(serde_json::Value::Array(records)));
        0
    })
}

fn collect_ps(handle: &ProcessHandle, out: &mut Vec<serde_json::Value>) {
    let node = handle.borrow();
    out.push(serde_json::json!({
        "id": node.core().id,
        "state": format!("{:?}", node.core().state),
    }));
    let children = node.core().children.clone();
    drop(node);
    for child in &children {
        collect_ps(child, out);
    }
}

// ── tiny left-to-right arithmetic evaluator for `js` ────────────────────

fn spawn_js() -> ProcessHandle {
    Caller::new(|handle| {
        let args = current_args(handle);
        match eval_arithmetic(&args.join(" ")) {
            Ok(value) => {
                forward(handle, Output::text(format_number(value)));
                0
            }
            Err(message) => {
                forward(handle, Output::text(message));
                1
            }
        }
    })
}

fn format_number(n: f64) -> String {
    if n.fract() == 0.0 {
        format!("{}", n as i64)
    } else {
        n.to_string()
    }
}

/// Left-to-right, no operator precedence — `js` is specified only at the
/// contract level (SPEC_FULL.md §1 Out of scope); this covers the common
/// "quick calculator" case without pulling in a full expression engine.
fn eval_arithmetic(expr: &str) -> Result<f64, String> {
    let tokens: Vec<&str> = expr.split_whitespace().collect();
    if tokens.is_empty() {
        return Err("js: empty expression".into());
    }
    let mut acc: f64 = tokens[0]
        .parse()
        .map_err(|_| format!("js: not a number: {}", tokens[0]))?;
    let mut i = 1;
    while i < tokens.len() {
        let op = tokens[i];
        let Some(rhs_tok) = tokens.get(i + 1) else {
            return Err("js: dangling operator".into());
        };
        let rhs: f64 = rhs_tok
            .parse()
            .map_err(|_| format!("js: not a number: {rhs_tok}"))?;
        acc = match op {
            "+" => acc + rhs,
            "-" => acc - rhs,
            "*" => acc * rhs,
            "/" => acc / rhs,
            other => return Err(format!("js: unknown operator: {other}")),
        };
        i += 2;
    }
    Ok(acc)
}

/// A `Process` whose `on_execute` spawns a local async task to produce its
/// result, rather than computing one synchronously. The task is
/// responsible for calling `process::write`/`process::exit` on its own
/// handle once it resolves.
struct GenericAsync {
    core: ProcessCore,
    #[allow(clippy::type_complexity)]
    start: Option<Box<dyn FnOnce(ProcessHandle) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()>>>>>,
}

impl GenericAsync {
    fn new(
        start: impl FnOnce(ProcessHandle) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()>>> + 'static,
    ) -> ProcessHandle {
        Rc::new(RefCell::new(GenericAsync {
            core: ProcessCore::new(next_id()),
            start: Some(Box::new(start)),
        }))
    }
}

impl Process for GenericAsync {
    fn core(&self) -> &ProcessCore {
        &self.core
    }
    fn core_mut(&mut self) -> &mut ProcessCore {
        &mut self.core
    }
    fn on_execute(&mut self, handle: &ProcessHandle, _args: &[String]) -> ExecuteOutcome {
        if let Some(start) = self.start.take() {
            let handle = handle.clone();
            tokio::task::spawn_local(start(handle));
        }
        None
    }
}
