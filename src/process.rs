//! The process lifecycle state machine and stream graph (SPEC_FULL.md §3, §4.1).
//!
//! Every runnable unit — the shell, the terminal, an adapter, a built-in —
//! implements [`Process`] and is held behind `Rc<RefCell<dyn Process>>`.
//! `stdin`/`stdout`/`stderr`/`parent` are `Weak`: the stream graph has
//! back-edges and must not keep processes alive once their owner drops them.
//! Ownership runs parent → child only, through `children`.
//!
//! Hooks never reach back into their own handle — see the outcome enums
//! below — because the dispatcher holds an exclusive `RefCell` borrow while
//! calling them. Cascading effects (exit, eof, interrupt) on *other*
//! processes are fine; on *self* they must come back out as a return value.

use std::cell::RefCell;
use std::rc::{Rc, Weak};

use tracing::{debug, trace};

use crate::output::Output;

pub type ProcessHandle = Rc<RefCell<dyn Process>>;
pub type WeakProcess = Weak<RefCell<dyn Process>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    Ready,
    Running,
    Terminated,
}

/// Outcome of `on_execute`: `None` leaves the process running (the common
/// case for long-lived adapters and the shell itself); `Some(code)` exits
/// it immediately with that code (one-shot builtins).
pub type ExecuteOutcome = Option<i32>;

/// Outcome of `on_eof`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EofOutcome {
    /// The hook already did everything it needs to.
    Handled,
    /// Apply the default: exit(0) iff `input_enabled`.
    ExitNormally,
}

/// Outcome of `on_interrupt`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterruptOutcome {
    Handled,
    /// Bubble to the parent, then exit self with `code`.
    PropagateAndExit(i32),
}

/// Outcome of `on_return`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReturnOutcome {
    Continue,
    ExitSelf(i32),
}

/// Outcome of `on_input` (only invoked when `raw_input` is set).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputOutcome {
    Continue,
    Exit(i32),
}

/// A single key/control event delivered to a `raw_input` process (the
/// editor). Mirrors the subset of `crossterm::event::KeyEvent` the core
/// cares about, so `process.rs` does not need a `crossterm` dependency.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InputEvent {
    Char(char),
    Enter,
    Escape,
    Backspace,
    Left,
    Right,
    Up,
    Down,
}

/// Fields common to every process (SPEC_FULL.md §3).
pub struct ProcessCore {
    pub id: u64,
    pub state: ProcessState,
    pub parent: WeakProcess,
    pub children: Vec<ProcessHandle>,
    /// Every member of the pipeline this process belongs to, including
    /// itself. A lone process has `job = [self]`.
    pub job: Vec<WeakProcess>,
    pub stdin: WeakProcess,
    pub stdout: WeakProcess,
    pub stderr: WeakProcess,
    pub args: Vec<String>,
    pub variables: std::collections::HashMap<String, String>,
    pub history: Vec<String>,
    pub history_index: usize,
    /// The in-progress line preserved while browsing history (§4.2).
    pub newest: Option<String>,
    pub input_enabled: bool,
    pub echo: bool,
    pub password: bool,
    pub raw_input: bool,
    pub tty: bool,
    pub exit_input: Option<String>,
    pub prompt: Output,
    pub input_ended: bool,
}

impl ProcessCore {
    pub fn new(id: u64) -> Self {
        ProcessCore {
            id,
            state: ProcessState::Ready,
            parent: Weak::new(),
            children: Vec::new(),
            job: Vec::new(),
            stdin: Weak::new(),
            stdout: Weak::new(),
            stderr: Weak::new(),
            args: Vec::new(),
            variables: std::collections::HashMap::new(),
            history: Vec::new(),
            history_index: 0,
            newest: None,
            input_enabled: true,
            echo: false,
            password: false,
            raw_input: false,
            tty: false,
            exit_input: None,
            prompt: Output::text(""),
            input_ended: false,
        }
    }

    /// Snapshot-copy `variables` from a parent, per the environment-map
    /// invariant in §3: a child never shares, and never mutates upward.
    pub fn inherit_variables(&mut self, parent: &ProcessCore) {
        self.variables = parent.variables.clone();
    }
}

/// The common interface every process kind implements.
pub trait Process {
    fn core(&self) -> &ProcessCore;
    fn core_mut(&mut self) -> &mut ProcessCore;

    fn on_execute(&mut self, _handle: &ProcessHandle, _args: &[String]) -> ExecuteOutcome {
        None
    }

    /// Returning `false` disables further writes (the writer should stop
    /// producing; `write()` itself then also returns `false`).
    fn on_write(&mut self, _handle: &ProcessHandle, _payload: &Output) -> bool {
        true
    }

    fn on_input(&mut self, _handle: &ProcessHandle, _event: &InputEvent) -> InputOutcome {
        InputOutcome::Continue
    }

    fn on_eof(&mut self, _handle: &ProcessHandle) -> EofOutcome {
        EofOutcome::ExitNormally
    }

    fn on_interrupt(&mut self, _handle: &ProcessHandle) -> InterruptOutcome {
        InterruptOutcome::PropagateAndExit(130)
    }

    fn on_return(&mut self, _handle: &ProcessHandle, _child: &ProcessHandle, _code: i32) -> ReturnOutcome {
        ReturnOutcome::Continue
    }
}

static NEXT_ID: std::sync::atomic::AtomicU64 = std::sync::atomic::AtomicU64::new(1);

/// Allocate the next process id (monotonic, used as a `tracing` span field).
pub fn next_id() -> u64 {
    NEXT_ID.fetch_add(1, std::sync::atomic::Ordering::Relaxed)
}

// ── orchestration ──────────────────────────────────────────────────────
//
// These free functions are the only places that transition process state.
// Each one is careful to drop its `RefCell` borrow before touching another
// handle, including (when the cascade demands it) re-entering the *same*
// handle for a follow-up step.

/// READY → RUNNING. See SPEC_FULL.md §4.1.
pub fn execute(handle: &ProcessHandle, args: Vec<String>) {
    let ready = handle.borrow().core().state == ProcessState::Ready;
    if !ready {
        return;
    }

    {
        let mut node = handle.borrow_mut();
        node.core_mut().state = ProcessState::Running;
        node.core_mut().args = args.clone();
    }

    let stdin_handle = handle.borrow().core().stdin.upgrade();
    let upstream_terminated = if let Some(up) = &stdin_handle {
        up.borrow_mut().core_mut().stdout = Rc::downgrade(handle);
        up.borrow().core().state == ProcessState::Terminated
    } else {
        false
    };

    let parent_handle = handle.borrow().core().parent.upgrade();
    if let Some(parent) = &parent_handle {
        parent.borrow_mut().core_mut().children.push(Rc::clone(handle));
    }

    let id = handle.borrow().core().id;
    trace!(process = id, ?args, "execute");
    let outcome = handle.borrow_mut().on_execute(handle, &args);

    if upstream_terminated {
        eof(handle);
    }

    if let Some(code) = outcome {
        exit(handle, code);
    }
}

/// Deliver `payload` iff RUNNING ∧ input_enabled. Returns whether the
/// writer should keep producing. A hook declining further writes
/// (`false`) is treated as "this process is done" — it exits normally
/// right away, so a filter like `head` that stops after N items still
/// flushes downstream and frees up the foreground the same turn.
pub fn write(handle: &ProcessHandle, payload: Output) -> bool {
    let eligible = {
        let node = handle.borrow();
        node.core().state == ProcessState::Running && node.core().input_enabled
    };
    if !eligible {
        return false;
    }
    let keep_going = handle.borrow_mut().on_write(handle, &payload);
    if !keep_going {
        exit(handle, 0);
    }
    keep_going
}

/// Deliver a raw input event (only meaningful when `raw_input` is set).
pub fn input(handle: &ProcessHandle, event: InputEvent) {
    let eligible = {
        let node = handle.borrow();
        node.core().state == ProcessState::Running && node.core().raw_input
    };
    if !eligible {
        return;
    }
    let outcome = handle.borrow_mut().on_input(handle, &event);
    if let InputOutcome::Exit(code) = outcome {
        exit(handle, code);
    }
}

/// At-most-once end-of-input signal.
pub fn eof(handle: &ProcessHandle) {
    let should_invoke = {
        let node = handle.borrow();
        node.core().state == ProcessState::Running && !node.core().input_ended
    };
    if !should_invoke {
        return;
    }
    handle.borrow_mut().core_mut().input_ended = true;
    let outcome = handle.borrow_mut().on_eof(handle);
    if outcome == EofOutcome::ExitNormally {
        let enabled = handle.borrow().core().input_enabled;
        if enabled {
            exit(handle, 0);
        }
    }
}

/// Interrupt (Ctrl-C). Default: bubble to parent, then exit with `code`.
pub fn interrupt(handle: &ProcessHandle) {
    let running = handle.borrow().core().state == ProcessState::Running;
    if !running {
        return;
    }
    let outcome = handle.borrow_mut().on_interrupt(handle);
    if let InterruptOutcome::PropagateAndExit(code) = outcome {
        let parent = handle.borrow().core().parent.upgrade();
        if let Some(parent) = parent {
            interrupt(&parent);
        }
        exit(handle, code);
    }
}

/// RUNNING → TERMINATED, at most once. See SPEC_FULL.md §4.1 and the
/// "tail-of-pipeline flush" decision recorded in DESIGN.md.
pub fn exit(handle: &ProcessHandle, code: i32) {
    let running = handle.borrow().core().state == ProcessState::Running;
    if !running {
        return;
    }

    // Open Question (3): give a process that is exiting without ever
    // having seen its upstream's EOF one last chance to flush (e.g. a
    // buffering filter like `tail`), before marking it terminated.
    {
        let (already_ended, upstream_terminated) = {
            let node = handle.borrow();
            let up = node.core().stdin.upgrade();
            (
                node.core().input_ended,
                up.map(|u| u.borrow().core().state == ProcessState::Terminated)
                    .unwrap_or(false),
            )
        };
        if !already_ended && upstream_terminated {
            handle.borrow_mut().core_mut().input_ended = true;
            let _ = handle.borrow_mut().on_eof(handle);
        }
    }

    let id = handle.borrow().core().id;
    debug!(process = id, code, "exit");

    {
        let mut node = handle.borrow_mut();
        node.core_mut().state = ProcessState::Terminated;
        node.core_mut().input_enabled = false;
    }

    let children: Vec<ProcessHandle> = handle.borrow().core().children.clone();
    for child in &children {
        exit(child, 0);
    }

    let stdout = handle.borrow().core().stdout.upgrade();
    if let Some(out) = &stdout {
        eof(out);
    }
    let stderr = handle.borrow().core().stderr.upgrade();
    if let Some(err) = &stderr {
        eof(err);
    }

    let job_returned = {
        let node = handle.borrow();
        node.core().job.iter().all(|w| {
            w.upgrade()
                .map(|p| p.borrow().core().state == ProcessState::Terminated)
                .unwrap_or(true)
        })
    };
    if job_returned {
        let leader = handle.borrow().core().job.first().and_then(|w| w.upgrade());
        let parent = handle.borrow().core().parent.upgrade();
        if let (Some(leader), Some(parent)) = (leader, parent) {
            let upstream = leader.borrow().core().stdin.upgrade();
            if let Some(upstream) = upstream {
                upstream.borrow_mut().core_mut().stdout = Rc::downgrade(&parent);
            }
        }
    }

    let parent = handle.borrow().core().parent.upgrade();
    if let Some(parent) = &parent {
        parent
            .borrow_mut()
            .core_mut()
            .children
            .retain(|c| !Rc::ptr_eq(c, handle));
        let parent_running = parent.borrow().core().state == ProcessState::Running;
        if parent_running {
            let outcome = parent.borrow_mut().on_return(parent, handle, code);
            if let ReturnOutcome::ExitSelf(c) = outcome {
                exit(parent, c);
            }
        }
    }
}
