//! Adapter process kinds (SPEC_FULL.md §4.6): small `Process` impls that let
//! simple built-ins and shell special forms be near one-liners instead of
//! full hand-rolled state machines.

use std::cell::RefCell;
use std::rc::Rc;

use crate::output::Output;
use crate::process::{
    next_id, EofOutcome, ExecuteOutcome, Process, ProcessCore, ProcessHandle, ProcessState,
};

/// Invokes a callback on every write, and an optional callback on EOF.
/// Used for `read`, `js`, `tee`, and any filter whose logic is a plain
/// closure over `(self, payload)`.
pub struct Monitor {
    core: ProcessCore,
    on_write: Box<dyn FnMut(&ProcessHandle, &Output) -> bool>,
    on_eof: Option<Box<dyn FnMut(&ProcessHandle) -> EofOutcome>>,
}

impl Monitor {
    pub fn new(
        on_write: impl FnMut(&ProcessHandle, &Output) -> bool + 'static,
    ) -> Rc<RefCell<Monitor>> {
        Rc::new(RefCell::new(Monitor {
            core: ProcessCore::new(next_id()),
            on_write: Box::new(on_write),
            on_eof: None,
        }))
    }

    pub fn with_eof(
        on_write: impl FnMut(&ProcessHandle, &Output) -> bool + 'static,
        on_eof: impl FnMut(&ProcessHandle) -> EofOutcome + 'static,
    ) -> Rc<RefCell<Monitor>> {
        Rc::new(RefCell::new(Monitor {
            core: ProcessCore::new(next_id()),
            on_write: Box::new(on_write),
            on_eof: Some(Box::new(on_eof)),
        }))
    }
}

impl Process for Monitor {
    fn core(&self) -> &ProcessCore {
        &self.core
    }
    fn core_mut(&mut self) -> &mut ProcessCore {
        &mut self.core
    }
    fn on_write(&mut self, handle: &ProcessHandle, payload: &Output) -> bool {
        (self.on_write)(handle, payload)
    }
    fn on_eof(&mut self, handle: &ProcessHandle) -> EofOutcome {
        match &mut self.on_eof {
            Some(cb) => cb(handle),
            None => EofOutcome::ExitNormally,
        }
    }
}

/// Writes a fixed payload on execute, then exits 0. Used for `history`
/// (joined history) and anything that emits a static value.
pub struct Printer {
    core: ProcessCore,
    payload: Output,
}

impl Printer {
    pub fn new(payload: Output) -> Rc<RefCell<Printer>> {
        Rc::new(RefCell::new(Printer {
            core: ProcessCore::new(next_id()),
            payload,
        }))
    }
}

impl Process for Printer {
    fn core(&self) -> &ProcessCore {
        &self.core
    }
    fn core_mut(&mut self) -> &mut ProcessCore {
        &mut self.core
    }
    fn on_execute(&mut self, handle: &ProcessHandle, _args: &[String]) -> ExecuteOutcome {
        let stdout = self.core.stdout.upgrade();
        if let Some(out) = stdout {
            crate::process::write(&out, self.payload.clone());
        }
        let _ = handle;
        Some(0)
    }
}

/// Invokes a one-shot effect on execute, then exits with the code it
/// returns. Used for `echo`, `set`, `exit`.
pub struct Caller {
    core: ProcessCore,
    effect: Option<Box<dyn FnOnce(&ProcessHandle) -> i32>>,
}

impl Caller {
    pub fn new(effect: impl FnOnce(&ProcessHandle) -> i32 + 'static) -> Rc<RefCell<Caller>> {
        Rc::new(RefCell::new(Caller {
            core: ProcessCore::new(next_id()),
            effect: Some(Box::new(effect)),
        }))
    }
}

impl Process for Caller {
    fn core(&self) -> &ProcessCore {
        &self.core
    }
    fn core_mut(&mut self) -> &mut ProcessCore {
        &mut self.core
    }
    fn on_execute(&mut self, handle: &ProcessHandle, _args: &[String]) -> ExecuteOutcome {
        let effect = self.effect.take();
        let code = match effect {
            Some(f) => f(handle),
            None => 0,
        };
        Some(code)
    }
}

/// Convenience: true once `handle` is in any terminal state other than
/// `Running` (used by a few built-ins to decide whether to keep looping).
pub fn is_running(handle: &ProcessHandle) -> bool {
    handle.borrow().core().state == ProcessState::Running
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::execute;
    use std::cell::RefCell as Cell;
    use std::rc::Rc as Shared;

    #[test]
    fn printer_writes_then_exits() {
        let captured: Shared<Cell<Vec<String>>> = Shared::new(Cell::new(Vec::new()));
        let captured2 = captured.clone();
        let sink = Monitor::new(move |_h, p| {
            captured2.borrow_mut().push(p.str());
            true
        });
        let sink_handle: ProcessHandle = sink.clone();
        execute(&sink_handle, vec![]);

        let printer = Printer::new(Output::text("hi"));
        printer.borrow_mut().core_mut().stdout = Rc::downgrade(&sink_handle);
        let printer_handle: ProcessHandle = printer.clone();
        execute(&printer_handle, vec![]);

        assert_eq!(*captured.borrow(), vec!["hi".to_string()]);
        assert_eq!(printer_handle.borrow().core().state, ProcessState::Terminated);
    }

    #[test]
    fn caller_runs_effect_and_exits_with_its_code() {
        let caller = Caller::new(|_h| 7);
        let handle: ProcessHandle = caller;
        execute(&handle, vec![]);
        assert_eq!(handle.borrow().core().state, ProcessState::Terminated);
    }
}
