//! The controlling TTY (SPEC_FULL.md §4.2): owns the keyboard, the
//! in-progress input line, the output pane, and the foreground pointer
//! (realized, per invariant 1, as this process's own generic `stdout`
//! field — restoring it on job return is handled entirely by
//! `process::exit`; the terminal only ever reads it).
//!
//! Line discipline lives here as free functions over a concrete
//! `TerminalHandle` rather than as `Process` hooks, because it needs
//! direct access to the input buffer and output pane alongside generic
//! process orchestration (`write`/`eof`/`interrupt`) on a *different*
//! handle (the foreground process) — exactly the situation §9's "hook
//! outcomes, not hook side effects" note is about, except here there is no
//! hook at all, just an ordinary function with two handles in scope.

use std::cell::RefCell;
use std::rc::Rc;

use crate::output::Output;
use crate::process::{self, next_id, InputEvent, Process, ProcessCore, ProcessHandle, ReturnOutcome};

pub type TerminalHandle = Rc<RefCell<Terminal>>;

/// A key event as the host (real TTY or test harness) sees it. Deliberately
/// narrower than `crossterm::event::KeyEvent` so this module has no
/// dependency on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Key {
    Char(char),
    Enter,
    Escape,
    Backspace,
    Delete,
    Left,
    Right,
    Up,
    Down,
    CtrlC,
    CtrlD,
    CtrlL,
    CtrlU,
}

pub struct Terminal {
    core: ProcessCore,
    pub input: Vec<char>,
    pub cursor: usize,
    pub output_pane: Vec<String>,
    pub ended: bool,
}

impl Terminal {
    pub fn new() -> TerminalHandle {
        Rc::new(RefCell::new(Terminal {
            core: ProcessCore::new(next_id()),
            input: Vec::new(),
            cursor: 0,
            output_pane: Vec::new(),
            ended: false,
        }))
    }

    pub fn as_process(handle: &TerminalHandle) -> ProcessHandle {
        handle.clone()
    }

    pub fn foreground(handle: &TerminalHandle) -> Option<ProcessHandle> {
        handle.borrow().core.stdout.upgrade()
    }
}

impl Process for Terminal {
    fn core(&self) -> &ProcessCore {
        &self.core
    }
    fn core_mut(&mut self) -> &mut ProcessCore {
        &mut self.core
    }

    fn on_write(&mut self, _handle: &ProcessHandle, payload: &Output) -> bool {
        self.output_pane.push(payload.render());
        true
    }

    fn on_return(&mut self, _handle: &ProcessHandle, _child: &ProcessHandle, code: i32) -> ReturnOutcome {
        self.output_pane.push(format!("[returned {code}]"));
        self.core.input_enabled = false;
        self.ended = true;
        ReturnOutcome::Continue
    }
}

/// Dispatch one key event through the line discipline (§4.2).
pub fn handle_key(term: &TerminalHandle, key: Key) {
    let foreground = Terminal::foreground(term);
    let raw_input = foreground
        .as_ref()
        .map(|f| f.borrow().core().raw_input)
        .unwrap_or(false);

    if raw_input {
        if let Some(event) = to_input_event(key) {
            if let Some(fg) = &foreground {
                process::input(fg, event);
            }
        }
        return;
    }

    match key {
        Key::Char(c) => insert_char(term, c),
        Key::Enter => submit_line(term, foreground.as_ref()),
        Key::Backspace => {
            let mut t = term.borrow_mut();
            if t.cursor > 0 {
                t.cursor -= 1;
                let idx = t.cursor;
                t.input.remove(idx);
            }
        }
        Key::Delete => {
            let mut t = term.borrow_mut();
            if t.cursor < t.input.len() {
                t.input.remove(t.cursor);
            }
        }
        Key::Left => {
            let mut t = term.borrow_mut();
            t.cursor = t.cursor.saturating_sub(1);
        }
        Key::Right => {
            let mut t = term.borrow_mut();
            t.cursor = (t.cursor + 1).min(t.input.len());
        }
        Key::Up => navigate_history(term, foreground.as_ref(), -1),
        Key::Down => navigate_history(term, foreground.as_ref(), 1),
        Key::CtrlC => ctrl_c(term, foreground.as_ref()),
        Key::CtrlD => ctrl_d(term, foreground.as_ref()),
        Key::CtrlL => term.borrow_mut().output_pane.clear(),
        Key::CtrlU => {
            let enabled = foreground
                .as_ref()
                .map(|f| f.borrow().core().input_enabled)
                .unwrap_or(false);
            if enabled {
                let mut t = term.borrow_mut();
                t.input.clear();
                t.cursor = 0;
            }
        }
    }
}

fn to_input_event(key: Key) -> Option<InputEvent> {
    match key {
        Key::Char(c) => Some(InputEvent::Char(c)),
        Key::Enter => Some(InputEvent::Enter),
        Key::Escape => Some(InputEvent::Escape),
        Key::Backspace => Some(InputEvent::Backspace),
        Key::Left => Some(InputEvent::Left),
        Key::Right => Some(InputEvent::Right),
        Key::Up => Some(InputEvent::Up),
        Key::Down => Some(InputEvent::Down),
        Key::Delete | Key::CtrlC | Key::CtrlD | Key::CtrlL | Key::CtrlU => None,
    }
}

fn insert_char(term: &TerminalHandle, c: char) {
    let mut t = term.borrow_mut();
    let idx = t.cursor;
    t.input.insert(idx, c);
    t.cursor += 1;
}

fn submit_line(term: &TerminalHandle, foreground: Option<&ProcessHandle>) {
    let line: String = term.borrow().input.iter().collect();
    let Some(fg) = foreground else {
        term.borrow_mut().input.clear();
        term.borrow_mut().cursor = 0;
        return;
    };

    let (echo, password) = {
        let node = fg.borrow();
        (node.core().echo, node.core().password)
    };
    if echo {
        let shown = if password { "*".repeat(line.chars().count()) } else { line.clone() };
        term.borrow_mut().output_pane.push(shown);
    }
    if !password && !line.is_empty() {
        let mut node = fg.borrow_mut();
        let history = &mut node.core_mut().history;
        if history.last().map(|l| l.as_str()) != Some(line.as_str()) {
            history.push(line.clone());
        }
    }

    process::write(fg, Output::text(line));

    let mut t = term.borrow_mut();
    t.input.clear();
    t.cursor = 0;
    drop(t);
    let mut node = fg.borrow_mut();
    let idx = node.core().history.len();
    node.core_mut().history_index = idx;
    node.core_mut().newest = None;
}

fn navigate_history(term: &TerminalHandle, foreground: Option<&ProcessHandle>, delta: i32) {
    let Some(fg) = foreground else { return };
    let mut node = fg.borrow_mut();
    let len = node.core().history.len();
    if len == 0 {
        return;
    }
    let current_line: String = term.borrow().input.iter().collect();
    let idx = node.core().history_index as i32;
    if idx == len as i32 && delta < 0 {
        node.core_mut().newest = Some(current_line);
    }
    let new_idx = (idx + delta).clamp(0, len as i32);
    node.core_mut().history_index = new_idx as usize;
    let line = if new_idx as usize == len {
        node.core().newest.clone().unwrap_or_default()
    } else {
        node.core().history[new_idx as usize].clone()
    };
    drop(node);
    let mut t = term.borrow_mut();
    t.input = line.chars().collect();
    t.cursor = t.input.len();
}

fn ctrl_c(term: &TerminalHandle, foreground: Option<&ProcessHandle>) {
    term.borrow_mut().input.clear();
    term.borrow_mut().cursor = 0;
    let Some(fg) = foreground else { return };
    let job = fg.borrow().core().job.clone();
    for member in job {
        if let Some(p) = member.upgrade() {
            process::interrupt(&p);
        }
    }
}

fn ctrl_d(term: &TerminalHandle, foreground: Option<&ProcessHandle>) {
    if !term.borrow().input.is_empty() {
        return;
    }
    let Some(fg) = foreground else { return };
    let exit_input = fg.borrow().core().exit_input.clone();
    if let Some(text) = exit_input {
        term.borrow_mut().output_pane.push(text);
    }
    process::eof(fg);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::Monitor;
    use crate::process::execute;

    fn attach_foreground(term: &TerminalHandle) -> Rc<RefCell<Monitor>> {
        let captured = Rc::new(RefCell::new(Vec::<String>::new()));
        let c2 = captured.clone();
        let fg = Monitor::new(move |_h, p| {
            c2.borrow_mut().push(p.str());
            true
        });
        fg.borrow_mut().core_mut().echo = true;
        let term_dyn: ProcessHandle = term.clone();
        fg.borrow_mut().core_mut().stdin = Rc::downgrade(&term_dyn);
        fg.borrow_mut().core_mut().parent = Rc::downgrade(&term_dyn);
        let fg_dyn: ProcessHandle = fg.clone();
        term.borrow_mut().core_mut().stdout = Rc::downgrade(&fg_dyn);
        execute(&fg_dyn, vec![]);
        fg
    }

    #[test]
    fn typing_and_enter_delivers_line_and_clears_buffer() {
        let term = Terminal::new();
        let fg = attach_foreground(&term);
        for c in "hi".chars() {
            handle_key(&term, Key::Char(c));
        }
        handle_key(&term, Key::Enter);
        assert!(term.borrow().input.is_empty());
        assert_eq!(fg.borrow().core().history, vec!["hi".to_string()]);
    }

    #[test]
    fn ctrl_u_clears_input_line() {
        let term = Terminal::new();
        let _fg = attach_foreground(&term);
        handle_key(&term, Key::Char('x'));
        handle_key(&term, Key::CtrlU);
        assert!(term.borrow().input.is_empty());
    }

    #[test]
    fn ctrl_l_clears_output_pane() {
        let term = Terminal::new();
        term.borrow_mut().output_pane.push("stale".into());
        handle_key(&term, Key::CtrlL);
        assert!(term.borrow().output_pane.is_empty());
    }

    #[test]
    fn history_navigation_restores_newest_on_down() {
        let term = Terminal::new();
        let fg = attach_foreground(&term);
        fg.borrow_mut().core_mut().history = vec!["first".into(), "second".into()];
        fg.borrow_mut().core_mut().history_index = 2;
        handle_key(&term, Key::Char('x'));
        handle_key(&term, Key::Up);
        assert_eq!(term.borrow().input.iter().collect::<String>(), "second");
        handle_key(&term, Key::Up);
        assert_eq!(term.borrow().input.iter().collect::<String>(), "first");
        handle_key(&term, Key::Down);
        handle_key(&term, Key::Down);
        assert_eq!(term.borrow().input.iter().collect::<String>(), "x");
    }

    #[test]
    fn on_return_writes_epitaph_and_disables_input() {
        let term = Terminal::new();
        let fg = attach_foreground(&term);
        let fg_dyn: ProcessHandle = fg.clone();
        crate::process::exit(&fg_dyn, 3);
        assert!(term.borrow().output_pane.iter().any(|l| l.contains("returned 3")));
        assert!(!term.borrow().core().input_enabled);
    }
}
