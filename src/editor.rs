//! The modal line-buffer editor (SPEC_FULL.md §4.5): `vi`'s implementation.
//! Enables `raw_input` so keystrokes arrive as [`InputEvent`] rather than
//! assembled lines, exactly like any other `raw_input` process the
//! terminal's line discipline already knows how to route.

use std::cell::RefCell;
use std::rc::{Rc, Weak};

use tracing::warn;

use crate::output::Output;
use crate::process::{self, next_id, InputEvent, InputOutcome, Process, ProcessCore, ProcessHandle};
use crate::services::Storage;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Normal,
    Insert,
}

/// A run of one character class, used by `w`/`b` word motion.
#[derive(PartialEq, Eq)]
enum CharClass {
    Word,
    Symbol,
    Space,
}

fn class_of(c: char) -> CharClass {
    if c.is_whitespace() {
        CharClass::Space
    } else if c.is_alphanumeric() || c == '_' {
        CharClass::Word
    } else {
        CharClass::Symbol
    }
}

pub struct Editor {
    core: ProcessCore,
    /// Lets `on_execute`'s async load reach back into the concrete struct
    /// once the file read resolves, without a `dyn Process` downcast.
    self_weak: Weak<RefCell<Editor>>,
    storage: Storage,
    path: String,
    buffer: Vec<String>,
    mode: Mode,
    line: usize,
    col: usize,
    /// Remembered column for vertical motion across shorter lines.
    virtual_col: usize,
}

impl Editor {
    fn clamp_col(&mut self) {
        let len = self.buffer.get(self.line).map(String::len).unwrap_or(0);
        let max = if self.mode == Mode::Insert { len } else { len.saturating_sub(1) };
        self.col = self.col.min(max);
    }
}

impl Process for Editor {
    fn core(&self) -> &ProcessCore {
        &self.core
    }
    fn core_mut(&mut self) -> &mut ProcessCore {
        &mut self.core
    }

    fn on_execute(&mut self, _handle: &ProcessHandle, args: &[String]) -> process::ExecuteOutcome {
        self.core.raw_input = true;
        let Some(path) = args.first().cloned() else {
            let stderr = self.core.stderr.upgrade();
            if let Some(err) = stderr {
                process::write(&err, Output::text("vi: missing file operand"));
            }
            return Some(1);
        };
        self.path = path.clone();
        let storage = self.storage.clone();
        let Some(concrete) = self.self_weak.upgrade() else {
            return None;
        };
        tokio::task::spawn_local(async move {
            if let Ok(content) = storage.read(&path).await {
                let mut editor = concrete.borrow_mut();
                editor.buffer = if content.is_empty() {
                    vec![String::new()]
                } else {
                    content.lines().map(str::to_string).collect()
                };
            }
        });
        None
    }

    fn on_input(&mut self, handle: &ProcessHandle, event: &InputEvent) -> InputOutcome {
        match self.mode {
            Mode::Normal => self.on_input_normal(handle, event),
            Mode::Insert => self.on_input_insert(event),
        }
    }
}

pub fn spawn(storage: Storage, error_sink: ProcessHandle) -> ProcessHandle {
    Rc::new_cyclic(|weak_self| {
        let mut core = ProcessCore::new(next_id());
        core.stderr = Rc::downgrade(&error_sink);
        RefCell::new(Editor {
            core,
            self_weak: weak_self.clone(),
            storage,
            path: String::new(),
            buffer: vec![String::new()],
            mode: Mode::Normal,
            line: 0,
            col: 0,
            virtual_col: 0,
        })
    })
}

impl Editor {
    fn on_input_normal(&mut self, handle: &ProcessHandle, event: &InputEvent) -> InputOutcome {
        match event {
            InputEvent::Char('h') => {
                self.col = self.col.saturating_sub(1);
                self.virtual_col = self.col;
            }
            InputEvent::Char('l') => {
                let len = self.buffer[self.line].len();
                self.col = (self.col + 1).min(len.saturating_sub(1));
                self.virtual_col = self.col;
            }
            InputEvent::Char('j') => {
                if self.line + 1 < self.buffer.len() {
                    self.line += 1;
                    self.col = self.virtual_col;
                    self.clamp_col();
                }
            }
            InputEvent::Char('k') => {
                if self.line > 0 {
                    self.line -= 1;
                    self.col = self.virtual_col;
                    self.clamp_col();
                }
            }
            InputEvent::Char('w') => self.move_word_forward(),
            InputEvent::Char('b') => self.move_word_backward(),
            InputEvent::Char('^') => {
                self.col = 0;
                self.virtual_col = 0;
            }
            InputEvent::Char('$') => {
                self.col = self.buffer[self.line].len().saturating_sub(1);
                self.virtual_col = self.col;
            }
            InputEvent::Char('i') => self.mode = Mode::Insert,
            InputEvent::Char('a') => {
                self.col = (self.col + 1).min(self.buffer[self.line].len());
                self.mode = Mode::Insert;
            }
            InputEvent::Char('o') => {
                self.buffer.insert(self.line + 1, String::new());
                self.line += 1;
                self.col = 0;
                self.mode = Mode::Insert;
            }
            InputEvent::Char('z') => {
                self.save(handle);
                return InputOutcome::Continue;
            }
            InputEvent::Char('q') => return InputOutcome::Exit(0),
            _ => {}
        }
        InputOutcome::Continue
    }

    fn on_input_insert(&mut self, event: &InputEvent) -> InputOutcome {
        match event {
            InputEvent::Char(c) => {
                self.buffer[self.line].insert(self.col, *c);
                self.col += 1;
            }
            InputEvent::Enter => {
                let rest = self.buffer[self.line].split_off(self.col);
                self.buffer.insert(self.line + 1, rest);
                self.line += 1;
                self.col = 0;
            }
            InputEvent::Backspace => {
                if self.col > 0 {
                    self.col -= 1;
                    self.buffer[self.line].remove(self.col);
                } else if self.line > 0 {
                    let current = self.buffer.remove(self.line);
                    self.line -= 1;
                    self.col = self.buffer[self.line].len();
                    self.buffer[self.line].push_str(&current);
                }
            }
            InputEvent::Escape => {
                self.mode = Mode::Normal;
                self.clamp_col();
            }
            _ => {}
        }
        InputOutcome::Continue
    }

    fn move_word_forward(&mut self) {
        let line = &self.buffer[self.line];
        let chars: Vec<char> = line.chars().collect();
        if self.col >= chars.len() {
            return;
        }
        let start_class = class_of(chars[self.col]);
        let mut i = self.col;
        while i < chars.len() && class_of(chars[i]) == start_class {
            i += 1;
        }
        while i < chars.len() && class_of(chars[i]) == CharClass::Space {
            i += 1;
        }
        self.col = i.min(chars.len().saturating_sub(1));
        self.virtual_col = self.col;
    }

    fn move_word_backward(&mut self) {
        let line = &self.buffer[self.line];
        let chars: Vec<char> = line.chars().collect();
        if self.col == 0 || chars.is_empty() {
            return;
        }
        let mut i = self.col - 1;
        while i > 0 && class_of(chars[i]) == CharClass::Space {
            i -= 1;
        }
        let class = class_of(chars[i]);
        while i > 0 && class_of(chars[i - 1]) == class {
            i -= 1;
        }
        self.col = i;
        self.virtual_col = self.col;
    }

    fn save(&mut self, handle: &ProcessHandle) {
        let content = self.buffer.join("\n");
        let storage = self.storage.clone();
        let path = self.path.clone();
        let error_sink = self.core.stderr.upgrade();
        let handle = handle.clone();
        tokio::task::spawn_local(async move {
            match storage.write(&path, content).await {
                Ok(()) => process::exit(&handle, 0),
                Err(e) => {
                    warn!(error = %e, "editor save failed");
                    if let Some(err) = error_sink {
                        process::write(&err, Output::text(format!("vi: save failed: {e}")));
                    }
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::Monitor;
    use crate::process::{execute, input, ProcessState};

    // `on_execute` fires an async load via `spawn_local`, so every test
    // needs a `LocalSet` in scope even though it never awaits the load.

    #[tokio::test(flavor = "current_thread")]
    async fn i_enters_insert_and_typing_inserts_chars() {
        tokio::task::LocalSet::new()
            .run_until(async {
                let sink: ProcessHandle = Monitor::new(|_h, _p| true);
                let handle = spawn(Storage::new(), sink);
                execute(&handle, vec!["scratch.txt".into()]);
                input(&handle, InputEvent::Char('i'));
                input(&handle, InputEvent::Char('h'));
                input(&handle, InputEvent::Char('i'));
                assert_eq!(handle.borrow().core().state, ProcessState::Running);
            })
            .await;
    }

    #[tokio::test(flavor = "current_thread")]
    async fn q_exits_without_saving() {
        tokio::task::LocalSet::new()
            .run_until(async {
                let sink: ProcessHandle = Monitor::new(|_h, _p| true);
                let handle = spawn(Storage::new(), sink);
                execute(&handle, vec!["scratch.txt".into()]);
                input(&handle, InputEvent::Char('q'));
                assert_eq!(handle.borrow().core().state, ProcessState::Terminated);
            })
            .await;
    }

    #[tokio::test(flavor = "current_thread")]
    async fn unknown_key_in_normal_mode_is_a_no_op() {
        tokio::task::LocalSet::new()
            .run_until(async {
                let sink: ProcessHandle = Monitor::new(|_h, _p| true);
                let handle = spawn(Storage::new(), sink);
                execute(&handle, vec!["scratch.txt".into()]);
                input(&handle, InputEvent::Char('9'));
                assert_eq!(handle.borrow().core().state, ProcessState::Running);
            })
            .await;
    }

    #[tokio::test(flavor = "current_thread")]
    async fn o_then_x_opens_and_fills_a_new_line() {
        tokio::task::LocalSet::new()
            .run_until(async {
                let sink: ProcessHandle = Monitor::new(|_h, _p| true);
                let handle = spawn(Storage::new(), sink);
                execute(&handle, vec!["scratch.txt".into()]);
                input(&handle, InputEvent::Char('o'));
                input(&handle, InputEvent::Char('x'));
                input(&handle, InputEvent::Escape);
                assert_eq!(handle.borrow().core().state, ProcessState::Running);
            })
            .await;
    }
}
