//! The shell: tokenizer, pipeline scheduler, job queue, history
//! persistence, and special forms (SPEC_FULL.md §4.3).
//!
//! Launching is deliberately kept out of the `Process` hooks themselves.
//! A hook (`on_write`, `on_execute`, `on_return`) runs while the dispatcher
//! in `process.rs` holds an exclusive borrow of this shell; if it were to
//! call `launch_next` synchronously, a one-shot built-in (e.g. `echo`)
//! that executes-and-immediately-exits would cascade straight back into
//! this shell's own `on_return` — the same `RefCell`, already borrowed —
//! and panic. So hooks only ever update local state (`queue`,
//! `job_running`, `?`); [`pump`] is the single place that actually calls
//! `launch_next`, and it is only ever invoked by the top-level event loop
//! (a keystroke handled, an async completion applied), never from inside
//! another hook. This mirrors SPEC_FULL.md §5: the graph settles between
//! events, not in the middle of one.

use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::rc::Rc;

use tracing::{info, warn};

use crate::error::ParseError;
use crate::output::Output;
use crate::process::{
    self, next_id, EofOutcome, ExecuteOutcome, InterruptOutcome, Process, ProcessCore,
    ProcessHandle, ProcessState, ReturnOutcome, WeakProcess,
};
use crate::services::Storage;

pub type ShellHandle = Rc<RefCell<Shell>>;

const DEFAULT_HIST_SIZE: usize = 100;

#[derive(Debug, Clone)]
pub enum ShellMode {
    Interactive { profile: Option<String> },
    Script(String),
    Piped,
}

/// Shared collaborators every built-in may need; bundled so `builtins::spawn`
/// doesn't need a dozen separate parameters.
#[derive(Clone)]
pub struct ShellEnv {
    pub storage: Storage,
    pub terminal: crate::terminal::TerminalHandle,
    pub error_sink: ProcessHandle,
}

pub struct Shell {
    core: ProcessCore,
    env: ShellEnv,
    mode: ShellMode,
    queue: VecDeque<String>,
    job_running: bool,
    current_job: Vec<WeakProcess>,
    current_job_tail: WeakProcess,
    exit_after_drain: bool,
    hist_loaded: bool,
    hist_write_inflight: Option<tokio::task::JoinHandle<()>>,
    /// Set by the `exit` special form. Checked once the job it belongs to
    /// has fully returned, so the shell terminates even with lines still
    /// queued — see the module doc comment on why this can't just call
    /// `process::exit` on the shell directly from inside `exit`'s effect.
    force_exit: Option<i32>,
}

impl Shell {
    pub fn new(env: ShellEnv, mode: ShellMode) -> ShellHandle {
        let mut core = ProcessCore::new(next_id());
        core.variables.insert("?".into(), "0".into());
        core.variables.insert("HIST_SIZE".into(), DEFAULT_HIST_SIZE.to_string());
        Rc::new(RefCell::new(Shell {
            core,
            env,
            mode,
            queue: VecDeque::new(),
            job_running: false,
            current_job: Vec::new(),
            current_job_tail: WeakProcess::new(),
            exit_after_drain: false,
            hist_loaded: false,
            hist_write_inflight: None,
            force_exit: None,
        }))
    }

    pub fn as_process(handle: &ShellHandle) -> ProcessHandle {
        handle.clone()
    }

    /// Used by the `exit` special form to request shell termination once
    /// its job returns, regardless of what's still queued.
    pub fn request_exit(&mut self, code: i32) {
        self.force_exit = Some(code);
    }

    fn hist_file(&self) -> Option<String> {
        self.core.variables.get("HIST_FILE").cloned()
    }

    fn hist_size(&self) -> usize {
        self.core
            .variables
            .get("HIST_SIZE")
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_HIST_SIZE)
    }
}

impl Process for Shell {
    fn core(&self) -> &ProcessCore {
        &self.core
    }
    fn core_mut(&mut self) -> &mut ProcessCore {
        &mut self.core
    }

    fn on_execute(&mut self, _handle: &ProcessHandle, _args: &[String]) -> ExecuteOutcome {
        info!(process = self.core.id, "shell starting");
        // Script/profile loading still needs the storage read; since this
        // hook cannot safely drive the tokio runtime itself (no executor
        // context guaranteed here), the caller is responsible for reading
        // the file and calling `enqueue_program` before/along with
        // `execute` for script/profile modes — see `Shell::bootstrap`.
        None
    }

    fn on_write(&mut self, _handle: &ProcessHandle, payload: &Output) -> bool {
        enqueue_text(self, &payload.str());
        true
    }

    /// A job member's default interrupt cascade bubbles to its parent (this
    /// shell); absorb it here instead of letting it fall through to the
    /// shell's own default, which would exit the whole session on every
    /// Ctrl-C instead of just the foreground job.
    fn on_interrupt(&mut self, _handle: &ProcessHandle) -> InterruptOutcome {
        InterruptOutcome::Handled
    }

    fn on_eof(&mut self, _handle: &ProcessHandle) -> EofOutcome {
        if self.job_running || !self.queue.is_empty() {
            self.exit_after_drain = true;
            EofOutcome::Handled
        } else {
            EofOutcome::ExitNormally
        }
    }

    fn on_return(&mut self, _handle: &ProcessHandle, child: &ProcessHandle, code: i32) -> ReturnOutcome {
        let is_tail = self
            .current_job_tail
            .upgrade()
            .map(|t| Rc::ptr_eq(&t, child))
            .unwrap_or(false);
        if is_tail {
            self.core.variables.insert("?".into(), code.to_string());
            self.core.prompt = if code == 0 {
                Output::text("$ ")
            } else {
                Output::raw("\x1b[31m$ \x1b[0m")
            };
        }

        let job_done = self.current_job.iter().all(|w| {
            w.upgrade()
                .map(|p| p.borrow().core().state == ProcessState::Terminated)
                .unwrap_or(true)
        });
        if job_done {
            self.job_running = false;
            self.current_job.clear();
            if let Some(code) = self.force_exit.take() {
                return ReturnOutcome::ExitSelf(code);
            }
            if self.queue.is_empty() && self.exit_after_drain {
                let code = self
                    .core
                    .variables
                    .get("?")
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(0);
                return ReturnOutcome::ExitSelf(code);
            }
        }
        ReturnOutcome::Continue
    }
}

fn enqueue_text(shell: &mut Shell, text: &str) {
    for line in text.split(['\n', ';']) {
        let trimmed = line.trim();
        if !trimmed.is_empty() {
            shell.queue.push_back(trimmed.to_string());
        }
    }
}

/// Read a script/profile file through the shell's storage and enqueue its
/// lines. Must run before (or right after) `process::execute` on the
/// shell's own handle — called from an async context that owns the tokio
/// runtime (see `main.rs`), since `Process` hooks must stay synchronous.
pub async fn enqueue_program(shell: &ShellHandle, path: &str) -> Result<(), crate::error::ServiceError> {
    let storage = shell.borrow().env.storage.clone();
    let text = storage.read(path).await?;
    enqueue_text(&mut shell.borrow_mut(), &text);
    Ok(())
}

/// Split a pipeline line on `|` into stages, each split on whitespace.
fn tokenize_pipeline(line: &str) -> Result<Vec<Vec<String>>, ParseError> {
    let mut stages = Vec::new();
    for stage in line.split('|') {
        let tokens: Vec<String> = stage.split_whitespace().map(str::to_string).collect();
        if tokens.is_empty() {
            return Err(ParseError::InvalidPipe);
        }
        stages.push(tokens);
    }
    Ok(stages)
}

/// `$name` substitution only — no quoting, no globbing (Non-goal).
fn substitute(tokens: Vec<String>, variables: &HashMap<String, String>) -> Vec<String> {
    tokens
        .into_iter()
        .map(|t| {
            if let Some(name) = t.strip_prefix('$') {
                variables.get(name).cloned().unwrap_or_default()
            } else {
                t
            }
        })
        .collect()
}

/// Drive the job queue until the shell is either running a job or empty.
/// The only caller of `launch_next`; must be invoked from outside any
/// `Process` hook (see the module doc comment).
pub fn pump(shell: &ShellHandle) {
    loop {
        let should_launch = {
            let s = shell.borrow();
            s.core.state == ProcessState::Running && !s.job_running && !s.queue.is_empty()
        };
        if !should_launch {
            break;
        }
        launch_next(shell);
    }
}

fn launch_next(shell: &ShellHandle) {
    let line = {
        let mut s = shell.borrow_mut();
        s.queue.pop_front()
    };
    let Some(line) = line else { return };

    let variables = shell.borrow().core.variables.clone();
    let stages = match tokenize_pipeline(&line) {
        Ok(s) => s,
        Err(_) => {
            report_shell_error(shell, "sh: invalid pipe");
            set_return_code(shell, 1);
            return;
        }
    };

    let env = shell.borrow().env.clone();
    let mut procs: Vec<(ProcessHandle, Vec<String>)> = Vec::new();
    for tokens in &stages {
        let tokens = substitute(tokens.clone(), &variables);
        let name = &tokens[0];
        match crate::builtins::spawn(name, shell, &env, &variables) {
            Some(p) => procs.push((p, tokens[1..].to_vec())),
            None => {
                report_shell_error(shell, &format!("sh: command not found: {name}"));
                set_return_code(shell, 127);
                return;
            }
        }
    }

    let n = procs.len();
    let job_weak: Vec<WeakProcess> = procs.iter().map(|(p, _)| Rc::downgrade(p)).collect();
    let shell_dyn = Shell::as_process(shell);
    let shell_stdin = shell.borrow().core.stdin.clone();
    let shell_stdout = shell.borrow().core.stdout.clone();
    let error_sink = Rc::downgrade(&env.error_sink);

    for (i, (p, _)) in procs.iter().enumerate() {
        let mut node = p.borrow_mut();
        node.core_mut().parent = Rc::downgrade(&shell_dyn);
        node.core_mut().job = job_weak.clone();
        node.core_mut().stdin = if i == 0 {
            shell_stdin.clone()
        } else {
            Rc::downgrade(&procs[i - 1].0)
        };
        node.core_mut().stdout = if i == n - 1 {
            shell_stdout.clone()
        } else {
            Rc::downgrade(&procs[i + 1].0)
        };
        node.core_mut().stderr = error_sink.clone();
        node.core_mut().inherit_variables(&shell.borrow().core);
    }

    {
        let mut s = shell.borrow_mut();
        s.job_running = true;
        s.current_job = job_weak;
        s.current_job_tail = Rc::downgrade(&procs[n - 1].0);
    }

    for (p, args) in procs.into_iter().rev() {
        process::execute(&p, args);
    }

    persist_history(shell, &line);
}

fn report_shell_error(shell: &ShellHandle, message: &str) {
    let sink = shell.borrow().env.error_sink.clone();
    process::write(&sink, Output::text(message));
}

fn set_return_code(shell: &ShellHandle, code: i32) {
    let mut s = shell.borrow_mut();
    s.core.variables.insert("?".into(), code.to_string());
    s.core.prompt = if code == 0 {
        Output::text("$ ")
    } else {
        Output::raw("\x1b[31m$ \x1b[0m")
    };
}

fn persist_history(shell: &ShellHandle, accepted_line: &str) {
    let (hist_file, hist_size, in_flight) = {
        let mut s = shell.borrow_mut();
        s.hist_loaded = true;
        s.core.history.push(accepted_line.to_string());
        (s.hist_file(), s.hist_size(), s.hist_write_inflight.is_some())
    };
    let Some(path) = hist_file else { return };
    if in_flight {
        // "one write in flight" rule: drop this tick's write, the next
        // accepted line will schedule a fresh one with the up-to-date tail.
        return;
    }
    let storage = shell.borrow().env.storage.clone();
    let tail: Vec<String> = {
        let s = shell.borrow();
        let hist = &s.core.history;
        let start = hist.len().saturating_sub(hist_size);
        hist[start..].to_vec()
    };
    let task = tokio::spawn(async move {
        let content = tail.join("\n");
        if let Err(e) = storage.write(&path, content).await {
            warn!(error = %e, "history persistence failed");
        }
    });
    shell.borrow_mut().hist_write_inflight = Some(task);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::Monitor;
    use crate::terminal::Terminal;

    fn make_env() -> ShellEnv {
        let terminal = Terminal::new();
        let terminal_dyn: ProcessHandle = Terminal::as_process(&terminal);
        let error_sink = Monitor::new({
            let terminal_dyn = terminal_dyn.clone();
            move |_h, p| process::write(&terminal_dyn, p.clone())
        });
        let error_sink_dyn: ProcessHandle = error_sink.clone();
        process::execute(&error_sink_dyn, vec![]);
        ShellEnv {
            storage: Storage::new(),
            terminal,
            error_sink: error_sink_dyn,
        }
    }

    fn run_line(shell: &ShellHandle, line: &str) {
        let handle: ProcessHandle = shell.clone();
        process::write(&handle, Output::text(line));
        pump(shell);
    }

    #[test]
    fn pipe_syntax_error_sets_return_code_one() {
        let env = make_env();
        let shell = Shell::new(env, ShellMode::Piped);
        let handle: ProcessHandle = shell.clone();
        process::execute(&handle, vec![]);
        run_line(&shell, "echo a | | echo b");
        assert_eq!(shell.borrow().core().variables.get("?"), Some(&"1".to_string()));
    }

    #[test]
    fn unknown_command_sets_127() {
        let env = make_env();
        let shell = Shell::new(env, ShellMode::Piped);
        let handle: ProcessHandle = shell.clone();
        process::execute(&handle, vec![]);
        run_line(&shell, "nope");
        assert_eq!(shell.borrow().core().variables.get("?"), Some(&"127".to_string()));
    }

    #[test]
    fn echo_runs_and_returns_zero() {
        let env = make_env();
        let shell = Shell::new(env, ShellMode::Piped);
        let handle: ProcessHandle = shell.clone();
        process::execute(&handle, vec![]);
        run_line(&shell, "echo hello");
        assert_eq!(shell.borrow().core().variables.get("?"), Some(&"0".to_string()));
    }

    #[test]
    fn chained_one_shot_builtins_do_not_panic_on_reentrancy() {
        let env = make_env();
        let shell = Shell::new(env, ShellMode::Piped);
        let handle: ProcessHandle = shell.clone();
        process::execute(&handle, vec![]);
        {
            let mut s = shell.borrow_mut();
            enqueue_text(&mut s, "echo one\necho two\necho three");
        }
        pump(&shell);
        assert_eq!(shell.borrow().core().variables.get("?"), Some(&"0".to_string()));
        assert!(shell.borrow().queue.is_empty());
    }

    #[test]
    fn shell_absorbs_interrupt_instead_of_exiting() {
        let env = make_env();
        let shell = Shell::new(env, ShellMode::Piped);
        let handle: ProcessHandle = shell.clone();
        process::execute(&handle, vec![]);
        process::interrupt(&handle);
        assert_eq!(handle.borrow().core().state, ProcessState::Running);
    }

    #[test]
    fn variable_substitution_only_dollar_name() {
        let env = make_env();
        let shell = Shell::new(env, ShellMode::Piped);
        shell
            .borrow_mut()
            .core_mut()
            .variables
            .insert("NAME".into(), "world".into());
        let subst = substitute(vec!["$NAME".into()], &shell.borrow().core().variables);
        assert_eq!(subst, vec!["world".to_string()]);
    }
}
