//! Black-box scenario tests (SPEC_FULL.md §8) driving a `Shell` plus an
//! in-memory `Storage` end-to-end, without touching a real TTY.

use std::rc::Rc;

use webterm::adapters::Monitor;
use webterm::output::Output;
use webterm::process::{self, Process, ProcessHandle};
use webterm::services::Storage;
use webterm::shell::{pump, Shell, ShellEnv, ShellHandle, ShellMode};
use webterm::terminal::{self, Terminal, TerminalHandle};

/// Wires a shell the way `main.rs` does: the terminal is the shell's
/// parent and stream endpoint on both ends, so the foreground-claim and
/// epitaph-on-return invariants both apply exactly as in production.
fn make_shell(storage: Storage) -> (ShellHandle, TerminalHandle) {
    let terminal = Terminal::new();
    let terminal_dyn: ProcessHandle = Terminal::as_process(&terminal);

    let t2 = terminal_dyn.clone();
    let error_sink: ProcessHandle = Monitor::new(move |_h, p| {
        process::write(&t2, Output::raw(format!("[err] {}", p.render())))
    });
    process::execute(&error_sink, vec![]);

    let env = ShellEnv { storage, terminal: terminal.clone(), error_sink };
    let shell = Shell::new(env, ShellMode::Piped);
    let shell_dyn: ProcessHandle = shell.clone();
    shell_dyn.borrow_mut().core_mut().parent = Rc::downgrade(&terminal_dyn);
    shell_dyn.borrow_mut().core_mut().stdin = Rc::downgrade(&terminal_dyn);
    shell_dyn.borrow_mut().core_mut().stdout = Rc::downgrade(&terminal_dyn);
    process::execute(&shell_dyn, vec![]);

    (shell, terminal)
}

fn run_line(shell: &ShellHandle, line: &str) {
    let handle: ProcessHandle = shell.clone();
    process::write(&handle, Output::text(line));
    pump(shell);
}

fn return_code(shell: &ShellHandle) -> String {
    shell.borrow().core().variables.get("?").cloned().unwrap_or_default()
}

#[tokio::test(flavor = "current_thread")]
async fn pipeline_filtering_keeps_matches_within_head_limit() {
    tokio::task::LocalSet::new()
        .run_until(async {
            let storage = Storage::new();
            storage.write("a", String::new()).await.unwrap();
            storage.write("ab", String::new()).await.unwrap();
            storage.write("abc", String::new()).await.unwrap();
            storage.write("zz", String::new()).await.unwrap();

            let (shell, terminal) = make_shell(storage);
            run_line(&shell, "ls | grep ^a | head 2");

            // `ls` reads storage on a spawned local task; give it a turn to
            // resolve and cascade through the rest of the pipeline.
            for _ in 0..4 {
                tokio::task::yield_now().await;
            }

            assert_eq!(return_code(&shell), "0");
            assert!(terminal.borrow().output_pane.iter().any(|l| l == "a\nab"));
        })
        .await;
}

#[tokio::test(flavor = "current_thread")]
async fn tail_buffers_a_ring_of_the_last_n_items() {
    tokio::task::LocalSet::new()
        .run_until(async {
            let storage = Storage::new();
            storage.write("log", "1\n2\n3\n4\n5".into()).await.unwrap();

            let (shell, terminal) = make_shell(storage);
            run_line(&shell, "cat log | tail 3");

            // `cat` reads storage on a spawned local task; give it a turn to
            // resolve and cascade through the rest of the pipeline.
            for _ in 0..4 {
                tokio::task::yield_now().await;
            }

            assert_eq!(return_code(&shell), "0");
            assert!(terminal.borrow().output_pane.iter().any(|l| l == "3\n4\n5"));
        })
        .await;
}

#[tokio::test(flavor = "current_thread")]
async fn grep_with_no_match_writes_nothing_and_sets_return_code_one() {
    tokio::task::LocalSet::new()
        .run_until(async {
            let storage = Storage::new();
            let (shell, terminal) = make_shell(storage);
            let before = terminal.borrow().output_pane.len();
            run_line(&shell, "echo hello | grep xyz");
            assert_eq!(return_code(&shell), "1");
            assert_eq!(terminal.borrow().output_pane.len(), before);
        })
        .await;
}

#[tokio::test(flavor = "current_thread")]
async fn history_persistence_caps_at_hist_size() {
    tokio::task::LocalSet::new()
        .run_until(async {
            let storage = Storage::new();
            let (shell, _terminal) = make_shell(storage.clone());
            shell.borrow_mut().core_mut().variables.insert("HIST_FILE".into(), ".hist".into());
            shell.borrow_mut().core_mut().variables.insert("HIST_SIZE".into(), "2".into());

            run_line(&shell, "echo a");
            run_line(&shell, "echo b");
            run_line(&shell, "echo c");

            // history writes are fire-and-forget tokio tasks; give the
            // runtime a couple of turns to drive the last one to completion.
            for _ in 0..4 {
                tokio::task::yield_now().await;
            }

            let content = storage.read(".hist").await.unwrap_or_default();
            assert_eq!(content, "echo b\necho c");
        })
        .await;
}

#[tokio::test(flavor = "current_thread")]
async fn missing_command_sets_127_and_shell_keeps_running() {
    tokio::task::LocalSet::new()
        .run_until(async {
            let storage = Storage::new();
            let (shell, terminal) = make_shell(storage);
            run_line(&shell, "nope");
            assert_eq!(return_code(&shell), "127");
            assert!(terminal
                .borrow()
                .output_pane
                .iter()
                .any(|l| l.contains("command not found: nope")));

            run_line(&shell, "echo still-alive");
            assert_eq!(return_code(&shell), "0");
        })
        .await;
}

#[tokio::test(flavor = "current_thread")]
async fn interrupt_mid_sleep_aborts_the_timer_and_sets_130() {
    tokio::task::LocalSet::new()
        .run_until(async {
            let storage = Storage::new();
            let (shell, terminal) = make_shell(storage);
            {
                let handle: ProcessHandle = shell.clone();
                process::write(&handle, Output::text("sleep 30"));
            }
            pump(&shell);

            // Ctrl-C fans out to every member of the terminal's foreground
            // job, exactly as the real key-driven path does.
            terminal::handle_key(&terminal, terminal::Key::CtrlC);

            assert_eq!(return_code(&shell), "130");
        })
        .await;
}
