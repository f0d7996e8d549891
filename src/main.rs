use std::io;

use clap::Parser;
use crossterm::event::{self, Event, KeyCode, KeyEventKind, KeyModifiers};
use crossterm::tty::IsTty;
use tracing::{info, warn};

use webterm::adapters::Monitor;
use webterm::config::Cli;
use webterm::output::Output;
use webterm::process::{self, Process, ProcessHandle};
use webterm::services::Storage;
use webterm::shell::{self, Shell, ShellEnv, ShellMode};
use webterm::terminal::{self, Key, Terminal};

/// One raw keyboard event, read on its own blocking thread (`crossterm`'s
/// reader blocks the OS thread) and forwarded to the async event loop.
enum HostEvent {
    Key(Key),
    CtrlC,
}

fn to_key(code: KeyCode, modifiers: KeyModifiers) -> Option<HostEvent> {
    if modifiers.contains(KeyModifiers::CONTROL) {
        return match code {
            KeyCode::Char('c') => Some(HostEvent::CtrlC),
            KeyCode::Char('d') => Some(HostEvent::Key(Key::CtrlD)),
            KeyCode::Char('l') => Some(HostEvent::Key(Key::CtrlL)),
            KeyCode::Char('u') => Some(HostEvent::Key(Key::CtrlU)),
            _ => None,
        };
    }
    match code {
        KeyCode::Char(c) => Some(HostEvent::Key(Key::Char(c))),
        KeyCode::Enter => Some(HostEvent::Key(Key::Enter)),
        KeyCode::Esc => Some(HostEvent::Key(Key::Escape)),
        KeyCode::Backspace => Some(HostEvent::Key(Key::Backspace)),
        KeyCode::Delete => Some(HostEvent::Key(Key::Delete)),
        KeyCode::Left => Some(HostEvent::Key(Key::Left)),
        KeyCode::Right => Some(HostEvent::Key(Key::Right)),
        KeyCode::Up => Some(HostEvent::Key(Key::Up)),
        KeyCode::Down => Some(HostEvent::Key(Key::Down)),
        _ => None,
    }
}

/// Spawn the blocking `crossterm` reader on its own OS thread and relay
/// translated events over an async channel — the bridge the single-threaded
/// runtime needs since `event::read` cannot itself be awaited.
fn spawn_key_reader() -> tokio::sync::mpsc::UnboundedReceiver<HostEvent> {
    let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
    std::thread::spawn(move || loop {
        match event::read() {
            Ok(Event::Key(key)) if key.kind == KeyEventKind::Press => {
                if let Some(event) = to_key(key.code, key.modifiers) {
                    if tx.send(event).is_err() {
                        break;
                    }
                }
            }
            Ok(_) => continue,
            Err(e) => {
                warn!(error = %e, "key reader stopped");
                break;
            }
        }
    });
    rx
}

fn make_error_sink(terminal: &terminal::TerminalHandle) -> ProcessHandle {
    let terminal_dyn: ProcessHandle = Terminal::as_process(terminal);
    let sink: ProcessHandle = Monitor::new(move |_h, payload| {
        process::write(&terminal_dyn, Output::raw(format!("\x1b[31m{}\x1b[0m", payload.render())))
    });
    process::execute(&sink, vec![]);
    sink
}

async fn bootstrap(cli: &Cli) -> (terminal::TerminalHandle, shell::ShellHandle) {
    let terminal = Terminal::new();
    let error_sink = make_error_sink(&terminal);
    let storage = Storage::new();

    let env = ShellEnv { storage, terminal: terminal.clone(), error_sink };

    let mode = if let Some(path) = &cli.script {
        ShellMode::Script(path.clone())
    } else if io::stdin().is_tty() {
        ShellMode::Interactive { profile: cli.profile.clone() }
    } else {
        ShellMode::Piped
    };

    let shell = Shell::new(env, mode.clone());
    if let Some(n) = cli.hist_size {
        shell.borrow_mut().core_mut().variables.insert("HIST_SIZE".into(), n.to_string());
    }

    let terminal_dyn: ProcessHandle = Terminal::as_process(&terminal);
    let shell_dyn: ProcessHandle = Shell::as_process(&shell);
    shell_dyn.borrow_mut().core_mut().parent = std::rc::Rc::downgrade(&terminal_dyn);
    shell_dyn.borrow_mut().core_mut().stdin = std::rc::Rc::downgrade(&terminal_dyn);
    shell_dyn.borrow_mut().core_mut().stdout = std::rc::Rc::downgrade(&terminal_dyn);

    process::execute(&shell_dyn, vec![]);

    match &mode {
        ShellMode::Script(path) => {
            if let Err(e) = shell::enqueue_program(&shell, path).await {
                warn!(error = %e, "failed to load script");
            }
        }
        ShellMode::Interactive { profile } if !cli.no_rc => {
            let path = profile.clone().unwrap_or_else(|| ".profile".to_string());
            let _ = shell::enqueue_program(&shell, &path).await;
        }
        _ => {}
    }
    shell::pump(&shell);

    (terminal, shell)
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    ctrlc::set_handler(|| {}).expect("failed to install SIGINT handler");

    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("failed to build runtime");
    let local = tokio::task::LocalSet::new();

    local.block_on(&rt, async move {
        let (terminal, shell) = bootstrap(&cli).await;
        info!("webterm started");

        let raw_mode = io::stdin().is_tty();
        if raw_mode {
            if let Err(e) = crossterm::terminal::enable_raw_mode() {
                warn!(error = %e, "failed to enable raw mode; falling back to line mode");
            }
        }

        let mut events = spawn_key_reader();
        loop {
            let shell_dyn: ProcessHandle = Shell::as_process(&shell);
            if shell_dyn.borrow().core().state == process::ProcessState::Terminated {
                break;
            }
            let Some(event) = events.recv().await else { break };
            match event {
                HostEvent::Key(key) => terminal::handle_key(&terminal, key),
                HostEvent::CtrlC => terminal::handle_key(&terminal, Key::CtrlC),
            }
            shell::pump(&shell);
        }

        if raw_mode {
            let _ = crossterm::terminal::disable_raw_mode();
        }
    });
}
