//! Crew CLI - operator console for concurrent coding-agent sessions
//!
//! Each session binds one coding-agent process to one isolated git
//! worktree. The console multiplexes all of them onto a single terminal:
//! switch focus, feed input, answer permission prompts, and drive
//! merge/PR workflows without one session blocking another.

mod runner;
mod tui;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use crossterm::{
    event::{Event as CrosstermEvent, KeyEventKind},
    execute,
    terminal::{EnterAlternateScreen, LeaveAlternateScreen, disable_raw_mode, enable_raw_mode},
};
use ratatui::Terminal;
use ratatui::backend::CrosstermBackend;

use crew_core::{
    ConfigStore, Controller, FileConfigStore, GitCli, ListenerPool, MergeEntry, MergeWorkflow,
    Notice, PgrepSupervisor, PreviousFocus, SessionLifecycle, SessionRecord, SessionStore,
    TranscriptMessage, default_data_dir,
};
use runner::ProcessRunnerFactory;
use tui::{
    App, CommitPrompt, Event, EventHandler, KeyAction, Mode, handle_key_commit,
    handle_key_confirm, handle_key_conflict, handle_key_input, handle_key_permission,
    handle_key_question, handle_key_sessions,
};

#[derive(Parser)]
#[command(name = "crew")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Operator console for concurrent coding-agent sessions", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Agent command launched per session
    #[arg(long, default_value = "claude")]
    agent_command: String,

    /// Extra argument passed to the agent command (repeatable)
    #[arg(long = "agent-arg")]
    agent_args: Vec<String>,

    /// Data directory (defaults to the platform data dir)
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Branch that plain merges target
    #[arg(long, default_value = "main")]
    main_branch: String,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Interactive console (default)
    Console,

    /// Manage the session registry
    #[command(subcommand)]
    Sessions(SessionCommands),

    /// Show configuration paths
    Config,
}

#[derive(Subcommand)]
enum SessionCommands {
    /// List registered sessions
    List,

    /// Register a session bound to an existing worktree
    Add {
        /// Display name (also the default branch name)
        name: String,
        /// Path to the session's git worktree
        #[arg(long)]
        worktree: PathBuf,
        /// Branch checked out in the worktree
        #[arg(long)]
        branch: Option<String>,
        /// Parent session id (enables merge-to-parent)
        #[arg(long)]
        parent: Option<String>,
        /// Issue or ticket reference
        #[arg(long)]
        issue: Option<String>,
    },

    /// Remove a session from the registry
    Remove {
        /// Session id
        id: String,
    },
}

fn init_logging(
    verbose: bool,
    data_dir: &Path,
) -> anyhow::Result<tracing_appender::non_blocking::WorkerGuard> {
    let log_dir = data_dir.join("logs");
    std::fs::create_dir_all(&log_dir)?;
    let appender = tracing_appender::rolling::daily(log_dir, "crew.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(appender);
    let default_filter = if verbose { "debug" } else { "info" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter));
    // The TUI owns the terminal, so logs go to a file only
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(non_blocking)
        .with_ansi(false)
        .init();
    Ok(guard)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let data_dir = cli.data_dir.clone().unwrap_or_else(default_data_dir);
    let _log_guard = init_logging(cli.verbose, &data_dir)?;

    let config = Arc::new(FileConfigStore::with_root(data_dir.clone())?);

    match cli.command.unwrap_or(Commands::Console) {
        Commands::Console => {
            run_console(config, cli.agent_command, cli.agent_args, cli.main_branch).await
        }
        Commands::Sessions(command) => handle_sessions_command(config.as_ref(), command),
        Commands::Config => {
            println!("data dir:  {}", data_dir.display());
            println!("registry:  {}", data_dir.join("sessions.toml").display());
            println!("logs:      {}", data_dir.join("logs").display());
            Ok(())
        }
    }
}

fn handle_sessions_command(
    config: &FileConfigStore,
    command: SessionCommands,
) -> anyhow::Result<()> {
    match command {
        SessionCommands::List => {
            for session in config.list_sessions()? {
                println!(
                    "{}  {}  [{}]  {:?}  {}",
                    session.id,
                    session.name,
                    session.branch,
                    session.status,
                    session.worktree_path.display()
                );
            }
        }
        SessionCommands::Add {
            name,
            worktree,
            branch,
            parent,
            issue,
        } => {
            let branch = branch.unwrap_or_else(|| name.clone());
            let mut record = SessionRecord::new(name, worktree, branch);
            record.parent = parent;
            record.issue = issue;
            let id = record.id.clone();
            config.create_session(record)?;
            println!("registered session {}", id);
        }
        SessionCommands::Remove { id } => {
            config.delete_session(&id)?;
            println!("removed session {}", id);
        }
    }
    Ok(())
}

async fn run_console(
    config: Arc<FileConfigStore>,
    agent_command: String,
    agent_args: Vec<String>,
    main_branch: String,
) -> anyhow::Result<()> {
    let config_store: Arc<dyn ConfigStore> = config.clone();
    let store = Arc::new(SessionStore::new());
    let (pool, events_rx) = ListenerPool::new();
    let factory = Arc::new(ProcessRunnerFactory::new(agent_command, agent_args));
    let git = Arc::new(GitCli::with_main_branch(main_branch));
    let supervisor = Arc::new(PgrepSupervisor::new());

    let lifecycle = Arc::new(SessionLifecycle::new(
        store.clone(),
        config_store.clone(),
        supervisor,
        factory,
        pool.clone(),
    ));
    let merge = Arc::new(MergeWorkflow::new(
        store.clone(),
        config_store.clone(),
        git,
        None,
        pool.clone(),
    ));
    let mut controller = Controller::new(store, lifecycle, merge, config_store, pool);

    enable_raw_mode()?;
    let mut stdout = std::io::stdout();
    execute!(stdout, EnterAlternateScreen)?;
    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend)?;

    let mut app = App::new(config.list_sessions()?);
    let mut handler = EventHandler::new(events_rx);

    let result = run_event_loop(
        &mut terminal,
        &mut app,
        &mut controller,
        &mut handler,
        config.as_ref(),
    )
    .await;

    controller.shutdown().await;
    disable_raw_mode()?;
    execute!(terminal.backend_mut(), LeaveAlternateScreen)?;
    terminal.show_cursor()?;

    result
}

async fn run_event_loop(
    terminal: &mut Terminal<CrosstermBackend<std::io::Stdout>>,
    app: &mut App,
    controller: &mut Controller,
    handler: &mut EventHandler,
    config: &FileConfigStore,
) -> anyhow::Result<()> {
    loop {
        terminal.draw(|frame| tui::draw(frame, app, controller.store(), controller.phase()))?;

        let Some(event) = handler.next().await else {
            break;
        };
        match event {
            Event::Tick => {}
            Event::Routed(routed) => {
                let notices = controller.dispatch(routed).await;
                for notice in &notices {
                    app.apply_notice(notice, controller.store());
                }
                // Persisted status flags may have changed (started, merged,
                // PR created); refresh the sidebar from the registry
                if notices.iter().any(|n| {
                    matches!(
                        n,
                        Notice::MergeFinished { .. } | Notice::ResponseFinished(_)
                    )
                }) {
                    app.refresh_sessions(config.list_sessions().unwrap_or_default());
                }
            }
            Event::Terminal(CrosstermEvent::Key(key)) if key.kind != KeyEventKind::Release => {
                let action = match app.mode {
                    Mode::Sessions => handle_key_sessions(key),
                    Mode::Input => handle_key_input(key, &mut app.input),
                    Mode::Permission => handle_key_permission(key),
                    Mode::Question => handle_key_question(key),
                    Mode::Commit => match app.commit_prompt.as_mut() {
                        Some(prompt) => handle_key_commit(key, &mut prompt.input),
                        None => KeyAction::None,
                    },
                    Mode::Conflict => handle_key_conflict(key),
                    Mode::ConfirmDelete => handle_key_confirm(key),
                };
                perform(action, app, controller, config).await?;
            }
            Event::Terminal(_) => {}
        }

        if app.should_quit {
            break;
        }
    }
    Ok(())
}

/// Session the next action applies to: the focused one, falling back to
/// the sidebar cursor.
fn action_target(app: &App) -> Option<SessionRecord> {
    app.focused
        .clone()
        .or_else(|| app.selected_record().cloned())
}

async fn perform(
    action: KeyAction,
    app: &mut App,
    controller: &mut Controller,
    config: &FileConfigStore,
) -> anyhow::Result<()> {
    match action {
        KeyAction::None => {}
        KeyAction::Quit => app.should_quit = true,
        KeyAction::SelectPrev => app.select_prev(),
        KeyAction::SelectNext => app.select_next(),
        KeyAction::ScrollUp => app.scroll_up(),
        KeyAction::ScrollDown => app.scroll_down(),

        KeyAction::FocusSelected => {
            let Some(record) = app.selected_record().cloned() else {
                return Ok(());
            };
            let previous = app.focused.as_ref().map(|focused| PreviousFocus {
                id: focused.id.clone(),
                input_text: app.input.value().to_string(),
                streaming: None,
            });
            match controller.select(&record, previous).await {
                Ok(result) => app.apply_selection(record, result),
                Err(e) => app.status = format!("cannot open session: {}", e),
            }
        }
        KeyAction::FocusInput => {
            if app.focused.is_some() {
                app.mode = Mode::Input;
            }
        }
        KeyAction::LeaveInput => app.mode = Mode::Sessions,

        KeyAction::Submit(text) => {
            let Some(record) = app.focused.clone() else {
                return Ok(());
            };
            app.transcript.push(TranscriptMessage::user(text.clone()));
            match controller.send_message(&record, text).await {
                Ok(true) => app.status.clear(),
                Ok(false) => app.status = "agent busy - message queued".to_string(),
                Err(e) => app.status = format!("send failed: {}", e),
            }
        }

        KeyAction::CancelAgent => {
            if let Some(record) = action_target(app)
                && controller.cancel_agent(&record.id)
            {
                app.status = format!("cancelled request for {}", record.name);
            }
        }
        KeyAction::CancelMerge => {
            if let Some(record) = action_target(app)
                && controller.cancel_merge(&record.id)
            {
                app.status = format!("cancelled {} operation", record.name);
            }
        }

        KeyAction::BeginMerge(kind) => {
            let Some(record) = app.selected_record().cloned() else {
                return Ok(());
            };
            match controller.begin_merge(&record, kind).await {
                Ok(MergeEntry::Started) => {
                    app.status = format!("{} started for {}", kind, record.name);
                }
                Ok(MergeEntry::CommitMessagePending { draft, .. }) => {
                    app.commit_prompt = Some(CommitPrompt {
                        kind,
                        input: tui_input::Input::new(draft),
                    });
                    app.mode = Mode::Commit;
                }
                Err(e) => app.status = e.to_string(),
            }
        }
        KeyAction::CommitConfirm(message) => {
            let Some(prompt) = app.commit_prompt.take() else {
                return Ok(());
            };
            app.mode = Mode::Sessions;
            let Some(record) = app.selected_record().cloned() else {
                return Ok(());
            };
            match controller.confirm_commit(&record, prompt.kind, message).await {
                Ok(()) => app.status = format!("{} started for {}", prompt.kind, record.name),
                Err(e) => app.status = e.to_string(),
            }
        }
        KeyAction::CommitCancel => {
            app.commit_prompt = None;
            app.mode = Mode::Sessions;
        }

        KeyAction::Permission { allowed, always } => {
            app.mode = Mode::Input;
            let Some(record) = app.focused.clone() else {
                return Ok(());
            };
            let Some(request) = app.pending_permission.take() else {
                return Ok(());
            };
            if let Err(e) = controller
                .respond_permission(&record, &request.id, allowed, always)
                .await
            {
                app.status = format!("permission response failed: {}", e);
            }
        }

        KeyAction::QuestionPrev => app.question_prev(),
        KeyAction::QuestionNext => app.question_next(),
        KeyAction::QuestionAnswer => {
            app.mode = Mode::Input;
            let Some(record) = app.focused.clone() else {
                return Ok(());
            };
            let Some(question) = app.pending_question.take() else {
                return Ok(());
            };
            let answer = question
                .options
                .get(app.question_choice)
                .map(|option| option.label.clone())
                .unwrap_or_default();
            let mut answers = HashMap::new();
            answers.insert(question.question.clone(), answer);
            if let Err(e) = controller
                .respond_question(&record, &question.id, answers)
                .await
            {
                app.status = format!("question response failed: {}", e);
            }
        }

        KeyAction::ConflictChoice(choice) => {
            let Some(prompt) = app.conflict_prompt.take() else {
                return Ok(());
            };
            app.mode = Mode::Sessions;
            let Some(record) = action_target(app) else {
                return Ok(());
            };
            match choice {
                0 => match controller.delegate_conflicts(&record, &prompt.files).await {
                    Ok(()) => app.status = format!("conflicts handed to {}", record.name),
                    Err(e) => app.status = format!("delegation failed: {}", e),
                },
                1 => match controller.merge().abort(&record).await {
                    Ok(()) => app.status = "merge aborted".to_string(),
                    Err(e) => app.status = format!("abort failed: {}", e),
                },
                _ => {
                    app.transcript.push(TranscriptMessage::system(
                        MergeWorkflow::manual_instructions(&record),
                    ));
                }
            }
        }
        KeyAction::ConflictDismiss => {
            app.conflict_prompt = None;
            app.mode = Mode::Sessions;
        }

        KeyAction::ForceResume => {
            if let Some(record) = action_target(app) {
                match controller.force_resume(&record).await {
                    Ok(killed) => {
                        app.status =
                            format!("force-resumed {} ({} processes killed)", record.name, killed);
                    }
                    Err(e) => app.status = format!("force-resume failed: {}", e),
                }
            }
        }

        KeyAction::DeleteSelected => {
            if let Some(record) = app.selected_record().cloned() {
                app.confirm_delete = Some(record);
                app.mode = Mode::ConfirmDelete;
            }
        }
        KeyAction::ConfirmYes => {
            app.mode = Mode::Sessions;
            if let Some(record) = app.confirm_delete.take() {
                let stopped = controller.delete_session(&record.id).await;
                tracing::info!(
                    session = %record.id,
                    stopped_runner = stopped.is_some(),
                    "session deleted from console"
                );
                app.refresh_sessions(config.list_sessions().unwrap_or_default());
                app.status = format!("deleted {}", record.name);
            }
        }
        KeyAction::ConfirmNo => {
            app.confirm_delete = None;
            app.mode = Mode::Sessions;
        }
    }
    Ok(())
}
