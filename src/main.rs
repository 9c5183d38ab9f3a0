use clap::{Parser, Subcommand};
use serde::Serialize;
use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::process::ExitCode;
use taskpad::application::commands::{
    AppState, TaskListResponse, ToggleResult, create_task_impl, delete_task_impl, list_tasks_impl,
    login_impl, logout_impl, toggle_task_impl, update_task_impl, whoami_impl,
};
use taskpad::domain::models::{Task, TaskFilter, TaskId, TaskUpdate};
use taskpad::infrastructure::error::InfraError;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Command-line client for a remote task list.
#[derive(Parser, Debug)]
#[command(name = "taskpad", author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Output JSON
    #[arg(long, global = true)]
    json: bool,

    /// Directory holding `config/app.json` (defaults to the current directory)
    #[arg(long, value_name = "DIR", global = true)]
    workspace: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Log in and store the session tokens
    ///
    /// Example: taskpad login kim
    Login {
        username: String,
        /// Read from stdin when omitted
        #[arg(long, env = "TASKPAD_PASSWORD", hide_env_values = true)]
        password: Option<String>,
    },
    /// Forget the stored session
    Logout,
    /// Show the logged-in user
    Whoami,
    /// List tasks
    ///
    /// Example: taskpad list --filter overdue
    List {
        #[arg(long, short = 'f')]
        filter: Option<String>,
    },
    /// Add a new task
    ///
    /// Example: taskpad add "Water plants" 2026-02-16
    Add {
        description: String,
        due_date: String,
        #[arg(long)]
        details: Option<String>,
        #[arg(long)]
        recurrence: Option<u32>,
    },
    /// Edit fields of a task
    ///
    /// Example: taskpad edit 7 --due 2026-03-01T09:00
    Edit {
        id: TaskId,
        #[arg(long)]
        description: Option<String>,
        #[arg(long)]
        details: Option<String>,
        #[arg(long = "due")]
        due_date: Option<String>,
        #[arg(long)]
        recurrence: Option<u32>,
    },
    /// Delete a task
    Delete { id: TaskId },
    /// Flip a task's completion; press Ctrl-C during the undo window to take it back
    Toggle { id: TaskId },
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("taskpad=warn")),
        )
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();
    let workspace_root = match cli.workspace.clone().map(Ok).unwrap_or_else(std::env::current_dir) {
        Ok(path) => path,
        Err(error) => {
            eprintln!("error: could not resolve workspace: {error}");
            return ExitCode::FAILURE;
        }
    };

    let state = match AppState::new(&workspace_root) {
        Ok(state) => state,
        Err(error) => {
            eprintln!("error: {error}");
            return ExitCode::FAILURE;
        }
    };
    info!(api = %state.config().api_base_url, "client ready");

    let result = run(&state, cli.command, cli.json).await;
    state.dispose();
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err((command, error)) => {
            eprintln!("error: {}", state.command_error(command, &error));
            ExitCode::FAILURE
        }
    }
}

async fn run(state: &AppState, command: Command, json: bool) -> Result<(), (&'static str, InfraError)> {
    match command {
        Command::Login { username, password } => {
            let password = match password {
                Some(password) => password,
                None => prompt_password().map_err(|error| ("login", error))?,
            };
            let profile = login_impl(state, username, password)
                .await
                .map_err(|error| ("login", error))?;
            emit(json, &profile, || format!("Logged in as {}", profile.username))
        }
        Command::Logout => {
            logout_impl(state).await.map_err(|error| ("logout", error))?;
            emit(json, &serde_json::json!({ "logged_out": true }), || "Logged out".to_string())
        }
        Command::Whoami => {
            let profile = whoami_impl(state).await.map_err(|error| ("whoami", error))?;
            emit(json, &profile, || match profile.email.as_deref() {
                Some(email) => format!("{} <{email}>", profile.username),
                None => profile.username.clone(),
            })
        }
        Command::List { filter } => {
            let response = list_tasks_impl(state, filter)
                .await
                .map_err(|error| ("list", error))?;
            emit(json, &response, || render_list(&response))
        }
        Command::Add {
            description,
            due_date,
            details,
            recurrence,
        } => {
            let task = create_task_impl(state, description, due_date, details, recurrence)
                .await
                .map_err(|error| ("add", error))?;
            emit(json, &task, || format!("Added {}", render_task(&task)))
        }
        Command::Edit {
            id,
            description,
            details,
            due_date,
            recurrence,
        } => {
            let update = TaskUpdate {
                description,
                expanded_description: details,
                due_date,
                recurrence,
            };
            let task = update_task_impl(state, id, update)
                .await
                .map_err(|error| ("edit", error))?;
            emit(json, &task, || format!("Updated {}", render_task(&task)))
        }
        Command::Delete { id } => {
            let deleted = delete_task_impl(state, id)
                .await
                .map_err(|error| ("delete", error))?;
            emit(json, &serde_json::json!({ "id": id, "deleted": deleted }), || {
                format!("Deleted task {id}")
            })
        }
        Command::Toggle { id } => {
            if !json {
                eprintln!(
                    "Toggling task {id} in {} ms, press Ctrl-C to undo",
                    state.tasks().undo_delay().as_millis()
                );
            }
            let undo = async {
                if tokio::signal::ctrl_c().await.is_err() {
                    std::future::pending::<()>().await;
                }
            };
            let response = toggle_task_impl(state, id, undo)
                .await
                .and_then(|response| response.into_result())
                .map_err(|error| ("toggle", error))?;
            emit(json, &response, || match response.result {
                ToggleResult::Committed if response.requested_completed => format!("Completed task {id}"),
                ToggleResult::Committed => format!("Reopened task {id}"),
                ToggleResult::Undone | ToggleResult::Cancelled => format!("Undid toggle of task {id}"),
                ToggleResult::AlreadyCommitting => format!("Task {id} is already being updated"),
            })
        }
    }
}

fn emit<T, F>(json: bool, value: &T, text: F) -> Result<(), (&'static str, InfraError)>
where
    T: Serialize,
    F: FnOnce() -> String,
{
    if json {
        let rendered = serde_json::to_string_pretty(value).map_err(|error| ("output", InfraError::from(error)))?;
        println!("{rendered}");
    } else {
        println!("{}", text());
    }
    Ok(())
}

fn prompt_password() -> Result<String, InfraError> {
    eprint!("Password: ");
    io::stderr().flush()?;
    let mut line = String::new();
    io::stdin().lock().read_line(&mut line)?;
    Ok(line.trim_end_matches(['\r', '\n']).to_string())
}

fn render_task(task: &Task) -> String {
    let mark = if task.completed { "x" } else { " " };
    format!("[{mark}] #{} {} (due {})", task.id, task.description, task.due_date)
}

fn render_list(response: &TaskListResponse) -> String {
    let mut lines: Vec<String> = response.tasks.iter().map(render_task).collect();
    if lines.is_empty() {
        lines.push("No tasks.".to_string());
    }
    let counts = TaskFilter::ALL
        .iter()
        .map(|filter| format!("{filter}: {}", response.counts.get(*filter)))
        .collect::<Vec<_>>()
        .join("  ");
    lines.push(String::new());
    lines.push(counts);
    lines.join("\n")
}
