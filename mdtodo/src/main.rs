use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{Local, NaiveDate};
use clap::{Args, Parser, Subcommand, ValueEnum};
use mdtodo::annotations::DueFilter;
use mdtodo::config::{UserConfig, ViewOptions, load_user_config};
use mdtodo::core::{Heading, Todo};
use mdtodo::storage::{DocumentStore, FsStore, StoredDocument};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(
    name = "mdtodo",
    about = "Manage checkbox todos in a markdown file",
    version
)]
struct Cli {
    /// Enable verbose logging for debugging.
    #[arg(long, global = true)]
    verbose: bool,
    /// Markdown file holding the todos.
    #[arg(long, short, global = true, default_value = "todo.md")]
    file: PathBuf,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Print the todos, numbered from 1.
    List(ListArgs),
    /// Add a todo after the last one, or after todo N.
    Add(AddArgs),
    /// Flip the checkbox of todo N.
    Toggle { n: usize },
    /// Replace the text of todo N.
    Edit { n: usize, text: String },
    /// Delete todo N; its subtasks move up one level.
    Delete { n: usize },
    /// Move todo FROM next to todo TO.
    Move(MoveArgs),
    /// Nest todo N under the todo before it.
    Indent { n: usize },
    /// Move todo N out of its parent todo.
    Outdent { n: usize },
    /// Print the headings and the todo each one precedes.
    Headings {
        #[arg(long)]
        json: bool,
    },
    /// Normalize the file's markdown.
    Format(FormatArgs),
}

#[derive(Debug, Args)]
struct ListArgs {
    /// Emit JSON instead of a human-readable list.
    #[arg(long)]
    json: bool,
    /// Only todos carrying one of these tags.
    #[arg(long = "tag")]
    tags: Vec<String>,
    /// Only todos with one of these priorities.
    #[arg(long = "priority")]
    priorities: Vec<u32>,
    /// Only todos matching one of these due-date filters.
    #[arg(long = "due", value_enum)]
    due: Vec<DueArg>,
    /// Reference date for due filters (YYYY-MM-DD). Defaults to today.
    #[arg(long)]
    today: Option<NaiveDate>,
}

#[derive(Copy, Clone, Debug, ValueEnum)]
enum DueArg {
    All,
    Overdue,
    Today,
    Week,
}

impl From<DueArg> for DueFilter {
    fn from(arg: DueArg) -> Self {
        match arg {
            DueArg::All => DueFilter::All,
            DueArg::Overdue => DueFilter::Overdue,
            DueArg::Today => DueFilter::Today,
            DueArg::Week => DueFilter::Week,
        }
    }
}

#[derive(Debug, Args)]
struct AddArgs {
    text: String,
    /// Insert after this todo instead of at the end.
    #[arg(long)]
    after: Option<usize>,
    /// Create the todo already checked.
    #[arg(long)]
    checked: bool,
}

#[derive(Debug, Args)]
struct MoveArgs {
    from: usize,
    to: usize,
    /// Place after TO instead of before it.
    #[arg(long)]
    after: bool,
}

#[derive(Debug, Args)]
struct FormatArgs {
    /// Overwrite the file instead of printing to stdout.
    #[arg(long)]
    in_place: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let config = load_user_config().unwrap_or_else(|err| {
        tracing::warn!(error = %err, "ignoring user config");
        UserConfig::default()
    });
    let store = FsStore;
    let path = cli.file.as_path();

    match cli.command {
        Commands::List(args) => handle_list(&store, path, &config, args),
        Commands::Headings { json } => handle_headings(&store, path, json),
        Commands::Format(args) => handle_format(&store, path, &config, args),
        Commands::Add(args) => {
            let after = args.after.map(to_index).transpose()?;
            let index = edit_file(&store, path, &config, |stored| {
                let document = &mut stored.document;
                Ok(match after {
                    Some(_) => document.insert(after, &args.text, args.checked)?,
                    None => document.append(&args.text, args.checked)?,
                })
            })?;
            println!("Added todo {}", index + 1);
            Ok(())
        }
        Commands::Toggle { n } => {
            let index = to_index(n)?;
            edit_file(&store, path, &config, |stored| {
                Ok(stored.document.toggle_check(index)?)
            })
        }
        Commands::Edit { n, text } => {
            let index = to_index(n)?;
            edit_file(&store, path, &config, |stored| {
                Ok(stored.document.set_text(index, &text)?)
            })
        }
        Commands::Delete { n } => {
            let index = to_index(n)?;
            edit_file(&store, path, &config, |stored| Ok(stored.document.delete(index)?))
        }
        Commands::Move(MoveArgs { from, to, after }) => {
            let (from, to) = (to_index(from)?, to_index(to)?);
            edit_file(&store, path, &config, |stored| {
                Ok(stored.document.move_todo(from, to, after)?)
            })
        }
        Commands::Indent { n } => {
            let index = to_index(n)?;
            edit_file(&store, path, &config, |stored| Ok(stored.document.indent(index)?))
        }
        Commands::Outdent { n } => {
            let index = to_index(n)?;
            edit_file(&store, path, &config, |stored| Ok(stored.document.outdent(index)?))
        }
    }
}

fn init_tracing(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/// Command-line numbers are 1-based.
fn to_index(n: usize) -> Result<usize> {
    n.checked_sub(1)
        .ok_or_else(|| anyhow::anyhow!("todo numbers start at 1"))
}

fn load(store: &impl DocumentStore, path: &Path) -> Result<StoredDocument> {
    store
        .load(path)
        .with_context(|| format!("loading {:?}", path))
}

/// Loads the file, applies `apply`, and saves it back.
fn edit_file<T>(
    store: &impl DocumentStore,
    path: &Path,
    config: &UserConfig,
    apply: impl FnOnce(&mut StoredDocument) -> Result<T>,
) -> Result<T> {
    let mut stored = load(store, path)?;
    if let Some(err) = &stored.metadata_error {
        anyhow::bail!(
            "refusing to modify {:?}: its frontmatter is invalid ({err})",
            path
        );
    }
    let view = ViewOptions::resolve(config, stored.document.metadata());
    if view.read_only {
        anyhow::bail!("{:?} is marked read-only", path);
    }
    let out = apply(&mut stored)?;
    store
        .save(&mut stored)
        .with_context(|| format!("saving {:?}", path))?;
    Ok(out)
}

fn handle_list(
    store: &impl DocumentStore,
    path: &Path,
    config: &UserConfig,
    args: ListArgs,
) -> Result<()> {
    let ListArgs {
        json,
        tags,
        priorities,
        due,
        today,
    } = args;
    let stored = load(store, path)?;
    let view = ViewOptions::resolve(config, stored.document.metadata());
    let today = today.unwrap_or_else(|| Local::now().date_naive());
    let due: Vec<DueFilter> = due.into_iter().map(DueFilter::from).collect();

    let todos: Vec<Todo> = stored
        .document
        .todos()
        .into_iter()
        .filter(|t| !(view.filter_done && t.checked))
        .filter(|t| t.has_any_tag(tags.as_slice()))
        .filter(|t| t.has_any_priority(&priorities))
        .filter(|t| t.matches_any_due_filter(&due, today))
        .take(if view.max_visible == 0 {
            usize::MAX
        } else {
            view.max_visible
        })
        .collect();

    if json {
        println!("{}", serde_json::to_string_pretty(&todos)?);
        return Ok(());
    }

    let headings = if view.show_headings {
        stored.document.headings()
    } else {
        Vec::new()
    };
    let mut pending = headings.iter().peekable();
    for todo in &todos {
        while let Some(h) = pending.next_if(|h| h.before_todo_index <= todo.index) {
            print_heading(h);
        }
        println!(
            "{}{:>3}. [{}] {}",
            "  ".repeat(todo.depth),
            todo.index + 1,
            if todo.checked { 'x' } else { ' ' },
            todo.text
        );
    }
    Ok(())
}

fn print_heading(h: &Heading) {
    println!("{} {}", "#".repeat(h.level as usize), h.text);
}

fn handle_headings(store: &impl DocumentStore, path: &Path, json: bool) -> Result<()> {
    let stored = load(store, path)?;
    let headings = stored.document.headings();
    if json {
        println!("{}", serde_json::to_string_pretty(&headings)?);
    } else {
        for h in &headings {
            print_heading(h);
        }
    }
    Ok(())
}

fn handle_format(
    store: &impl DocumentStore,
    path: &Path,
    config: &UserConfig,
    args: FormatArgs,
) -> Result<()> {
    if args.in_place {
        return edit_file(store, path, config, |_| Ok(()));
    }
    let stored = load(store, path)?;
    print!("{}", stored.document.serialize());
    Ok(())
}
