#![forbid(unsafe_code)]

mod cmd;
mod output;

use clap::{Parser, Subcommand};
use cmd::Project;
use output::{CliError, OutputMode, render_error, resolve_output_mode};
use std::env;
use tracing::debug;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};
use tracksync_core::config;

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "tsync: inspect and drive a tracksync item store",
    long_about = None
)]
struct Cli {
    /// Emit JSON output instead of human-readable text.
    #[arg(long, global = true)]
    json: bool,

    /// Output format; overrides --json, FORMAT and the user config.
    #[arg(long, global = true, value_enum)]
    format: Option<OutputMode>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    #[command(
        next_help_heading = "Project",
        about = "Initialize a tracksync project",
        long_about = "Create .tracksync/ with a default config.toml in the current directory.",
        after_help = concat!(
            "EXAMPLES:\n    tsync init\n\n",
            "    # Overwrite an existing config\n    tsync init --force",
        )
    )]
    Init(cmd::init::InitArgs),

    #[command(
        next_help_heading = "Edits",
        about = "Create a local item",
        after_help = concat!(
            "EXAMPLES:\n",
            "    tsync create --connection jira --set status=open \\\n",
            "        --set summary=\"Crash on start\"\n\n",
            "    # Slave of item 42\n",
            "    tsync create --parent 42 --set body=\"needs repro\"",
        )
    )]
    Create(cmd::create::CreateArgs),

    #[command(
        next_help_heading = "Edits",
        about = "Set or unset attributes of an item",
        after_help = concat!(
            "EXAMPLES:\n    tsync edit 42 --set status=closed\n\n",
            "    tsync edit 42 --unset assignee",
        )
    )]
    Edit(cmd::edit::EditArgs),

    #[command(
        next_help_heading = "Edits",
        about = "Settle a conflict",
        after_help = concat!(
            "EXAMPLES:\n    tsync resolve 42 --take-server\n\n",
            "    tsync resolve 42 --keep-local",
        )
    )]
    Resolve(cmd::resolve::ResolveArgs),

    #[command(
        next_help_heading = "Edits",
        about = "Drop local changes of an item and its slaves"
    )]
    Discard(cmd::discard::DiscardArgs),

    #[command(
        next_help_heading = "Edits",
        about = "Delete an item and its slaves locally"
    )]
    Remove(cmd::remove::RemoveArgs),

    #[command(
        next_help_heading = "Query",
        about = "List items with their sync state",
        after_help = "EXAMPLES:\n    tsync list\n\n    tsync list --state conflicted --json"
    )]
    List(cmd::list::ListArgs),

    #[command(
        next_help_heading = "Query",
        about = "Show one item with its shadows"
    )]
    Show(cmd::show::ShowArgs),

    #[command(
        next_help_heading = "Sync",
        about = "Apply a download batch from a JSON file",
        long_about = concat!(
            "Write a batch of server values and removals, then merge it.\n\n",
            "The file holds a JSON array of entries such as\n",
            "{\"op\": \"updated\", \"id\": 42, \"connection\": \"jira\", \"values\": {...}}\n",
            "or {\"op\": \"removed\", \"id\": 42}. Use `-` to read standard input.",
        ),
        after_help = concat!(
            "EXAMPLES:\n    tsync download batch.json\n\n",
            "    cat batch.json | tsync download -",
        )
    )]
    Download(cmd::download::DownloadArgs),

    #[command(
        next_help_heading = "Sync",
        about = "Upload local changes",
        long_about = concat!(
            "Claim dirty items, hand them to their connections and apply the answers.\n\n",
            "Without a server the answers are simulated: every item is confirmed unless\n",
            "listed with --reject or --fail.",
        ),
        after_help = concat!(
            "EXAMPLES:\n    tsync upload\n\n",
            "    tsync upload 42 43 --reject 43=\"workflow forbids reopening\"\n\n",
            "    tsync upload --offline",
        )
    )]
    Upload(cmd::upload::UploadArgs),
}

fn init_tracing() {
    let filter = EnvFilter::try_from_env("TRACKSYNC_LOG").unwrap_or_else(|_| {
        EnvFilter::new(if env::var("DEBUG").is_ok() {
            "tracksync=debug,info"
        } else {
            "tracksync=info,warn"
        })
    });

    let format = env::var("TRACKSYNC_LOG_FORMAT").unwrap_or_else(|_| "compact".to_string());

    let registry = tracing_subscriber::registry().with(filter);

    match format.as_str() {
        "json" => {
            registry
                .with(fmt::layer().json().with_ansi(false).with_writer(std::io::stderr))
                .init();
        }
        _ => {
            registry
                .with(fmt::layer().compact().with_writer(std::io::stderr))
                .init();
        }
    }
}

fn run(command: Commands, output: OutputMode, project: &Project) -> anyhow::Result<()> {
    match command {
        Commands::Init(args) => cmd::init::run_init(&args, output, project),
        Commands::Create(args) => cmd::create::run_create(&args, output, project),
        Commands::Edit(args) => cmd::edit::run_edit(&args, output, project),
        Commands::Resolve(args) => cmd::resolve::run_resolve(&args, output, project),
        Commands::Discard(args) => cmd::discard::run_discard(&args, output, project),
        Commands::Remove(args) => cmd::remove::run_remove(&args, output, project),
        Commands::List(args) => cmd::list::run_list(&args, output, project),
        Commands::Show(args) => cmd::show::run_show(&args, output, project),
        Commands::Download(args) => cmd::download::run_download(&args, output, project),
        Commands::Upload(args) => cmd::upload::run_upload(&args, output, project),
    }
}

fn main() -> anyhow::Result<()> {
    init_tracing();

    let cli = Cli::parse();
    let project_root = env::current_dir()?;

    let effective = match config::resolve_config(&project_root, cli.json) {
        Ok(effective) => effective,
        Err(err) => {
            let fallback = resolve_output_mode(cli.format, if cli.json { "json" } else { "text" });
            render_error(fallback, &CliError::from(&err))?;
            std::process::exit(1);
        }
    };
    let output = resolve_output_mode(cli.format, &effective.resolved_output);
    debug!(?output, root = %project_root.display(), "command starting");

    let project = Project {
        root: project_root,
        config: effective.sync,
    };
    if let Err(err) = run(cli.command, output, &project) {
        render_error(output, &CliError::from(&err))?;
        std::process::exit(1);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracksync_core::model::ItemId;

    #[test]
    fn global_json_flag_after_subcommand() {
        let cli = Cli::parse_from(["tsync", "list", "--json"]);
        assert!(cli.json);
        assert!(matches!(cli.command, Commands::List(_)));
    }

    #[test]
    fn format_flag_parses_value_enum() {
        let cli = Cli::parse_from(["tsync", "--format", "text", "list"]);
        assert_eq!(cli.format, Some(OutputMode::Text));
    }

    #[test]
    fn show_takes_hash_prefixed_ids() {
        let cli = Cli::parse_from(["tsync", "show", "#42"]);
        match cli.command {
            Commands::Show(args) => assert_eq!(args.id, ItemId::new(42)),
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn resolve_requires_exactly_one_choice() {
        assert!(Cli::try_parse_from(["tsync", "resolve", "42"]).is_err());
        let both = ["tsync", "resolve", "42", "--keep-local", "--take-server"];
        assert!(Cli::try_parse_from(both).is_err());
        assert!(Cli::try_parse_from(["tsync", "resolve", "42", "--take-server"]).is_ok());
    }

    #[test]
    fn upload_collects_simulated_answers() {
        let cli = Cli::parse_from([
            "tsync", "upload", "1", "2", "--reject", "2=not allowed", "--fail", "1=timeout",
        ]);
        match cli.command {
            Commands::Upload(args) => {
                assert_eq!(args.ids, vec![ItemId::new(1), ItemId::new(2)]);
                assert_eq!(args.reject.len(), 1);
                assert_eq!(args.fail.len(), 1);
                assert!(!args.offline);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }
}
