//! `tsync download`: feed a batch of server values into the store.

use anyhow::Context as _;
use clap::Args;
use std::path::PathBuf;
use tracksync_core::merge::Downloaded;

use super::{Project, read_input, with_session};
use crate::output::{OutputMode, pretty_kv, pretty_section, render_mode};

#[derive(Args, Debug)]
pub struct DownloadArgs {
    /// JSON file with the batch, or `-` for standard input.
    pub file: PathBuf,
}

pub fn run_download(
    args: &DownloadArgs,
    output: OutputMode,
    project: &Project,
) -> anyhow::Result<()> {
    let raw = read_input(&args.file)?;
    let batch: Vec<Downloaded> = serde_json::from_str(&raw)
        .with_context(|| format!("Invalid download batch in {}", args.file.display()))?;

    with_session(project, output, |session| {
        let report = session.manager.write_downloaded(&batch, &session.cancel)?;

        render_mode(
            output,
            &report,
            |report, w| {
                for id in &report.created {
                    writeln!(w, "{id} created")?;
                }
                for (id, outcome) in &report.merged {
                    writeln!(w, "{id} {outcome}")?;
                }
                for id in &report.deferred {
                    writeln!(w, "{id} deferred")?;
                }
                for id in &report.removed {
                    writeln!(w, "{id} removed")?;
                }
                for id in &report.kept {
                    writeln!(w, "{id} kept")?;
                }
                Ok(())
            },
            |report, w| {
                pretty_section(w, &format!("Download applied (commit {})", report.commit))?;
                pretty_kv(w, "Created", report.created.len().to_string())?;
                pretty_kv(w, "Merged", report.merged.len().to_string())?;
                let conflicted = report.conflicted();
                if !conflicted.is_empty() {
                    let ids: Vec<String> = conflicted.iter().map(|id| format!("#{id}")).collect();
                    pretty_kv(w, "Conflicted", ids.join(", "))?;
                }
                pretty_kv(w, "Deferred", report.deferred.len().to_string())?;
                pretty_kv(w, "Removed", report.removed.len().to_string())?;
                pretty_kv(w, "Kept", report.kept.len().to_string())
            },
        )
    })
}
