//! `tsync upload`: claim dirty items, hand them to their connections and
//! apply the answers.
//!
//! There is no server behind the CLI: every claimed item is confirmed unless
//! `--reject` or `--fail` names it, and `--offline` makes the connections
//! refuse the request outright.

use clap::Args;
use serde::Serialize;
use std::collections::BTreeMap;
use tracksync_core::model::ItemId;
use tracksync_core::upload::{UploadReport, UploadResult};

use super::{Project, parse_pair, with_session};
use crate::output::{OutputMode, pretty_kv, pretty_section, render_mode};

#[derive(Args, Debug)]
pub struct UploadArgs {
    /// Items to upload; defaults to every item with uploadable changes.
    pub ids: Vec<ItemId>,

    /// Simulate a server rejection as id=reason (repeatable).
    #[arg(long, value_name = "ID=REASON")]
    pub reject: Vec<String>,

    /// Simulate a failed request as id=message (repeatable).
    #[arg(long, value_name = "ID=MESSAGE")]
    pub fail: Vec<String>,

    /// Simulate unreachable servers.
    #[arg(long)]
    pub offline: bool,
}

#[derive(Debug, Serialize)]
struct UploadView {
    /// Requested items that were not claimed.
    skipped: Vec<ItemId>,
    #[serde(flatten)]
    report: UploadReport,
}

fn parse_answers(pairs: &[String]) -> anyhow::Result<BTreeMap<ItemId, String>> {
    pairs
        .iter()
        .map(|pair| {
            let (id, text) = parse_pair(pair)?;
            Ok((id.parse::<ItemId>()?, text.to_string()))
        })
        .collect()
}

fn simulated_results(
    claimed: &[ItemId],
    rejections: &BTreeMap<ItemId, String>,
    failures: &BTreeMap<ItemId, String>,
) -> BTreeMap<ItemId, UploadResult> {
    claimed
        .iter()
        .map(|item| {
            let result = if let Some(reason) = rejections.get(item) {
                UploadResult::Rejected {
                    reason: reason.clone(),
                }
            } else if let Some(message) = failures.get(item) {
                UploadResult::Failed {
                    message: message.clone(),
                }
            } else {
                UploadResult::Confirmed
            };
            (*item, result)
        })
        .collect()
}

pub fn run_upload(args: &UploadArgs, output: OutputMode, project: &Project) -> anyhow::Result<()> {
    let rejections = parse_answers(&args.reject)?;
    let failures = parse_answers(&args.fail)?;

    with_session(project, output, |session| {
        if args.offline {
            for connection in session.connections() {
                connection.set_offline(true);
            }
        }

        let requested = if args.ids.is_empty() {
            session.manager.pending_uploads()?
        } else {
            args.ids.clone()
        };
        let batch = session.manager.begin_upload(&requested, &session.cancel)?;
        let claimed = batch.ids();
        let skipped: Vec<ItemId> = requested
            .iter()
            .copied()
            .filter(|item| !claimed.contains(item))
            .collect();

        let report = if batch.is_empty() {
            UploadReport::default()
        } else {
            session.manager.request_upload(&batch)?;
            let results = simulated_results(&claimed, &rejections, &failures);
            session
                .manager
                .finish_upload(batch, &results, &session.cancel)?
        };
        let view = UploadView { skipped, report };

        render_mode(
            output,
            &view,
            |view, w| {
                for id in &view.report.confirmed {
                    writeln!(w, "{id} confirmed")?;
                }
                for id in &view.report.rejected {
                    writeln!(w, "{id} rejected")?;
                }
                for id in &view.report.failed {
                    writeln!(w, "{id} failed")?;
                }
                for id in &view.skipped {
                    writeln!(w, "{id} skipped")?;
                }
                Ok(())
            },
            |view, w| {
                pretty_section(w, "Upload")?;
                pretty_kv(w, "Confirmed", view.report.confirmed.len().to_string())?;
                pretty_kv(w, "Rejected", view.report.rejected.len().to_string())?;
                pretty_kv(w, "Failed", view.report.failed.len().to_string())?;
                pretty_kv(w, "Merged", view.report.merged.len().to_string())?;
                pretty_kv(w, "Skipped", view.skipped.len().to_string())
            },
        )
    })
}
