use clap::Args;
use tracksync_core::model::ItemId;

use super::{Project, render_outcome, with_session};
use crate::output::OutputMode;

#[derive(Args, Debug)]
pub struct DiscardArgs {
    /// Item whose local changes, including those of its slaves, are dropped.
    pub id: ItemId,
}

pub fn run_discard(
    args: &DiscardArgs,
    output: OutputMode,
    project: &Project,
) -> anyhow::Result<()> {
    with_session(project, output, |session| {
        let outcome = session.manager.discard(args.id, &session.cancel)?;
        render_outcome(output, &outcome)
    })
}
