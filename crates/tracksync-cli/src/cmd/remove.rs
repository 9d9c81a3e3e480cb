use clap::Args;
use tracksync_core::model::ItemId;

use super::{Project, render_outcome, with_session};
use crate::output::OutputMode;

#[derive(Args, Debug)]
pub struct RemoveArgs {
    /// Item to delete together with its slaves.
    pub id: ItemId,
}

pub fn run_remove(args: &RemoveArgs, output: OutputMode, project: &Project) -> anyhow::Result<()> {
    with_session(project, output, |session| {
        let outcome = session.manager.remove(args.id, &session.cancel)?;
        render_outcome(output, &outcome)
    })
}
