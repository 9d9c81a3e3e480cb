//! `tsync resolve`: settle a conflicted item by explicit choice.

use clap::Args;
use tracksync_core::merge::Resolution;
use tracksync_core::model::ItemId;

use super::{Project, render_outcome, with_session};
use crate::output::OutputMode;

#[derive(Args, Debug)]
pub struct ResolveArgs {
    /// Conflicted item.
    pub id: ItemId,

    /// Keep local values of the overlapping attributes.
    #[arg(long, conflicts_with = "take_server", required_unless_present = "take_server")]
    pub keep_local: bool,

    /// Drop local edits and take the server values.
    #[arg(long)]
    pub take_server: bool,
}

impl ResolveArgs {
    const fn resolution(&self) -> Resolution {
        if self.keep_local {
            Resolution::KeepLocal
        } else {
            Resolution::TakeServer
        }
    }
}

pub fn run_resolve(
    args: &ResolveArgs,
    output: OutputMode,
    project: &Project,
) -> anyhow::Result<()> {
    with_session(project, output, |session| {
        let outcome = session
            .manager
            .reconcile(args.id, args.resolution(), &session.cancel)?;
        render_outcome(output, &outcome)
    })
}
