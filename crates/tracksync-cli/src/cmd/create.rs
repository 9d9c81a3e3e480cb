//! `tsync create`: add a local item that has never been seen by a server.

use clap::Args;
use tracksync_core::commit::NewItem;
use tracksync_core::model::{ConnectionId, ItemId};

use super::{Project, parse_assignments, render_outcome, with_session};
use crate::output::OutputMode;

#[derive(Args, Debug)]
pub struct CreateArgs {
    /// Connection that will own the item once uploaded.
    #[arg(short, long)]
    pub connection: Option<String>,

    /// Master item; the new item becomes its slave.
    #[arg(long)]
    pub parent: Option<ItemId>,

    /// Attribute values as attr=value (repeatable).
    #[arg(short, long = "set", value_name = "ATTR=VALUE")]
    pub set: Vec<String>,
}

pub fn run_create(args: &CreateArgs, output: OutputMode, project: &Project) -> anyhow::Result<()> {
    let new = NewItem {
        connection: args.connection.as_deref().map(ConnectionId::new),
        parent: args.parent,
        values: parse_assignments(&args.set)?,
    };

    with_session(project, output, |session| {
        let outcome = session.manager.create(new, &session.cancel)?;
        render_outcome(output, &outcome)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_args_defaults() {
        use clap::Parser;

        #[derive(Parser)]
        struct Wrapper {
            #[command(flatten)]
            args: CreateArgs,
        }
        let w = Wrapper::parse_from(["test", "--set", "status=open", "-s", "summary=Crash"]);
        assert!(w.args.connection.is_none());
        assert!(w.args.parent.is_none());
        assert_eq!(w.args.set.len(), 2);
    }
}
