//! `tsync edit`: set and unset trunk attributes in one commit.

use clap::Args;
use tracksync_core::model::{AttrId, ItemId};
use tracksync_core::mutations::{SetAttributes, UnsetAttributes};

use super::{Project, parse_assignments, render_outcome, with_session};
use crate::output::OutputMode;

#[derive(Args, Debug)]
pub struct EditArgs {
    /// Item to change.
    pub id: ItemId,

    /// Attribute values as attr=value (repeatable).
    #[arg(short, long = "set", value_name = "ATTR=VALUE")]
    pub set: Vec<String>,

    /// Attributes to remove (repeatable).
    #[arg(short, long = "unset", value_name = "ATTR")]
    pub unset: Vec<String>,
}

pub fn run_edit(args: &EditArgs, output: OutputMode, project: &Project) -> anyhow::Result<()> {
    if args.set.is_empty() && args.unset.is_empty() {
        anyhow::bail!("nothing to change: pass --set or --unset");
    }
    let values = parse_assignments(&args.set)?;
    let attrs: Vec<AttrId> = args.unset.iter().map(|attr| AttrId::new(attr.trim())).collect();

    with_session(project, output, |session| {
        let mut txn = session
            .manager
            .prepare_edit(&[args.id])?
            .with_cancel(session.cancel.clone());
        if !values.is_empty() {
            txn.add_mutation(args.id, SetAttributes::new(values))?;
        }
        if !attrs.is_empty() {
            txn.add_mutation(args.id, UnsetAttributes { attrs })?;
        }
        let outcome = txn.commit()?;
        session.manager.merge_pending(&session.cancel)?;
        render_outcome(output, &outcome)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[derive(Parser)]
    struct Wrapper {
        #[command(flatten)]
        args: EditArgs,
    }

    #[test]
    fn edit_args_parse_set_and_unset() {
        let w = Wrapper::parse_from([
            "test", "42", "--set", "status=closed", "--unset", "assignee",
        ]);
        assert_eq!(w.args.id, ItemId::new(42));
        assert_eq!(w.args.set, vec!["status=closed".to_string()]);
        assert_eq!(w.args.unset, vec!["assignee".to_string()]);
    }

    #[test]
    fn edit_requires_an_id() {
        assert!(Wrapper::try_parse_from(["test", "--set", "status=closed"]).is_err());
    }
}
