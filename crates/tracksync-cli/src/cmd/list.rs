//! `tsync list`: items with their derived sync state.

use clap::Args;
use serde::Serialize;
use tracksync_core::model::{ConnectionId, ItemId};
use tracksync_core::state::SyncState;

use super::{Project, with_session};
use crate::output::{OutputMode, pretty_rule, render_mode};

#[derive(Args, Debug)]
pub struct ListArgs {
    /// Filter by state: clean, local-dirty, download-pending, conflicted, locked.
    #[arg(long)]
    pub state: Option<SyncState>,

    /// Filter by connection.
    #[arg(short, long)]
    pub connection: Option<String>,
}

#[derive(Debug, Serialize)]
struct Row {
    id: ItemId,
    state: SyncState,
    #[serde(skip_serializing_if = "Option::is_none")]
    connection: Option<ConnectionId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    parent: Option<ItemId>,
    attributes: usize,
}

pub fn run_list(args: &ListArgs, output: OutputMode, project: &Project) -> anyhow::Result<()> {
    let connection = args.connection.as_deref().map(ConnectionId::new);

    with_session(project, output, |session| {
        let snapshot = session.manager.snapshot()?;
        let rows: Vec<Row> = session
            .manager
            .states()?
            .into_iter()
            .filter(|(_, state)| args.state.is_none_or(|wanted| wanted == *state))
            .filter_map(|(id, state)| {
                let record = snapshot.get(id)?;
                Some(Row {
                    id,
                    state,
                    connection: record.connection.clone(),
                    parent: record.parent,
                    attributes: record.trunk.len(),
                })
            })
            .filter(|row| connection.is_none() || row.connection == connection)
            .collect();

        render_mode(
            output,
            &rows,
            |rows, w| {
                for row in rows {
                    let connection = row.connection.as_ref().map_or("-", ConnectionId::as_str);
                    writeln!(w, "{} {} {connection}", row.id, row.state)?;
                }
                Ok(())
            },
            |rows, w| {
                writeln!(
                    w,
                    "{:>6}  {:<17} {:<12} {:>6}  ATTRS",
                    "ID", "STATE", "CONNECTION", "PARENT"
                )?;
                pretty_rule(w)?;
                for row in rows {
                    let connection = row.connection.as_ref().map_or("-", ConnectionId::as_str);
                    let parent = row
                        .parent
                        .map_or_else(|| "-".to_string(), |parent| parent.to_string());
                    writeln!(
                        w,
                        "{:>6}  {:<17} {:<12} {:>6}  {}",
                        row.id.to_string(),
                        row.state.to_string(),
                        connection,
                        parent,
                        row.attributes
                    )?;
                }
                writeln!(w, "{} item(s)", rows.len())
            },
        )
    })
}
