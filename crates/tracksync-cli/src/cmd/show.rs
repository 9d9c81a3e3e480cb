//! `tsync show`: one item with its trunk, shadows and upload readiness.

use clap::Args;
use serde::Serialize;
use std::io::{self, Write};
use tracksync_core::SyncError;
use tracksync_core::model::{AttributeMap, ItemId, ItemRecord, ShadowKind};
use tracksync_core::state::SyncState;

use super::{Project, with_session};
use crate::output::{OutputMode, pretty_kv, pretty_section, render_mode};

#[derive(Args, Debug)]
pub struct ShowArgs {
    /// Item ID, with or without a leading `#`.
    pub id: ItemId,
}

#[derive(Debug, Serialize)]
struct ItemView {
    state: SyncState,
    can_upload: bool,
    slaves: Vec<ItemId>,
    #[serde(flatten)]
    record: ItemRecord,
}

fn write_values(w: &mut dyn Write, indent: &str, values: &AttributeMap) -> io::Result<()> {
    if values.is_empty() {
        return writeln!(w, "{indent}(empty)");
    }
    for (attr, value) in values.iter() {
        writeln!(w, "{indent}{attr} = {value}")?;
    }
    Ok(())
}

pub fn run_show(args: &ShowArgs, output: OutputMode, project: &Project) -> anyhow::Result<()> {
    with_session(project, output, |session| {
        let snapshot = session.manager.snapshot()?;
        let record = snapshot
            .get(args.id)
            .cloned()
            .ok_or(SyncError::ItemNotFound(args.id))?;
        let view = ItemView {
            state: session.manager.state(args.id)?,
            can_upload: session.manager.can_upload(args.id)?,
            slaves: snapshot.children_of(args.id),
            record,
        };

        render_mode(
            output,
            &view,
            |view, w| {
                writeln!(w, "{} {}", view.record.id, view.state)?;
                write_values(w, "  ", &view.record.trunk)?;
                for kind in ShadowKind::ALL {
                    if let Some(shadow) = view.record.shadow(kind) {
                        writeln!(w, "{kind}:")?;
                        write_values(w, "  ", shadow)?;
                    }
                }
                Ok(())
            },
            |view, w| {
                pretty_section(w, &format!("Item #{}", view.record.id))?;
                pretty_kv(w, "State", view.state.to_string())?;
                if let Some(connection) = &view.record.connection {
                    pretty_kv(w, "Connection", connection.as_str())?;
                }
                if let Some(parent) = view.record.parent {
                    pretty_kv(w, "Master", format!("#{parent}"))?;
                }
                if !view.slaves.is_empty() {
                    let slaves: Vec<String> =
                        view.slaves.iter().map(|id| format!("#{id}")).collect();
                    pretty_kv(w, "Slaves", slaves.join(", "))?;
                }
                if let Some(edited) = view.record.edited_at {
                    pretty_kv(w, "Edited", edited.to_rfc3339())?;
                }
                pretty_kv(w, "Uploadable", if view.can_upload { "yes" } else { "no" })?;
                writeln!(w)?;
                writeln!(w, "Trunk")?;
                write_values(w, "  ", &view.record.trunk)?;
                for kind in ShadowKind::ALL {
                    if let Some(shadow) = view.record.shadow(kind) {
                        writeln!(w)?;
                        writeln!(w, "Shadow: {kind}")?;
                        write_values(w, "  ", shadow)?;
                    }
                }
                Ok(())
            },
        )
    })
}
