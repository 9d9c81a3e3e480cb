//! Subcommands and the store session they share.

pub mod create;
pub mod discard;
pub mod download;
pub mod edit;
pub mod init;
pub mod list;
pub mod remove;
pub mod resolve;
pub mod show;
pub mod upload;

use std::collections::{BTreeMap, BTreeSet};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use tracksync_core::commit::{CommitOutcome, ItemResult};
use tracksync_core::config::{PROJECT_DIR, SyncConfig};
use tracksync_core::connection::{Connection, StaticConnection};
use tracksync_core::model::{AttrId, AttributeMap, ConnectionId, Value};
use tracksync_core::{CancelToken, SyncManager};

use crate::output::{OutputMode, render_mode, render_problems};

/// Where a command runs and the sync config resolved for it.
#[derive(Debug, Clone)]
pub struct Project {
    pub root: PathBuf,
    pub config: SyncConfig,
}

impl Project {
    pub fn dir(&self) -> PathBuf {
        self.root.join(PROJECT_DIR)
    }
}

/// An open store plus one simulated connection per connection id it knows.
pub struct Session {
    pub manager: SyncManager,
    pub cancel: CancelToken,
    connections: BTreeMap<ConnectionId, Arc<StaticConnection>>,
}

impl Session {
    fn open(project: &Project) -> anyhow::Result<Self> {
        if !project.dir().is_dir() {
            anyhow::bail!(
                "not a tracksync project: {} is missing (run `tsync init`)",
                project.dir().display()
            );
        }
        let manager = SyncManager::open(&project.root, &project.config)?;
        let mut session = Self {
            manager,
            cancel: CancelToken::new(),
            connections: BTreeMap::new(),
        };
        let known: BTreeSet<ConnectionId> = session
            .manager
            .snapshot()?
            .items()
            .filter_map(|record| record.connection.clone())
            .collect();
        for id in known {
            session.register(id);
        }
        Ok(session)
    }

    fn register(&mut self, id: ConnectionId) {
        let connection = Arc::new(StaticConnection::new(id.as_str()));
        self.manager.connections().register(Arc::clone(&connection) as Arc<dyn Connection>);
        self.connections.insert(id, connection);
    }

    pub fn connections(&self) -> impl Iterator<Item = &Arc<StaticConnection>> {
        self.connections.values()
    }
}

/// Run `f` against the project's store and print the sync problems it recorded.
pub fn with_session<T>(
    project: &Project,
    output: OutputMode,
    f: impl FnOnce(&mut Session) -> anyhow::Result<T>,
) -> anyhow::Result<T> {
    let mut session = Session::open(project)?;
    let result = f(&mut session);
    render_problems(output, &session.manager.problems())?;
    result
}

/// Parse `attr=value` pairs into an attribute map.
pub fn parse_assignments(pairs: &[String]) -> anyhow::Result<AttributeMap> {
    pairs.iter().try_fold(AttributeMap::new(), |mut map, pair| {
        let (attr, raw) = pair
            .split_once('=')
            .with_context(|| format!("expected attr=value, got '{pair}'"))?;
        let attr = attr.trim();
        if attr.is_empty() {
            anyhow::bail!("empty attribute name in '{pair}'");
        }
        map.set(AttrId::new(attr), Value::parse_literal(raw));
        Ok(map)
    })
}

/// Split `key=text` into its parts.
pub fn parse_pair(pair: &str) -> anyhow::Result<(&str, &str)> {
    pair.split_once('=')
        .map(|(key, text)| (key.trim(), text))
        .with_context(|| format!("expected key=value, got '{pair}'"))
}

/// Print a commit outcome; fails the command if any change failed.
pub fn render_outcome(output: OutputMode, outcome: &CommitOutcome) -> anyhow::Result<()> {
    fn text(outcome: &CommitOutcome, w: &mut dyn Write) -> io::Result<()> {
        for (item, result) in &outcome.results {
            writeln!(w, "{item} {result}")?;
        }
        Ok(())
    }

    render_mode(output, outcome, text, |outcome, w| {
        crate::output::pretty_section(w, &format!("Commit {}", outcome.commit))?;
        for (item, result) in &outcome.results {
            let marker = if outcome.created.contains(item) { " (new)" } else { "" };
            crate::output::pretty_kv(w, &format!("#{item}"), format!("{result}{marker}"))?;
        }
        Ok(())
    })?;

    let failed = outcome
        .results
        .iter()
        .filter(|(_, result)| matches!(result, ItemResult::Failed { .. }))
        .count();
    if failed > 0 {
        anyhow::bail!("{failed} change(s) failed and were rolled back");
    }
    Ok(())
}

/// Read a file, or standard input for `-`.
pub fn read_input(path: &Path) -> anyhow::Result<String> {
    if path == Path::new("-") {
        return io::read_to_string(io::stdin()).context("Failed to read standard input");
    }
    std::fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))
}
