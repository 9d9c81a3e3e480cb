use anyhow::{Context as _, Result};
use clap::Args;
use serde::Serialize;
use tracksync_core::SyncManager;
use tracksync_core::config::{self, PROJECT_DIR};

use super::Project;
use crate::output::{OutputMode, pretty_kv, pretty_section, render_mode};

#[derive(Args, Debug)]
pub struct InitArgs {
    /// Overwrite the config even if `.tracksync/` already exists.
    #[arg(long)]
    pub force: bool,
}

const CONFIG_TOML: &str = "[merge]\n\
    # manual | server-wins | local-wins | server-wins-after\n\
    conflict_policy = \"manual\"\n\
    server_wins_after_minutes = 60\n\
    \n\
    [schema]\n\
    # Attributes computed from others; never compared or kept in shadows.\n\
    derived = []\n\
    \n\
    [store]\n\
    path = \"items.db\"\n\
    lock_timeout_ms = 2000\n";

const GITIGNORE: &str = "*.db\n*.db-wal\n*.db-shm\n*.lock\n";

#[derive(Debug, Serialize)]
struct InitReport {
    config: String,
    store: String,
    items: usize,
}

/// Execute `tsync init`. Creates the project skeleton and an empty store:
///
/// ```text
/// .tracksync/
///   config.toml   (default project config)
///   .gitignore    (store and lock files)
///   items.db      (SQLite item store)
/// ```
///
/// # Errors
///
/// Returns an error if `.tracksync/` already exists and `--force` is not set,
/// or if any filesystem or store operation fails.
pub fn run_init(args: &InitArgs, output: OutputMode, project: &Project) -> Result<()> {
    let dir = project.dir();

    if dir.exists() && !args.force {
        anyhow::bail!("{PROJECT_DIR}/ already exists. Use `tsync init --force` to reinitialize.");
    }

    std::fs::create_dir_all(&dir)
        .with_context(|| format!("Failed to create {}", dir.display()))?;

    let config_path = dir.join("config.toml");
    std::fs::write(&config_path, CONFIG_TOML)
        .with_context(|| format!("Failed to write config: {}", config_path.display()))?;

    let gitignore_path = dir.join(".gitignore");
    std::fs::write(&gitignore_path, GITIGNORE)
        .with_context(|| format!("Failed to write .gitignore: {}", gitignore_path.display()))?;

    let sync = config::load_sync_config(&project.root)?;
    let store_path = sync.store.resolve_path(&project.root);
    let manager = SyncManager::open(&project.root, &sync)?;
    let report = InitReport {
        config: config_path.display().to_string(),
        store: store_path.display().to_string(),
        items: manager.snapshot()?.len(),
    };

    render_mode(
        output,
        &report,
        |report, w| writeln!(w, "initialized {} ({} items)", report.store, report.items),
        |report, w| {
            pretty_section(w, "Initialized tracksync project")?;
            pretty_kv(w, "Config", &report.config)?;
            pretty_kv(w, "Store", &report.store)?;
            pretty_kv(w, "Items", report.items.to_string())
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracksync_core::config::SyncConfig;

    fn project(root: &std::path::Path) -> Project {
        Project {
            root: root.to_path_buf(),
            config: SyncConfig::default(),
        }
    }

    #[test]
    fn default_config_parses() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::create_dir_all(dir.path().join(PROJECT_DIR)).expect("mkdir");
        let path = dir.path().join(PROJECT_DIR).join("config.toml");
        std::fs::write(path, CONFIG_TOML).expect("write");

        let parsed = config::load_sync_config(dir.path()).expect("parse default config");
        assert_eq!(parsed.store.lock_timeout_ms, 2000);
        assert!(parsed.schema.derived.is_empty());
    }

    #[test]
    fn init_creates_store_and_refuses_second_run() {
        let dir = tempfile::tempdir().expect("tempdir");
        let project = project(dir.path());

        run_init(&InitArgs { force: false }, OutputMode::Json, &project).expect("first init");
        assert!(dir.path().join(".tracksync/config.toml").exists());
        assert!(dir.path().join(".tracksync/items.db").exists());

        let err = run_init(&InitArgs { force: false }, OutputMode::Json, &project)
            .expect_err("second init without --force");
        assert!(err.to_string().contains("--force"));

        run_init(&InitArgs { force: true }, OutputMode::Json, &project).expect("forced init");
    }
}
