//! Knowledge store command handler.
//!
//! Writes go straight to the SQLite store. A running service picks them up
//! on its next synchronizer tick through the store's modification time.

use super::print_json;
use clap::{Args, Subcommand};
use kbqa_core::{config::AppConfig, AppResult};
use kbqa_knowledge::{NewEntry, SqliteKnowledgeStore};
use std::path::PathBuf;

/// Manage knowledge entries
#[derive(Args, Debug)]
pub struct KbCommand {
    #[command(subcommand)]
    pub action: KbAction,
}

#[derive(Subcommand, Debug)]
pub enum KbAction {
    /// Add one entry
    Add(KbAddCommand),
    /// Import entries from a YAML file
    Import(KbImportCommand),
    /// List entries
    List(KbListCommand),
    /// Exclude an entry from answers, keeping its history
    Deactivate(KbDeactivateCommand),
    /// Show store statistics
    Stats(KbStatsCommand),
}

impl KbCommand {
    pub async fn execute(&self, config: &AppConfig) -> AppResult<()> {
        config.ensure_state_dir()?;
        let store = SqliteKnowledgeStore::open(config.store_path())?;

        match &self.action {
            KbAction::Add(cmd) => cmd.execute(&store),
            KbAction::Import(cmd) => cmd.execute(&store),
            KbAction::List(cmd) => cmd.execute(&store),
            KbAction::Deactivate(cmd) => cmd.execute(&store),
            KbAction::Stats(cmd) => cmd.execute(&store),
        }
    }
}

#[derive(Args, Debug)]
pub struct KbAddCommand {
    #[arg(long)]
    pub category: String,

    #[arg(long)]
    pub question: String,

    #[arg(long)]
    pub answer: String,

    /// Free-form context tag
    #[arg(long)]
    pub context: Option<String>,
}

impl KbAddCommand {
    fn execute(&self, store: &SqliteKnowledgeStore) -> AppResult<()> {
        let mut entry = NewEntry::new(&self.category, &self.question, &self.answer);
        entry.context = self.context.clone();

        let created = store.add_entry(&entry)?;
        println!("Added entry #{}", created.id);
        Ok(())
    }
}

#[derive(Args, Debug)]
pub struct KbImportCommand {
    /// YAML file: a list of entries, or a mapping with an `entries` list
    pub file: PathBuf,
}

impl KbImportCommand {
    fn execute(&self, store: &SqliteKnowledgeStore) -> AppResult<()> {
        let count = store.import_yaml(&self.file)?;
        println!("Imported {} entries from {}", count, self.file.display());
        Ok(())
    }
}

#[derive(Args, Debug)]
pub struct KbListCommand {
    /// Include deactivated entries
    #[arg(long)]
    pub all: bool,

    /// Output as JSON
    #[arg(long)]
    pub json: bool,
}

impl KbListCommand {
    fn execute(&self, store: &SqliteKnowledgeStore) -> AppResult<()> {
        let entries = store.list_entries(self.all)?;

        if self.json {
            return print_json(&entries);
        }

        if entries.is_empty() {
            println!("No entries");
            return Ok(());
        }

        for entry in &entries {
            let marker = if entry.active { "" } else { " (inactive)" };
            println!(
                "#{} [{}] {}{}",
                entry.id, entry.category, entry.question, marker
            );
        }
        Ok(())
    }
}

#[derive(Args, Debug)]
pub struct KbDeactivateCommand {
    pub id: i64,
}

impl KbDeactivateCommand {
    fn execute(&self, store: &SqliteKnowledgeStore) -> AppResult<()> {
        store.deactivate_entry(self.id)?;
        println!("Deactivated entry #{}", self.id);
        Ok(())
    }
}

#[derive(Args, Debug)]
pub struct KbStatsCommand {
    /// Output as JSON
    #[arg(long)]
    pub json: bool,
}

impl KbStatsCommand {
    fn execute(&self, store: &SqliteKnowledgeStore) -> AppResult<()> {
        let stats = store.stats()?;

        if self.json {
            return print_json(&stats);
        }

        println!("Knowledge store: {}", store.path().display());
        println!(
            "  Entries: {} ({} active, {} indexed)",
            stats.total_entries, stats.active_entries, stats.indexed_entries
        );
        println!("  Conversations: {}", stats.conversations);
        if let Some(modified) = stats.last_modified {
            println!("  Last modified: {}", modified);
        }
        Ok(())
    }
}
