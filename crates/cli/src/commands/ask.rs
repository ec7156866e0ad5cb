//! Ask command handler.
//!
//! Runs the full retrieval pipeline once, without the HTTP layer. The
//! index is loaded from the persisted snapshot when it is current and
//! rebuilt from the store otherwise.

use super::print_json;
use clap::Args;
use kbqa_core::{config::AppConfig, AppResult};
use kbqa_knowledge::Services;

/// Answer one question
#[derive(Args, Debug)]
pub struct AskCommand {
    /// The question to ask
    pub question: String,

    /// Session id to record the conversation under
    #[arg(long, default_value = "cli")]
    pub session: String,

    /// Output as JSON
    #[arg(long)]
    pub json: bool,
}

impl AskCommand {
    pub async fn execute(&self, config: &AppConfig) -> AppResult<()> {
        let services = Services::connect(config).await?;
        services.prepare_index().await?;

        let answer = services
            .orchestrator
            .answer(&self.question, &self.session)
            .await?;

        tracing::debug!(
            confidence = answer.confidence,
            matched = answer.matched,
            degraded = answer.degraded,
            total_ms = answer.latency.total_ms,
            "Answered"
        );

        if self.json {
            return print_json(&answer);
        }

        println!("{}", answer.answer);
        println!();
        if !answer.matched {
            println!("No matching entry (confidence {:.2})", answer.confidence);
            return Ok(());
        }
        if answer.degraded {
            println!("(generator unavailable, showing retrieved entries)");
        }
        println!("Sources:");
        for source in &answer.sources {
            println!(
                "- #{} {} ({:.2})",
                source.id, source.question, source.confidence
            );
        }

        Ok(())
    }
}
