//! Command handlers for the kbqa CLI.

pub mod ask;
pub mod index;
pub mod kb;
pub mod serve;

pub use ask::AskCommand;
pub use index::IndexCommand;
pub use kb::KbCommand;
pub use serve::ServeCommand;

use kbqa_core::AppResult;
use serde::Serialize;

/// Print `value` as pretty JSON on stdout.
pub(crate) fn print_json<T: Serialize>(value: &T) -> AppResult<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
