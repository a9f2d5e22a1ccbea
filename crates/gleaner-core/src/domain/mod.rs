//! Domain model (IDs, categories, items, runs, decisions, errors).
//!
//! ここは I/O を持たない純粋な型と状態遷移だけを置きます。

pub mod category;
pub mod decision;
pub mod errors;
pub mod ids;
pub mod item;
pub mod run;

pub use category::{Category, ParseCategoryError, ParsePriorityError, PriorityTier};
pub use decision::{Decider, Decision, DefaultDecider};
pub use errors::{ErrorKind, GleanerError};
pub use ids::{ParseIdError, RunId, TaskId};
pub use item::{DetailQueueEntry, DetailStatus, Item, ListedItem, derive_dedupe_key};
pub use run::{BlockReason, Run, RunBlock, RunPhase, RunStatus};
