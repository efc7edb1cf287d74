//! Records and summaries produced while streaming query results.

mod row;
mod summary;

pub use row::Record;
pub use summary::{CommitSummary, QuerySummary};

pub(crate) use row::build_key_index;
