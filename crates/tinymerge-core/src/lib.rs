pub mod cancel;
pub mod config;
pub mod copier;
pub mod error;
pub mod ledger;
pub mod logging;
pub mod merge;
pub mod tree;

pub use cancel::CancelToken;
pub use config::Settings;
pub use copier::{FileCopier, FsCopier};
pub use error::{MergeError, Result};
pub use ledger::{RollbackLedger, Undo};
pub use merge::{merge, MergeReport, Merger};
pub use tree::MergeSummary;
