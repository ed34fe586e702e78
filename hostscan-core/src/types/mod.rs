pub mod finding;
pub mod module;
pub mod report;
pub mod severity;

pub use finding::{excerpt, Finding, FindingSet, MAX_EXCERPT};
pub use module::ModuleName;
pub use report::*;
pub use severity::Severity;
