//! Playbook Loader & Inliner (spec.md §4.2).
//!
//! Resolves `source helpers.sh` marker comments and assembles a single
//! self-contained script. Pure and reentrant: given the same playbook
//! name it always produces the same bytes.

mod inliner;
pub(crate) mod source;

pub use inliner::{assemble, content_hash, AssembledScript};
pub use source::{DirPlaybookSource, PlaybookSource};
