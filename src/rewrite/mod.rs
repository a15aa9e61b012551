//! Method body rewriting: the editor, guard caches, and the instrumentor.
//!
//! # Architecture
//!
//! Instrumentation walks every method body of a loading module. The
//! [`editor::BodyEditor`] advances instruction by instruction while the
//! per-opcode patchers in [`instrument`] emit guard prologues built from
//! [`imports::ImportedReferences`] and the per-call-site cache fields created
//! by [`guards::GuardWriter`]. Branch targets and exception-handler spans are
//! remapped when the editor finishes.

pub mod editor;
pub mod guards;
pub mod imports;
pub mod instrument;

pub use editor::BodyEditor;
pub use guards::{GuardTarget, GuardWriter};
pub use imports::ImportedReferences;
pub use instrument::InstrumentationReport;
