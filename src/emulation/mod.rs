//! Controlled execution environment for guarded bytecode.
//!
//! # Architecture
//!
//! The engine is a compact interpreter over the runtime metadata model: an
//! evaluation stack, a managed heap, per-type static storage with one-shot
//! initialisation, and a frame stack recording the executing module. The frame
//! stack doubles as the calling-assembly primitive the guard entry points
//! consult, so a machine is all a sandboxed module needs to run with its
//! policy enforced.
//!
//! # Key Components
//!
//! - [`Machine`] - Interpreter, heap, statics, and frames
//! - [`EmValue`] / [`machine::ObjData`] - Runtime values and heap objects
//! - [`NativeCall`] - Argument package for native intrinsic methods
//! - [`intrinsics`] - Core library bootstrap with the guard entry points

pub mod intrinsics;
pub mod machine;
pub mod value;

pub use machine::{Machine, ObjData};
pub use value::{EmValue, HeapRef, NativeCall};
