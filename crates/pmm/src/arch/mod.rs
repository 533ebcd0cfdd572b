//! Architecture-specific implementations for memory management.
//!
//! Only the software scale model is built today. It behaves like a small radix MMU and
//! runs on any host, which lets the whole memory manager be exercised in ordinary tests.

mod software;
pub use software::*;
