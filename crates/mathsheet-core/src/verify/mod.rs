//! Verification stages for generated items.
//!
//! Cheap pure checks (`repair`, `sanitize`, `structural`) run before the
//! compile check, which shells out to a TeX engine through [`Compiler`].

pub mod compile;
pub mod item;
pub mod repair;
pub mod sanitize;
pub mod structural;

pub use compile::{CompileVerifier, Compiler};
pub use item::{CompileFanout, ItemVerifier};
pub use repair::{repair, repair_with_report, RepairAction, RepairReport};
pub use sanitize::{denylist, sanitize, DenyRule};
pub use structural::{check_content, MIN_STEM_LEN};
