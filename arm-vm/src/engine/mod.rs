pub mod cache;
pub mod decode;

pub use cache::TranslationCache;
pub use decode::{DpOpc, Insn, Op, Operand2, Shift};
