//! # ReachClaw Keywords
//!
//! Compiles tenant keyword sets (literal or regex entries) into one matcher
//! over inbound chat text. Literals go through a single Aho-Corasick
//! automaton, regexes are checked one by one. Text and literals are
//! lowercased char-wise before matching.

pub mod compiled;
pub mod index;

pub use compiled::{CompileReport, CompiledIndex, KeywordMatch, SkippedEntry, normalize};
pub use index::KeywordIndex;
