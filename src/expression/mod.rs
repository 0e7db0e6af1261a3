pub mod pattern;

pub use pattern::{escape_glob, glob_match};
