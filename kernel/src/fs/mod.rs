pub mod file;

pub use file::{BackingFile, FileError};
