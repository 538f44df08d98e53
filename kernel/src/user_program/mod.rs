pub mod loader;

pub use loader::{load_segment, map_file, setup_stack, unmap};
