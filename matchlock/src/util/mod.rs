//! Small host-process helpers shared across components.

mod fs;
mod process;

pub use fs::copy_dir_recursive;
pub use process::{is_process_alive, is_same_process, kill_process, terminate_process};
