pub mod fs;
pub mod tasks;
