pub mod daemon;
pub mod todos;
