pub mod cli;
pub mod render;

pub use cli::{run, Cli, Command};
pub use render::TerminalRenderer;
