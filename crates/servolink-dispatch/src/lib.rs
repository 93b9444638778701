mod commands;
mod events;
mod source;

pub use commands::parse_mode_command;
pub use events::ModeEvent;
pub use source::{run_socket_dispatcher, run_stdin_dispatcher, serve_lines};
