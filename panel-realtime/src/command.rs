//! Console command validation and rejection reasons.

/// Why a console command was not sent. Nothing reaches the wire in any of these cases.
#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum CommandRejection {
    #[error("Not connected to the panel")]
    Disconnected,

    #[error("Server {server_id} has no active subscribers")]
    NotSubscribed { server_id: String },

    #[error("Command is empty")]
    Empty,

    #[error("Command is {len} bytes, limit is {max}")]
    TooLong { len: usize, max: usize },

    #[error("Command must be a single line")]
    MultiLine,
}

/// Check a command's shape and return it with surrounding whitespace removed.
pub fn validate_command(command: &str, max_len: usize) -> Result<&str, CommandRejection> {
    let trimmed = command.trim();
    if trimmed.is_empty() {
        return Err(CommandRejection::Empty);
    }
    if trimmed.contains(['\n', '\r']) {
        return Err(CommandRejection::MultiLine);
    }
    if trimmed.len() > max_len {
        return Err(CommandRejection::TooLong {
            len: trimmed.len(),
            max: max_len,
        });
    }
    Ok(trimmed)
}
