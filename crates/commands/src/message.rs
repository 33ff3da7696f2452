use serde::{Deserialize, Serialize};

use teamcloud_core::CommandId;

use crate::command::Command;

/// Wire envelope pushed to an external provider.
///
/// `callback_url` is where an asynchronous provider posts the final
/// [`crate::CommandResult`] once it is done.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandMessage {
    pub command_id: CommandId,
    pub command_type: String,
    pub command: Command,
    #[serde(default)]
    pub callback_url: Option<String>,
}

impl CommandMessage {
    pub fn new(command: Command, callback_url: Option<String>) -> Self {
        Self {
            command_id: command.command_id,
            command_type: command.name(),
            command,
            callback_url,
        }
    }
}
