//! Command vocabulary shared by coordinator and workers

use serde::{Deserialize, Serialize};
use std::fmt;

/// Width of every command tag on the wire
pub const TAG_LEN: usize = 4;

/// Control tokens exchanged between coordinator and workers.
///
/// Commands precede or replace a data frame; they never carry a payload
/// themselves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Command {
    /// Terminate the conversation
    Exit,
    /// Run simulation sub-steps and produce a sample
    Step,
    /// End of the current command sequence
    Done,
    /// End of a dictionary sub-message
    Finished,
    /// Request (worker) or apply (coordinator push) a network prediction
    Prediction,
    /// A labeled value follows
    Read,
    /// Load a dataset-supplied sample reference
    Sample,
    /// Refresh or request visualization state
    Visualisation,
    /// Persist the currently loaded sample without stepping
    Compute,
    /// Switch the worker's storage partition
    ChangeDb,
}

impl Command {
    /// Every command, in tag-table order
    pub const ALL: [Command; 10] = [
        Command::Exit,
        Command::Step,
        Command::Done,
        Command::Finished,
        Command::Prediction,
        Command::Read,
        Command::Sample,
        Command::Visualisation,
        Command::Compute,
        Command::ChangeDb,
    ];

    /// Fixed 4-byte ASCII tag
    pub const fn tag(self) -> &'static [u8; TAG_LEN] {
        match self {
            Command::Exit => b"exit",
            Command::Step => b"step",
            Command::Done => b"done",
            Command::Finished => b"fini",
            Command::Prediction => b"pred",
            Command::Read => b"read",
            Command::Sample => b"samp",
            Command::Visualisation => b"visu",
            Command::Compute => b"comp",
            Command::ChangeDb => b"chdb",
        }
    }

    /// Resolve a tag back to its command
    pub fn from_tag(tag: &[u8]) -> Option<Command> {
        Self::ALL.into_iter().find(|command| command.tag().as_slice() == tag)
    }

    /// Human readable name
    pub const fn name(self) -> &'static str {
        match self {
            Command::Exit => "exit",
            Command::Step => "step",
            Command::Done => "done",
            Command::Finished => "finished",
            Command::Prediction => "prediction",
            Command::Read => "read",
            Command::Sample => "sample",
            Command::Visualisation => "visualisation",
            Command::Compute => "compute",
            Command::ChangeDb => "change_db",
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
