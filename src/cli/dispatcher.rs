// src/cli/dispatcher.rs

use anyhow::{Result, bail};
use clap::CommandFactory;

use crate::{
    CancellationToken,
    cli::{Cli, handlers},
};

// --- Command Definition and Registry ---

/// A command, its aliases and its handler.
struct CommandDefinition {
    name: &'static str,
    aliases: &'static [&'static str],
    handler: fn(Vec<String>, &CancellationToken) -> Result<()>,
}

/// The single source of truth for all commands.
static COMMAND_REGISTRY: &[CommandDefinition] = &[
    CommandDefinition {
        name: "run",
        aliases: &[],
        handler: handlers::run::handle,
    },
    CommandDefinition {
        name: "status",
        aliases: &["st"],
        handler: handlers::status::handle,
    },
    CommandDefinition {
        name: "cancel",
        aliases: &["stop"],
        handler: handlers::cancel::handle,
    },
];

/// Finds a command definition in the registry by its name or alias.
fn find_command(name: &str) -> Option<&'static CommandDefinition> {
    COMMAND_REGISTRY
        .iter()
        .find(|cmd| cmd.name == name || cmd.aliases.contains(&name))
}

/// Routes `qanat <command> [args...]` to the command's handler.
pub fn dispatch(all_args: Vec<String>, cancellation_token: &CancellationToken) -> Result<()> {
    log::debug!("Dispatching args: {:?}", all_args);

    let Some((name, rest)) = all_args.split_first() else {
        Cli::command().print_help()?;
        return Ok(());
    };

    match find_command(name) {
        Some(command) => (command.handler)(rest.to_vec(), cancellation_token),
        None => bail!(
            "Unknown command '{}'. Available commands: {}.",
            name,
            COMMAND_REGISTRY
                .iter()
                .map(|cmd| cmd.name)
                .collect::<Vec<_>>()
                .join(", ")
        ),
    }
}
