// src/cli/mod.rs

use clap::Parser;

pub mod dispatcher;
pub mod handlers;

const HELP_TEMPLATE: &str = "\
<title>qanat</title> {version}
Run experiments over expanded parameter grids, locally or on a cluster.

<title>USAGE:</title>
    <cmd>qanat</cmd> <hl><COMMAND></hl> [ARGS...]

<group>COMMANDS:</group>
    <cmd>run</cmd> <hl><experiment></hl> [OPTIONS] [ARGS...]
        Expand the arguments into groups and dispatch them.
        <dim>--group \"<tokens>\"   one argument set per flag</dim>
        <dim>--range \"--name start stop step\" | \"--name v1,v2\"</dim>
        <dim>--param-file <file>  YAML or TOML parameter file</dim>
        <dim>--runner local|htcondor|slurm, --threads N, --template <name|file></dim>
    <cmd>status</cmd> <hl><experiment></hl> [run_id] [--json]
        Show the runs of an experiment, or the groups of one run.
    <cmd>cancel</cmd> <hl><experiment></hl> <hl><run_id></hl>
        <err>Stop every pending group of a run.</err>

Use <cmd>qanat <COMMAND> --help</cmd> for the options of a command.
Set <hi>RUST_LOG=debug</hi> for detailed logs.
";

/// Renders the help template, replacing the style tags with ANSI codes when
/// the terminal supports colors.
fn build_help_string() -> &'static str {
    let use_colors = colored::control::SHOULD_COLORIZE.should_colorize();

    let title = if use_colors { "\x1b[1;33m" } else { "" }; // Bold Yellow
    let hl = if use_colors { "\x1b[1;36m" } else { "" }; // Bold Cyan
    let hi = if use_colors { "\x1b[1m" } else { "" }; // Bold
    let cmd = if use_colors { "\x1b[36m" } else { "" }; // Cyan
    let group = if use_colors { "\x1b[1;32m" } else { "" }; // Bold Green
    let err = if use_colors { "\x1b[91m" } else { "" }; // Bright Red
    let dim = if use_colors { "\x1b[2m" } else { "" };
    let reset = if use_colors { "\x1b[0m" } else { "" };

    let formatted_string = HELP_TEMPLATE
        .replace("<title>", title)
        .replace("</title>", reset)
        .replace("<hl>", hl)
        .replace("</hl>", reset)
        .replace("<hi>", hi)
        .replace("</hi>", reset)
        .replace("<cmd>", cmd)
        .replace("</cmd>", reset)
        .replace("<group>", group)
        .replace("</group>", reset)
        .replace("<err>", err)
        .replace("</err>", reset)
        .replace("<dim>", dim)
        .replace("</dim>", reset);

    Box::leak(formatted_string.into_boxed_str())
}

/// qanat: experiment tracking and parameter-sweep dispatch.
#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about,
    help_template = { build_help_string() },
    styles = clap::builder::Styles::styled()
        .header(clap::builder::styling::AnsiColor::Yellow.on_default().bold())
        .usage(clap::builder::styling::AnsiColor::Yellow.on_default().bold())
        .literal(clap::builder::styling::AnsiColor::Cyan.on_default().bold())
        .placeholder(clap::builder::styling::AnsiColor::Green.on_default()),
)]
#[command(disable_help_subcommand = true)]
#[command(trailing_var_arg = true)]
pub struct Cli {
    /// The command and its arguments. Each command parses its own arguments.
    #[arg(allow_hyphen_values = true)]
    pub args: Vec<String>,
}
