// src/cli/handlers/run.rs

use anyhow::{Context, Result, bail};
use chrono::Local;
use clap::Parser;
use colored::*;
use std::path::PathBuf;

use crate::{
    CancellationToken,
    cli::handlers::commons,
    core::{
        command_builder::{self, CommandContext, ContainerRef},
        config_loader::{ExperimentConfig, ProjectConfig},
        expander,
        param_file,
        paths,
        storage::{self, RunJournal},
        templates::{self, SubmitTemplate},
    },
    models::{
        ExpansionInput, GroupInfo, GroupRecord, GroupStatus, ParameterSet, RunRecord, RunnerKind,
        RunnerSettings,
    },
    system::{
        backend::{self, BackendOptions, DispatchJob, DispatchOutcome},
        executor::{self, ExecutionError},
        signals,
    },
};

#[derive(Parser, Debug)]
#[command(
    no_binary_name = true,
    about = "Expands the arguments into groups and dispatches one job per group.",
    after_help = "Arguments after the options are fixed for every group. Use `--` before them if the first one starts with `--`."
)]
struct RunArgs {
    /// Experiment to run, as declared in `.qanat/qanat.toml`.
    experiment: String,

    /// One argument set per flag, e.g. `--group "10 --cov A"`.
    #[arg(short, long = "group", value_name = "TOKENS", allow_hyphen_values = true)]
    groups: Vec<String>,

    /// A varied option: `--range "--name start stop step"` or `--range "--name v1,v2"`.
    #[arg(short, long = "range", value_name = "DECLARATION", allow_hyphen_values = true)]
    ranges: Vec<String>,

    /// YAML or TOML file with `fixed_args` and `varying_args` sections.
    #[arg(long, value_name = "FILE")]
    param_file: Option<PathBuf>,

    /// Execution backend. Defaults to the project's `default_runner`.
    #[arg(long, value_enum)]
    runner: Option<RunnerKind>,

    /// Submission template: a configured name or a YAML/TOML file.
    #[arg(long, value_name = "NAME|FILE")]
    template: Option<String>,

    /// Number of local worker threads.
    #[arg(short = 'n', long)]
    threads: Option<usize>,

    /// Apptainer/Singularity image to run every command in.
    #[arg(long, value_name = "IMAGE")]
    container: Option<PathBuf>,

    /// Extra flag for the container runtime, e.g. `--container-flag --nv`.
    #[arg(long = "container-flag", value_name = "FLAG", allow_hyphen_values = true, requires = "container")]
    container_flags: Vec<String>,

    #[arg(short, long, default_value = "")]
    description: String,

    #[arg(short, long = "tag")]
    tags: Vec<String>,

    /// Print the commands without creating the run.
    #[arg(long)]
    dry_run: bool,

    /// Fixed arguments shared by every group.
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    args: Vec<String>,
}

/// Everything needed to launch a run, independent of how it was requested.
#[derive(Debug, Clone, Default)]
pub struct RunContext {
    pub experiment: String,
    pub input: ExpansionInput,
    pub runner: Option<RunnerKind>,
    pub template: Option<String>,
    pub threads: Option<usize>,
    pub container: Option<PathBuf>,
    pub container_flags: Vec<String>,
    pub description: String,
    pub tags: Vec<String>,
    pub show_progress: bool,
}

/// What a launched run ended up with.
#[derive(Debug, Clone)]
pub struct LaunchSummary {
    pub run_id: u64,
    pub run_dir: PathBuf,
    pub runner: RunnerKind,
    pub outcomes: Vec<DispatchOutcome>,
}

/// A run resolved against the project, before anything is written.
struct RunPlan<'a> {
    experiment: &'a ExperimentConfig,
    runner: RunnerKind,
    settings: RunnerSettings,
    template: SubmitTemplate,
    container: Option<ContainerRef>,
    sets: Vec<ParameterSet>,
    experiment_dir: PathBuf,
}

impl RunPlan<'_> {
    fn command_context(&self, config: &ProjectConfig, run_dir: PathBuf) -> Result<CommandContext> {
        let ctx = CommandContext::new(
            &self.experiment.executable_command,
            self.experiment.executable_path(&config.root),
            self.experiment.dataset_paths(&config.root),
            config.root.clone(),
            run_dir,
        )?;
        Ok(ctx.with_container(self.container.clone()))
    }
}

/// Main entry point for the `run` command.
pub fn handle(args: Vec<String>, cancellation_token: &CancellationToken) -> Result<()> {
    let run_args = RunArgs::try_parse_from(&args)?;
    let config = commons::load_project()?;

    let input = build_expansion_input(&run_args, &config)?;
    let context = RunContext {
        experiment: run_args.experiment,
        input,
        runner: run_args.runner,
        template: run_args.template,
        threads: run_args.threads,
        container: run_args.container,
        container_flags: run_args.container_flags,
        description: run_args.description,
        tags: run_args.tags,
        show_progress: true,
    };

    if run_args.dry_run {
        return print_dry_run(&context, &config);
    }

    let runner = context.runner.unwrap_or(config.default_runner);
    if runner == RunnerKind::Local {
        signals::install_cancellation_handlers(cancellation_token.clone())
            .context("Could not install the signal handlers")?;
    }

    let summary = launch_run(context, &config, cancellation_token)?;
    print_summary(&summary);

    let all_failed = summary
        .outcomes
        .iter()
        .all(|o| matches!(o, DispatchOutcome::Failed(_)));
    if all_failed {
        bail!("No group of run {} could be dispatched.", summary.run_id);
    }
    Ok(())
}

/// Merges the parameter file (if any) with the groups, ranges and fixed
/// arguments given on the command line. Command-line values win.
fn build_expansion_input(run_args: &RunArgs, config: &ProjectConfig) -> Result<ExpansionInput> {
    let mut input = match &run_args.param_file {
        Some(path) => {
            // Relative to the current directory first, then to the project root.
            let path = if path.is_file() {
                path.clone()
            } else {
                config.root.join(path)
            };
            param_file::load_parameter_file(&path)
                .with_context(|| format!("Invalid parameter file '{}'", path.display()))?
        }
        None => ExpansionInput::default(),
    };

    let cli_fixed = expander::parse_cli_tokens(&run_args.args, input.fixed.next_positional_slot())
        .context("Invalid fixed arguments")?;
    input.fixed = input.fixed.overlay(&cli_fixed);

    // Groups from the file were slotted right after the file's fixed
    // positionals; make room for the ones given on the command line.
    let added = cli_fixed.positional_count();
    if added > 0 {
        input.groups = input
            .groups
            .into_iter()
            .map(|group| group.shift_positionals(added))
            .collect();
    }

    let first_group_slot = input.fixed.next_positional_slot();
    for declaration in &run_args.groups {
        let group = expander::parse_group_declaration(declaration, first_group_slot)
            .with_context(|| format!("Invalid group '{}'", declaration))?;
        input.groups.push(group);
    }
    for declaration in &run_args.ranges {
        let range = expander::parse_range_declaration(declaration)
            .with_context(|| format!("Invalid range '{}'", declaration))?;
        input.ranges.push(range);
    }
    Ok(input)
}

/// Resolves everything that can fail before a run directory is created:
/// runner parameters, expansion, experiment, template and container.
fn plan_run<'a>(context: &RunContext, config: &'a ProjectConfig) -> Result<RunPlan<'a>> {
    let (fixed, from_args) = expander::extract_runner_settings(context.input.fixed.clone())?;
    let settings = RunnerSettings {
        threads: context.threads.or(from_args.threads),
        template: context.template.clone().or(from_args.template),
    };
    let input = ExpansionInput {
        fixed,
        ..context.input.clone()
    };
    let sets = expander::expand(&input).context("Could not expand the run arguments")?;

    let experiment = config.experiment(&context.experiment)?;
    let runner = context.runner.unwrap_or(config.default_runner);
    let template = templates::resolve_template(runner, settings.template.as_deref(), config)
        .context("Could not resolve the submission template")?;

    let container = context
        .container
        .as_ref()
        .map(|image| {
            ContainerRef::resolve(&config.root.join(image))
                .map(|c| c.with_extra_flags(context.container_flags.clone()))
        })
        .transpose()?;

    let experiment_dir = commons::experiment_dir(config, &context.experiment)?;
    log::debug!(
        "Planned {} group(s) of '{}' on the {} runner.",
        sets.len(),
        experiment.name,
        runner
    );

    Ok(RunPlan {
        experiment,
        runner,
        settings,
        template,
        container,
        sets,
        experiment_dir,
    })
}

/// Creates a run and dispatches its groups.
///
/// The run record is written before dispatch and updated as groups start
/// and finish. A cancelled local run marks its pending groups cancelled and
/// returns `ExecutionError::Cancelled`.
pub fn launch_run(
    context: RunContext,
    config: &ProjectConfig,
    cancellation_token: &CancellationToken,
) -> Result<LaunchSummary> {
    let plan = plan_run(&context, config)?;

    // --- Storage ---
    let run_id = storage::allocate_run_id(&plan.experiment_dir)?;
    let run_dir = paths::run_dir(&plan.experiment_dir, run_id);
    let group_dirs = storage::create_run_layout(&run_dir, plan.sets.len())?;
    let command_context = plan.command_context(config, run_dir.clone())?;

    let mut jobs = Vec::with_capacity(plan.sets.len());
    let mut groups = Vec::with_capacity(plan.sets.len());
    for (index, (set, group_dir)) in plan.sets.iter().zip(group_dirs).enumerate() {
        let command = command_builder::build_command(set, &group_dir, &command_context);
        let info = GroupInfo::new(command.command_line(), set);
        storage::write_group_info(&group_dir, &info)?;

        groups.push(GroupRecord {
            index,
            storage_path: group_dir.clone(),
            command: info.command,
            status: GroupStatus::NotStarted,
            handle: None,
            started: None,
            finished: None,
            error: None,
        });
        jobs.push(DispatchJob::new(index, command, config.root.clone(), group_dir));
    }

    let record = RunRecord {
        run_id,
        experiment: plan.experiment.name.clone(),
        description: context.description,
        tags: context.tags,
        launched: Local::now(),
        ended: None,
        runner: plan.runner,
        runner_settings: plan.settings.clone(),
        container: plan.container.as_ref().map(|c| c.image.clone()),
        commit: executor::current_commit(&config.root),
        storage_path: run_dir.clone(),
        working_directory: config.root.clone(),
        main_pid: (plan.runner == RunnerKind::Local).then(std::process::id),
        groups,
    };
    let mut journal = RunJournal::create(record)?;
    log::info!("Created run {} in '{}'.", run_id, run_dir.display());

    // --- Dispatch ---
    let backend = backend::create_backend(
        plan.runner,
        BackendOptions {
            threads: plan.settings.threads.unwrap_or(1),
            template: plan.template,
            batch_name: commons::batch_name(&plan.experiment.name, run_id),
            show_progress: context.show_progress,
            cancellation_token: cancellation_token.clone(),
        },
    );

    match backend.dispatch(&jobs, &mut journal) {
        Ok(outcomes) => {
            journal.close_if_done()?;
            Ok(LaunchSummary {
                run_id,
                run_dir,
                runner: plan.runner,
                outcomes,
            })
        }
        Err(ExecutionError::Cancelled) => {
            log::info!("Run {} was cancelled.", run_id);
            journal.cancel_pending()?;
            journal.close_if_done()?;
            Err(ExecutionError::Cancelled.into())
        }
        Err(e) => Err(e).with_context(|| format!("Dispatch of run {} failed", run_id)),
    }
}

fn print_dry_run(context: &RunContext, config: &ProjectConfig) -> Result<()> {
    let plan = plan_run(context, config)?;
    let run_id = storage::peek_run_id(&plan.experiment_dir)?;
    let run_dir = paths::run_dir(&plan.experiment_dir, run_id);
    let command_context = plan.command_context(config, run_dir.clone())?;

    println!(
        "{} run {} of '{}' on the {} runner ({} group(s)):",
        "Dry run:".yellow().bold(),
        run_id,
        plan.experiment.name.cyan(),
        plan.runner,
        plan.sets.len()
    );
    let group_dirs = storage::group_dirs(&run_dir, plan.sets.len());
    for (index, (set, group_dir)) in plan.sets.iter().zip(group_dirs).enumerate() {
        let command = command_builder::build_command(set, &group_dir, &command_context);
        let parameters: Vec<String> = set
            .to_named_strings()
            .into_iter()
            .map(|(name, value)| format!("{}={}", name, value))
            .collect();
        println!("  [{}] {}", index, parameters.join("  ").bold());
        println!("      {}", command.command_line().dimmed());
    }
    if let Some(name) = &plan.template.name {
        println!("  template: {}", name);
    }
    Ok(())
}

fn print_summary(summary: &LaunchSummary) {
    let count = |status: GroupStatus| {
        summary
            .outcomes
            .iter()
            .filter(|o| o.status() == status)
            .count()
    };

    println!(
        "{} run {} ({} group(s), {} runner) in {}",
        "Created".green().bold(),
        summary.run_id.to_string().cyan(),
        summary.outcomes.len(),
        summary.runner,
        summary.run_dir.display()
    );
    match summary.runner {
        RunnerKind::Local => {
            println!("  finished: {}", count(GroupStatus::Finished).to_string().green());
            let failed = count(GroupStatus::Failed);
            if failed > 0 {
                println!("  failed:   {}", failed.to_string().red());
            }
        }
        _ => {
            println!("  submitted: {}", count(GroupStatus::Running).to_string().green());
            let failed = count(GroupStatus::Failed);
            if failed > 0 {
                println!("  {} {}", "submission failed:".red(), failed);
            }
        }
    }
}
