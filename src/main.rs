//! Paracore CLI - Slurm job submission with retries and autotuning
//!
//! Submits shell commands to Slurm (or local subprocesses) from layered
//! YAML profiles.

use clap::Parser;
use paracore::autotune::{MeasurementMode, PilotRequest, ResourceGuesses, DEFAULT_PILOT_RETRIES};
use paracore::config::{
    read_command_lines, Backend, CallOverrides, CliArgs, Commands, ConfigLayers, ConfigResolver,
    ResourceArgs, RetryArgs, WaitArgs,
};
use paracore::core::{Paracore, SubmitOptions};
use paracore::error::{IoResultExt, ParacoreError, Result};
use paracore::progress::BatchProgress;
use paracore::provider::{LocalProvider, Payload, SlurmProvider, SubmissionProvider};
use paracore::status::job_status;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

/// Exit code after Ctrl+C
const INTERRUPTED_EXIT: i32 = 130;

fn main() {
    let args = CliArgs::parse();
    init_logging(&args);

    if let Err(e) = run(args) {
        eprintln!("Error: {}", e);
        std::process::exit(e.exit_code());
    }
}

fn init_logging(args: &CliArgs) {
    let level = match args.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);
    if args.log_json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn run(args: CliArgs) -> Result<()> {
    let layers = ConfigLayers::discover(args.config.as_deref())?;
    let resolver = ConfigResolver::new(&layers);

    let provider: Arc<dyn SubmissionProvider> = match args.backend {
        Backend::Slurm => Arc::new(SlurmProvider::new()),
        Backend::Local => Arc::new(LocalProvider::new()),
    };
    let paracore = Paracore::new(resolver, provider);

    let rt = tokio::runtime::Runtime::new()
        .map_err(|e| ParacoreError::Internal(format!("Failed to create runtime: {}", e)))?;

    rt.block_on(async {
        match args.command.clone() {
            Commands::Run {
                command,
                resources,
                retry,
                wait,
            } => cmd_run(&paracore, &args, command, &resources, &retry, &wait).await,
            Commands::Batch {
                file,
                resources,
                array_parallelism,
                concurrency,
                retry,
                wait,
                no_progress,
            } => {
                let mut options = submit_options(&args, &resources, &retry, &wait);
                options.overrides.array_parallelism = array_parallelism;
                options.overrides.concurrency = concurrency;
                cmd_batch(&paracore, &file, &options, wait.wait, !no_progress).await
            }
            Commands::Autotune {
                file,
                sample_size,
                partition,
                cpus_guess,
                memory_guess,
                time_guess,
                env_setup,
                measure_memory,
                output,
                export_shell,
                seed,
                pilot_retries,
            } => {
                let options = SubmitOptions {
                    cluster: args.cluster.clone(),
                    overrides: CallOverrides {
                        partition,
                        env_setup,
                        log_dir: args.log_dir.clone(),
                        ..Default::default()
                    },
                    ..Default::default()
                };
                let request = PilotRequest {
                    sample_size,
                    mode: if measure_memory {
                        MeasurementMode::TimeAndRss
                    } else {
                        MeasurementMode::TimeOnly
                    },
                    guesses: ResourceGuesses {
                        cpus_per_task: cpus_guess,
                        mem_gb: memory_guess,
                        time_min: time_guess,
                    },
                    seed,
                    pilot_retries: pilot_retries.unwrap_or(DEFAULT_PILOT_RETRIES),
                };
                cmd_autotune(&paracore, &file, &request, &options, output.as_deref(), export_shell).await
            }
            Commands::Status { job_ids } => cmd_status(&paracore, &args, &job_ids).await,
        }
    })
}

fn submit_options(args: &CliArgs, resources: &ResourceArgs, retry: &RetryArgs, wait: &WaitArgs) -> SubmitOptions {
    let mut overrides = resources.to_overrides();
    retry.apply(&mut overrides);
    overrides.log_dir = args.log_dir.clone();

    SubmitOptions {
        overrides,
        cluster: args.cluster.clone(),
        job_name: resources.name.clone(),
        env: resources.env_overlay(),
        env_merge: resources.env_merge,
        wait_timeout: wait.wait_timeout,
        ..Default::default()
    }
}

fn read_commands(file: &str) -> Result<Vec<String>> {
    let commands = read_command_lines(file).with_path(file)?;
    if commands.is_empty() {
        return Err(ParacoreError::config(format!("No commands in {}", file)));
    }
    Ok(commands)
}

async fn cmd_run(
    paracore: &Paracore,
    args: &CliArgs,
    command: String,
    resources: &ResourceArgs,
    retry: &RetryArgs,
    wait: &WaitArgs,
) -> Result<()> {
    let options = submit_options(args, resources, retry, wait);
    let mut task = paracore.run_cmd(command, &options).await?;
    let handle = task.first_handle().await?;

    println!("Submitted job {}", handle.job_id());
    if args.verbose > 0 {
        println!("Job name: {}", handle.job_name());
        println!("Stdout: {}", handle.stdout_path().display());
        println!("Stderr: {}", handle.stderr_path().display());
    }

    if !wait.wait {
        return Ok(());
    }

    println!("Waiting for job to complete...");
    let cancel = task.cancel_token();
    let mut result = Box::pin(task.wait());
    let output = tokio::select! {
        output = &mut result => output,
        _ = tokio::signal::ctrl_c() => {
            cancel.cancel();
            if let Err(e) = result.await {
                tracing::info!("{}", e);
            }
            eprintln!("\nInterrupted");
            std::process::exit(INTERRUPTED_EXIT);
        }
    }?;

    println!("Job completed successfully");
    if args.verbose > 0 {
        match output.value {
            serde_json::Value::String(ref s) => print!("Result: {}", s),
            ref other => println!("Result: {}", other),
        }
    }
    Ok(())
}

async fn cmd_batch(
    paracore: &Paracore,
    file: &str,
    options: &SubmitOptions,
    wait: bool,
    show_progress: bool,
) -> Result<()> {
    let commands = read_commands(file)?;
    println!("Submitting {} jobs...", commands.len());

    let batch = paracore.map_cmds(&commands, options).await?;
    println!("Submitted {} jobs", batch.len());
    if let (Some(first), Some(last)) = (batch.handles().first(), batch.handles().last()) {
        println!("Job IDs: {} - {}", first.job_id(), last.job_id());
    }

    if !wait {
        return Ok(());
    }

    println!("Waiting for all jobs to complete...");
    let total = batch.len() as u64;
    let progress = if show_progress && console::Term::stderr().is_term() {
        BatchProgress::new(total)
    } else {
        BatchProgress::disabled(total)
    };

    let mut gathering = Box::pin(batch.gather(options.overrides.concurrency, Some(&progress)));
    let results = tokio::select! {
        results = &mut gathering => results,
        _ = tokio::signal::ctrl_c() => {
            batch.cancel();
            gathering.await;
            progress.finish();
            eprintln!("\nInterrupted");
            std::process::exit(INTERRUPTED_EXIT);
        }
    };
    progress.finish();

    let failed: Vec<_> = results
        .into_iter()
        .enumerate()
        .filter_map(|(index, result)| result.err().map(|e| (index, e)))
        .collect();
    println!("Completed {} jobs successfully", batch.len() - failed.len());

    if !failed.is_empty() {
        eprintln!("Failed {} jobs", failed.len());
        for (index, error) in &failed {
            eprintln!("  Job {} ({}): {}", index, batch.handles()[*index].job_id(), error);
        }
    }
    match failed.into_iter().next() {
        Some((_, first)) => Err(first),
        None => Ok(()),
    }
}

async fn cmd_autotune(
    paracore: &Paracore,
    file: &str,
    request: &PilotRequest,
    options: &SubmitOptions,
    output: Option<&std::path::Path>,
    export_shell: bool,
) -> Result<()> {
    let commands = read_commands(file)?;
    println!(
        "Running pilot with {} jobs from {} total...",
        request.sample_size.min(commands.len()),
        commands.len()
    );

    let items: Vec<Payload> = commands.iter().map(Payload::command).collect();
    let report = paracore.autotune(&items, request, options).await?;
    let rec = report.recommendation;

    println!("\nResource recommendations:");
    println!("  Time:        {} minutes", rec.time_min);
    println!("  Memory:      {} GB", rec.mem_gb);
    println!("  CPUs:        {}", rec.cpus_per_task);
    println!("  Parallelism: {}", rec.array_parallelism);
    if let Some(note) = report.note() {
        println!("  Note:        {}", note);
    }

    if let Some(path) = output {
        rec.write_json(path)?;
        println!("\nRecommendations saved to {}", path.display());
    }

    if export_shell {
        println!("\nExport as shell variables:");
        print!("{}", rec.shell_exports());
    }
    Ok(())
}

async fn cmd_status(paracore: &Paracore, args: &CliArgs, job_ids: &[String]) -> Result<()> {
    if job_ids.is_empty() {
        return Err(ParacoreError::config("No job IDs given"));
    }
    let overrides = CallOverrides {
        log_dir: args.log_dir.clone(),
        ..Default::default()
    };
    let config = paracore
        .resolver()
        .resolve(args.cluster.as_deref(), &overrides)?;

    for job_id in job_ids {
        let report = job_status(job_id, &config.log_dir).await;
        print!("{}", report);
    }
    Ok(())
}
