use anyhow::{Context, Result};
use clap::Parser;
use simbatch_config::{ConcurrencyModel, ConfigLoader, CoordinatorConfig, LogLevel, ProtocolConfig, SimbatchConfig};
use simbatch_execution::{
    frame_limits, Batch, BlockingCoordinator, CoordinatorServices, JsonDirStore, MemoryStore,
    SampleStore, TaskCoordinator, WorkerClient,
};
use std::fs;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

mod cli;
mod demo;

use cli::{Cli, Commands, ConfigCommands, CoordinatorArgs, WorkerArgs};
use demo::{DampingPredictor, LoggingSink, RandomWalkEnv};

/// Load configuration from file or use defaults
fn load_config(config_path: Option<&PathBuf>) -> Result<SimbatchConfig> {
    let loader = ConfigLoader::new();

    match config_path {
        Some(path) => {
            if path.exists() {
                info!("Loading configuration from: {:?}", path);
                loader
                    .from_file(path)
                    .context(format!("Failed to load configuration from {:?}", path))
            } else {
                warn!("Configuration file not found: {:?}. Using defaults.", path);
                loader
                    .from_env()
                    .context("Failed to load configuration from environment")
            }
        }
        None => {
            debug!("No configuration file specified. Loading from environment or defaults.");
            loader
                .from_env()
                .context("Failed to load configuration from environment")
        }
    }
}

fn coordinator_services(config: &CoordinatorConfig) -> CoordinatorServices {
    let services = CoordinatorServices::new().with_visualization(Arc::new(LoggingSink));
    if config.allow_prediction_requests {
        services.with_prediction(Arc::new(DampingPredictor::default()))
    } else {
        services
    }
}

fn print_batch(index: usize, batch: &Batch) -> Result<()> {
    let line = serde_json::to_string(batch).context("Failed to serialize batch")?;
    println!("batch {}: {}", index, line);
    Ok(())
}

/// Run the coordinator until `batches` batches are produced or Ctrl-C
async fn coordinator_command(config: SimbatchConfig, args: &CoordinatorArgs) -> Result<()> {
    let mut coordinator_config = config.coordinator;
    if let Some(port) = args.port {
        coordinator_config.port = port;
    }
    if let Some(nb_client) = args.nb_client {
        coordinator_config.nb_client = nb_client;
    }
    if let Some(batch_size) = args.batch_size {
        coordinator_config.batch_size = batch_size;
    }
    if let Some(model) = &args.concurrency {
        coordinator_config.concurrency =
            ConcurrencyModel::from_str(model).map_err(|e| anyhow::anyhow!(e))?;
    }
    if args.allow_predictions {
        coordinator_config.allow_prediction_requests = true;
    }

    let protocol = config.protocol;
    let services = coordinator_services(&coordinator_config);
    match coordinator_config.concurrency {
        ConcurrencyModel::Tasks => {
            run_task_coordinator(coordinator_config, protocol, services, args.batches, args.replay).await
        }
        ConcurrencyModel::Threads => {
            let batches = args.batches;
            let replay = args.replay;
            let interrupted = Arc::new(AtomicBool::new(false));
            let watcher = {
                let interrupted = interrupted.clone();
                tokio::spawn(async move {
                    if tokio::signal::ctrl_c().await.is_ok() {
                        info!("Interrupted, finishing the current batch");
                        interrupted.store(true, Ordering::SeqCst);
                    }
                })
            };
            let result = tokio::task::spawn_blocking(move || {
                run_thread_coordinator(coordinator_config, protocol, services, batches, replay, &interrupted)
            })
            .await
            .context("Coordinator thread failed")?;
            watcher.abort();
            result
        }
    }
}

async fn run_task_coordinator(
    config: CoordinatorConfig,
    protocol: ProtocolConfig,
    services: CoordinatorServices,
    batches: usize,
    replay: bool,
) -> Result<()> {
    let mut coordinator = TaskCoordinator::bind(config, &protocol, services).await?;
    info!("Coordinator listening on {}", coordinator.local_addr()?);
    coordinator.start().await?;

    let produced = async {
        for index in 0..batches {
            let batch = coordinator.get_batch(true).await?;
            print_batch(index, &batch)?;
            if replay {
                coordinator.set_dataset_batch(batch.lines.iter().copied());
                let replayed = coordinator.get_batch(true).await?;
                print_batch(index, &replayed)?;
            }
        }
        Ok::<(), anyhow::Error>(())
    };

    let outcome = tokio::select! {
        result = produced => result,
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupted, shutting down workers");
            Ok(())
        }
    };

    let closed = coordinator.close().await;
    outcome?;
    closed?;
    Ok(())
}

/// Call `produce` for each batch index until `batches` are done or the
/// interrupt flag is raised. Returns how many batches were produced.
fn produce_until_interrupted(
    batches: usize,
    interrupted: &AtomicBool,
    mut produce: impl FnMut(usize) -> Result<()>,
) -> Result<usize> {
    for index in 0..batches {
        if interrupted.load(Ordering::SeqCst) {
            info!("Interrupted after {} batches, shutting down workers", index);
            return Ok(index);
        }
        produce(index)?;
    }
    Ok(batches)
}

fn run_thread_coordinator(
    config: CoordinatorConfig,
    protocol: ProtocolConfig,
    services: CoordinatorServices,
    batches: usize,
    replay: bool,
    interrupted: &AtomicBool,
) -> Result<()> {
    let mut coordinator = BlockingCoordinator::bind(config, &protocol, services)?;
    info!("Coordinator listening on {} (threads)", coordinator.local_addr()?);
    coordinator.start()?;

    let outcome = produce_until_interrupted(batches, interrupted, |index| {
        let result = coordinator.get_batch(true).and_then(|batch| {
            if replay {
                coordinator.set_dataset_batch(batch.lines.iter().copied());
                coordinator.get_batch(true).map(|replayed| vec![batch, replayed])
            } else {
                Ok(vec![batch])
            }
        });
        match result {
            Ok(produced) => produced.iter().try_for_each(|batch| print_batch(index, batch)),
            Err(e) => {
                error!("Batch {} failed: {}", index, e);
                Err(e.into())
            }
        }
    });

    let closed = coordinator.close();
    outcome?;
    closed?;
    Ok(())
}

/// Run one worker until the coordinator releases it or Ctrl-C
async fn worker_command(config: SimbatchConfig, args: &WorkerArgs) -> Result<()> {
    let mut worker_config = config.worker;
    if let Some(address) = &args.address {
        worker_config.coordinator_address = address.clone();
    }
    if let Some(port) = args.port {
        worker_config.port = port;
    }
    if args.instance_id.is_some() {
        worker_config.instance_id = args.instance_id;
    }

    let limits = frame_limits(&config.protocol);
    let seed = args.seed.unwrap_or_else(rand::random);
    let env = RandomWalkEnv::new(seed);
    let store: Box<dyn SampleStore> = if args.memory_store {
        Box::new(MemoryStore::new())
    } else {
        let root = args
            .store_dir
            .clone()
            .unwrap_or_else(|| std::env::temp_dir().join("simbatch"));
        Box::new(JsonDirStore::new(root))
    };

    if args.blocking {
        let mut client = tokio::task::spawn_blocking(move || {
            WorkerClient::connect_blocking(&worker_config, limits, env, store)
        })
        .await
        .context("Worker thread failed")??;
        let stop = client.stop_handle()?;
        let mut running = tokio::task::spawn_blocking(move || {
            let result = client.run_blocking();
            (client, result)
        });
        let (client, result) = tokio::select! {
            joined = &mut running => joined.context("Worker thread failed")?,
            signal = tokio::signal::ctrl_c() => {
                match signal {
                    Ok(()) => {
                        info!("Interrupted, closing worker");
                        stop.stop();
                    }
                    Err(e) => error!("Failed to listen for Ctrl-C: {}", e),
                }
                running.await.context("Worker thread failed")?
            }
        };
        result?;
        info!("Worker finished at position {:.3}", client.environment().position());
        Ok(())
    } else {
        let mut client = WorkerClient::connect(&worker_config, limits, env, store).await?;
        client.initialize().await?;
        client
            .launch_until(async {
                if let Err(e) = tokio::signal::ctrl_c().await {
                    error!("Failed to listen for Ctrl-C: {}", e);
                    std::future::pending::<()>().await;
                }
            })
            .await?;
        info!("Worker finished at position {:.3}", client.environment().position());
        Ok(())
    }
}

/// Handle configuration validation
fn handle_config_validate(config_file: &PathBuf) -> Result<()> {
    info!("Validating configuration file: {:?}", config_file);

    if !config_file.exists() {
        return Err(anyhow::anyhow!("Configuration file not found: {:?}", config_file));
    }

    match ConfigLoader::new().from_file(config_file) {
        Ok(_config) => {
            println!("Configuration file is valid");
            info!("Configuration validation passed");
            Ok(())
        }
        Err(e) => {
            println!("Configuration validation failed: {}", e);
            error!("Configuration validation failed: {}", e);
            Err(e.into())
        }
    }
}

/// Handle configuration generation
fn handle_config_generate(output: &PathBuf, force: bool) -> Result<()> {
    info!("Generating configuration at: {:?}", output);

    if output.exists() && !force {
        return Err(anyhow::anyhow!(
            "Output file already exists: {:?}. Use --force to overwrite.",
            output
        ));
    }

    if let Some(parent) = output.parent() {
        fs::create_dir_all(parent).context("Failed to create output directory")?;
    }

    let content = SimbatchConfig::generate_sample().context("Failed to render sample configuration")?;
    fs::write(output, content).context("Failed to write configuration file")?;

    println!("Configuration generated at: {:?}", output);
    println!("Validate with: simbatch config validate --config-file {:?}", output);
    Ok(())
}

/// Handle configuration display
fn handle_config_show(config_file: Option<&PathBuf>, format: &str) -> Result<()> {
    let config = load_config(config_file)?;
    let value = serde_json::to_value(&config).context("Failed to serialize config")?;

    match format.to_lowercase().as_str() {
        "yaml" | "yml" => {
            let yaml = serde_yaml::to_string(&value).context("Failed to serialize to YAML")?;
            println!("{}", yaml);
        }
        "json" => {
            let json = serde_json::to_string_pretty(&value).context("Failed to serialize to JSON")?;
            println!("{}", json);
        }
        _ => {
            return Err(anyhow::anyhow!(
                "Unknown output format: {}. Valid formats: yaml, json",
                format
            ));
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Config subcommands print to stdout; keep their logging minimal
    if let Some(Commands::Config { config_cmd }) = &cli.command {
        simbatch_logging::init_simple_tracing(cli.log_level.as_deref().unwrap_or("warn"))?;
        return match config_cmd {
            ConfigCommands::Validate { config_file } => handle_config_validate(config_file),
            ConfigCommands::Generate { output, force } => handle_config_generate(output, *force),
            ConfigCommands::Show { config_file, format } => handle_config_show(config_file.as_ref(), format),
        };
    }

    let mut config = load_config(cli.config.as_ref())?;
    if let Some(level) = &cli.log_level {
        config.logging.level =
            LogLevel::from_str(level).map_err(|_| anyhow::anyhow!("Invalid log level: {}", level))?;
    }

    match &cli.command {
        Some(Commands::Coordinator(args)) => {
            simbatch_logging::init_logging_from_config(&config.logging)?;
            coordinator_command(config, args).await
        }
        Some(Commands::Worker(args)) => {
            // Batches go to stdout on the coordinator; workers log to stderr
            simbatch_logging::init_worker_tracing(Some(config.logging.level.as_str()))?;
            worker_command(config, args).await
        }
        Some(Commands::Config { .. }) => Ok(()),
        None => {
            // If no subcommand is provided, print help
            use clap::CommandFactory;
            let mut cmd = Cli::command();
            cmd.print_help().context("Failed to print help")?;
            println!();
            Ok(())
        }
    }
}
