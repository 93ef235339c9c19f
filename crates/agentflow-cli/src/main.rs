use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;

use agentflow_agent::{Agent, AgentConfig, Pool, PoolConfig, Task};
use agentflow_core::config::Config;
use agentflow_core::skills::{SkillRegistry, SkillSource};
use agentflow_providers::ProviderRegistry;

#[derive(Parser)]
#[command(
    name = "agentflow",
    about = "Run LLM agents and bounded subagent batches against local or hosted models",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file path (default: ~/.agentflow/config.json)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Send one message to an agent
    Run {
        /// Model as provider/model (default: defaults.main)
        #[arg(short, long)]
        model: Option<String>,

        /// Prefix the message with a skill's instructions
        #[arg(short, long)]
        skill: Option<String>,

        /// Print the reply as it streams
        #[arg(long)]
        stream: bool,

        message: String,
    },

    /// Run each argument as a task on its own subagent
    Batch {
        /// Model as provider/model (default: defaults.subagent)
        #[arg(short, long)]
        model: Option<String>,

        /// Override pool.max_concurrent
        #[arg(long)]
        max_concurrent: Option<usize>,

        #[arg(required = true)]
        tasks: Vec<String>,
    },

    /// List configured providers and their models
    Models,

    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Show the effective configuration
    Show,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config_path = cli.config.clone().unwrap_or_else(Config::default_path);
    let config = Config::load(&config_path)?;
    init_logging(&config, cli.verbose);

    for warning in config.validate() {
        tracing::warn!("{warning}");
    }

    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Interrupted, cancelling");
            on_interrupt.cancel();
        }
    });

    match cli.command {
        Commands::Run {
            model,
            skill,
            stream,
            message,
        } => {
            let spec = model.unwrap_or_else(|| config.defaults.main.clone());
            run_once(&config, &cancel, &spec, skill.as_deref(), stream, &message).await?;
        }
        Commands::Batch {
            model,
            max_concurrent,
            tasks,
        } => {
            let spec = model.unwrap_or_else(|| config.defaults.subagent.clone());
            run_batch(&config, &cancel, &spec, max_concurrent, tasks).await?;
        }
        Commands::Models => {
            let registry = ProviderRegistry::from_config(&config);
            for name in registry.list() {
                let Some(provider) = registry.get(name) else {
                    continue;
                };
                println!("{name} ({})", provider.name());
                for model in provider.models() {
                    println!("  {name}/{model}");
                }
            }
        }
        Commands::Config { action } => match action {
            ConfigAction::Show => {
                let json = serde_json::to_string_pretty(&config)?;
                println!("{json}");
            }
        },
    }

    Ok(())
}

/// `RUST_LOG` wins; otherwise `--verbose`, then the configured level and filters.
fn init_logging(config: &Config, verbose: bool) {
    let logging = config.logging.as_ref();
    let level = if verbose {
        "debug"
    } else {
        logging.and_then(|l| l.level.as_deref()).unwrap_or("info")
    };

    let mut directives = level.to_string();
    for filter in logging.map(|l| l.filters.as_slice()).unwrap_or_default() {
        directives.push(',');
        directives.push_str(filter);
    }

    let builder = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(directives)),
        )
        .with_writer(std::io::stderr);

    if logging.is_some_and(|l| l.format == "json") {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn load_skills(config: &Config) -> Arc<dyn SkillSource> {
    Arc::new(SkillRegistry::load_from_paths(&config.skill_paths()))
}

async fn run_once(
    config: &Config,
    cancel: &CancellationToken,
    spec: &str,
    skill: Option<&str>,
    stream: bool,
    message: &str,
) -> anyhow::Result<()> {
    let registry = ProviderRegistry::from_config(config);
    let (provider, model) = registry.resolve_model(spec)?;

    let mut agent_config = AgentConfig::new(provider, model);
    agent_config.skills = Some(load_skills(config));
    agent_config.temperature = config.temperature();
    agent_config.max_output_tokens = config.max_tokens();
    let mut agent = Agent::new(agent_config);

    if stream {
        if skill.is_some() {
            anyhow::bail!("--skill cannot be combined with --stream");
        }
        let mut reply = agent.stream(cancel, message).await?;
        let mut stdout = std::io::stdout();
        while let Some(chunk) = reply.recv().await {
            if let Some(e) = chunk.error {
                println!();
                anyhow::bail!("stream failed: {e}");
            }
            write!(stdout, "{}", chunk.content)?;
            stdout.flush()?;
        }
        println!();
        if !reply.is_complete() {
            if cancel.is_cancelled() {
                anyhow::bail!("cancelled");
            }
            anyhow::bail!("stream closed before the reply finished");
        }
        return Ok(());
    }

    let response = match skill {
        Some(name) => agent.run_with_skill(cancel, name, message).await?,
        None => agent.run(cancel, message).await?,
    };
    tracing::debug!(
        model = %response.model,
        tokens = response.tokens_used,
        finish_reason = %response.finish_reason,
        "Run complete"
    );
    println!("{}", response.content);
    Ok(())
}

async fn run_batch(
    config: &Config,
    cancel: &CancellationToken,
    spec: &str,
    max_concurrent: Option<usize>,
    tasks: Vec<String>,
) -> anyhow::Result<()> {
    let registry = ProviderRegistry::from_config(config);
    let (provider, model) = registry.resolve_model(spec)?;

    let mut pool_config = PoolConfig::new(provider, model);
    pool_config.skills = Some(load_skills(config));
    pool_config.max_concurrent = max_concurrent.unwrap_or_else(|| config.max_concurrent());
    pool_config.system_prompt = config.pool.system_prompt.clone();
    pool_config.temperature = config.temperature();
    pool_config.max_output_tokens = config.max_tokens();
    let pool = Pool::new(pool_config);

    let tasks: Vec<Task> = tasks
        .into_iter()
        .enumerate()
        .map(|(i, text)| Task::new(format!("task-{}", i + 1), text.clone()).with_description(text))
        .collect();

    let results = pool.spawn_batch(cancel, &tasks).await;
    let mut failed = 0;
    for result in &results {
        let elapsed = result.duration.as_millis();
        match &result.outcome {
            Ok(response) => {
                println!("[{}] ok ({elapsed}ms)\n{}\n", result.task_id, response.content)
            }
            Err(e) => {
                failed += 1;
                println!("[{}] error: {e}\n", result.task_id);
            }
        }
    }

    let stats = pool.stats();
    tracing::info!(
        tasks = results.len(),
        failed,
        max = stats.max,
        "Batch complete"
    );
    if failed > 0 {
        anyhow::bail!("{failed} of {} tasks failed", results.len());
    }
    Ok(())
}
