use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

use conductor::api::{serve, AppState};
use conductor::engine::coordinator::{CoordinationOptions, CoordinationRequest};
use conductor::engine::workflow::WorkflowOptions;
use conductor::engine::Orchestrator;
use conductor::simulation::{Behavior, SimulatedAgent};
use conductor::types::Priority;
use conductor::Config;

#[derive(Parser)]
#[command(name = "conductor")]
#[command(about = "Agent coordination and orchestration engine", long_about = None)]
#[command(version)]
struct Cli {
    /// TOML configuration file; CONDUCTOR_* variables override it.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the engine and the HTTP API
    Serve {
        #[arg(short, long)]
        port: Option<u16>,
    },
    /// Run one coordination and one workflow against simulated agents
    Demo {
        #[arg(long, default_value = "translation")]
        task_type: String,
        #[arg(long, default_value = "document_analysis")]
        workflow: String,
    },
    /// List workflow templates
    Templates,
    /// Load and validate the configuration
    CheckConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref()).context("failed to load configuration")?;

    match cli.command {
        Commands::Serve { port } => run_server(config, port).await?,
        Commands::Demo {
            task_type,
            workflow,
        } => run_demo(config, &task_type, &workflow).await?,
        Commands::Templates => list_templates(&config)?,
        Commands::CheckConfig => {
            println!("{}", serde_json::to_string_pretty(&config)?);
            println!("configuration OK");
        }
    }

    Ok(())
}

async fn run_server(config: Config, port: Option<u16>) -> Result<()> {
    let port = port.unwrap_or(config.api_port);
    let orchestrator = Arc::new(Orchestrator::new(config)?);
    orchestrator.start();

    let state = AppState {
        orchestrator: orchestrator.clone(),
    };
    tokio::select! {
        result = serve(state, port) => result?,
        _ = tokio::signal::ctrl_c() => log::info!("shutting down"),
    }

    orchestrator.shutdown();
    Ok(())
}

async fn run_demo(mut config: Config, task_type: &str, workflow: &str) -> Result<()> {
    config.default_timeout_ms = config.default_timeout_ms.min(2_000);
    config.specialist_min_capabilities = config.specialist_min_capabilities.min(2);
    let orchestrator = Orchestrator::new(config)?;
    orchestrator.start();

    let bus = orchestrator.bus().clone();
    let agents = vec![
        SimulatedAgent::new("translator", &["translation", "language_translation"])?
            .with_behavior(Behavior::Succeed {
                delay: Duration::from_millis(40),
            }),
        SimulatedAgent::new("polyglot", &["multilingual_support"])?,
        SimulatedAgent::new("analyst", &["analysis", "data_analysis"])?,
        SimulatedAgent::new("summarizer", &["summarization"])?,
        SimulatedAgent::new("researcher", &["research", "web_search"])?,
        SimulatedAgent::new("flaky", &["research"])?.with_behavior(Behavior::Fail {
            reason: "simulated outage".to_string(),
        }),
    ];

    let mut handles = Vec::new();
    for agent in agents {
        let registration = agent.registration();
        let id = agent.descriptor().id.clone();
        handles.push(agent.spawn(&bus));
        bus.publish(registration);
        wait_for_registration(&orchestrator, &id).await?;
    }

    let request = CoordinationRequest::new(task_type)
        .with_priority(Priority::High)
        .with_options(CoordinationOptions {
            max_agents: Some(2),
            ..Default::default()
        });
    let coordination = orchestrator.coordinate(request).await;

    let instance = orchestrator
        .orchestrate(
            workflow,
            json!({ "document": "Quarterly revenue grew 12%", "text": "hola" }),
            WorkflowOptions::default(),
        )
        .await;

    let health = orchestrator.health().check_all().await;
    let report = orchestrator.optimizer().evaluate();

    let output = json!({
        "coordination": match coordination {
            Ok(result) => serde_json::to_value(result)?,
            Err(e) => json!({ "error": e.to_string() }),
        },
        "workflow": match instance {
            Ok(instance) => serde_json::to_value(instance)?,
            Err(e) => json!({ "error": e.to_string() }),
        },
        "health": health,
        "optimizer": report,
        "dispatched": handles
            .iter()
            .map(|h| (h.id().to_string(), h.dispatched()))
            .collect::<std::collections::BTreeMap<_, _>>(),
    });
    println!("{}", serde_json::to_string_pretty(&output)?);

    orchestrator.shutdown();
    Ok(())
}

async fn wait_for_registration(orchestrator: &Orchestrator, id: &str) -> Result<()> {
    for _ in 0..100 {
        if orchestrator.registry().contains(id) {
            return Ok(());
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    anyhow::bail!("agent {} never registered", id)
}

fn list_templates(config: &Config) -> Result<()> {
    let catalog = config.template_catalog()?;
    for template in catalog.templates() {
        println!("{} ({} steps)", template.name, template.steps.len());
        if !template.description.is_empty() {
            println!("    {}", template.description);
        }
        for step in &template.steps {
            println!(
                "    - {} [{}{}]",
                step.name,
                step.kind.type_name(),
                if step.required { "" } else { ", optional" }
            );
        }
    }
    Ok(())
}
