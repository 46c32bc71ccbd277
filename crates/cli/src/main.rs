//! Exert CLI - runs exertions on a local federation.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use exert_core::{Access, Context, Exertion, Flow, Job, Signature, Task};
use exert_dispatch::{EngineConfig, LocalFederation};
use exert_invoker::Model;
use exert_provider::{arithmetic_provider, ARITHMETIC_ROLE};
use serde_json::Value;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "exert")]
#[command(about = "Federated exertion dispatch", long_about = None)]
struct Cli {
    /// Engine configuration file (JSON)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the two-task arithmetic job
    Arithmetic {
        /// Access mode
        #[arg(long, value_enum, default_value = "push")]
        access: AccessArg,
        /// Control flow
        #[arg(long, value_enum, default_value = "seq")]
        flow: FlowArg,
    },
    /// Show invoker caching and invalidation
    Model,
    /// Print the effective configuration
    Info,
}

#[derive(Clone, Copy, ValueEnum)]
enum AccessArg {
    Push,
    Pull,
}

#[derive(Clone, Copy, ValueEnum)]
enum FlowArg {
    Seq,
    Par,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => {
            info!("Loading configuration from {}", path.display());
            EngineConfig::from_file(path)?
        }
        None => EngineConfig::default(),
    };

    match cli.command {
        Commands::Arithmetic { access, flow } => {
            let access = match access {
                AccessArg::Push => Access::Push,
                AccessArg::Pull => Access::Pull,
            };
            let flow = match flow {
                FlowArg::Seq => Flow::Seq,
                FlowArg::Par => Flow::Par,
            };
            run_arithmetic(config, access, flow).await?;
        }
        Commands::Model => run_model()?,
        Commands::Info => {
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
    }

    Ok(())
}

async fn run_arithmetic(config: EngineConfig, access: Access, flow: Flow) -> Result<()> {
    let mut federation = LocalFederation::new(config).with_brokers();
    federation.deploy(Arc::new(arithmetic_provider("arithmetic")));

    let c1 = Context::new("c1")
        .with_in("operand/1", 20)
        .with_in("operand/2", 80)
        .with_out("result");
    let c2 = Context::new("c2")
        .with_in("operand/1", 10)
        .with_unbound_in("operand/2")
        .with_out("result");
    c1.connect("result", "operand/2", &c2);

    let job = Job::new("arithmetic")
        .with_flow(flow)
        .with_access(access)
        .add(Task::new("t1", Signature::new(ARITHMETIC_ROLE, "add"), c1.clone()))
        .add(Task::new("t3", Signature::new(ARITHMETIC_ROLE, "multiply"), c2.clone()));

    let done = federation.dispatcher().exert(job).await;
    print_outcome(&done);
    println!("{}", c1);
    println!("{}", c2);

    federation.shutdown().await;
    Ok(())
}

fn print_outcome(done: &Exertion) {
    println!("{}: {}", done.name(), done.status());
    for note in done.control().trace() {
        println!("  trace  {}", note);
    }
    for fault in done.control().exceptions() {
        println!("  fault  {:?}: {}", fault.kind, fault.message);
    }
}

fn run_model() -> Result<()> {
    let scope = Context::new("scope").with_in("x", 10.0).with_in("y", 20.0);
    let mut model = Model::new(scope);

    model.add_invoker("sum", &["x", "y"], |args| {
        Ok(Value::from(args.f64("x")? + args.f64("y")?))
    })?;
    model.add_invoker("double", &["sum"], |args| {
        Ok(Value::from(args.f64("sum")? * 2.0))
    })?;

    println!("double = {}", model.get_value("double")?);
    println!("double = {} (cached)", model.get_value("double")?);

    let invalidated = model.set_value("x", 5.0);
    println!("x = 5 invalidated {} invoker(s)", invalidated);
    println!("double = {}", model.get_value("double")?);

    for name in model.names() {
        println!(
            "  {} evaluated {} time(s)",
            name,
            model.evaluations(&name).unwrap_or(0)
        );
    }
    Ok(())
}
