use anyhow::Result;
use rayon::ThreadPoolBuilder;
use tracing_subscriber::{filter::LevelFilter, EnvFilter};

/// Maximum number of worker threads for CPU-bound consensus work.
/// More threads stop paying off for signature batches well before this.
const MAX_TASK_POOL_THREADS: usize = 16;

/// Initializes the `tracing` subscriber that also captures `log` records
/// from every crate in the workspace. `MERIDIAN_LOG` overrides directives.
pub fn initialize_logger(module_path: &str) -> Result<()> {
    let mut filter = EnvFilter::default()
        .add_directive(LevelFilter::OFF.into())
        .add_directive("binary_utils=info".parse()?)
        .add_directive("block_pool=info".parse()?)
        .add_directive("block_processor=info".parse()?)
        .add_directive("chain_dag=info".parse()?)
        .add_directive("clock=info".parse()?)
        .add_directive("consensus=info".parse()?)
        .add_directive("database=info".parse()?)
        .add_directive("events=info".parse()?)
        .add_directive("execution_engine=info".parse()?)
        .add_directive("metrics=info".parse()?)
        .add_directive("p2p=info".parse()?)
        .add_directive("runtime=info".parse()?)
        .add_directive("slashing_protection=info".parse()?)
        .add_directive("validator=info".parse()?)
        .add_directive(format!("{module_path}=info").parse()?);

    if let Ok(env_filter) = EnvFilter::try_from_env("MERIDIAN_LOG") {
        for directive in env_filter.to_string().split(',') {
            filter = filter.add_directive(directive.parse()?);
        }
    }

    tracing_subscriber::fmt()
        .compact()
        .with_env_filter(filter)
        .init();

    Ok(())
}

/// Builds the global task pool for CPU-bound work: BLS batches and state
/// transition hot paths. Control plane code never runs here.
pub fn initialize_task_pool(requested_threads: Option<usize>) -> Result<()> {
    let threads = requested_threads
        .unwrap_or_else(num_cpus::get)
        .clamp(1, MAX_TASK_POOL_THREADS);

    ThreadPoolBuilder::new()
        .thread_name(|index| format!("task-pool-{index}"))
        .num_threads(threads)
        .build_global()?;

    Ok(())
}
