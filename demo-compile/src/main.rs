use demo_compile::{TOY_FRAGMENT_TARGET, TOY_VERTEX_TARGET};
use kiln::scheduler::{
    ChannelConfig, CompileInput, CompileTarget, CompiledUnit, CompilingManager, JobInput, JobKey,
    NewJob, Priority, SchedulerConfig, SchedulerContext, SchedulerResult,
};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use structopt::StructOpt;

#[derive(StructOpt, Debug)]
struct DemoArgs {
    #[structopt(name = "config", long, parse(from_os_str))]
    config: Option<PathBuf>,
    #[structopt(name = "worker", long, parse(from_os_str))]
    worker: Option<PathBuf>,
    #[structopt(name = "units", long, default_value = "8")]
    units: u32,
    #[structopt(name = "jobs-per-unit", long, default_value = "6")]
    jobs_per_unit: u32,
    #[structopt(name = "in-process", long)]
    in_process: bool,
}

fn shader_source(
    unit_index: u32,
    job_index: u32,
) -> String {
    // Every unit shares the first two shaders so the cache has something to hit
    let variant = if job_index < 2 { job_index } else { unit_index * 100 + job_index };
    format!(
        "// variant {}\nfn main() {{\n  position $SCALE\n  color {}\n}}\n",
        variant, variant
    )
}

fn create_jobs(
    unit_index: u32,
    jobs_per_unit: u32,
) -> Vec<NewJob> {
    let priority = Priority::ALL[unit_index as usize % 3];
    (0..jobs_per_unit)
        .map(|job_index| {
            let target = if job_index % 2 == 0 {
                TOY_VERTEX_TARGET
            } else {
                TOY_FRAGMENT_TARGET
            };

            // The last job of every fourth unit is broken on purpose
            let source = if unit_index % 4 == 3 && job_index + 1 == jobs_per_unit {
                "fn main() {\n".to_string()
            } else {
                shader_source(unit_index, job_index)
            };

            NewJob::new(
                JobKey::from_u128(((unit_index as u128) << 32) | job_index as u128),
                priority,
                JobInput::Single(toy_input(target, unit_index, job_index, source)),
            )
        })
        .collect()
}

fn toy_input(
    target: CompileTarget,
    unit_index: u32,
    job_index: u32,
    source: String,
) -> CompileInput {
    CompileInput {
        target,
        entry_point: "main".to_string(),
        source,
        environment: vec![("SCALE".to_string(), "2.0".to_string())],
        debug_name: format!("unit{}/shader{}.toy", unit_index, job_index),
    }
}

fn run(args: DemoArgs) -> SchedulerResult<()> {
    let mut config = match &args.config {
        Some(path) => SchedulerConfig::read_from_path(path)?,
        None => SchedulerConfig::default(),
    };

    if args.worker.is_some() {
        config.worker_executable = args.worker.clone();
    }

    if args.in_process {
        config.channels = vec![ChannelConfig::in_process()];
    }

    let context = SchedulerContext::new(config, demo_compile::backends());

    let finalized = Arc::new(Mutex::new(Vec::<CompiledUnit>::default()));
    let finalized_clone = finalized.clone();
    let mut manager = CompilingManager::from_config(context, None, move |unit: CompiledUnit| {
        if unit.all_succeeded {
            log::info!("{:?} finished with {} jobs", unit.unit_id, unit.jobs.len());
        } else {
            for error in &unit.errors {
                log::error!("{:?}: {}", unit.unit_id, error);
            }
        }
        finalized_clone.lock().unwrap().push(unit);
    })?;

    for unit_index in 0..args.units {
        let unit_id = manager.allocate_unit_id();
        manager.submit(create_jobs(unit_index, args.jobs_per_unit), unit_id);
    }

    while manager.outstanding_count() > 0 {
        manager.process_async(Some(Duration::from_millis(5)), false)?;
        std::thread::sleep(Duration::from_millis(1));
    }

    manager.finish_all()?;
    manager.log_stats();

    let finalized = finalized.lock().unwrap();
    let failed = finalized.iter().filter(|unit| !unit.all_succeeded).count();
    log::info!("{} units finalized, {} failed", finalized.len(), failed);
    Ok(())
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .write_style(env_logger::WriteStyle::Always)
        .init();

    let args = DemoArgs::from_args();
    if let Err(e) = run(args) {
        log::error!("{}", e);
        std::process::exit(1);
    }
}
