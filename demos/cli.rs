// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! CLI tool to run tiled and pipelined workloads on a flow.

use clap::{Parser, ValueEnum};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha12Rng;
use std::num::NonZeroUsize;
use std::process::ExitCode;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tileflow::{CoreRange, CpuPinningPolicy, Flow, FlowBuilder, ThreadCount};

fn main() -> ExitCode {
    env_logger::init();
    let cli = Cli::parse();

    let mut builder = FlowBuilder::new(
        match cli.workers {
            Some(workers) => ThreadCount::Count(workers),
            None => ThreadCount::AvailableParallelism,
        },
        ThreadCount::Count(cli.pipelines),
    );
    if let (Some(first), Some(last)) = (cli.pin_first, cli.pin_last) {
        builder.compute.cpu_pinning = CpuPinningPolicy::IfSupported(CoreRange::new(first, last));
    }

    let flow = Arc::new(Flow::new());
    if let Err(e) = flow.init_with(&builder) {
        eprintln!("failed to initialize the flow: {e}");
        return ExitCode::FAILURE;
    }

    let start = Instant::now();
    let result = match cli.scenario {
        Scenario::Sum => sum(&flow, &cli),
        Scenario::Stages => stages(&flow, &cli),
        Scenario::FailingTile => failing_tile(&flow, &cli),
    };
    let elapsed = start.elapsed();

    match result {
        Ok(summary) => {
            println!("{summary} in {elapsed:?}");
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}

/// Sums a random input with one task per tile.
fn sum(flow: &Flow, cli: &Cli) -> Result<String, tileflow::Error> {
    let input = random_input(cli.input_size);
    let total = AtomicU64::new(0);

    flow.parallelize_tiled_tasks(input.len(), cli.tile, |start, len| {
        let partial = input[start..start + len].iter().sum::<u64>();
        total.fetch_add(partial, Ordering::Relaxed);
    })?;

    let expected = input.iter().sum::<u64>();
    let total = total.into_inner();
    assert_eq!(total, expected);
    Ok(format!("sum = {total}"))
}

/// Runs independent multi-stage jobs on the pipeline pool, each stage
/// dispatching tiles to the compute pool.
fn stages(flow: &Arc<Flow>, cli: &Cli) -> Result<String, tileflow::Error> {
    let jobs = (0..cli.jobs)
        .map(|job| {
            let stage_flow = flow.clone();
            let input_size = cli.input_size;
            let tile = cli.tile;
            flow.add_pipeline(move || -> Result<u64, tileflow::Error> {
                // Stage 1: square every item, each tile owning its chunk.
                let mut data = random_input(input_size);
                let chunks = data.chunks_mut(tile.max(1)).map(Mutex::new).collect::<Vec<_>>();
                stage_flow.parallelize_tiled_tasks(input_size, tile, |start, _len| {
                    for x in chunks[start / tile].lock().unwrap().iter_mut() {
                        *x = *x * *x;
                    }
                })?;
                drop(chunks);

                // Stage 2: reduce.
                let total = AtomicU64::new(0);
                stage_flow.parallelize_tiled_tasks(input_size, tile, |start, len| {
                    let partial = data[start..start + len].iter().sum::<u64>();
                    total.fetch_add(partial, Ordering::Relaxed);
                })?;

                let total = total.into_inner();
                println!("job #{job}: sum of squares = {total}");
                Ok(total)
            })
        })
        .collect::<Result<Vec<_>, _>>()?;

    let mut checksum = 0u64;
    for job in jobs {
        checksum = checksum.wrapping_add(job.wait()??);
    }
    Ok(format!("{} job(s), checksum = {checksum}", cli.jobs))
}

/// Makes one tile panic, and shows that the other tiles still complete.
fn failing_tile(flow: &Flow, cli: &Cli) -> Result<String, tileflow::Error> {
    let completed = AtomicU64::new(0);
    let result = flow.parallelize_tiled_tasks(cli.input_size, cli.tile, |start, len| {
        if start == 0 {
            panic!("tile at {start} refused to run");
        }
        completed.fetch_add(len as u64, Ordering::Relaxed);
    });
    match result {
        Err(tileflow::Error::Tiles(errors)) => Ok(format!(
            "{errors}; {} item(s) processed by the other tiles",
            completed.load(Ordering::Relaxed)
        )),
        Err(e) => Err(e),
        Ok(()) => Ok("no tile failed".to_owned()),
    }
}

/// Creates a vector of `input_size` small random numbers. The sequence is
/// fixed by a constant seed for reproducibility.
fn random_input(input_size: usize) -> Vec<u64> {
    let mut rng = ChaCha12Rng::seed_from_u64(42);
    (0..input_size).map(|_| rng.random_range(0..1000)).collect()
}

/// CLI tool to run tiled and pipelined workloads on a flow.
#[derive(Parser, Debug, PartialEq, Eq)]
#[command(version)]
struct Cli {
    /// Number of compute threads. Default to the available parallelism.
    #[arg(long)]
    workers: Option<NonZeroUsize>,

    /// Number of pipeline threads.
    #[arg(long, default_value = "2")]
    pipelines: NonZeroUsize,

    /// First CPU to pin compute threads to. Requires --pin-last.
    #[arg(long, requires = "pin_last")]
    pin_first: Option<usize>,

    /// Last CPU (included) to pin compute threads to. Requires --pin-first.
    #[arg(long, requires = "pin_first")]
    pin_last: Option<usize>,

    /// Scenario to run.
    #[arg(long, value_enum)]
    scenario: Scenario,

    /// Number of items in the input.
    #[arg(long, default_value_t = 1_000_000)]
    input_size: usize,

    /// Number of items per tile.
    #[arg(long, default_value_t = 4096)]
    tile: usize,

    /// Number of independent jobs. Used only for the stages scenario.
    #[arg(long, default_value_t = 4)]
    jobs: usize,
}

/// Scenario to run.
#[derive(ValueEnum, Clone, Debug, PartialEq, Eq)]
enum Scenario {
    /// Sum a vector of numbers with tiles.
    Sum,
    /// Run multi-stage jobs on the pipeline pool.
    Stages,
    /// Dispatch tiles where one of them panics.
    FailingTile,
}
