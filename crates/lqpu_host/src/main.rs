use anyhow::{Context, Result, bail};
use clap::{Parser, ValueEnum};
use env_logger::Env;
use log::{info, warn};
use lqpu_core::mailbox::VcMailbox;
use lqpu_core::{Discovery, PollLimit, SessionConfig, Strategy};
use lqpu_host::mandel::{
    BatchFailed, MandelArgs, NUM_QPUS, RenderOptions, RenderSummary, render,
};
use lqpu_host::{fractal, program};
use lqpu_io::NpyWriter;
use lqpu_sim::SimFirmware;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum StrategyArg {
    /// Program the request registers and poll for completion.
    Direct,
    /// Let the firmware run the batch and wait with a timeout.
    Mailbox,
}

/// Renders a Mandelbrot field on the VideoCore IV QPUs.
#[derive(Parser, Debug)]
#[command(version, allow_negative_numbers = true)]
struct Cli {
    re_min: f32,
    re_max: f32,
    im_min: f32,
    /// Pixels per row, a multiple of 16.
    width: usize,
    /// Rows, a multiple of the QPU count (12).
    height: usize,
    max_iter: u32,
    /// Escape threshold on the squared magnitude.
    max_value: f32,
    /// Write the escape counts here as a (height, width) .npy array.
    out: Option<PathBuf>,

    #[arg(long, value_enum, default_value_t = StrategyArg::Mailbox)]
    strategy: StrategyArg,
    /// Firmware execution timeout for the mailbox strategy.
    #[arg(long, default_value_t = 2000)]
    timeout_ms: u64,
    /// Give up polling after this many milliseconds (direct strategy).
    #[arg(long, value_name = "MS")]
    poll_limit: Option<u64>,
    /// Allocate around the VideoCore L2 cache.
    #[arg(long)]
    no_l2_cache: bool,
    /// Fail instead of using defaults when libbcm_host cannot be loaded.
    #[arg(long)]
    strict: bool,
    /// Run on the software simulator instead of /dev/vcio.
    #[arg(long)]
    simulate: bool,
    /// Compare the result with the CPU reference renderer.
    #[arg(long)]
    verify: bool,
    /// Print batch latency and V3D performance counters.
    #[arg(long)]
    stats: bool,
}

impl Cli {
    fn args(&self) -> MandelArgs {
        MandelArgs {
            re_min: self.re_min,
            re_max: self.re_max,
            im_min: self.im_min,
            width: self.width,
            height: self.height,
            max_iter: self.max_iter,
            max_value: self.max_value,
        }
    }

    fn strategy(&self) -> Strategy {
        match self.strategy {
            StrategyArg::Direct => Strategy::Direct {
                limit: match self.poll_limit {
                    Some(ms) => PollLimit::Deadline(Duration::from_millis(ms)),
                    None => PollLimit::Unbounded,
                },
            },
            StrategyArg::Mailbox => Strategy::Mailbox {
                timeout: Duration::from_millis(self.timeout_ms),
                flush: false,
            },
        }
    }
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();
    match run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e:#}");
            if let Some(batch) = e.downcast_ref::<BatchFailed>() {
                print_time(batch.elapsed);
            }
            ExitCode::FAILURE
        }
    }
}

fn run(cli: &Cli) -> Result<()> {
    let args = cli.args();
    args.validate(NUM_QPUS)?;

    let program = program::program();
    if !program::is_embedded() && !cli.simulate {
        warn!("no QPU program embedded, set LQPU_PROGRAM at build time; units will halt");
    }
    let options = RenderOptions {
        debug: cfg!(feature = "gpu-debug"),
        perf_counters: cli.stats,
    };

    let mut writer = cli
        .out
        .as_ref()
        .map(|path| NpyWriter::create(path, args.height, args.width))
        .transpose()?;
    let mut field = Vec::new();
    let sink = |band: &[u32]| -> Result<()> {
        if let Some(writer) = writer.as_mut() {
            writer.write_rows(band)?;
        }
        if cli.verify {
            field.extend_from_slice(band);
        }
        Ok(())
    };

    let summary = if cli.simulate {
        let sim = SimFirmware::default();
        sim.set_kernel(fractal::simulated_kernel());
        let config = SessionConfig {
            use_l2_cache: !cli.no_l2_cache,
            ..sim.session_config(cli.strategy())
        };
        render(sim, &config, &args, NUM_QPUS, &program, options, sink)?
    } else {
        let mailbox = VcMailbox::open().context("Failed to open the firmware mailbox")?;
        let mut config = SessionConfig {
            strategy: cli.strategy(),
            use_l2_cache: !cli.no_l2_cache,
            ..SessionConfig::default()
        };
        if let Discovery::Probe { strict, .. } = &mut config.discovery {
            *strict = cli.strict;
        }
        render(mailbox, &config, &args, NUM_QPUS, &program, options, sink)?
    };

    print_time(summary.elapsed);
    if let Some(writer) = writer {
        writer.finish()?;
    }
    if cli.stats {
        report(&summary);
    }
    if cli.verify {
        let reference = fractal::render_reference(&args);
        let differing = fractal::mismatches(&field, &reference);
        if differing > 0 {
            bail!("{differing} of {} pixels differ from the CPU reference", reference.len());
        }
        info!("all {} pixels match the CPU reference", reference.len());
    }
    Ok(())
}

fn print_time(elapsed: Duration) {
    println!("Time: {:.6} secs", elapsed.as_secs_f64());
}

fn report(summary: &RenderSummary) {
    summary.batches.print_report();
    if let Some(counters) = &summary.counters {
        println!("\nPerformance Counters");
        print!("{counters}");
    }
}
