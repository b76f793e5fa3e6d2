//! Stern-Gerlach Experiment Demo
//!
//! Headless runner for the numbered presets. Every run is driven through the
//! frame scheduler and the detector tallies are logged at the end.
//!
//! Presets: 1 aligned analyzer, 2 perpendicular analyzer, 3 entangled pair,
//! 4 interference, 5 hidden variables, 6 current loop
//!
//! Set RUST_LOG=info to see the summary, debug for every measurement.

use clap::Parser;
use common::constants::FRAME_DT;
use common::AnimationManager;
use std::cell::RefCell;
use std::rc::Rc;
use stern_gerlach::{presets, ExperimentConfig};

/// Frames allowed for a single run before giving up on it
const MAX_FRAMES_PER_RUN: u32 = 100_000;

#[derive(Parser)]
#[command(author, version, about = "Run a Stern-Gerlach preset and report detector tallies")]
struct Cli {
    /// Preset to run (1-6)
    #[arg(default_value_t = 1, value_parser = clap::value_parser!(u32).range(1..=6))]
    preset: u32,

    /// Number of runs
    #[arg(default_value_t = 100)]
    runs: u32,

    /// Seed for the measurement RNG
    #[arg(long)]
    seed: Option<u64>,
}

fn main() {
    env_logger::init();
    let cli = Cli::parse();

    let config = ExperimentConfig {
        seed: cli.seed,
        ..ExperimentConfig::default()
    };
    let preset = match presets::by_number(cli.preset, config) {
        Some(Ok(preset)) => preset,
        Some(Err(err)) => {
            log::error!("Preset {} could not be built: {}", cli.preset, err);
            std::process::exit(1);
        }
        None => {
            log::error!("Unknown preset {}, expected 1 to 6", cli.preset);
            std::process::exit(2);
        }
    };
    let runs = cli.runs;
    log::info!("Running '{}' {} times", preset.name, runs);

    let presets::Preset {
        name,
        experiment,
        detectors,
        screen,
    } = preset;
    let experiment = Rc::new(RefCell::new(experiment));

    let mut scheduler = AnimationManager::new();
    scheduler.register(experiment.clone());

    for run in 0..runs {
        experiment.borrow_mut().run();

        let mut frames = 0;
        loop {
            {
                let exp = experiment.borrow();
                if !exp.is_running() && !exp.has_pending_run() {
                    break;
                }
            }
            if frames == MAX_FRAMES_PER_RUN {
                log::warn!("Run {} did not finish, ending it", run + 1);
                experiment.borrow_mut().end();
                break;
            }
            scheduler.advance(FRAME_DT);
            frames += 1;
        }
    }

    let exp = experiment.borrow();
    log::info!("{} finished after {} runs", name, exp.run_count());
    for (label, id) in &detectors {
        let count = exp.detector_count(*id).unwrap_or(0);
        log::info!(
            "  {:<12} {:>6} ({:.1}%)",
            label,
            count,
            100.0 * count as f64 / runs.max(1) as f64
        );
    }
    if let Some(screen) = screen {
        let screen = screen.borrow();
        let upper = screen.dots.iter().filter(|d| d.y > 0.0).count();
        log::info!(
            "  screen: {} dots, {} upper, {} lower",
            screen.dots.len(),
            upper,
            screen.dots.len() - upper
        );
    }
}
