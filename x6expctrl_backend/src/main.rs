use clap::Parser;
use std::path::PathBuf;

use x6compiler_backend::{gen_receiver_pattern, gen_transmitter_pattern, gen_transmitter_pattern_nodigital, NumAvgs};
use x6expctrl_backend::*;

#[derive(clap::Parser, Debug)]
#[command(about = "Pulse-acquisition sweeps on the X6-1000M")]
struct X6Args {
    #[command(subcommand)]
    action: Action,
}

#[derive(clap::Subcommand, Debug)]
enum Action {
    /// Sweep pulse lengths and amplitudes, saving one averaged trace per grid point
    Run(RunArgs),
    /// Run a single acquisition with the current pattern and playback files
    Acquire(AcquireArgs),
    /// Write the transmitter and receiver patterns of one pulse length
    Patterns(PatternArgs),
    /// Plot the channel timelines of a board configuration
    PlotConfig(PlotConfigArgs),
}

#[derive(clap::Args, Debug)]
struct BoardArgs {
    /// TOML run configuration; defaults apply when omitted
    #[clap(short, long)]
    config: Option<PathBuf>,
    /// Use the simulated board, without pacing waits
    #[clap(long)]
    simulate: bool,
}

#[derive(clap::Args, Debug)]
struct RunArgs {
    #[command(flatten)]
    board: BoardArgs,
    /// Pulse amplitudes, as fractions of full scale
    #[clap(long, value_delimiter = ',', required = true)]
    amps: Vec<f64>,
    /// Pulse lengths, in ns
    #[clap(long, value_delimiter = ',', required = true)]
    lengths: Vec<u64>,
    #[clap(long, default_value_t = 500)]
    dead_time: u64,
    #[clap(long, default_value_t = 1.)]
    rep_time: f64,
    #[clap(long, default_value_t = 0.)]
    phase_shift: f64,
    #[clap(short, long, default_value = "1")]
    num_avgs: String,
    #[clap(long, default_value_t = 1)]
    repetitions: usize,
    /// Save a PNG next to every trace
    #[clap(long)]
    plot: bool,
}

#[derive(clap::Args, Debug)]
struct AcquireArgs {
    #[command(flatten)]
    board: BoardArgs,
    #[clap(short, long, default_value = "1")]
    num_avgs: String,
    #[clap(long, default_value_t = 1.)]
    rep_time: f64,
    #[clap(long, default_value_t = 1)]
    repetitions: usize,
    /// Save the capture as a .npy file
    #[clap(short, long)]
    out: Option<PathBuf>,
}

#[derive(clap::Args, Debug)]
struct PatternArgs {
    /// Pulse length, in ns
    pulse_length: u64,
    #[clap(long, default_value = ".")]
    dir: PathBuf,
    #[clap(long, default_value_t = 500)]
    dead_time: u64,
    #[clap(long, default_value_t = 0)]
    receiver_delay: u64,
    #[clap(long, default_value_t = 2000)]
    acq_time: u64,
    /// Drive the RF pulse only, without trigger and blanking lines
    #[clap(long)]
    no_digital: bool,
}

#[derive(clap::Args, Debug)]
struct PlotConfigArgs {
    /// Board configuration file, or a folder holding one
    conf_file: PathBuf,
    #[clap(short, long, default_value = "Single Pulse")]
    section: String,
    #[clap(short, long, default_value = "pulse.png")]
    out: PathBuf,
    /// Keep raw DAC values instead of fractions of full scale
    #[clap(long)]
    raw: bool,
}

fn load_config(board: &BoardArgs) -> Result<ExptConfig> {
    let config = match &board.config {
        Some(file) => ExptConfig::from_file(file)?,
        None => ExptConfig::default(),
    };
    Ok(if board.simulate { config.without_pacing() } else { config })
}

fn open_device(board: &BoardArgs, config: &ExptConfig) -> Result<Box<dyn X6Driver>> {
    if board.simulate {
        return Ok(Box::new(SimulatedX6::new(&config.capture_path())));
    }
    hardware_device()
}

#[cfg(feature = "hardware")]
fn hardware_device() -> Result<Box<dyn X6Driver>> {
    log::info!("{} board(s) found", probe_boards()?);
    Ok(Box::new(X6Board::new(0)?))
}

#[cfg(not(feature = "hardware"))]
fn hardware_device() -> Result<Box<dyn X6Driver>> {
    Err(Error::Device(
        "built without the `hardware` feature; pass --simulate".to_string(),
    ))
}

fn run(args: &RunArgs) -> Result<()> {
    let config = load_config(&args.board)?;
    let mut device = open_device(&args.board, &config)?;
    let params = SweepParams {
        dead_time: args.dead_time,
        rep_time_sec: args.rep_time,
        phase_shift_degree: args.phase_shift,
        num_avgs: args.num_avgs.parse::<NumAvgs>()?,
        num_repetitions: args.repetitions,
        do_plot: args.plot,
        ..SweepParams::new(args.amps.clone(), args.lengths.clone())
    };
    let result = run_expt(device.as_mut(), &config, &params)?;
    log::info!(
        "Wrote {} traces to {}",
        result.files.len(),
        config.output_dir.display()
    );
    Ok(())
}

fn acquire(args: &AcquireArgs) -> Result<()> {
    let config = load_config(&args.board)?;
    let mut device = open_device(&args.board, &config)?;
    let data = run_acq(
        device.as_mut(),
        &config.acq_config()?,
        args.repetitions,
        args.num_avgs.as_str(),
        args.rep_time,
    )?;
    log::info!("Acquired {} samples", data.len());
    if let Some(out) = &args.out {
        ndarray_npy::write_npy(out, &data)?;
    }
    Ok(())
}

fn patterns(args: &PatternArgs) -> Result<()> {
    let tx = if args.no_digital {
        gen_transmitter_pattern_nodigital(&args.dir, args.pulse_length, args.dead_time)?
    } else {
        gen_transmitter_pattern(&args.dir, args.pulse_length, args.dead_time)?
    };
    let rx = gen_receiver_pattern(&args.dir, args.receiver_delay, args.acq_time)?;
    log::info!("Wrote {} and {}", tx.display(), rx.display());
    Ok(())
}

fn plot_config(args: &PlotConfigArgs) -> Result<()> {
    if args.conf_file.is_dir() {
        let used = plot_compiled_folder(&args.conf_file, &args.section, &args.out)?;
        log::info!("Plotted {}", used.display());
    } else {
        plot_configuration_file(&args.conf_file, &args.section, &args.out, !args.raw)?;
    }
    log::info!("Saved {}", args.out.display());
    Ok(())
}

fn main() {
    env_logger::init();
    let args = X6Args::parse();
    use Action::*;
    let outcome = match &args.action {
        Run(args) => run(args),
        Acquire(args) => acquire(args),
        Patterns(args) => patterns(args),
        PlotConfig(args) => plot_config(args),
    };
    if let Err(e) = outcome {
        log::error!("{}", e);
        std::process::exit(1);
    }
}
