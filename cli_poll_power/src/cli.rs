use std::fmt::Display;

use clap::{Parser, ValueEnum};

#[derive(Parser)]
#[command(author, version, about = "Polls the per-thread CPU power of a process")]
pub struct Cli {
    /// PID of the process to sample.
    #[arg(short, long)]
    pub pid: i32,

    /// Sampling frequency, in hertz. Zero takes a single measurement over
    /// one nominal period and exits.
    #[arg(short, long, default_value_t = 2.0)]
    pub frequency: f64,

    /// Number of samples kept in the rolling history.
    #[arg(long, default_value_t = 60)]
    pub history: usize,

    /// How long to sample, in seconds. Zero means until Ctrl-C.
    #[arg(short, long, default_value_t = 0)]
    pub duration: u64,

    /// Do not attach pthread names to the samples.
    #[arg(long)]
    pub no_thread_names: bool,

    /// Where the per-thread power lines go.
    #[arg(short, long, value_enum, default_value_t = OutputType::Stdout)]
    pub output: OutputType,

    /// Sets the output file, if output is set to file.
    #[arg(long)]
    pub output_file: Option<String>,
}

#[derive(Clone, ValueEnum, Debug, PartialEq, Eq, Copy)]
pub enum OutputType {
    None,
    Stdout,
    File,
}

impl Display for OutputType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        (self as &dyn std::fmt::Debug).fmt(f)
    }
}
