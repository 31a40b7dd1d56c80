use std::fs::File;
use std::io::{BufWriter, Write};
use std::time::{Duration, SystemTime};

use anyhow::{anyhow, Context};
use clap::Parser;
use log::info;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tokio::sync::mpsc;

use power_sampling::sample::SampleResult;
use power_sampling::sampler::{PowerSampler, SamplerConfig};

use cli::{Cli, OutputType};
use probe::CpuTimeProbe;

mod cli;
mod probe;

const SAMPLES_FLUSH_INTERVAL: Duration = Duration::from_secs(1);
const WRITER_BUFFER_CAPACITY: usize = 8192;

#[tokio::main(worker_threads = 2)]
async fn main() -> Result<(), anyhow::Error> {
    // initialize logger
    let env = env_logger::Env::default().default_filter_or("info");
    env_logger::init_from_env(env);

    // parse CLI arguments
    let cli = Cli::parse();
    if cli.frequency < 0.0 {
        return Err(anyhow!("negative sampling frequency: {}", cli.frequency));
    }

    let config = SamplerConfig {
        sampling_period: if cli.frequency == 0.0 {
            SamplerConfig::default().sampling_period
        } else {
            Duration::from_secs_f64(1.0 / cli.frequency)
        },
        history_capacity: cli.history,
        thread_names: !cli.no_thread_names,
        ..SamplerConfig::default()
    };
    let period = config.sampling_period;
    let probe = CpuTimeProbe::new()?;
    let sampler = PowerSampler::new(Box::new(probe), config);

    // one-shot mode: a baseline read, one nominal period, one measurement
    if cli.frequency == 0.0 {
        sampler.sample_now(cli.pid)?;
        tokio::time::sleep(period).await;
        let sample = sampler.sample_now(cli.pid)?;
        println!(
            "{} threads, {:.3} W performance, {:.3} W efficiency, {:.3} W total",
            sample.threads_power.len(),
            sample.all_threads_power.performance(),
            sample.all_threads_power.efficiency(),
            sample.all_threads_power.total(),
        );
        return Ok(());
    }

    // prepare the output, if any
    let writer: Box<dyn Write + Send> = match cli.output {
        OutputType::None => Box::new(std::io::sink()),
        OutputType::Stdout => Box::new(BufWriter::with_capacity(WRITER_BUFFER_CAPACITY, std::io::stdout())),
        OutputType::File => {
            let filename = if let Some(f) = cli.output_file {
                f
            } else {
                let now = OffsetDateTime::now_utc().format(&Rfc3339)?;
                format!("poll-{now}.csv")
            };
            let file = File::create(filename)?;
            Box::new(BufWriter::with_capacity(WRITER_BUFFER_CAPACITY, file))
        }
    };

    // Start the writer task, which receives each sample from the sampling
    // loop through a channel and writes it to the selected output.
    let (tx, rx) = mpsc::channel::<SampleResult>(4096);
    sampler.set_sample_sender(tx);
    let writer_task = tokio::spawn(write_samples(writer, rx));

    info!("sampling pid {} every {:?}", cli.pid, period);
    sampler.start_sampling(cli.pid);

    if cli.duration > 0 {
        tokio::time::sleep(Duration::from_secs(cli.duration)).await;
    } else {
        tokio::signal::ctrl_c().await.context("waiting for Ctrl-C")?;
    }
    sampler.stop_sampling();

    let (samples, max_power) = sampler.history_snapshot();
    info!(
        "done: {} samples retained, {} threads, peak {:.3} W, {:.6} Wh consumed",
        samples.len(),
        sampler.current_thread_count(),
        max_power,
        sampler.total_energy_usage(),
    );

    // dropping the sampler closes the channel and ends the writer task
    drop(sampler);
    writer_task.await?.context("writer task error")?;

    Ok(())
}

async fn write_samples(
    mut writer: Box<dyn Write + Send>,
    mut rx: mpsc::Receiver<SampleResult>,
) -> anyhow::Result<()> {
    let mut previous_flush = SystemTime::now();

    // csv header
    writer.write_all("timestamp_ms;thread;name;performance_w;efficiency_w;total_w\n".as_bytes())?;
    while let Some(sample) = rx.recv().await {
        print_sample(&mut writer, &sample)?;

        let since_last_flush = sample
            .time
            .duration_since(previous_flush)
            .unwrap_or(Duration::ZERO);
        if since_last_flush >= SAMPLES_FLUSH_INTERVAL {
            previous_flush = sample.time;
            writer.flush()?;
        }
    }
    writer.flush()?;
    Ok(())
}

fn print_sample(writer: &mut dyn Write, sample: &SampleResult) -> anyhow::Result<()> {
    let timestamp_ms = sample.time.duration_since(SystemTime::UNIX_EPOCH)?.as_millis();
    for thread in &sample.threads_power {
        let name = thread.display_name();
        let performance = thread.power.performance();
        let efficiency = thread.power.efficiency();
        let total = thread.power.total();
        writeln!(
            writer,
            "{timestamp_ms};{};{name};{performance};{efficiency};{total}",
            thread.thread_id
        )?;
    }
    Ok(())
}
