//! Example: Reading Measurements
//!
//! Scans for a supported device, connects, and prints every reading until
//! the device ends the transfer.
//!
//! Run with: `cargo run --example read_measurements -- <MODEL> [CONFIG]`
//!
//! `MODEL` is a catalog id such as `omron-evolv` or `contour-next-one`.
//! `CONFIG` is an optional TOML file with session and pipeline settings.
//! Set `RUST_LOG=vitalink_core=debug` to follow the session states.

use std::env;
use std::str::FromStr;

use futures::StreamExt;
use tracing_subscriber::EnvFilter;
use vitalink_core::{Central, Config, ReadingPipeline};
use vitalink_types::{DeviceModel, Measurement, catalog};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args: Vec<String> = env::args().collect();
    let Some(model) = args.get(1) else {
        eprintln!("Usage: {} <MODEL> [CONFIG]", args[0]);
        eprintln!();
        eprintln!("Supported models:");
        for descriptor in catalog::all() {
            eprintln!("  {:<18} {}", descriptor.id.as_str(), descriptor.display_name);
        }
        std::process::exit(1);
    };
    let descriptor = DeviceModel::from_str(model)?.descriptor();
    let config = match args.get(2) {
        Some(path) => Config::load_validated(path)?,
        None => Config::default(),
    };

    println!("Looking for {}...", descriptor);
    let central = Central::btle().await?;
    let pipeline = ReadingPipeline::with_config(central, config.pipeline_config())?;

    let mut stream = pipeline.read(descriptor);
    while let Some(reading) = stream.next().await {
        let reading = reading?;
        match &reading.measurement {
            Measurement::BloodPressure(bp) => {
                let (systolic, diastolic) = bp.in_mmhg();
                println!(
                    "  {}  {:.0}/{:.0} mmHg  pulse {}",
                    bp.timestamp,
                    systolic,
                    diastolic,
                    bp.pulse.map_or("-".to_string(), |p| format!("{:.0}", p))
                );
            }
            Measurement::Glucose(glucose) => {
                println!(
                    "  #{:<5} {}  {:.1} mmol/L",
                    glucose.sequence,
                    glucose.timestamp,
                    glucose.in_mmol_per_l()
                );
            }
        }
        println!("           digest {}", reading.digest.to_hex());
    }

    let counters = stream.counters();
    println!();
    println!(
        "Received {} packets: {} readings, {} discarded",
        counters.received,
        counters.decoded,
        counters.discarded()
    );
    Ok(())
}
