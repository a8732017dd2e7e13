//! Bench tests for an MMU unit.
//!
//! Talks to the MMU directly over a USB-serial adapter, using the same wire
//! codec as the firmware.

mod device;

use clap::Parser;
use colored::Colorize;
use mmu2_link::config::serial::BAUD_RATE;

use device::{resolve_port, MmuClient};
use tests::{print_results, run_all_tests, TestOptions};

#[derive(Parser)]
#[command(name = "mmu-bench-tests")]
#[command(about = "Bench tests for an MMU unit on a serial adapter")]
struct Args {
    /// Serial port wired to the MMU (use "auto" to auto-detect)
    #[arg(short, long, default_value = "auto")]
    port: String,

    /// Baud rate
    #[arg(short, long, default_value_t = BAUD_RATE)]
    baud: u32,

    /// Append and require line checksums
    #[arg(long)]
    checksum: bool,

    /// Also run tests that move filament (slot 0 must be loaded in the MMU)
    #[arg(long)]
    motion: bool,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let port = resolve_port(&args.port, args.baud, args.checksum)?;

    println!("{}", "MMU Bench Tests".bold());
    println!("Port: {}", port);
    println!("Baud: {}", args.baud);
    println!();

    println!("Connecting to MMU...");
    let mut mmu = MmuClient::new(&port, args.baud, args.checksum)?;
    mmu.drain_buffer()?;
    println!("{}", "Connected!".green());

    println!("\nRunning tests...\n");

    let options = TestOptions {
        motion: args.motion,
    };
    let results = run_all_tests(&mut mmu, options);
    print_results(&results);

    // Exit with error code if any tests failed
    let failed = results.iter().filter(|r| !r.passed).count();
    if failed > 0 {
        std::process::exit(1);
    }

    Ok(())
}
