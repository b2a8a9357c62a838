use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use common::cli::GlobalOpts;
use common::{ThreadAdapter, ThreaddedInstance};
use psx::{Executable, Machine, MachineConfig, PollConfig};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "psx-mu", version, about = "Runs PlayStation software on an emulated R3000")]
struct Cli {
    #[command(flatten)]
    global: GlobalOpts,

    /// PS-X EXE to run, side-loaded once the BIOS reaches the shell
    exe: Option<PathBuf>,

    /// 512KiB BIOS image
    #[arg(long)]
    bios: Option<PathBuf>,

    /// Interpret everything, never compile
    #[arg(long)]
    no_compiler: bool,

    /// Calls to a target before it gets compiled
    #[arg(long, default_value_t = 8)]
    compile_threshold: u32,

    /// Step virtual time by instructions instead of following the host clock
    #[arg(long)]
    deterministic: bool,

    /// Stop after this many instructions
    #[arg(long)]
    instructions: Option<u64>,

    /// Repeated reads of one word before the CPU parks on it
    #[arg(long, default_value_t = 64)]
    poll_threshold: u32,

    /// Most instructions between two reads of a busy-wait
    #[arg(long, default_value_t = 32)]
    poll_gap: u32,

    /// Leave out the built-in vblank interrupt
    #[arg(long)]
    no_vblank: bool,

    /// Stop when execution reaches this address (hex)
    #[arg(long, value_parser = parse_address)]
    breakpoint: Vec<u32>,
}

fn parse_address(s: &str) -> Result<u32, String> {
    let digits = s.trim_start_matches("0x").replace('_', "");
    u32::from_str_radix(&digits, 16).map_err(|e| format!("bad address {s}: {e}"))
}

impl Cli {
    fn machine_config(&self) -> MachineConfig {
        let mut config = if self.deterministic { MachineConfig::deterministic() } else { MachineConfig::default() };
        config.compiler_enabled = !self.no_compiler;
        config.compiler.threshold = self.compile_threshold;
        config.poll = PollConfig {
            threshold: self.poll_threshold,
            max_gap: self.poll_gap,
        };
        if self.no_vblank {
            config.vblank_hz = None;
        }
        config
    }
}

fn main() -> Result<(), anyhow::Error> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_new(cli.global.log_directive())?)
        .init();

    if cli.bios.is_none() && cli.exe.is_none() {
        anyhow::bail!("nothing to run, give a BIOS image, an executable or both");
    }

    let mut machine = Machine::build(cli.machine_config()).context("building the machine")?;

    if let Some(path) = &cli.bios {
        let image = std::fs::read(path).with_context(|| format!("reading BIOS {}", path.display()))?;
        machine.load_bios(&image).with_context(|| format!("loading BIOS {}", path.display()))?;
    }
    if let Some(path) = &cli.exe {
        let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
        let exe = Executable::parse(&bytes).with_context(|| format!("parsing {}", path.display()))?;
        machine.load_exe(exe)?;
    }
    for address in &cli.breakpoint {
        machine.add_breakpoint(*address);
    }
    machine.set_instruction_limit(cli.instructions);

    let mut adapter = ThreadAdapter::new(Box::new(machine))?;
    adapter.start()?;
    let mut instance = adapter.wait_finished()?;

    let machine = instance.as_any().downcast_mut::<Machine>()
        .ok_or_else(|| anyhow::anyhow!("execution thread returned something other than a machine"))?;
    let regs = machine.registers();
    tracing::info!("stopped at {:08x} after {} steps, {} parks", regs.pc, machine.steps(), machine.parks());
    tracing::info!("{:?}", machine.bridge_stats());
    println!("{:?}", regs);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn options_map_to_config() {
        let cli = Cli::parse_from(["psx-mu", "--no-compiler", "--deterministic", "--poll-threshold", "16",
            "--breakpoint", "0x80030000", "--no-vblank", "game.exe"]);
        let config = cli.machine_config();
        assert!(!config.compiler_enabled);
        assert_eq!(config.poll.threshold, 16);
        assert_eq!(config.vblank_hz, None);
        assert_eq!(cli.breakpoint, vec![0x8003_0000]);
        assert_eq!(cli.exe, Some(PathBuf::from("game.exe")));
    }

    #[test]
    fn addresses_are_hex() {
        assert_eq!(parse_address("bfc0_0180"), Ok(0xbfc0_0180));
        assert!(parse_address("zz").is_err());
    }
}
