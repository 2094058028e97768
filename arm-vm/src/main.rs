use clap::Parser;

use arm_vm::{HaltReason, Machine};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Tick budget per run invocation
    #[arg(long, default_value_t = 1000)]
    ticks: u64,

    /// Single-step instead of running with a budget
    #[arg(long)]
    step: bool,

    /// Initial value of r0
    #[arg(long, default_value_t = 3)]
    r0: u32,

    /// Initial value of r1
    #[arg(long, default_value_t = 4)]
    r1: u32,

    /// Guest RAM size in KiB
    #[arg(long, default_value_t = 256)]
    ram_kib: usize,

    /// Disable the direct-access memory fast path
    #[arg(long)]
    no_fastmem: bool,
}

const CODE_BASE: u32 = 0x1000;

// add r0, r0, r1 ; svc #0
const DEMO: &[u32] = &[0xe080_0001, 0xef00_0000];

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let args = Args::parse();

    let mut machine = Machine::new(args.ram_kib * 1024, 1, !args.no_fastmem);
    machine.load_code(CODE_BASE, DEMO)?;

    let sp = machine.default_sp();
    let thread = machine.spawn_thread(CODE_BASE, sp);
    machine.switch_to(thread)?;
    machine.cpu_mut().regs_mut()[0] = args.r0;
    machine.cpu_mut().regs_mut()[1] = args.r1;

    if args.step {
        loop {
            let reason = machine.step_current()?;
            if reason != HaltReason::StepComplete {
                report(&machine, reason, None);
                break;
            }
        }
    } else {
        let (reason, left) = machine.run_current(args.ticks)?;
        report(&machine, reason, Some(args.ticks - left));
    }

    Ok(())
}

fn report(machine: &Machine, reason: HaltReason, consumed: Option<u64>) {
    println!("halt: {reason:?} (code {})", reason.to_code());
    if let Some(ticks) = consumed {
        println!("ticks consumed: {ticks}");
    }
    println!("r0 = {}", machine.cpu().regs()[0]);
    machine.cpu().dump_regs();
}
