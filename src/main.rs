use anyhow::{bail, Result};
use clap::Parser;
use log::{error, info};

use tessera::common::DimSize;
use tessera::config::{FailurePolicy, LoweringConfig};
use tessera::demos;
use tessera::kernel::Kernel;
use tessera::lowering::LoweringSession;
use tessera::pprint::pprint_module;

#[cfg(not(target_env = "msvc"))]
use tikv_jemallocator::Jemalloc;

#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Warps per CTA
    #[arg(long, default_value = "4")]
    num_warps: DimSize,

    /// Threads per warp
    #[arg(long, default_value = "32")]
    threads_per_warp: DimSize,

    /// What to do when an op fails to lower
    #[arg(long, value_enum, default_value_t = FailurePolicy::Abort)]
    failure_policy: FailurePolicy,

    /// Alignment of shared-memory buffers, in bytes
    #[arg(long, default_value_t = 128)]
    smem_alignment: u32,

    /// Print the input kernels before lowering
    #[arg(long)]
    print_kernels: bool,

    #[command(subcommand)]
    kernel: KernelChoice,
}

#[derive(clap::Subcommand)]
enum KernelChoice {
    #[command(about = "Broadcast a row across a tile")]
    Broadcast,
    #[command(about = "Offset a scalar pointer and a tensor of pointers")]
    AddPtr,
    #[command(about = "Allocate a pipelined shared buffer and slice a stage out of it")]
    AllocSlice,
    #[command(about = "Print the program id and a range from every thread")]
    Printf {
        #[arg(long, default_value = "pid, x, h, i: ")]
        prefix: String,
    },
    #[command(about = "Wait on outstanding asynchronous copies")]
    AsyncWait {
        #[arg(default_value = "0")]
        num: u32,
    },
    #[command(about = "Build a distributed range")]
    MakeRange {
        #[arg(long, default_value = "0")]
        start: u32,
        end: u32,
    },
    #[command(about = "Lower every demonstration kernel into one module")]
    All,
}

fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();

    let kernels: Vec<Kernel> = match &args.kernel {
        KernelChoice::Broadcast => vec![demos::broadcast_kernel()?],
        KernelChoice::AddPtr => vec![demos::add_ptr_kernel()?],
        KernelChoice::AllocSlice => vec![demos::alloc_slice_kernel()?],
        KernelChoice::Printf { prefix } => vec![demos::printf_kernel(prefix)?],
        KernelChoice::AsyncWait { num } => vec![demos::async_wait_kernel(*num)?],
        KernelChoice::MakeRange { start, end } => vec![demos::make_range_kernel(*start, *end)?],
        KernelChoice::All => demos::all_kernels()?,
    };

    let config = LoweringConfig {
        num_warps: args.num_warps,
        threads_per_warp: args.threads_per_warp,
        failure_policy: args.failure_policy,
        smem_alignment: args.smem_alignment,
    };
    let mut session = LoweringSession::new(config);
    let mut failures = 0;
    for kernel in &kernels {
        if args.print_kernels {
            println!("{kernel}\n");
        }
        info!("Lowering kernel @{}", kernel.name);
        if let Err(diagnostics) = session.lower_kernel(kernel) {
            for diagnostic in &diagnostics {
                error!("{diagnostic}");
            }
            failures += diagnostics.len();
        }
    }

    print!("{}", pprint_module(session.module()));
    if failures > 0 {
        bail!("{failures} op(s) failed to lower");
    }
    Ok(())
}
