//! Replays the shared memory user test against an in-process kernel.
//!
//! A parent grows its heap, forks, and maps the buffer into the child. The child writes a
//! greeting through its mapping, and the parent reads it back through its own buffer. The
//! child then either unmaps and allocates again, or (`--no-unmap`) exits and leaves the
//! cleanup to the kernel.

use clap::Parser;
use log::LevelFilter;

use shm::{
    Kernel, KernelConfig, Pid, TrapFrame,
    syscall::{SYS_GETPID, SYS_MAP_SHARED_PAGES, SYS_SBRK, SYS_UNMAP_SHARED_PAGES},
};

const TEST_SIZE: usize = 4096;
const TEST_STRING: &str = "Hello daddy";

#[derive(Parser)]
#[command(name = "shmtest")]
#[command(about = "Shared memory mapping test")]
struct Args {
    /// Let the child exit without unmapping the shared buffer
    #[arg(long)]
    no_unmap: bool,

    /// Number of physical frames in the pool
    #[arg(long, default_value_t = KernelConfig::default().frames)]
    frames: usize,

    /// Log every page table update
    #[arg(short, long)]
    verbose: bool,
}

struct StderrLogger;

static LOGGER: StderrLogger = StderrLogger;

impl log::Log for StderrLogger {
    fn enabled(&self, _metadata: &log::Metadata) -> bool {
        true
    }

    fn log(&self, record: &log::Record) {
        #[cfg(any(debug_assertions, feature = "detailed-logging"))]
        eprintln!(
            "[{} {}:{} {}] {}",
            record.level(),
            record.file().unwrap_or("unknown"),
            record.line().unwrap_or(0),
            record.target(),
            record.args()
        );
        #[cfg(not(any(debug_assertions, feature = "detailed-logging")))]
        eprintln!("[{:5}] {}", record.level(), record.args());
    }

    fn flush(&self) {}
}

/// Issues one system call as `pid`; `None` stands for a `-1` return.
fn syscall(kernel: &Kernel, pid: Pid, number: usize, args: &[usize]) -> Option<usize> {
    let mut frame = TrapFrame::call(number, args);
    kernel.syscall(pid, &mut frame);
    (frame.result() >= 0).then_some(frame.a0)
}

fn print_size(kernel: &Kernel, label: &str, pid: Pid) {
    let size = syscall(kernel, pid, SYS_SBRK, &[0]).unwrap_or(0);
    println!("{} (PID {}): size = {:#x}", label, pid, size);
}

fn read_string(
    kernel: &Kernel,
    pid: Pid,
    va: usize,
) -> Result<String, Box<dyn std::error::Error>> {
    let mut buf = [0u8; TEST_STRING.len()];
    kernel.read_user(pid, va, &mut buf)?;
    Ok(String::from_utf8_lossy(&buf).into_owned())
}

fn run(args: &Args) -> Result<(), Box<dyn std::error::Error>> {
    let kernel = Kernel::new(KernelConfig::default().with_frames(args.frames));

    if args.no_unmap {
        println!("Running test with no unmapping in child");
    }
    println!("=== Shared Memory Test ===");

    let parent = kernel.spawn("shmem_test")?;
    let buffer = syscall(&kernel, parent, SYS_SBRK, &[TEST_SIZE]).ok_or("sbrk failed")?;
    kernel.write_user(parent, buffer, &[0; TEST_SIZE])?;
    println!("Parent allocated buffer at {:#x}", buffer);
    print_size(&kernel, "Parent before fork", parent);

    let child = kernel.fork(parent)?;
    let child_id = syscall(&kernel, child, SYS_GETPID, &[]).ok_or("getpid failed")?;
    println!("\nChild process started (PID {})", child_id);
    print_size(&kernel, "Child before mapping", child);

    println!("\nParent mapping memory to child (PID {})", child);
    let shared = syscall(
        &kernel,
        parent,
        SYS_MAP_SHARED_PAGES,
        &[child_id, buffer, TEST_SIZE],
    )
    .ok_or("Parent: map_shared_pages failed")?;
    println!("Parent: mapped buffer to child at address {:#x}", shared);
    print_size(&kernel, "Child after mapping", child);

    kernel.write_user(child, shared, TEST_STRING.as_bytes())?;
    println!("Child: wrote '{}' to shared memory", TEST_STRING);

    if !args.no_unmap {
        syscall(&kernel, child, SYS_UNMAP_SHARED_PAGES, &[shared, TEST_SIZE])
            .ok_or("Child: unmap_shared_pages failed")?;
        println!("Child: unmapped shared memory");
        print_size(&kernel, "Child after unmapping", child);

        syscall(&kernel, child, SYS_SBRK, &[1024])
            .ok_or("Child: malloc failed after unmapping")?;
        println!("Child: malloc succeeded after unmapping");
        print_size(&kernel, "Child after malloc", child);
    } else {
        println!("Child: skipping unmap (testing cleanup on exit)");
    }

    println!("\nParent reading from buffer: '{}'", read_string(&kernel, parent, buffer)?);

    println!("Child exiting");
    kernel.exit(child)?;
    kernel.reap(child)?;
    println!("Child completed successfully");

    println!("Parent final read from buffer: '{}'", read_string(&kernel, parent, buffer)?);
    print_size(&kernel, "Parent after child exit", parent);

    kernel.exit(parent)?;
    kernel.reap(parent)?;
    log::info!(
        "{} of {} frames free, {} mappings live",
        kernel.pmm().free_frames(),
        kernel.pmm().total_frames(),
        kernel.mapping_count()
    );

    println!("\n=== Test completed ===");
    Ok(())
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    log::set_logger(&LOGGER).map_err(|err| err.to_string())?;
    log::set_max_level(if args.verbose {
        LevelFilter::Trace
    } else {
        LevelFilter::Info
    });

    run(&args)
}
