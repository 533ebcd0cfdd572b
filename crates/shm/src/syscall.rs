//! The system call boundary.
//!
//! Arguments arrive in the trap frame's argument registers and the call number in `a7`. The
//! result goes back in `a0`; every failure collapses to `-1`, so callers only ever learn
//! success or failure.

use crate::{Kernel, Pid, ShmError};

pub const SYS_GETPID: usize = 11;
pub const SYS_SBRK: usize = 12;
pub const SYS_MAP_SHARED_PAGES: usize = 22;
pub const SYS_UNMAP_SHARED_PAGES: usize = 23;

/// The failure value, `-1` as seen by user space.
pub const SYSCALL_ERROR: usize = usize::MAX;

/// Saved user registers relevant to system calls.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TrapFrame {
    pub a0: usize,
    pub a1: usize,
    pub a2: usize,
    pub a3: usize,
    pub a4: usize,
    pub a5: usize,
    pub a7: usize,
}

impl TrapFrame {
    /// Builds a frame for call `number` with the given leading arguments.
    pub fn call(number: usize, args: &[usize]) -> Self {
        let mut frame = Self {
            a7: number,
            ..Self::default()
        };
        for (n, &value) in args.iter().enumerate() {
            frame.set_arg(n, value);
        }
        frame
    }

    /// Fetches raw argument `n`.
    ///
    /// # Panics
    ///
    /// Panics if `n` is not an argument register (0 to 5).
    pub fn arg_raw(&self, n: usize) -> usize {
        match n {
            0 => self.a0,
            1 => self.a1,
            2 => self.a2,
            3 => self.a3,
            4 => self.a4,
            5 => self.a5,
            _ => panic!("syscall argument {} out of range", n),
        }
    }

    /// Fetches argument `n` as a signed integer.
    pub fn arg_int(&self, n: usize) -> isize {
        self.arg_raw(n) as isize
    }

    /// Fetches argument `n` as a user address.
    pub fn arg_addr(&self, n: usize) -> usize {
        self.arg_raw(n)
    }

    /// The value left in `a0`, read as a signed result.
    pub fn result(&self) -> isize {
        self.a0 as isize
    }

    fn set_arg(&mut self, n: usize, value: usize) {
        match n {
            0 => self.a0 = value,
            1 => self.a1 = value,
            2 => self.a2 = value,
            3 => self.a3 = value,
            4 => self.a4 = value,
            5 => self.a5 = value,
            _ => panic!("syscall argument {} out of range", n),
        }
    }
}

impl Kernel {
    /// Runs the system call in `frame` on behalf of `pid` and stores the result in `a0`.
    pub fn syscall(&self, pid: Pid, frame: &mut TrapFrame) {
        let result = match frame.a7 {
            SYS_GETPID => Ok(pid.as_usize()),
            SYS_SBRK => self
                .sbrk(pid, frame.arg_int(0))
                .map(|old| old.as_usize()),
            SYS_MAP_SHARED_PAGES => target_pid(frame.arg_int(0)).and_then(|target| {
                self.map_shared_pages(pid, target, frame.arg_addr(1), frame.arg_addr(2))
                    .map(|va| va.as_usize())
            }),
            SYS_UNMAP_SHARED_PAGES => self
                .unmap_shared_pages(pid, frame.arg_addr(0), frame.arg_addr(1))
                .map(|()| 0),
            number => {
                log::warn!("{}: unknown syscall {}", pid, number);
                frame.a0 = SYSCALL_ERROR;
                return;
            }
        };
        frame.a0 = result.unwrap_or(SYSCALL_ERROR);
    }
}

fn target_pid(raw: isize) -> Result<Pid, ShmError> {
    usize::try_from(raw)
        .ok()
        .and_then(Pid::new)
        .ok_or(ShmError::NoSuchProcess)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::KernelConfig;
    use pmm::PAGE_SIZE;

    fn kernel() -> (Kernel, Pid) {
        let kernel = Kernel::new(KernelConfig::default().with_frames(512));
        let pid = kernel.spawn("init").unwrap();
        (kernel, pid)
    }

    fn run(kernel: &Kernel, pid: Pid, number: usize, args: &[usize]) -> isize {
        let mut frame = TrapFrame::call(number, args);
        kernel.syscall(pid, &mut frame);
        frame.result()
    }

    #[test]
    fn arguments_come_from_argument_registers() {
        let frame = TrapFrame::call(SYS_SBRK, &[1, 2, usize::MAX]);
        assert_eq!(frame.a7, SYS_SBRK);
        assert_eq!(frame.arg_int(0), 1);
        assert_eq!(frame.arg_addr(1), 2);
        assert_eq!(frame.arg_int(2), -1);
    }

    #[test]
    #[should_panic(expected = "syscall argument 6 out of range")]
    fn seventh_argument_panics() {
        TrapFrame::default().arg_raw(6);
    }

    #[test]
    fn getpid_and_sbrk() {
        let (kernel, pid) = kernel();
        assert_eq!(run(&kernel, pid, SYS_GETPID, &[]), pid.as_usize() as isize);
        assert_eq!(run(&kernel, pid, SYS_SBRK, &[64]), PAGE_SIZE as isize);
        assert_eq!(
            run(&kernel, pid, SYS_SBRK, &[(-64isize) as usize]),
            (PAGE_SIZE + 64) as isize
        );
        assert_eq!(kernel.process_size(pid), Ok(PAGE_SIZE));
    }

    #[test]
    fn shared_memory_calls_round_trip() {
        let (kernel, parent) = kernel();
        let child = kernel.fork(parent).unwrap();

        let va = run(&kernel, parent, SYS_MAP_SHARED_PAGES, &[child.as_usize(), 0, PAGE_SIZE]);
        assert_eq!(va, PAGE_SIZE as isize);
        assert_eq!(
            run(&kernel, child, SYS_UNMAP_SHARED_PAGES, &[va as usize, PAGE_SIZE]),
            0
        );
    }

    #[test]
    fn failures_collapse_to_minus_one() {
        let (kernel, pid) = kernel();
        // Unknown target, negative target, unaligned size, nothing to unmap, bad number.
        assert_eq!(run(&kernel, pid, SYS_MAP_SHARED_PAGES, &[999, 0, PAGE_SIZE]), -1);
        assert_eq!(
            run(&kernel, pid, SYS_MAP_SHARED_PAGES, &[(-3isize) as usize, 0, PAGE_SIZE]),
            -1
        );
        assert_eq!(run(&kernel, pid, SYS_MAP_SHARED_PAGES, &[pid.as_usize(), 0, 100]), -1);
        assert_eq!(run(&kernel, pid, SYS_UNMAP_SHARED_PAGES, &[0, PAGE_SIZE]), -1);
        assert_eq!(run(&kernel, pid, 99, &[]), -1);
        assert_eq!(run(&kernel, pid, SYS_SBRK, &[(-4096isize) as usize]), -1);
    }
}
