//! Fixed-size limits baked into the kernel at compile time.
use static_assertions::const_assert;

/// Maximum number of processes held live in the process table at once.
pub const NPROC: usize = 64;

/// Maximum number of CPUs.
pub const NCPU: usize = 8;

/// Maximum number of child slots a process may address via PUT/GET.
pub const PROC_CHILDREN: usize = 256;

/// Depth of the return-address chain captured on spinlock acquire.
pub const DEBUG_TRACEFRAMES: usize = 10;

// The table must hold at least one process per CPU, or `sched` can starve a
// CPU permanently with no candidate to dispatch.
const_assert!(NPROC >= NCPU);
