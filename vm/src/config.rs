use kidneyos_shared::mem::USER_STACK_LIMIT;

/// Run-time knobs for the virtual memory subsystem.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VmConfig {
    /// How far below `OFFSET` the user stack may grow, in bytes.
    pub stack_limit: usize,
    /// How far below the user stack pointer a fault still counts as a stack
    /// access. `PUSHA` touches 32 bytes below `esp` before moving it.
    pub stack_slack: usize,
    /// Full passes the clock hand makes before giving up on finding a victim.
    pub clock_revolutions: usize,
}

impl Default for VmConfig {
    fn default() -> Self {
        Self {
            stack_limit: USER_STACK_LIMIT,
            stack_slack: 32,
            clock_revolutions: 3,
        }
    }
}
