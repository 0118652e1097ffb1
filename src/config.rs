use std::time::Duration;

/// Wait after enabling Vpp before issuing further commands. The MAX680 on
/// the programmer takes a little while.
pub const DEFAULT_SETTLE_DELAY: Duration = Duration::from_millis(100);
/// Bulk transfer timeout of the USB pipes.
pub const DEFAULT_TRANSFER_TIMEOUT: Duration = Duration::from_secs(1);

/// Run-wide settings handed to the transport and the protocol engines.
#[derive(Debug, Clone)]
pub struct Config {
    /// Log every frame sent and received at info level rather than trace.
    pub print_txrx: bool,
    /// Delay after turning on Vpp (PIC16F/PIC18F).
    pub settle_delay: Duration,
    pub read_timeout: Duration,
    pub write_timeout: Duration,
    /// Consecutive empty reads tolerated while waiting for a PIC32MX
    /// response. `None` waits forever.
    pub idle_limit: Option<u32>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            print_txrx: false,
            settle_delay: DEFAULT_SETTLE_DELAY,
            read_timeout: DEFAULT_TRANSFER_TIMEOUT,
            write_timeout: DEFAULT_TRANSFER_TIMEOUT,
            idle_limit: None,
        }
    }
}
