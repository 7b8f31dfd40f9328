use boot_qemu::qemu_trace;
use core::sync::atomic::{AtomicBool, Ordering};
use log::{LevelFilter, Log, Metadata, Record, SetLoggerError};

static LOGGER: UefiLogger = UefiLogger::new(LevelFilter::Debug);

/// Logs to the QEMU debug port and, while boot services are up, the UEFI console.
pub struct UefiLogger {
    max_level: LevelFilter,
    boot_services_available: AtomicBool,
}

impl UefiLogger {
    #[must_use]
    const fn new(max_level: LevelFilter) -> Self {
        Self {
            max_level,
            boot_services_available: AtomicBool::new(true),
        }
    }

    /// Install the loader's logger. Call this once during early init.
    #[allow(clippy::missing_errors_doc)]
    pub fn init() -> Result<&'static Self, SetLoggerError> {
        log::set_logger(&LOGGER)?;
        log::set_max_level(LOGGER.max_level);
        Ok(&LOGGER)
    }

    /// Stop writing to the firmware console. It is gone after `ExitBootServices`.
    pub fn exit_boot_services() {
        LOGGER.boot_services_available.store(false, Ordering::SeqCst);
    }
}

impl Log for UefiLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.max_level
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }

        // Format straight into the port; no allocation.
        qemu_trace!(
            "[{}] {}: {}\n",
            record.level(),
            record.target(),
            record.args()
        );

        if self.boot_services_available.load(Ordering::SeqCst) {
            uefi::println!(
                "[{}] {}: {}",
                record.level(),
                record.target(),
                record.args()
            );
        }
    }

    fn flush(&self) {
        // no-op for qemu debug port
    }
}
