//! Boot-time configuration, held behind the same singleton-spinlock pattern
//! as the root page table (`os/src/bin/kernel/vm.rs::ADDRESS_SPACE`).

use crate::sync::SpinLock;

/// Settings fixed at boot and read for the lifetime of the hypervisor.
#[derive(Debug, Clone, Copy)]
pub struct Config {
    /// Width of the IPA space in bits (spec fixes this at 36).
    pub ipa_bits: u32,
    /// I/O device id treated as the boot console / fixed BOOT-reply target.
    pub console_iodev: usize,
    /// Forces an I/O device flush after every `MMIOTRACE` event regardless
    /// of the triggering PTE's `SYNC_TRACE` bit, for hosts whose transport
    /// buffers aggressively.
    pub force_sync_trace: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            ipa_bits: 36,
            console_iodev: crate::iodevice::CONSOLE_IODEV,
            force_sync_trace: false,
        }
    }
}

static CONFIG: SpinLock<Config> = SpinLock::new(Config {
    ipa_bits: 36,
    console_iodev: crate::iodevice::CONSOLE_IODEV,
    force_sync_trace: false,
});

/// Overwrites the global configuration. Called once at boot.
pub fn set(config: Config) {
    *CONFIG.lock() = config;
}

/// Reads a copy of the current configuration.
pub fn get() -> Config {
    *CONFIG.lock()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec_constants() {
        let config = Config::default();
        assert_eq!(config.ipa_bits, 36);
        assert_eq!(config.console_iodev, crate::iodevice::CONSOLE_IODEV);
        assert!(!config.force_sync_trace);
    }

    #[test]
    fn set_then_get_round_trips() {
        set(Config {
            ipa_bits: 36,
            console_iodev: 2,
            force_sync_trace: true,
        });
        let config = get();
        assert_eq!(config.console_iodev, 2);
        assert!(config.force_sync_trace);
        set(Config::default());
    }
}
