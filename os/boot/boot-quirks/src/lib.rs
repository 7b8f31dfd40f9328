//! # Platform Quirks
//!
//! Some firmware gets the handoff wrong in ways that can only be recognized
//! by who built the machine. This crate maps platform identification strings
//! to [`QuirkBits`] that the rest of the handoff consults.
//!
//! ```rust
//! # use boot_quirks::*;
//! let platform = PlatformId {
//!     manufacturer: Some("Dell Inc."),
//!     product: Some("PowerEdge T320"),
//!     ..PlatformId::default()
//! };
//! let quirks = QuirkDatabase::builtin().lookup(&platform);
//! assert!(quirks.contains(QuirkBits::RTS_OLD_AND_NEW | QuirkBits::RTS_UNKNOWN_MEM));
//! ```

#![cfg_attr(not(any(test, doctest)), no_std)]

use log::debug;

bitflags::bitflags! {
    /// Behavioral overrides for known-broken platforms.
    #[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash)]
    pub struct QuirkBits: u64 {
        /// Runtime services must not be relocated at all.
        const RTS_UNSUPPORTED = 1 << 0;

        /// Firmware keeps using physical addresses after `SetVirtualAddressMap`,
        /// so old and new mappings must both be live during the call.
        const RTS_OLD_AND_NEW = 1 << 1;

        /// Firmware touches memory it never reported as runtime; policies
        /// that move regions relative to each other are unsafe.
        const RTS_UNKNOWN_MEM = 1 << 2;

        /// The boot framebuffer is unusable.
        const FB_BROKEN = 1 << 3;

        /// A network controller keeps doing DMA after boot services exit
        /// unless it is stopped first.
        const NET_DEV_DISABLE = 1 << 4;
    }
}

/// Identification strings of the running platform.
///
/// Manufacturer, product, firmware version and date come from SMBIOS when
/// available; the firmware vendor comes from the system table.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct PlatformId<'a> {
    pub manufacturer: Option<&'a str>,
    pub product: Option<&'a str>,
    pub version: Option<&'a str>,
    pub date: Option<&'a str>,
    pub firmware_vendor: Option<&'a str>,
}

impl PlatformId<'_> {
    /// Whether any SMBIOS-derived string is known.
    #[must_use]
    pub const fn has_smbios(&self) -> bool {
        self.manufacturer.is_some()
            || self.product.is_some()
            || self.version.is_some()
            || self.date.is_some()
    }
}

/// One table entry. Optional fields must match exactly when present.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct QuirkRecord {
    pub manufacturer: &'static str,
    pub product: &'static str,
    pub version: Option<&'static str>,
    pub date: Option<&'static str>,
    pub quirks: QuirkBits,
}

impl QuirkRecord {
    #[must_use]
    pub fn matches(&self, platform: &PlatformId<'_>) -> bool {
        self.manufacturer == platform.manufacturer.unwrap_or("")
            && self.product == platform.product.unwrap_or("")
            && self.version.is_none_or(|v| Some(v) == platform.version)
            && self.date.is_none_or(|d| Some(d) == platform.date)
    }
}

const BUILTIN: &[QuirkRecord] = &[
    QuirkRecord {
        manufacturer: "Dell Inc.",
        product: "PowerEdge T320",
        version: None,
        date: None,
        quirks: QuirkBits::RTS_OLD_AND_NEW.union(QuirkBits::RTS_UNKNOWN_MEM),
    },
    QuirkRecord {
        manufacturer: "GIGABYTE",
        product: "MT30-GS2-00",
        version: Some("T48"),
        date: None,
        quirks: QuirkBits::FB_BROKEN,
    },
];

/// Vendor whose network controllers keep DMAing after exit.
const NET_DEV_DISABLE_VENDOR: &str = "Apple";

#[derive(Copy, Clone, Debug)]
pub struct QuirkDatabase {
    records: &'static [QuirkRecord],
}

impl Default for QuirkDatabase {
    fn default() -> Self {
        Self::builtin()
    }
}

impl QuirkDatabase {
    #[must_use]
    pub const fn builtin() -> Self {
        Self { records: BUILTIN }
    }

    #[must_use]
    pub const fn with_records(records: &'static [QuirkRecord]) -> Self {
        Self { records }
    }

    #[must_use]
    pub const fn records(&self) -> &'static [QuirkRecord] {
        self.records
    }

    /// Quirks for `platform`; the first matching record wins.
    #[must_use]
    pub fn lookup(&self, platform: &PlatformId<'_>) -> QuirkBits {
        let mut quirks = QuirkBits::empty();
        if platform.firmware_vendor == Some(NET_DEV_DISABLE_VENDOR) {
            quirks |= QuirkBits::NET_DEV_DISABLE;
        }

        if !platform.has_smbios() {
            debug!("no platform strings to match quirks on");
            return quirks;
        }

        debug!(
            "looking up quirks for '{}' '{}' '{}' '{}'",
            platform.manufacturer.unwrap_or(""),
            platform.product.unwrap_or(""),
            platform.version.unwrap_or(""),
            platform.date.unwrap_or("")
        );
        if let Some(record) = self.records.iter().find(|r| r.matches(platform)) {
            quirks |= record.quirks;
            debug!("matched quirks {quirks:?}");
        }
        quirks
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn platform<'a>(
        manufacturer: &'a str,
        product: &'a str,
        version: Option<&'a str>,
    ) -> PlatformId<'a> {
        PlatformId {
            manufacturer: Some(manufacturer),
            product: Some(product),
            version,
            ..PlatformId::default()
        }
    }

    #[test]
    fn record_without_version_matches_any_version() {
        let db = QuirkDatabase::builtin();
        let quirks = db.lookup(&platform("Dell Inc.", "PowerEdge T320", Some("2.4.2")));
        assert_eq!(quirks, QuirkBits::RTS_OLD_AND_NEW | QuirkBits::RTS_UNKNOWN_MEM);
    }

    #[test]
    fn optional_fields_must_match_when_specified() {
        let db = QuirkDatabase::builtin();
        assert_eq!(
            db.lookup(&platform("GIGABYTE", "MT30-GS2-00", Some("T48"))),
            QuirkBits::FB_BROKEN
        );
        assert!(db.lookup(&platform("GIGABYTE", "MT30-GS2-00", Some("T49"))).is_empty());
        // A missing version is compared as an empty string.
        assert!(db.lookup(&platform("GIGABYTE", "MT30-GS2-00", None)).is_empty());
    }

    #[test]
    fn unknown_platform_has_no_quirks() {
        let db = QuirkDatabase::builtin();
        assert!(db.lookup(&platform("QEMU", "Standard PC (Q35 + ICH9, 2009)", None)).is_empty());
        assert!(db.lookup(&PlatformId::default()).is_empty());
    }

    #[test]
    fn apple_firmware_disables_network_devices() {
        let db = QuirkDatabase::builtin();
        let apple = PlatformId {
            firmware_vendor: Some("Apple"),
            ..PlatformId::default()
        };
        assert_eq!(db.lookup(&apple), QuirkBits::NET_DEV_DISABLE);

        let not_apple = PlatformId {
            firmware_vendor: Some("Apple Inc."),
            ..platform("Dell Inc.", "PowerEdge T320", None)
        };
        assert!(!db.lookup(&not_apple).contains(QuirkBits::NET_DEV_DISABLE));
    }

    #[test]
    fn first_match_wins() {
        static RECORDS: &[QuirkRecord] = &[
            QuirkRecord {
                manufacturer: "ACME",
                product: "Box",
                version: None,
                date: None,
                quirks: QuirkBits::RTS_UNSUPPORTED,
            },
            QuirkRecord {
                manufacturer: "ACME",
                product: "Box",
                version: None,
                date: Some("01/01/2020"),
                quirks: QuirkBits::FB_BROKEN,
            },
        ];
        let db = QuirkDatabase::with_records(RECORDS);
        let mut id = platform("ACME", "Box", None);
        id.date = Some("01/01/2020");
        assert_eq!(db.lookup(&id), QuirkBits::RTS_UNSUPPORTED);
    }
}
