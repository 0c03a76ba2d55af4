//! Module type enumeration and the compile-time capability table.
//!
//! All per-module behavioral differences are expressed as field lookups
//! into a single [`ModuleCaps`] row. There is no other runtime dispatch on
//! module identity anywhere in the crate: "which module variant" is a
//! lookup, not a trait hierarchy.

use embassy_time::Duration;

// A tiny hand-rolled `bitflags!`-alike: pulling in the real `bitflags`
// crate for one 17-bit mask isn't worth a new dependency, but the shape
// (named consts + union/contains) matches how IRQ mask constants are
// exposed elsewhere in this style of driver.
macro_rules! bitflags_like {
    (
        $(#[$meta:meta])*
        pub struct $name:ident: $ty:ty {
            $(const $flag:ident = $val:expr;)*
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        #[cfg_attr(feature = "defmt", derive(defmt::Format))]
        pub struct $name($ty);

        impl $name {
            $(pub const $flag: $name = $name($val);)*

            pub const fn union(self, other: Self) -> Self {
                $name(self.0 | other.0)
            }

            pub const fn contains(self, other: Self) -> bool {
                (self.0 & other.0) == other.0
            }

            pub const fn bits(self) -> $ty {
                self.0
            }
        }
    };
}

/// Closed enumeration of supported module types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ModuleType {
    SaraU201,
    SaraR410M02B,
    SaraR412M02B,
    SaraR412M03B,
    SaraR5,
    SaraR410M03B,
    SaraR422,
    LaraR6,
}

bitflags_like! {
    /// ~25 boolean feature bits. Kept as a bitflags-style `u32` rather than
    /// individual `bool` fields so capability checks read as a single mask
    /// test.
    pub struct Feature: u32 {
        const CONTEXT_MAPPING_REQUIRED = 1 << 0;
        const POWER_SAVING_3GPP        = 1 << 1;
        const ROOT_OF_TRUST            = 1 << 2;
        const MQTT                     = 1 << 3;
        const EDRX                     = 1 << 4;
        const HTTP                     = 1 << 5;
        const SOCKETS                  = 1 << 6;
        const GNSS                     = 1 << 7;
        const WIFI                     = 1 << 8;
        const BLE                      = 1 << 9;
        const FILE_SYSTEM               = 1 << 10;
        const CHIP_TO_CHIP_SECURITY    = 1 << 11;
        const PPP                      = 1 << 12;
        const CMUX                     = 1 << 13;
        const AUTO_BAUD                = 1 << 14;
        const DTR_POWER_SAVING         = 1 << 15;
        const MQTT_KEEP_ALIVE          = 1 << 16;
    }
}

/// Immutable per-module behavioral row. Looked up once at `Device::open`
/// time and never mutated.
#[derive(Debug, Clone, Copy)]
pub struct ModuleCaps {
    pub module: ModuleType,
    pub power_on_pulse: Duration,
    pub power_off_pulse: Duration,
    pub boot_wait: Duration,
    pub at_response_timeout: Duration,
    pub min_command_gap: Duration,
    pub max_response_wait: Duration,
    pub radio_off_cfun: u8,
    pub reset_hold: Duration,
    /// Bitmask of supported RATs; bit meaning is upper-layer-defined, the
    /// core only ever passes it through.
    pub supported_rat: u32,
    pub features: Feature,
    pub max_cmux_channels: usize,
    pub ppp_channel_id: u8,
    pub cmux_max_frame_size: usize,
}

impl ModuleType {
    /// Returns the immutable capability row for this module type.
    pub fn caps(self) -> ModuleCaps {
        match self {
            ModuleType::SaraU201 => ModuleCaps {
                module: self,
                power_on_pulse: Duration::from_millis(1),
                power_off_pulse: Duration::from_millis(1500),
                boot_wait: Duration::from_secs(6),
                at_response_timeout: Duration::from_secs(8),
                min_command_gap: Duration::from_millis(20),
                max_response_wait: Duration::from_secs(180),
                radio_off_cfun: 0,
                reset_hold: Duration::from_millis(50),
                supported_rat: 0b0001, // 2G only
                features: Feature::CMUX.union(Feature::PPP),
                max_cmux_channels: 4,
                ppp_channel_id: 2,
                cmux_max_frame_size: 1509,
            },
            ModuleType::SaraR410M02B => ModuleCaps {
                module: self,
                power_on_pulse: Duration::from_millis(300),
                power_off_pulse: Duration::from_millis(1500),
                boot_wait: Duration::from_secs(6),
                at_response_timeout: Duration::from_secs(10),
                min_command_gap: Duration::from_secs(1),
                max_response_wait: Duration::from_secs(180),
                radio_off_cfun: 4,
                reset_hold: Duration::from_millis(100),
                supported_rat: 0b0110, // CatM1 + NB-IoT
                features: Feature::CMUX
                    .union(Feature::PPP)
                    .union(Feature::CONTEXT_MAPPING_REQUIRED)
                    .union(Feature::POWER_SAVING_3GPP)
                    .union(Feature::EDRX),
                max_cmux_channels: 4,
                ppp_channel_id: 2,
                cmux_max_frame_size: 1509,
            },
            ModuleType::SaraR412M02B => ModuleCaps {
                module: self,
                ..ModuleType::SaraR410M02B.caps()
            },
            ModuleType::SaraR412M03B => ModuleCaps {
                module: self,
                ..ModuleType::SaraR410M02B.caps()
            },
            ModuleType::SaraR410M03B => ModuleCaps {
                module: self,
                ..ModuleType::SaraR410M02B.caps()
            },
            ModuleType::SaraR5 => ModuleCaps {
                module: self,
                power_on_pulse: Duration::from_millis(1500),
                power_off_pulse: Duration::from_millis(2000),
                boot_wait: Duration::from_secs(8),
                at_response_timeout: Duration::from_secs(10),
                min_command_gap: Duration::from_secs(2),
                max_response_wait: Duration::from_secs(180),
                radio_off_cfun: 4,
                reset_hold: Duration::from_millis(100),
                supported_rat: 0b0110,
                features: Feature::CMUX
                    .union(Feature::PPP)
                    .union(Feature::CONTEXT_MAPPING_REQUIRED)
                    .union(Feature::POWER_SAVING_3GPP)
                    .union(Feature::EDRX)
                    .union(Feature::ROOT_OF_TRUST)
                    .union(Feature::MQTT)
                    .union(Feature::HTTP)
                    .union(Feature::SOCKETS)
                    .union(Feature::GNSS)
                    .union(Feature::CHIP_TO_CHIP_SECURITY)
                    .union(Feature::FILE_SYSTEM),
                max_cmux_channels: 6,
                ppp_channel_id: 2,
                cmux_max_frame_size: 1509,
            },
            ModuleType::SaraR422 => ModuleCaps {
                module: self,
                power_on_pulse: Duration::from_millis(150),
                power_off_pulse: Duration::from_millis(1500),
                boot_wait: Duration::from_secs(6),
                at_response_timeout: Duration::from_secs(10),
                min_command_gap: Duration::from_secs(1),
                max_response_wait: Duration::from_secs(180),
                radio_off_cfun: 4,
                reset_hold: Duration::from_millis(100),
                supported_rat: 0b0110,
                // 3GPP power saving is disabled here despite hardware
                // support: re-entering sleep after a wake is unreliable on
                // this module. Encoded as policy, not as a hardware
                // limitation.
                features: Feature::CMUX
                    .union(Feature::PPP)
                    .union(Feature::CONTEXT_MAPPING_REQUIRED)
                    .union(Feature::EDRX)
                    .union(Feature::GNSS)
                    .union(Feature::SOCKETS),
                max_cmux_channels: 6,
                ppp_channel_id: 2,
                cmux_max_frame_size: 1509,
            },
            ModuleType::LaraR6 => ModuleCaps {
                module: self,
                power_on_pulse: Duration::from_millis(150),
                power_off_pulse: Duration::from_millis(1500),
                boot_wait: Duration::from_secs(6),
                at_response_timeout: Duration::from_secs(10),
                min_command_gap: Duration::from_secs(1),
                max_response_wait: Duration::from_secs(180),
                radio_off_cfun: 4,
                reset_hold: Duration::from_millis(100),
                supported_rat: 0b1111,
                features: Feature::CMUX
                    .union(Feature::PPP)
                    .union(Feature::POWER_SAVING_3GPP)
                    .union(Feature::EDRX)
                    .union(Feature::SOCKETS)
                    .union(Feature::WIFI)
                    .union(Feature::BLE),
                max_cmux_channels: 6,
                ppp_channel_id: 2,
                cmux_max_frame_size: 1509,
            },
        }
    }

    pub fn supports(self, feature: Feature) -> bool {
        self.caps().features.contains(feature)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sara_r422_disables_power_saving_despite_hw_support() {
        assert!(!ModuleType::SaraR422.supports(Feature::POWER_SAVING_3GPP));
    }

    #[test]
    fn sara_r5_has_root_of_trust_and_mqtt() {
        let caps = ModuleType::SaraR5.caps();
        assert!(caps.features.contains(Feature::ROOT_OF_TRUST));
        assert!(caps.features.contains(Feature::MQTT));
    }

    #[test]
    fn every_module_supports_cmux_and_ppp() {
        for m in [
            ModuleType::SaraU201,
            ModuleType::SaraR410M02B,
            ModuleType::SaraR412M02B,
            ModuleType::SaraR412M03B,
            ModuleType::SaraR5,
            ModuleType::SaraR410M03B,
            ModuleType::SaraR422,
            ModuleType::LaraR6,
        ] {
            assert!(m.supports(Feature::CMUX));
            assert!(m.supports(Feature::PPP));
        }
    }
}
