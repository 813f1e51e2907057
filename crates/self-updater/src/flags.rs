//! Typed bit-flag sets for package policy.
//!
//! Both sets serialize as their raw integer value so manifests can carry
//! combinations such as `VERSION_COMPARE | SKIP_IF_NOT_EXIST` (9).

use std::fmt;
use std::ops::{BitAnd, BitOr, BitOrAssign};

use serde::{Deserialize, Serialize};

macro_rules! flag_set {
    (
        $(#[$meta:meta])*
        $name:ident {
            $( $(#[$fmeta:meta])* $flag:ident = $bits:expr => $label:literal, )+
        }
    ) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(u8);

        impl $name {
            /// No flag set.
            pub const NONE: Self = Self(0);
            $( $(#[$fmeta])* pub const $flag: Self = Self($bits); )+

            const NAMED: &'static [(Self, &'static str)] = &[ $( (Self::$flag, $label), )+ ];

            /// Build a set from raw bits, dropping unknown bits.
            pub const fn from_bits_truncate(bits: u8) -> Self {
                Self(bits & (0 $( | $bits )+))
            }

            pub const fn bits(self) -> u8 {
                self.0
            }

            pub const fn is_empty(self) -> bool {
                self.0 == 0
            }

            /// True when every bit of `other` is set. An empty `other` is never contained.
            pub const fn contains(self, other: Self) -> bool {
                other.0 != 0 && self.0 & other.0 == other.0
            }

            /// True when any bit of `other` is set.
            pub const fn intersects(self, other: Self) -> bool {
                self.0 & other.0 != 0
            }

            pub fn insert(&mut self, other: Self) {
                self.0 |= other.0;
            }

            pub fn remove(&mut self, other: Self) {
                self.0 &= !other.0;
            }
        }

        impl BitOr for $name {
            type Output = Self;
            fn bitor(self, rhs: Self) -> Self {
                Self(self.0 | rhs.0)
            }
        }

        impl BitOrAssign for $name {
            fn bitor_assign(&mut self, rhs: Self) {
                self.0 |= rhs.0;
            }
        }

        impl BitAnd for $name {
            type Output = Self;
            fn bitand(self, rhs: Self) -> Self {
                Self(self.0 & rhs.0)
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), self)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                if self.is_empty() {
                    return f.write_str("none");
                }
                let names: Vec<&str> = Self::NAMED
                    .iter()
                    .filter(|(flag, _)| self.contains(*flag))
                    .map(|(_, label)| *label)
                    .collect();
                f.write_str(&names.join(" | "))
            }
        }
    };
}

flag_set! {
    /// How a package decides whether it needs to be installed.
    UpdateMethod {
        /// Compare the local file against the declared expectations.
        VERSION_COMPARE = 1 => "VersionCompare",
        /// Never replace an existing local file.
        SKIP_IF_EXISTS = 2 => "SkipIfExists",
        /// Carried for manifest compatibility; selection does not act on it.
        IGNORE = 4 => "Ignore",
        /// Do not install when there is no local file yet.
        SKIP_IF_NOT_EXIST = 8 => "SkipIfNotExist",
        /// Always install.
        ALWAYS = 16 => "Always",
    }
}

flag_set! {
    /// Which properties of a local file are compared against the package.
    VerificationLevel {
        SIZE = 1 => "Size",
        VERSION = 2 => "Version",
        HASH = 4 => "Hash",
    }
}
