//! OS/arch tuples and the core platform set used for cross-platform validation.

use std::fmt;
use std::str::FromStr;

use crate::errors::HermitError;

/// An operating system hermit can materialize toolchains for
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Os {
    /// Linux, any distro
    Linux,
    /// macOS
    Darwin,
}

impl Os {
    /// The os string used in manifests and `${os}` substitution
    pub fn as_str(&self) -> &'static str {
        match self {
            Os::Linux => "linux",
            Os::Darwin => "darwin",
        }
    }
}

impl fmt::Display for Os {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Os {
    type Err = HermitError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "linux" => Ok(Os::Linux),
            // macOS shows up under both names in the wild
            "darwin" | "macos" => Ok(Os::Darwin),
            _ => Err(HermitError::msg(format!("unknown os {s:?}"))),
        }
    }
}

/// A CPU architecture hermit can materialize toolchains for
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Arch {
    /// 64-bit x86 (AKA x86_64)
    Amd64,
    /// 64-bit ARM (AKA aarch64)
    Arm64,
}

impl Arch {
    /// The arch string used in manifests and `${arch}` substitution
    pub fn as_str(&self) -> &'static str {
        match self {
            Arch::Amd64 => "amd64",
            Arch::Arm64 => "arm64",
        }
    }

    /// The alternate arch naming convention, for `${xarch}` substitution
    pub fn xarch(&self) -> &'static str {
        match self {
            Arch::Amd64 => "x86_64",
            Arch::Arm64 => "aarch64",
        }
    }
}

impl fmt::Display for Arch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Arch {
    type Err = HermitError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "amd64" | "x86_64" => Ok(Arch::Amd64),
            "arm64" | "aarch64" => Ok(Arch::Arm64),
            _ => Err(HermitError::msg(format!("unknown arch {s:?}"))),
        }
    }
}

/// A normalized (os, arch) tuple
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Platform {
    /// the operating system
    pub os: Os,
    /// the CPU architecture
    pub arch: Arch,
}

/// The platforms every manifest is validated against. A manifest that resolves
/// a source on none of these fails validation outright; per-platform failures
/// are warnings.
pub const CORE_PLATFORMS: [Platform; 4] = [
    Platform { os: Os::Linux, arch: Arch::Amd64 },
    Platform { os: Os::Linux, arch: Arch::Arm64 },
    Platform { os: Os::Darwin, arch: Arch::Amd64 },
    Platform { os: Os::Darwin, arch: Arch::Arm64 },
];

impl Platform {
    /// Create a platform from parts
    pub fn new(os: Os, arch: Arch) -> Self {
        Platform { os, arch }
    }

    /// The platform of the running process
    pub fn host() -> Platform {
        let os = if cfg!(target_os = "macos") { Os::Darwin } else { Os::Linux };
        let arch = if cfg!(target_arch = "aarch64") { Arch::Arm64 } else { Arch::Amd64 };
        Platform { os, arch }
    }

    /// Whether a `platform <attr>...` block applies to this platform.
    ///
    /// Attrs are matched as a set intersection: every attr must name either
    /// this platform's os or its arch.
    pub fn matches_attrs<S: AsRef<str>>(&self, attrs: &[S]) -> bool {
        attrs.iter().all(|attr| {
            let attr = attr.as_ref();
            attr == self.os.as_str() || attr == self.arch.as_str()
        })
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.os, self.arch)
    }
}

impl FromStr for Platform {
    type Err = HermitError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (os, arch) = s
            .split_once('-')
            .ok_or_else(|| HermitError::msg(format!("unknown platform {s:?}")))?;
        Ok(Platform { os: os.parse()?, arch: arch.parse()? })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn platform_attr_matching() {
        let p = Platform::new(Os::Linux, Arch::Amd64);
        assert!(p.matches_attrs(&["linux"]));
        assert!(p.matches_attrs(&["amd64"]));
        assert!(p.matches_attrs(&["linux", "amd64"]));
        assert!(!p.matches_attrs(&["darwin"]));
        assert!(!p.matches_attrs(&["linux", "arm64"]));
        // no attrs matches everything
        assert!(p.matches_attrs::<&str>(&[]));
    }

    #[test]
    fn roundtrip() {
        let p: Platform = "darwin-arm64".parse().unwrap();
        assert_eq!(p, Platform::new(Os::Darwin, Arch::Arm64));
        assert_eq!(p.to_string(), "darwin-arm64");
        assert_eq!(p.arch.xarch(), "aarch64");
    }
}
