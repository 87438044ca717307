//! Architecture naming for Debian packages.
//!
//! Rust, uname and recipes name CPUs differently from dpkg. Recipes may say
//! `x86_64` while the package must say `amd64`:
//!
//! | recipe / Rust      | Debian    |
//! |--------------------|-----------|
//! | `x86_64`           | `amd64`   |
//! | `aarch64`, `arm64` | `arm64`   |
//! | `x86`, `i686`      | `i386`    |
//! | `arm`              | `armhf`   |
//! | `powerpc64le`      | `ppc64el` |
//!
//! `all` (architecture-independent) passes through unchanged.
//!
//! # Examples
//!
//! ```
//! use debrew::platform;
//!
//! assert_eq!(platform::debian_arch("x86_64"), "amd64");
//! assert!(!platform::host_arch().is_empty());
//! ```

/// Architecture of the build host in Debian naming.
pub fn host_arch() -> &'static str {
    debian_arch(std::env::consts::ARCH)
}

/// Map an architecture name to its Debian spelling. Unknown names are kept.
pub fn debian_arch(arch: &str) -> &str {
    match arch {
        "x86_64" | "amd64" => "amd64",
        "aarch64" | "arm64" => "arm64",
        "x86" | "i386" | "i586" | "i686" => "i386",
        "arm" | "armv7" | "armhf" => "armhf",
        "powerpc64le" | "ppc64le" | "ppc64el" => "ppc64el",
        "riscv64" => "riscv64",
        "s390x" => "s390x",
        other => other,
    }
}
