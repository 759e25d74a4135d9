//! Platform-specific library resolution.
//!
//! Native builds ship one folder per platform key under the library root:
//!
//! ```text
//! <library_dir>/
//!   linux-x64/      libggml-base.so libggml-cpu.so libggml.so libllama.so libllmbridge.so
//!   windows-x64/    ggml-base.dll ggml-cpu.dll ggml.dll llama.dll llmbridge.dll
//!   macos-arm64/    ...
//! ```
//!
//! Dependencies are loaded in the order listed, then the bridge library.

use crate::error::{BindingError, Result};
use std::path::{Path, PathBuf};
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PlatformKey {
    WindowsX64,
    LinuxX64,
    LinuxArm64,
    MacosX64,
    MacosArm64,
    AndroidArm64,
    IosArm64,
}

impl PlatformKey {
    pub const ALL: [PlatformKey; 7] = [
        Self::WindowsX64,
        Self::LinuxX64,
        Self::LinuxArm64,
        Self::MacosX64,
        Self::MacosArm64,
        Self::AndroidArm64,
        Self::IosArm64,
    ];

    /// Key for the running target.
    pub fn current() -> Result<Self> {
        Self::from_target(std::env::consts::OS, std::env::consts::ARCH)
    }

    pub fn from_target(os: &str, arch: &str) -> Result<Self> {
        match (os, arch) {
            ("windows", "x86_64") => Ok(Self::WindowsX64),
            ("linux", "x86_64") => Ok(Self::LinuxX64),
            ("linux", "aarch64") => Ok(Self::LinuxArm64),
            ("macos", "x86_64") => Ok(Self::MacosX64),
            ("macos", "aarch64") => Ok(Self::MacosArm64),
            ("android", "aarch64") => Ok(Self::AndroidArm64),
            ("ios", "aarch64") => Ok(Self::IosArm64),
            _ => Err(BindingError::UnsupportedPlatform(format!("{}-{}", os, arch))),
        }
    }

    /// Folder name under the library root
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::WindowsX64 => "windows-x64",
            Self::LinuxX64 => "linux-x64",
            Self::LinuxArm64 => "linux-arm64",
            Self::MacosX64 => "macos-x64",
            Self::MacosArm64 => "macos-arm64",
            Self::AndroidArm64 => "android-arm64",
            Self::IosArm64 => "ios-arm64",
        }
    }

    pub fn main_library(&self) -> &'static str {
        match self {
            Self::WindowsX64 => "llmbridge.dll",
            Self::LinuxX64 | Self::LinuxArm64 | Self::AndroidArm64 => "libllmbridge.so",
            Self::MacosX64 | Self::MacosArm64 | Self::IosArm64 => "libllmbridge.dylib",
        }
    }

    /// Libraries that must be loaded before the main one, in load order.
    pub fn dependencies(&self) -> &'static [&'static str] {
        match self {
            Self::WindowsX64 => &["ggml-base.dll", "ggml-cpu.dll", "ggml.dll", "llama.dll"],
            Self::LinuxX64 | Self::LinuxArm64 | Self::AndroidArm64 => &[
                "libggml-base.so",
                "libggml-cpu.so",
                "libggml.so",
                "libllama.so",
            ],
            Self::MacosX64 | Self::MacosArm64 => &[
                "libggml-base.dylib",
                "libggml-cpu.dylib",
                "libggml-metal.dylib",
                "libggml.dylib",
                "libllama.dylib",
            ],
            // Statically linked into the bridge library
            Self::IosArm64 => &[],
        }
    }

    pub fn library_dir(&self, root: &Path) -> PathBuf {
        root.join(self.as_str())
    }

    pub fn main_library_path(&self, root: &Path) -> PathBuf {
        self.library_dir(root).join(self.main_library())
    }

    pub fn dependency_paths(&self, root: &Path) -> Vec<PathBuf> {
        let dir = self.library_dir(root);
        self.dependencies().iter().map(|name| dir.join(name)).collect()
    }
}

impl std::fmt::Display for PlatformKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PlatformKey {
    type Err = BindingError;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|key| key.as_str() == s)
            .ok_or_else(|| BindingError::UnsupportedPlatform(s.to_string()))
    }
}
