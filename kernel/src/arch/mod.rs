//! Architecture-specific glue. This core targets x86-64 only (the bootloader
//! and long-mode transition live outside this crate); other architectures are
//! out of scope.

#[cfg(target_arch = "x86_64")]
pub mod x86_64;
