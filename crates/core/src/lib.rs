//! fwprobe-core
//!
//! Core library for reverse-engineering GL.iNet router/KVM firmware images.
//!
//! The heavy lifting (unpacking, signature matching, string extraction) is
//! delegated to external tools such as `binwalk` and `strings`. This crate
//! parses their text output, derives boot-chain offsets and rootfs facts, and
//! renders documented TOML/JSON reports.
//!
//! All substantive logic lives here so it is testable and reusable from the
//! CLI frontend.

pub mod cache;
pub mod config;
pub mod devicetree;
pub mod extraction;
pub mod finders;
pub mod firmware;
pub mod layout;
pub mod offsets;
pub mod report;
pub mod services;
pub mod tools;

