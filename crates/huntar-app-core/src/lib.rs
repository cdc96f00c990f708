// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Shared application services for HuntAR tools (config, prefs).
//! Keeps the hub and device adapters thin and framework-agnostic.

pub mod config;
pub mod prefs;
