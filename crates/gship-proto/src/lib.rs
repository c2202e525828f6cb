// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Generated wire types for the GSHIP engine.
//!
//! Two packages: `gship.control.v1` (management plane) and
//! `gship.logs.v1` (OTLP-style log export). Codegen runs in `build.rs`
//! via `tonic-build`.

/// Management plane: Ping, GetStatus, WatchStatus, OverrideZone.
pub mod control {
    pub mod v1 {
        tonic::include_proto!("gship.control.v1");
    }
}

/// OTLP-style log export.
pub mod logs {
    pub mod v1 {
        tonic::include_proto!("gship.logs.v1");
    }
}

#[cfg(test)]
mod tests {
    use super::control::v1::Zone;

    #[test]
    fn zone_enum_round_trips_through_i32() {
        for zone in [Zone::Unspecified, Zone::Green, Zone::Yellow, Zone::Red] {
            assert_eq!(Zone::try_from(zone as i32).ok(), Some(zone));
        }
    }
}
