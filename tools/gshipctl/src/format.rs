// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Output formatting for the diagnostic CLI.

use serde::Serialize;

use gship_proto::control::v1::{StatusResponse, Zone};

/// Flattened status for rendering.
#[derive(Debug, Clone, Serialize)]
pub struct StatusView {
    pub zone: String,
    pub pressure_score: u32,
    pub memory_usage_bytes: u64,
    pub heap_objects: u64,
    pub task_count: u32,
}

impl StatusView {
    pub fn from_response(resp: &StatusResponse) -> Self {
        StatusView {
            zone: zone_name(resp.zone),
            pressure_score: resp.pressure_score,
            memory_usage_bytes: resp.memory_usage_bytes,
            heap_objects: resp.heap_objects,
            task_count: resp.goroutine_count,
        }
    }
}

pub fn zone_name(raw: i32) -> String {
    match Zone::try_from(raw) {
        Ok(Zone::Green) => "GREEN".to_string(),
        Ok(Zone::Yellow) => "YELLOW".to_string(),
        Ok(Zone::Red) => "RED".to_string(),
        _ => "UNSPECIFIED".to_string(),
    }
}

/// Supported output formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
    Table,
    Json,
    Yaml,
}

impl OutputFormat {
    pub fn render(self, view: &StatusView) -> anyhow::Result<String> {
        match self {
            OutputFormat::Table => Ok(render_table(view)),
            OutputFormat::Json => Ok(serde_json::to_string_pretty(view)?),
            OutputFormat::Yaml => Ok(serde_yaml::to_string(view)?),
        }
    }
}

fn render_table(view: &StatusView) -> String {
    let mut out = String::new();
    out.push_str("GSHIP Engine Status\n");
    out.push_str("===================\n");
    out.push_str(&format!("{:<18} {}\n", "Zone:", view.zone));
    out.push_str(&format!("{:<18} {}%\n", "Pressure score:", view.pressure_score));
    out.push_str(&format!(
        "{:<18} {} bytes\n",
        "Memory usage:", view.memory_usage_bytes
    ));
    out.push_str(&format!("{:<18} {}\n", "Live leases:", view.heap_objects));
    out.push_str(&format!("{:<18} {}\n", "Tasks:", view.task_count));
    out
}

/// Exit code contract: 0 Green, 1 Yellow, 2 Red.
pub fn exit_code_for_zone(raw: i32) -> i32 {
    match Zone::try_from(raw) {
        Ok(Zone::Yellow) => 1,
        Ok(Zone::Red) => 2,
        _ => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> StatusView {
        StatusView {
            zone: "YELLOW".to_string(),
            pressure_score: 42,
            memory_usage_bytes: 1024,
            heap_objects: 3,
            task_count: 17,
        }
    }

    #[test]
    fn table_lists_every_field() {
        let text = render_table(&sample());
        assert!(text.contains("Zone:"));
        assert!(text.contains("YELLOW"));
        assert!(text.contains("42%"));
        assert!(text.contains("1024 bytes"));
        assert!(text.contains("Tasks:"));
    }

    #[test]
    fn json_round_trips() {
        let text = OutputFormat::Json.render(&sample()).expect("json");
        let parsed: serde_json::Value = serde_json::from_str(&text).expect("parse");
        assert_eq!(parsed["zone"], "YELLOW");
        assert_eq!(parsed["pressure_score"], 42);
    }

    #[test]
    fn yaml_is_parseable() {
        let text = OutputFormat::Yaml.render(&sample()).expect("yaml");
        let parsed: serde_yaml::Value = serde_yaml::from_str(&text).expect("parse");
        assert_eq!(parsed["memory_usage_bytes"], 1024);
    }

    #[test]
    fn exit_codes_follow_zones() {
        assert_eq!(exit_code_for_zone(Zone::Green as i32), 0);
        assert_eq!(exit_code_for_zone(Zone::Yellow as i32), 1);
        assert_eq!(exit_code_for_zone(Zone::Red as i32), 2);
        assert_eq!(exit_code_for_zone(Zone::Unspecified as i32), 0);
        assert_eq!(exit_code_for_zone(99), 0);
    }
}
