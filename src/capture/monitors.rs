//! Output layout as reported by niri, for the command line front end.
use std::process::Command;

use anyhow::{Context, Result, bail};
use serde_json::Value;

use crate::capture::geometry::MonitorInfo;

fn niri_json(request: &str) -> Result<Value> {
    let output = Command::new("niri")
        .args(["msg", "--json", request])
        .output()
        .context("cannot run `niri msg`, is this a niri session?")?;

    if !output.status.success() {
        bail!("`niri msg {request}` failed");
    }

    let stdout = String::from_utf8(output.stdout).context("niri printed invalid UTF-8")?;
    serde_json::from_str(stdout.trim()).with_context(|| format!("cannot parse niri {request} JSON"))
}

pub fn list_monitors() -> Result<Vec<MonitorInfo>> {
    let monitors = parse_outputs(&niri_json("outputs")?);
    if monitors.is_empty() {
        bail!("niri reported no enabled outputs");
    }
    Ok(monitors)
}

pub fn focused_output_name() -> Result<String> {
    let data = niri_json("focused-output")?;

    if let Some(name) = data.get("name").and_then(Value::as_str) {
        return Ok(name.to_string());
    }

    if let Some(name) = data
        .pointer("/Ok/FocusedOutput/name")
        .and_then(Value::as_str)
    {
        return Ok(name.to_string());
    }

    bail!("niri focused-output did not name an output")
}

fn parse_outputs(data: &Value) -> Vec<MonitorInfo> {
    let entries: Vec<&Value> = match data {
        Value::Object(map) => map.values().collect(),
        Value::Array(items) => items.iter().collect(),
        _ => Vec::new(),
    };

    let mut monitors: Vec<MonitorInfo> = entries.into_iter().filter_map(parse_output).collect();
    monitors.sort_by_key(|m| (m.x, m.y));
    monitors
}

fn parse_output(item: &Value) -> Option<MonitorInfo> {
    let name = item.get("name").and_then(Value::as_str)?;
    // Disabled outputs have no logical geometry.
    let logical = item.get("logical").filter(|v| !v.is_null())?;

    let int = |key: &str| logical.get(key).and_then(Value::as_i64);
    let scale = logical.get("scale").and_then(Value::as_f64).unwrap_or(1.0);

    Some(MonitorInfo::new(
        name,
        int("x")? as i32,
        int("y")? as i32,
        u32::try_from(int("width")?).ok()?,
        u32::try_from(int("height")?).ok()?,
        scale.ceil() as i32,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_enabled_outputs_in_layout_order() {
        let data: Value = serde_json::from_str(
            r#"{
                "HDMI-A-1": {"name": "HDMI-A-1", "logical": {"x": 1280, "y": 0, "width": 1920, "height": 1080, "scale": 1.0, "transform": "Normal"}},
                "eDP-1": {"name": "eDP-1", "logical": {"x": 0, "y": 0, "width": 1280, "height": 800, "scale": 1.5, "transform": "Normal"}},
                "DP-3": {"name": "DP-3", "logical": null}
            }"#,
        )
        .unwrap();

        let monitors = parse_outputs(&data);
        assert_eq!(
            monitors,
            vec![
                MonitorInfo::new("eDP-1", 0, 0, 1280, 800, 2),
                MonitorInfo::new("HDMI-A-1", 1280, 0, 1920, 1080, 1),
            ]
        );
    }

    #[test]
    fn garbage_yields_no_monitors() {
        assert!(parse_outputs(&Value::String("nope".into())).is_empty());
        assert!(parse_outputs(&serde_json::json!([{"name": "X"}])).is_empty());
    }
}
