//! nmcli invocation and terse-output parsing.
//!
//! NetworkManager's machine-readable output (`--terse`) separates
//! fields with `:` and escapes literal colons and backslashes with a
//! backslash. All parsing is pure functions over captured output, so
//! recorded transcripts can drive the tests.

use anyhow::bail;

use bondcast_common::models::WifiNetwork;

/// Run nmcli with the given arguments, returning stdout. A non-zero
/// exit fails with the captured stderr, which callers inspect for
/// error classification.
pub async fn run(args: &[&str]) -> anyhow::Result<String> {
    let output = tokio::process::Command::new("nmcli")
        .args(args)
        .output()
        .await?;
    if !output.status.success() {
        bail!("{}", String::from_utf8_lossy(&output.stderr).trim());
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Split one terse line into fields, honoring `\:` and `\\` escapes.
pub fn split_terse(line: &str) -> Vec<String> {
    let mut fields = Vec::new();
    let mut current = String::new();
    let mut chars = line.chars();
    while let Some(c) = chars.next() {
        match c {
            '\\' => {
                if let Some(escaped) = chars.next() {
                    current.push(escaped);
                }
            }
            ':' => fields.push(std::mem::take(&mut current)),
            _ => current.push(c),
        }
    }
    fields.push(current);
    fields
}

/// Row of `nmcli -t -f DEVICE,TYPE,STATE,CON-UUID device status`.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceRow {
    pub device: String,
    pub dtype: String,
    pub state: String,
    pub con_uuid: Option<String>,
}

pub fn parse_device_status(output: &str) -> Vec<DeviceRow> {
    output
        .lines()
        .filter_map(|line| {
            let fields = split_terse(line);
            if fields.len() < 4 {
                return None;
            }
            Some(DeviceRow {
                device: fields[0].clone(),
                dtype: fields[1].clone(),
                state: fields[2].clone(),
                con_uuid: (!fields[3].is_empty()).then(|| fields[3].clone()),
            })
        })
        .collect()
}

/// Row of `nmcli -t -f ACTIVE,SSID,SIGNAL,SECURITY,FREQ,DEVICE device
/// wifi list`. Hidden networks (empty SSID) are skipped.
#[derive(Debug, Clone, PartialEq)]
pub struct ScanRow {
    pub network: WifiNetwork,
    pub device: String,
}

pub fn parse_wifi_list(output: &str) -> Vec<ScanRow> {
    output
        .lines()
        .filter_map(|line| {
            let fields = split_terse(line);
            if fields.len() < 6 || fields[1].is_empty() {
                return None;
            }
            Some(ScanRow {
                network: WifiNetwork {
                    active: fields[0] == "yes",
                    ssid: fields[1].clone(),
                    signal: fields[2].parse().unwrap_or(0),
                    security: fields[3].clone(),
                    freq: fields[4]
                        .split_whitespace()
                        .next()
                        .and_then(|f| f.parse().ok())
                        .unwrap_or(0),
                },
                device: fields[5].clone(),
            })
        })
        .collect()
}

/// Row of `nmcli -t -f NAME,UUID,TYPE,TIMESTAMP connection show`.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnRow {
    pub name: String,
    pub uuid: String,
    pub ctype: String,
    /// Last successful activation, epoch seconds; 0 = never.
    pub timestamp: i64,
}

pub fn parse_connections(output: &str) -> Vec<ConnRow> {
    output
        .lines()
        .filter_map(|line| {
            let fields = split_terse(line);
            if fields.len() < 4 {
                return None;
            }
            Some(ConnRow {
                name: fields[0].clone(),
                uuid: fields[1].clone(),
                ctype: fields[2].clone(),
                timestamp: fields[3].parse().unwrap_or(0),
            })
        })
        .collect()
}

/// Parse `field:value` detail output (`nmcli -t -f a,b show …`) into
/// key/value pairs. Values keep their unescaped colons.
pub fn parse_show_fields(output: &str) -> std::collections::HashMap<String, String> {
    output
        .lines()
        .filter_map(|line| {
            let fields = split_terse(line);
            if fields.len() < 2 {
                return None;
            }
            Some((fields[0].clone(), fields[1..].join(":")))
        })
        .collect()
}
