use std::{process::Stdio, time::Duration};

use tokio::{process::Command, time::timeout};
use tracing::info;

use crate::models::PortFinding;

const NMAP_TOOL: &str = "nmap";

/// Characters that never appear in a legitimate hostname or address and
/// would let a target string smuggle shell syntax. Arguments are always
/// passed as a vector and never through a shell, so this is defense in
/// depth on top of the structural guarantee.
const SHELL_METACHARACTERS: &[char] = &[
    ';', '|', '&', '`', '$', '(', ')', '{', '}', '[', ']', '<', '>',
];

#[derive(Debug, thiserror::Error)]
pub enum TargetError {
    #[error("target cannot be empty")]
    Empty,
    #[error("target contains forbidden character `{0}`")]
    ForbiddenCharacter(char),
}

#[derive(Debug, thiserror::Error)]
pub enum ProbeError {
    #[error("invalid target: {0}")]
    Target(#[from] TargetError),
    #[error("failed to launch {tool}: {source}")]
    Launch {
        tool: &'static str,
        #[source]
        source: std::io::Error,
    },
    #[error("{tool} failed ({status}): {stderr}")]
    Exit {
        tool: &'static str,
        status: std::process::ExitStatus,
        stderr: String,
    },
    #[error("scan timed out after {0:?}")]
    Timeout(Duration),
    #[error("failed to parse scanner output: {0}")]
    Parse(#[from] quick_xml::DeError),
}

pub fn validate_target(target: &str) -> Result<(), TargetError> {
    if target.is_empty() {
        return Err(TargetError::Empty);
    }
    if let Some(c) = target.chars().find(|c| SHELL_METACHARACTERS.contains(c)) {
        return Err(TargetError::ForbiddenCharacter(c));
    }
    Ok(())
}

/// Seam between the orchestrator and the external scanning tool. One
/// invocation per call, no retries; the caller decides what an error means.
#[async_trait::async_trait]
pub trait Probe: Send + Sync {
    async fn scan(&self, target: &str, budget: Duration) -> Result<Vec<PortFinding>, ProbeError>;
}

/// Probe backed by the real nmap binary: SYN scan with version detection
/// over ports 1-1000, XML on stdout.
pub struct NmapProbe;

#[async_trait::async_trait]
impl Probe for NmapProbe {
    async fn scan(&self, target: &str, budget: Duration) -> Result<Vec<PortFinding>, ProbeError> {
        validate_target(target)?;

        let host_timeout = format!("{}s", budget.as_secs());
        let args = [
            "-sS",
            "-sV",
            "-p",
            "1-1000",
            "-oX",
            "-",
            "--host-timeout",
            &host_timeout,
            target,
        ];

        let xml = run_with_deadline(NMAP_TOOL, &args, budget).await?;
        parse_nmap_xml(&xml)
    }
}

/// Runs the tool with a hard deadline. The child is spawned with
/// `kill_on_drop`, so when the deadline fires and the wait future is
/// dropped the process is forcibly terminated.
async fn run_with_deadline(
    tool: &'static str,
    args: &[&str],
    budget: Duration,
) -> Result<String, ProbeError> {
    info!(command = tool, ?args, "launching external scanner");
    let child = Command::new(tool)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|source| ProbeError::Launch { tool, source })?;

    let out = match timeout(budget, child.wait_with_output()).await {
        Ok(res) => res.map_err(|source| ProbeError::Launch { tool, source })?,
        Err(_) => return Err(ProbeError::Timeout(budget)),
    };

    if !out.status.success() {
        return Err(ProbeError::Exit {
            tool,
            status: out.status,
            stderr: String::from_utf8_lossy(&out.stderr).trim().to_string(),
        });
    }

    Ok(String::from_utf8_lossy(&out.stdout).into_owned())
}

#[derive(Debug, serde::Deserialize)]
struct NmapRun {
    #[serde(rename = "host", default)]
    hosts: Vec<NmapHost>,
}

#[derive(Debug, serde::Deserialize)]
struct NmapHost {
    status: NmapStatus,
    #[serde(default)]
    ports: Option<NmapPorts>,
}

#[derive(Debug, serde::Deserialize)]
struct NmapStatus {
    #[serde(rename = "@state")]
    state: String,
}

#[derive(Debug, serde::Deserialize)]
struct NmapPorts {
    #[serde(rename = "port", default)]
    ports: Vec<NmapPort>,
}

#[derive(Debug, serde::Deserialize)]
struct NmapPort {
    #[serde(rename = "@portid")]
    portid: u16,
    #[serde(rename = "@protocol")]
    protocol: String,
    state: NmapState,
    #[serde(default)]
    service: Option<NmapService>,
}

#[derive(Debug, serde::Deserialize)]
struct NmapState {
    #[serde(rename = "@state")]
    state: String,
}

#[derive(Debug, serde::Deserialize)]
struct NmapService {
    #[serde(rename = "@name", default)]
    name: Option<String>,
    #[serde(rename = "@product", default)]
    product: Option<String>,
    #[serde(rename = "@version", default)]
    version: Option<String>,
    #[serde(rename = "@banner", default)]
    banner: Option<String>,
}

/// Parses nmap XML into findings, keeping only open ports on hosts that
/// reported "up". The version string is "<product> <version>" when both are
/// present, otherwise whichever one is.
pub fn parse_nmap_xml(xml: &str) -> Result<Vec<PortFinding>, ProbeError> {
    let run: NmapRun = quick_xml::de::from_str(xml)?;
    let mut findings = Vec::new();

    for host in run.hosts {
        if host.status.state != "up" {
            continue;
        }
        let Some(ports) = host.ports else {
            continue;
        };
        for port in ports.ports {
            if port.state.state != "open" {
                continue;
            }
            let service = port.service.unwrap_or(NmapService {
                name: None,
                product: None,
                version: None,
                banner: None,
            });
            let version = match (service.product, service.version) {
                (Some(product), Some(version)) => Some(format!("{product} {version}")),
                (Some(product), None) => Some(product),
                (None, Some(version)) => Some(version),
                (None, None) => None,
            };
            findings.push(PortFinding {
                port: port.portid,
                protocol: port.protocol,
                state: port.state.state,
                service: service.name,
                version,
                banner: service.banner,
            });
        }
    }

    Ok(findings)
}
