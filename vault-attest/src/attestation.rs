//! Attestation report acquisition and VCEK chain verification.
//!
//! # Acquisition order
//!
//! 1. Local guest device — invoke the vendor's guest tool against
//!    `/dev/sev-guest` with the caller's request blob.
//! 2. Cloud instance metadata — fetch a pre-signed report from the
//!    provider's metadata endpoint.
//! 3. Else fail with [`AttestationError::HardwareUnavailable`].
//!
//! Every failure path returns a typed error rather than panicking; the
//! bootstrap sequence decides whether a given failure is fatal.

use std::os::unix::fs::PermissionsExt;
use std::process::Stdio;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::process::Command;

use crate::error::AttestationError;

const GUEST_DEVICE_PATH: &str = "/dev/sev-guest";
const GUEST_TOOL_PATH: &str = "/usr/bin/snpguest";
const TOOL_TIMEOUT: Duration = Duration::from_secs(10);
const HTTP_TIMEOUT: Duration = Duration::from_secs(10);

/// A hardware attestation report. Produced on demand, never persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttestationReport {
    pub measurement: [u8; 48],
    pub report_data: [u8; 64],
    pub platform_version: String,
    pub signature: Vec<u8>,
    pub vcek_chain_verified: bool,
    /// Populated when acquisition or chain verification failed.
    pub error: Option<String>,
}

impl AttestationReport {
    fn failed(request_data: [u8; 64], error: &AttestationError) -> Self {
        Self {
            measurement: [0u8; 48],
            report_data: request_data,
            platform_version: String::new(),
            signature: Vec::new(),
            vcek_chain_verified: false,
            error: Some(error.to_string()),
        }
    }
}

pub struct AttestationProvider {
    http: reqwest::Client,
    /// Cloud instance metadata endpoint for the fallback acquisition path,
    /// supplied by the caller's config at construction — this crate never
    /// reads `std::env` itself.
    instance_metadata_url: Option<String>,
}

impl Default for AttestationProvider {
    fn default() -> Self {
        Self::new(None)
    }
}

impl AttestationProvider {
    pub fn new(instance_metadata_url: Option<String>) -> Self {
        let http = reqwest::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .expect("reqwest client builds with static config");
        Self { http, instance_metadata_url }
    }

    /// Acquire a signed hardware report binding `request_data` into the
    /// report, then verify its VCEK chain.
    pub async fn get_report(&self, request_data: [u8; 64]) -> AttestationReport {
        let attempt = async {
            match self.acquire_from_guest_device(request_data).await {
                Ok(report) => return Ok(report),
                Err(e) => tracing::warn!(attempt = "guest-device", error = %e, "attestation acquisition failed"),
            }
            self.acquire_from_instance_metadata(request_data).await
        };

        match attempt.await {
            Ok(mut report) => {
                report.vcek_chain_verified = self.verify_chain(&report).await;
                report
            }
            Err(e) => {
                tracing::warn!(attempt = "instance-metadata", error = %e, "attestation acquisition failed");
                AttestationReport::failed(request_data, &e)
            }
        }
    }

    async fn acquire_from_guest_device(
        &self,
        request_data: [u8; 64],
    ) -> Result<AttestationReport, AttestationError> {
        if !std::path::Path::new(GUEST_DEVICE_PATH).exists() {
            return Err(AttestationError::HardwareUnavailable);
        }

        let work_dir = tempfile::Builder::new()
            .prefix("vault-attest-")
            .tempdir()
            .map_err(|e| AttestationError::ToolInvocation(e.to_string()))?;
        std::fs::set_permissions(work_dir.path(), std::fs::Permissions::from_mode(0o700))
            .map_err(|e| AttestationError::ToolInvocation(e.to_string()))?;

        let request_path = work_dir.path().join("request.bin");
        let report_path = work_dir.path().join("report.bin");
        tokio::fs::write(&request_path, request_data)
            .await
            .map_err(|e| AttestationError::ToolInvocation(e.to_string()))?;

        run_tool(
            GUEST_TOOL_PATH,
            &[
                "report",
                report_path.to_str().unwrap(),
                request_path.to_str().unwrap(),
            ],
        )
        .await?;

        let display = run_tool_capture(GUEST_TOOL_PATH, &["display", "report", report_path.to_str().unwrap()]).await?;
        parse_report_display(&display, request_data)

        // `work_dir` is removed here on drop, covering every exit path
        // including the early returns above.
    }

    async fn acquire_from_instance_metadata(
        &self,
        request_data: [u8; 64],
    ) -> Result<AttestationReport, AttestationError> {
        let endpoint = self
            .instance_metadata_url
            .as_deref()
            .ok_or(AttestationError::HardwareUnavailable)?;

        let response = self
            .http
            .get(endpoint)
            .query(&[("request_data", hex::encode(request_data))])
            .send()
            .await
            .map_err(|e| AttestationError::ToolInvocation(e.to_string()))?;

        if !response.status().is_success() {
            return Err(AttestationError::ToolInvocation(format!(
                "instance metadata endpoint returned {}",
                response.status()
            )));
        }

        let display = response
            .text()
            .await
            .map_err(|e| AttestationError::ToolInvocation(e.to_string()))?;

        parse_report_display(&display, request_data)
    }

    /// Fetch the platform VCEK certificate and CA chain and verify the
    /// report's signature against them.
    pub async fn verify_chain(&self, report: &AttestationReport) -> bool {
        match self.verify_chain_inner(report).await {
            Ok(valid) => valid,
            Err(e) => {
                tracing::warn!(error = %e, "VCEK chain verification failed");
                false
            }
        }
    }

    async fn verify_chain_inner(&self, report: &AttestationReport) -> Result<bool, AttestationError> {
        let work_dir = tempfile::Builder::new()
            .prefix("vault-attest-vcek-")
            .tempdir()
            .map_err(|e| AttestationError::VcekFetch(e.to_string()))?;
        std::fs::set_permissions(work_dir.path(), std::fs::Permissions::from_mode(0o700))
            .map_err(|e| AttestationError::VcekFetch(e.to_string()))?;

        let vcek_url = format!(
            "https://kdsintf.amd.com/vcek/v1/Milan/{}",
            report.platform_version
        );
        let vcek = self
            .http
            .get(&vcek_url)
            .send()
            .await
            .map_err(|e| AttestationError::VcekFetch(e.to_string()))?
            .bytes()
            .await
            .map_err(|e| AttestationError::VcekFetch(e.to_string()))?;

        let vcek_path = work_dir.path().join("vcek.der");
        tokio::fs::write(&vcek_path, &vcek)
            .await
            .map_err(|e| AttestationError::VcekFetch(e.to_string()))?;

        let signature_path = work_dir.path().join("report.sig");
        tokio::fs::write(&signature_path, &report.signature)
            .await
            .map_err(|e| AttestationError::VcekFetch(e.to_string()))?;

        let status = run_tool_status(
            GUEST_TOOL_PATH,
            &["verify", "attestation", work_dir.path().to_str().unwrap()],
        )
        .await
        .map_err(|e| AttestationError::ChainVerification(e.to_string()))?;

        Ok(status.success())
    }
}

async fn run_tool(program: &str, args: &[&str]) -> Result<(), AttestationError> {
    let status = run_tool_status(program, args)
        .await
        .map_err(|e| AttestationError::ToolInvocation(e.to_string()))?;
    if !status.success() {
        return Err(AttestationError::ToolInvocation(format!(
            "{program} exited with {status}"
        )));
    }
    Ok(())
}

async fn run_tool_status(program: &str, args: &[&str]) -> std::io::Result<std::process::ExitStatus> {
    tokio::time::timeout(
        TOOL_TIMEOUT,
        Command::new(program)
            .args(args)
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .status(),
    )
    .await
    .map_err(|_| std::io::Error::new(std::io::ErrorKind::TimedOut, "tool invocation timed out"))?
}

async fn run_tool_capture(program: &str, args: &[&str]) -> Result<String, AttestationError> {
    let output = tokio::time::timeout(TOOL_TIMEOUT, Command::new(program).args(args).output())
        .await
        .map_err(|_| AttestationError::ToolInvocation("tool invocation timed out".into()))?
        .map_err(|e| AttestationError::ToolInvocation(e.to_string()))?;

    if !output.status.success() {
        return Err(AttestationError::ToolInvocation(format!(
            "{program} exited with {}",
            output.status
        )));
    }

    String::from_utf8(output.stdout).map_err(|e| AttestationError::ToolInvocation(e.to_string()))
}

/// Parse the guest tool's textual `display report` output into a
/// structured record. Lines are `Label:     value` pairs; unrecognized
/// lines are ignored so tool output formatting changes across vendor
/// releases don't become parse failures.
fn parse_report_display(
    text: &str,
    request_data: [u8; 64],
) -> Result<AttestationReport, AttestationError> {
    let mut measurement: Option<[u8; 48]> = None;
    let mut platform_version: Option<String> = None;
    let mut signature: Option<Vec<u8>> = None;

    for line in text.lines() {
        let Some((label, value)) = line.split_once(':') else {
            continue;
        };
        let label = label.trim().to_ascii_lowercase();
        let value = value.trim().replace(' ', "");
        match label.as_str() {
            "measurement" => {
                let bytes = hex::decode(&value)
                    .map_err(|e| AttestationError::ToolInvocation(e.to_string()))?;
                let arr: [u8; 48] = bytes
                    .try_into()
                    .map_err(|_| AttestationError::ToolInvocation("measurement wrong length".into()))?;
                measurement = Some(arr);
            }
            "platform version" | "platform_version" => platform_version = Some(value),
            "signature" => {
                signature = Some(
                    hex::decode(&value).map_err(|e| AttestationError::ToolInvocation(e.to_string()))?,
                );
            }
            _ => {}
        }
    }

    Ok(AttestationReport {
        measurement: measurement
            .ok_or_else(|| AttestationError::ToolInvocation("report missing measurement".into()))?,
        report_data: request_data,
        platform_version: platform_version
            .ok_or_else(|| AttestationError::ToolInvocation("report missing platform version".into()))?,
        signature: signature
            .ok_or_else(|| AttestationError::ToolInvocation("report missing signature".into()))?,
        vcek_chain_verified: false,
        error: None,
    })
}
