//! Expensive hardware queries run off the main tick.
//!
//! GPU identity, memory module frequency and GPU usage come from external
//! system tools. Each invocation is bounded by a timeout and its result is
//! merged field-by-field into the shared [`HardwareInfo`]; a failed query
//! only leaves its own field at the last known value.

use crate::error::{Result, SystemError};
use crate::metrics::data::HardwareInfo;
use crate::metrics::traits::{GpuIdentity, HardwareProbe};
use async_trait::async_trait;
use lazy_static::lazy_static;
use regex::Regex;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, info, warn};

lazy_static! {
    static ref MEMORY_SPEED: Regex = Regex::new(r"(\d+)\s*(?:MHz|MT/s)").unwrap();
    static ref PERCENT: Regex = Regex::new(r"(\d+(?:\.\d+)?)\s*%").unwrap();
    static ref VRAM: Regex = Regex::new(r"(?i)(\d+(?:\.\d+)?)\s*(GB|MB)").unwrap();
}

/// Probe that shells out to the platform's system profiling tools.
pub struct CommandProbe {
    timeout: Duration,
}

impl CommandProbe {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    async fn run(&self, program: &str, args: &[&str]) -> Result<String> {
        let query = format!("{} {}", program, args.join(" "));
        let output = Command::new(program)
            .args(args)
            .kill_on_drop(true)
            .output();

        let output = time::timeout(self.timeout, output)
            .await
            .map_err(|_| SystemError::external_query(&query, "timed out"))?
            .map_err(|e| SystemError::external_query(&query, e.to_string()))?;

        if !output.status.success() {
            return Err(SystemError::external_query(
                &query,
                format!("exited with {}", output.status),
            ));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[cfg(target_os = "macos")]
#[async_trait]
impl HardwareProbe for CommandProbe {
    async fn gpu_identity(&self) -> Result<GpuIdentity> {
        let output = self
            .run("/usr/sbin/system_profiler", &["SPDisplaysDataType"])
            .await?;
        parse_display_profile(&output)
    }

    async fn memory_frequency(&self) -> Result<f64> {
        let output = self
            .run("/usr/sbin/system_profiler", &["SPMemoryDataType"])
            .await?;
        parse_memory_speed(&output)
    }

    async fn gpu_usage(&self) -> Result<f64> {
        let output = self
            .run(
                "/usr/bin/powermetrics",
                &["--samplers", "gpu_power", "-n1", "-i", "200"],
            )
            .await?;
        parse_gpu_busy(&output)
    }
}

#[cfg(not(target_os = "macos"))]
#[async_trait]
impl HardwareProbe for CommandProbe {
    async fn gpu_identity(&self) -> Result<GpuIdentity> {
        match self
            .run(
                "nvidia-smi",
                &["--query-gpu=name,memory.total", "--format=csv,noheader,nounits"],
            )
            .await
            .and_then(|output| parse_nvidia_identity(&output))
        {
            Ok(identity) => Ok(identity),
            Err(err) => {
                debug!("nvidia-smi unavailable ({}), falling back to lspci", err);
                let output = self.run("lspci", &[]).await?;
                parse_lspci(&output)
            }
        }
    }

    async fn memory_frequency(&self) -> Result<f64> {
        let output = self.run("dmidecode", &["-t", "memory"]).await?;
        parse_memory_speed(&output)
    }

    async fn gpu_usage(&self) -> Result<f64> {
        let output = self
            .run(
                "nvidia-smi",
                &["--query-gpu=utilization.gpu", "--format=csv,noheader,nounits"],
            )
            .await?;
        let first = output
            .lines()
            .next()
            .ok_or_else(|| SystemError::parse_error("empty nvidia-smi output"))?;
        parse_number(first.trim(), "GPU utilization")
    }
}

/// Run the identity queries concurrently and merge their results into `info`.
pub async fn poll_expensive(probe: &dyn HardwareProbe, info: &mut HardwareInfo) {
    let (identity, frequency) = tokio::join!(probe.gpu_identity(), probe.memory_frequency());

    match identity {
        Ok(identity) => {
            info.gpu_model = Some(identity.model);
            if identity.vram_gb.is_some() {
                info.gpu_vram_gb = identity.vram_gb;
            }
        }
        Err(err) => warn!("GPU identity query failed: {}", err),
    }

    match frequency {
        Ok(mhz) => info.ram_frequency_mhz = Some(mhz),
        Err(err) => warn!("Memory frequency query failed: {}", err),
    }
}

/// Sample GPU usage into `info`, keeping the previous value on failure.
pub async fn poll_gpu_usage(probe: &dyn HardwareProbe, info: &mut HardwareInfo) {
    match probe.gpu_usage().await {
        Ok(percent) => info.gpu_usage_percent = Some(percent.clamp(0.0, 100.0)),
        Err(err) => debug!("GPU usage query failed: {}", err),
    }
}

/// Cadences of the background query task.
#[derive(Debug, Clone, Copy)]
pub struct ProbeSchedule {
    /// Identity refresh period; `None` runs the queries once at startup
    pub profile_interval: Option<Duration>,
    /// GPU usage period; `None` disables usage sampling
    pub gpu_usage_interval: Option<Duration>,
}

/// Spawn the background query task.
///
/// Results are published through `results`. The task stops at the next
/// query boundary once `shutdown` turns true; an in-flight command is left to
/// finish or time out.
pub fn spawn_probe_task(
    probe: Arc<dyn HardwareProbe>,
    schedule: ProbeSchedule,
    results: Arc<watch::Sender<HardwareInfo>>,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut info = results.borrow().clone();
        poll_expensive(probe.as_ref(), &mut info).await;
        if *shutdown.borrow() {
            return;
        }
        info!(
            gpu = info.gpu_model.as_deref().unwrap_or("unknown"),
            ram_mhz = info.ram_frequency_mhz.unwrap_or(0.0),
            "Hardware identity resolved"
        );
        results.send_replace(info.clone());

        let mut profile = schedule.profile_interval.map(delayed_interval);
        let mut usage = schedule.gpu_usage_interval.map(|period| {
            let mut interval = time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            interval
        });

        if profile.is_none() && usage.is_none() {
            return;
        }

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
                _ = next_tick(profile.as_mut()) => {
                    poll_expensive(probe.as_ref(), &mut info).await;
                }
                _ = next_tick(usage.as_mut()) => {
                    poll_gpu_usage(probe.as_ref(), &mut info).await;
                }
            }

            if *shutdown.borrow() {
                break;
            }
            results.send_replace(info.clone());
        }
        debug!("Hardware probe task stopped");
    })
}

fn delayed_interval(period: Duration) -> time::Interval {
    let mut interval = time::interval_at(time::Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

async fn next_tick(interval: Option<&mut time::Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

/// Parse `system_profiler SPDisplaysDataType` output.
#[cfg_attr(not(target_os = "macos"), allow(dead_code))]
pub(crate) fn parse_display_profile(output: &str) -> Result<GpuIdentity> {
    let model = field_value(output, "Chipset Model:")
        .ok_or_else(|| SystemError::parse_error("no Chipset Model in display profile"))?;

    let vram_gb = ["VRAM (Total):", "VRAM (Dynamic, Max):"]
        .iter()
        .find_map(|key| field_value(output, key))
        .and_then(parse_vram_gb);

    Ok(GpuIdentity {
        model: model.to_string(),
        vram_gb,
    })
}

/// Parse `nvidia-smi --query-gpu=name,memory.total` CSV output (MiB).
#[cfg_attr(target_os = "macos", allow(dead_code))]
pub(crate) fn parse_nvidia_identity(output: &str) -> Result<GpuIdentity> {
    let line = output
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .ok_or_else(|| SystemError::parse_error("empty nvidia-smi output"))?;

    let mut parts = line.split(',').map(str::trim);
    let model = parts
        .next()
        .filter(|name| !name.is_empty())
        .ok_or_else(|| SystemError::parse_error("missing GPU name"))?;
    let vram_gb = parts
        .next()
        .and_then(|mib| mib.parse::<f64>().ok())
        .map(|mib| mib / 1024.0);

    Ok(GpuIdentity {
        model: model.to_string(),
        vram_gb,
    })
}

/// Take the first display controller reported by `lspci`.
#[cfg_attr(target_os = "macos", allow(dead_code))]
pub(crate) fn parse_lspci(output: &str) -> Result<GpuIdentity> {
    const CLASSES: &[&str] = &[
        "VGA compatible controller:",
        "3D controller:",
        "Display controller:",
    ];

    output
        .lines()
        .find_map(|line| {
            CLASSES
                .iter()
                .find_map(|class| line.split_once(class).map(|(_, name)| name.trim()))
        })
        .filter(|name| !name.is_empty())
        .map(|name| GpuIdentity {
            model: name.to_string(),
            vram_gb: None,
        })
        .ok_or_else(|| SystemError::parse_error("no display controller in lspci output"))
}

/// First memory speed in MHz or MT/s.
pub(crate) fn parse_memory_speed(output: &str) -> Result<f64> {
    MEMORY_SPEED
        .captures_iter(output)
        .filter_map(|caps| caps[1].parse::<f64>().ok())
        .find(|mhz| *mhz > 0.0)
        .ok_or_else(|| SystemError::parse_error("no memory speed reported"))
}

/// GPU busy percentage from `powermetrics` output.
#[cfg_attr(not(target_os = "macos"), allow(dead_code))]
pub(crate) fn parse_gpu_busy(output: &str) -> Result<f64> {
    output
        .lines()
        .filter(|line| line.contains("GPU Busy") || line.contains("GPU HW active residency"))
        .find_map(|line| {
            let (_, value) = line.split_once(':')?;
            PERCENT
                .captures(value)
                .and_then(|caps| caps[1].parse::<f64>().ok())
        })
        .ok_or_else(|| SystemError::parse_error("no GPU busy figure in powermetrics output"))
}

#[cfg_attr(not(target_os = "macos"), allow(dead_code))]
fn field_value<'a>(output: &'a str, key: &str) -> Option<&'a str> {
    output
        .lines()
        .map(str::trim)
        .find_map(|line| line.strip_prefix(key))
        .map(str::trim)
        .filter(|value| !value.is_empty())
}

#[cfg_attr(not(target_os = "macos"), allow(dead_code))]
fn parse_vram_gb(value: &str) -> Option<f64> {
    let caps = VRAM.captures(value)?;
    let amount: f64 = caps[1].parse().ok()?;
    if caps[2].eq_ignore_ascii_case("GB") {
        Some(amount)
    } else {
        Some(amount / 1024.0)
    }
}

#[cfg_attr(target_os = "macos", allow(dead_code))]
fn parse_number(value: &str, what: &str) -> Result<f64> {
    value
        .parse::<f64>()
        .map_err(|e| SystemError::parse_error(format!("bad {} '{}': {}", what, value, e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fake::CannedProbe;

    const DISPLAYS: &str = "\
Graphics/Displays:

    AMD Radeon Pro 5500M:

      Chipset Model: AMD Radeon Pro 5500M
      Type: GPU
      Bus: PCIe
      PCIe Lane Width: x16
      VRAM (Total): 8 GB
      Vendor: AMD (0x1002)
";

    #[test]
    fn test_parse_display_profile() {
        let identity = parse_display_profile(DISPLAYS).unwrap();
        assert_eq!(identity.model, "AMD Radeon Pro 5500M");
        assert_eq!(identity.vram_gb, Some(8.0));
    }

    #[test]
    fn test_parse_display_profile_vram_in_mb() {
        let output = "Chipset Model: Intel UHD Graphics 630\nVRAM (Dynamic, Max): 1536 MB\n";
        let identity = parse_display_profile(output).unwrap();
        assert_eq!(identity.model, "Intel UHD Graphics 630");
        assert_eq!(identity.vram_gb, Some(1.5));
    }

    #[test]
    fn test_parse_display_profile_without_chipset() {
        assert!(parse_display_profile("Graphics/Displays:\n").is_err());
    }

    #[test]
    fn test_parse_nvidia_identity() {
        let identity = parse_nvidia_identity("NVIDIA GeForce RTX 3080, 10240\n").unwrap();
        assert_eq!(identity.model, "NVIDIA GeForce RTX 3080");
        assert_eq!(identity.vram_gb, Some(10.0));
        assert!(parse_nvidia_identity("\n").is_err());
    }

    #[test]
    fn test_parse_lspci() {
        let output = "\
00:00.0 Host bridge: Intel Corporation 8th Gen Core Processor Host Bridge
00:02.0 VGA compatible controller: Intel Corporation UHD Graphics 630 (rev 02)
01:00.0 3D controller: NVIDIA Corporation TU117M
";
        let identity = parse_lspci(output).unwrap();
        assert_eq!(identity.model, "Intel Corporation UHD Graphics 630 (rev 02)");
        assert!(parse_lspci("00:00.0 Host bridge: foo\n").is_err());
    }

    #[test]
    fn test_parse_memory_speed() {
        let profile = "Memory:\n\n    BANK 0/ChannelA-DIMM0:\n\n      Size: 16 GB\n      Type: DDR4\n      Speed: 2667 MHz\n";
        assert_eq!(parse_memory_speed(profile).unwrap(), 2667.0);

        let dmidecode = "Memory Device\n\tSpeed: Unknown\nMemory Device\n\tSpeed: 3200 MT/s\n\tConfigured Memory Speed: 3200 MT/s\n";
        assert_eq!(parse_memory_speed(dmidecode).unwrap(), 3200.0);

        assert!(parse_memory_speed("Speed: Unknown\n").is_err());
    }

    #[test]
    fn test_parse_gpu_busy() {
        assert_eq!(parse_gpu_busy("GPU Busy: 37.5%\n").unwrap(), 37.5);
        let output = "**** GPU usage ****\n\nGPU HW active frequency: 389 MHz\nGPU HW active residency:  12.04% (389 MHz: 12%)\n";
        assert_eq!(parse_gpu_busy(output).unwrap(), 12.04);
        assert!(parse_gpu_busy("CPU die temperature: 50 C\n").is_err());
    }

    #[tokio::test]
    async fn test_poll_expensive_merges_successful_fields_only() {
        let probe = CannedProbe::new()
            .with_identity(Err(SystemError::external_query("system_profiler", "boom")))
            .with_memory_frequency(Ok(3200.0));

        let mut info = HardwareInfo {
            gpu_model: Some("Previous GPU".to_string()),
            gpu_vram_gb: Some(4.0),
            ..Default::default()
        };
        poll_expensive(&probe, &mut info).await;

        assert_eq!(info.gpu_model.as_deref(), Some("Previous GPU"));
        assert_eq!(info.gpu_vram_gb, Some(4.0));
        assert_eq!(info.ram_frequency_mhz, Some(3200.0));
    }

    #[tokio::test]
    async fn test_poll_gpu_usage_keeps_previous_on_failure() {
        let mut info = HardwareInfo {
            gpu_usage_percent: Some(20.0),
            ..Default::default()
        };
        let failing = CannedProbe::new();
        poll_gpu_usage(&failing, &mut info).await;
        assert_eq!(info.gpu_usage_percent, Some(20.0));

        let working = CannedProbe::new().with_gpu_usage(Ok(140.0));
        poll_gpu_usage(&working, &mut info).await;
        assert_eq!(info.gpu_usage_percent, Some(100.0));
    }

    #[tokio::test]
    async fn test_probe_task_publishes_startup_results() {
        let probe = CannedProbe::new()
            .with_identity(Ok(GpuIdentity {
                model: "Apple M2".to_string(),
                vram_gb: None,
            }))
            .with_memory_frequency(Ok(6400.0));

        let (tx, mut rx) = watch::channel(HardwareInfo::default());
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let schedule = ProbeSchedule {
            profile_interval: None,
            gpu_usage_interval: None,
        };

        let handle = spawn_probe_task(Arc::new(probe), schedule, Arc::new(tx), shutdown_rx);
        rx.changed().await.unwrap();
        let info = rx.borrow().clone();
        assert_eq!(info.gpu_model.as_deref(), Some("Apple M2"));
        assert_eq!(info.ram_frequency_mhz, Some(6400.0));

        handle.await.unwrap();
    }
}
