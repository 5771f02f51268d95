//! Differential performance-counter sampling.
//!
//! CPU utilization and package power only exist as the difference between
//! two ordered counter readings, so the sampler keeps a window of exactly two
//! samples. Frequency and temperature are instantaneous and are read from the
//! newer sample alone, but are still only reported once the window is full so
//! that every CPU field becomes available on the same tick.

use crate::error::{Result, SystemError};
use crate::metrics::traits::CounterSource;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{debug, info, warn};

/// hwmon driver names that report CPU package or core temperatures.
const CPU_HWMON_NAMES: &[&str] = &["coretemp", "k10temp", "zenpower", "cpu_thermal"];

/// One instantaneous counter reading.
#[derive(Debug, Clone, PartialEq)]
pub struct RawSample {
    /// Monotonic instant the reading was taken
    pub taken_at: Instant,
    /// Non-idle jiffies summed over all CPUs
    pub cpu_busy_jiffies: u64,
    /// All jiffies summed over all CPUs
    pub cpu_total_jiffies: u64,
    /// Cumulative package energy in microjoules, if exposed
    pub package_energy_uj: Option<u64>,
    /// Value at which the energy counter wraps back to zero
    pub energy_range_uj: Option<u64>,
    /// Current frequency of each CPU in kHz
    pub core_frequencies_khz: Vec<u64>,
    /// Package/core temperatures in Celsius
    pub temperatures_c: Vec<f64>,
}

impl RawSample {
    pub fn new(taken_at: Instant, cpu_busy_jiffies: u64, cpu_total_jiffies: u64) -> Self {
        Self {
            taken_at,
            cpu_busy_jiffies,
            cpu_total_jiffies,
            package_energy_uj: None,
            energy_range_uj: None,
            core_frequencies_khz: Vec::new(),
            temperatures_c: Vec::new(),
        }
    }

    pub fn with_energy(mut self, energy_uj: u64, range_uj: Option<u64>) -> Self {
        self.package_energy_uj = Some(energy_uj);
        self.energy_range_uj = range_uj;
        self
    }

    pub fn with_frequencies(mut self, khz: Vec<u64>) -> Self {
        self.core_frequencies_khz = khz;
        self
    }

    pub fn with_temperatures(mut self, celsius: Vec<f64>) -> Self {
        self.temperatures_c = celsius;
        self
    }
}

/// Ring of the two most recent samples.
#[derive(Debug, Default)]
pub struct SampleWindow {
    previous: Option<RawSample>,
    current: Option<RawSample>,
}

impl SampleWindow {
    /// Retire the older sample and make `sample` the current one.
    pub fn push(&mut self, sample: RawSample) {
        self.previous = self.current.take();
        self.current = Some(sample);
    }

    pub fn len(&self) -> usize {
        usize::from(self.previous.is_some()) + usize::from(self.current.is_some())
    }

    pub fn is_empty(&self) -> bool {
        self.current.is_none()
    }

    /// `(previous, current)` once two samples are retained.
    pub fn pair(&self) -> Result<(&RawSample, &RawSample)> {
        match (&self.previous, &self.current) {
            (Some(previous), Some(current)) => Ok((previous, current)),
            _ => Err(SystemError::InsufficientSamples {
                available: self.len(),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SamplerState {
    Uninitialized,
    Ready,
    Disabled,
}

/// Derives CPU metrics from consecutive counter samples.
pub struct PerformanceSampler {
    source: Box<dyn CounterSource>,
    window: SampleWindow,
    state: SamplerState,
}

impl PerformanceSampler {
    pub fn new(source: Box<dyn CounterSource>) -> Self {
        Self {
            source,
            window: SampleWindow::default(),
            state: SamplerState::Uninitialized,
        }
    }

    /// Sampler backed by procfs/sysfs at their standard locations.
    pub fn procfs() -> Self {
        Self::new(Box::new(ProcfsCounterSource::new(SamplerPaths::default())))
    }

    /// Acquire the counter facility.
    ///
    /// A failure is permanent: the sampler never touches the source again.
    pub fn initialize(&mut self) -> Result<()> {
        match self.state {
            SamplerState::Ready => Ok(()),
            SamplerState::Disabled => Err(SystemError::sampler_unavailable(
                "sampler disabled after failed initialization",
            )),
            SamplerState::Uninitialized => match self.source.start() {
                Ok(()) => {
                    self.state = SamplerState::Ready;
                    info!("Performance sampler initialized");
                    Ok(())
                }
                Err(err) => {
                    self.state = SamplerState::Disabled;
                    warn!("Performance sampler disabled: {}", err);
                    Err(SystemError::sampler_unavailable(err.to_string()))
                }
            },
        }
    }

    pub fn is_available(&self) -> bool {
        self.state == SamplerState::Ready
    }

    pub fn is_disabled(&self) -> bool {
        self.state == SamplerState::Disabled
    }

    /// Number of samples currently retained (0 to 2).
    pub fn retained_samples(&self) -> usize {
        self.window.len()
    }

    /// Take a new sample. On failure the window is left as it was.
    pub fn tick(&mut self) -> Result<()> {
        if self.state != SamplerState::Ready {
            return Err(SystemError::sampler_unavailable("sampler not initialized"));
        }
        let sample = self.source.read_sample()?;
        self.window.push(sample);
        Ok(())
    }

    /// CPU utilization between the two samples, in [0, 100].
    pub fn utilization_percent(&self) -> Result<f64> {
        let (previous, current) = self.window.pair()?;
        let total = current
            .cpu_total_jiffies
            .saturating_sub(previous.cpu_total_jiffies);
        let busy = current
            .cpu_busy_jiffies
            .saturating_sub(previous.cpu_busy_jiffies);
        if total == 0 {
            return Ok(0.0);
        }
        Ok((busy as f64 / total as f64 * 100.0).clamp(0.0, 100.0))
    }

    /// Package power averaged over the interval between the two samples.
    pub fn package_power_w(&self) -> Result<f64> {
        let (previous, current) = self.window.pair()?;
        let (Some(before), Some(after)) = (previous.package_energy_uj, current.package_energy_uj)
        else {
            return Err(SystemError::sampler_unavailable(
                "package energy counter not exposed",
            ));
        };

        let elapsed = current
            .taken_at
            .saturating_duration_since(previous.taken_at)
            .as_secs_f64();
        if elapsed <= 0.0 {
            return Ok(0.0);
        }

        let delta_uj = if after >= before {
            after - before
        } else {
            match current.energy_range_uj {
                Some(range) if range >= before => range - before + after,
                _ => 0,
            }
        };
        let watts = delta_uj as f64 / 1_000_000.0 / elapsed;
        Ok(if watts.is_finite() { watts.max(0.0) } else { 0.0 })
    }

    /// Average core frequency of the current sample in MHz.
    pub fn frequency_mhz(&self) -> Result<f64> {
        let (_, current) = self.window.pair()?;
        if current.core_frequencies_khz.is_empty() {
            return Err(SystemError::sampler_unavailable("no cpufreq counters"));
        }
        let sum: u64 = current.core_frequencies_khz.iter().sum();
        Ok(sum as f64 / current.core_frequencies_khz.len() as f64 / 1000.0)
    }

    /// Hottest package/core sensor of the current sample.
    pub fn package_temperature_c(&self) -> Result<f64> {
        let (_, current) = self.window.pair()?;
        current
            .temperatures_c
            .iter()
            .copied()
            .filter(|t| t.is_finite())
            .reduce(f64::max)
            .ok_or_else(|| SystemError::sampler_unavailable("no temperature sensors"))
    }
}

/// Locations of the kernel counters read by [`ProcfsCounterSource`].
#[derive(Debug, Clone, PartialEq)]
pub struct SamplerPaths {
    pub proc_stat: PathBuf,
    /// RAPL package domain directory (`energy_uj`, `max_energy_range_uj`)
    pub powercap: PathBuf,
    /// Directory holding `cpuN/cpufreq/scaling_cur_freq`
    pub cpu_root: PathBuf,
    pub hwmon_root: PathBuf,
    pub thermal_root: PathBuf,
}

impl Default for SamplerPaths {
    fn default() -> Self {
        Self::rooted_at(Path::new("/"))
    }
}

impl SamplerPaths {
    /// Standard layout below an alternate filesystem root.
    pub fn rooted_at(root: &Path) -> Self {
        Self {
            proc_stat: root.join("proc/stat"),
            powercap: root.join("sys/class/powercap/intel-rapl:0"),
            cpu_root: root.join("sys/devices/system/cpu"),
            hwmon_root: root.join("sys/class/hwmon"),
            thermal_root: root.join("sys/class/thermal"),
        }
    }
}

/// Counter source reading procfs, RAPL, cpufreq and hwmon.
pub struct ProcfsCounterSource {
    paths: SamplerPaths,
}

impl ProcfsCounterSource {
    pub fn new(paths: SamplerPaths) -> Self {
        Self { paths }
    }

    fn read_cpu_times(&self) -> Result<(u64, u64)> {
        let content = fs::read_to_string(&self.paths.proc_stat)?;
        parse_proc_stat(&content)
    }

    fn read_energy(&self) -> (Option<u64>, Option<u64>) {
        let energy = read_u64(&self.paths.powercap.join("energy_uj"));
        let range = read_u64(&self.paths.powercap.join("max_energy_range_uj"));
        (energy, range)
    }

    fn read_frequencies(&self) -> Vec<u64> {
        let Ok(entries) = fs::read_dir(&self.paths.cpu_root) else {
            return Vec::new();
        };
        entries
            .flatten()
            .filter(|entry| is_numbered(&entry.file_name().to_string_lossy(), "cpu"))
            .filter_map(|entry| read_u64(&entry.path().join("cpufreq/scaling_cur_freq")))
            .collect()
    }

    fn read_temperatures(&self) -> Vec<f64> {
        let hwmon = self.read_hwmon_temperatures();
        if !hwmon.is_empty() {
            return hwmon;
        }

        let Ok(entries) = fs::read_dir(&self.paths.thermal_root) else {
            return Vec::new();
        };
        entries
            .flatten()
            .filter(|entry| is_numbered(&entry.file_name().to_string_lossy(), "thermal_zone"))
            .filter_map(|entry| read_millidegrees(&entry.path().join("temp")))
            .collect()
    }

    fn read_hwmon_temperatures(&self) -> Vec<f64> {
        let Ok(entries) = fs::read_dir(&self.paths.hwmon_root) else {
            return Vec::new();
        };

        let mut temperatures = Vec::new();
        for entry in entries.flatten() {
            let dir = entry.path();
            let name = fs::read_to_string(dir.join("name")).unwrap_or_default();
            if !CPU_HWMON_NAMES.contains(&name.trim()) {
                continue;
            }
            let Ok(inputs) = fs::read_dir(&dir) else {
                continue;
            };
            for input in inputs.flatten() {
                let file_name = input.file_name();
                let file_name = file_name.to_string_lossy();
                if file_name.starts_with("temp") && file_name.ends_with("_input") {
                    if let Some(celsius) = read_millidegrees(&input.path()) {
                        temperatures.push(celsius);
                    }
                }
            }
        }
        temperatures
    }
}

impl CounterSource for ProcfsCounterSource {
    fn start(&mut self) -> Result<()> {
        self.read_cpu_times().map_err(|e| {
            SystemError::sampler_unavailable(format!(
                "cannot read {}: {}",
                self.paths.proc_stat.display(),
                e
            ))
        })?;

        let (energy, _) = self.read_energy();
        if energy.is_none() {
            info!("RAPL energy counter not available, package power will read 0");
        }
        if self.read_temperatures().is_empty() {
            info!("No CPU temperature sensors found");
        }
        Ok(())
    }

    fn read_sample(&mut self) -> Result<RawSample> {
        let (busy, total) = self.read_cpu_times()?;
        let (energy, range) = self.read_energy();
        let sample = RawSample {
            taken_at: Instant::now(),
            cpu_busy_jiffies: busy,
            cpu_total_jiffies: total,
            package_energy_uj: energy,
            energy_range_uj: range,
            core_frequencies_khz: self.read_frequencies(),
            temperatures_c: self.read_temperatures(),
        };
        debug!(
            busy,
            total,
            cores = sample.core_frequencies_khz.len(),
            sensors = sample.temperatures_c.len(),
            "Read counter sample"
        );
        Ok(sample)
    }
}

/// Parse the aggregate `cpu` line of `/proc/stat` into `(busy, total)` jiffies.
pub(crate) fn parse_proc_stat(content: &str) -> Result<(u64, u64)> {
    let line = content
        .lines()
        .find(|line| line.starts_with("cpu "))
        .ok_or_else(|| SystemError::parse_error("no aggregate cpu line in /proc/stat"))?;

    let fields = line
        .split_whitespace()
        .skip(1)
        .map(|field| field.parse::<u64>())
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| SystemError::parse_error(format!("bad /proc/stat field: {}", e)))?;

    if fields.len() < 4 {
        return Err(SystemError::parse_error("truncated cpu line in /proc/stat"));
    }

    // guest and guest_nice are already folded into user and nice
    let total: u64 = fields.iter().take(8).sum();
    let idle = fields[3] + fields.get(4).copied().unwrap_or(0);
    Ok((total.saturating_sub(idle), total))
}

fn read_u64(path: &Path) -> Option<u64> {
    fs::read_to_string(path).ok()?.trim().parse().ok()
}

fn read_millidegrees(path: &Path) -> Option<f64> {
    let millidegrees: i64 = fs::read_to_string(path).ok()?.trim().parse().ok()?;
    Some(millidegrees as f64 / 1000.0)
}

fn is_numbered(name: &str, prefix: &str) -> bool {
    name.strip_prefix(prefix)
        .is_some_and(|rest| !rest.is_empty() && rest.chars().all(|c| c.is_ascii_digit()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fake::ScriptedCounterSource;
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    fn ready_sampler(samples: Vec<Result<RawSample>>) -> PerformanceSampler {
        let mut sampler = PerformanceSampler::new(Box::new(ScriptedCounterSource::new(samples)));
        sampler.initialize().unwrap();
        sampler
    }

    #[test]
    fn test_parse_proc_stat() {
        let content = "\
cpu  10000 500 3000 80000 1000 200 100 0 0 0
cpu0 2500 125 750 20000 250 50 25 0 0 0
ctxt 500000
";
        let (busy, total) = parse_proc_stat(content).unwrap();
        assert_eq!(total, 94_800);
        assert_eq!(busy, 94_800 - 80_000 - 1_000);
    }

    #[test]
    fn test_parse_proc_stat_rejects_garbage() {
        assert!(parse_proc_stat("intr 1 2 3\n").is_err());
        assert!(parse_proc_stat("cpu  1 2\n").is_err());
        assert!(parse_proc_stat("cpu  a b c d\n").is_err());
    }

    #[test]
    fn test_window_keeps_two_samples() {
        let t0 = Instant::now();
        let mut window = SampleWindow::default();
        assert!(window.is_empty());
        assert!(matches!(
            window.pair(),
            Err(SystemError::InsufficientSamples { available: 0 })
        ));

        window.push(RawSample::new(t0, 1, 10));
        assert!(matches!(
            window.pair(),
            Err(SystemError::InsufficientSamples { available: 1 })
        ));

        window.push(RawSample::new(t0, 2, 20));
        window.push(RawSample::new(t0, 3, 30));
        assert_eq!(window.len(), 2);
        let (previous, current) = window.pair().unwrap();
        assert_eq!(previous.cpu_busy_jiffies, 2);
        assert_eq!(current.cpu_busy_jiffies, 3);
    }

    #[test]
    fn test_single_sample_reports_unavailable() {
        let t0 = Instant::now();
        let mut sampler = ready_sampler(vec![Ok(RawSample::new(t0, 0, 0))]);
        sampler.tick().unwrap();

        assert!(matches!(
            sampler.utilization_percent(),
            Err(SystemError::InsufficientSamples { available: 1 })
        ));
        assert!(sampler.package_power_w().is_err());
        assert!(sampler.frequency_mhz().is_err());
        assert!(sampler.package_temperature_c().is_err());
    }

    #[test]
    fn test_differential_metrics() {
        let t0 = Instant::now();
        let t1 = t0 + Duration::from_secs(2);
        let mut sampler = ready_sampler(vec![
            Ok(RawSample::new(t0, 1_000, 4_000)
                .with_energy(10_000_000, Some(262_143_328_850))
                .with_frequencies(vec![800_000, 800_000])
                .with_temperatures(vec![40.0, 41.0])),
            Ok(RawSample::new(t1, 1_250, 4_400)
                .with_energy(100_000_000, Some(262_143_328_850))
                .with_frequencies(vec![4_000_000, 4_400_000])
                .with_temperatures(vec![65.0, 72.5, 70.0])),
        ]);
        sampler.tick().unwrap();
        sampler.tick().unwrap();

        assert_eq!(sampler.utilization_percent().unwrap(), 62.5);
        assert!((sampler.package_power_w().unwrap() - 45.0).abs() < 1e-9);
        assert_eq!(sampler.frequency_mhz().unwrap(), 4200.0);
        assert_eq!(sampler.package_temperature_c().unwrap(), 72.5);
    }

    #[test]
    fn test_metrics_stay_in_range_on_counter_anomalies() {
        let t0 = Instant::now();
        let mut sampler = ready_sampler(vec![
            Ok(RawSample::new(t0, 5_000, 4_000).with_energy(500, None)),
            // busy runs ahead of total, energy goes backwards without a range
            Ok(RawSample::new(t0, 9_000, 4_100).with_energy(100, None)),
        ]);
        sampler.tick().unwrap();
        sampler.tick().unwrap();

        let utilization = sampler.utilization_percent().unwrap();
        assert!((0.0..=100.0).contains(&utilization));
        let power = sampler.package_power_w().unwrap();
        assert!(power.is_finite());
        assert!(power >= 0.0);
    }

    #[test]
    fn test_energy_wraparound_uses_range() {
        let t0 = Instant::now();
        let t1 = t0 + Duration::from_secs(1);
        let mut sampler = ready_sampler(vec![
            Ok(RawSample::new(t0, 0, 100).with_energy(999_000_000, Some(1_000_000_000))),
            Ok(RawSample::new(t1, 0, 200).with_energy(4_000_000, Some(1_000_000_000))),
        ]);
        sampler.tick().unwrap();
        sampler.tick().unwrap();

        assert!((sampler.package_power_w().unwrap() - 5.0).abs() < 1e-9);
    }

    #[test]
    fn test_failed_initialization_is_permanent() {
        let source = ScriptedCounterSource::unavailable();
        let starts = source.start_counter();
        let mut sampler = PerformanceSampler::new(Box::new(source));

        assert!(matches!(
            sampler.initialize(),
            Err(SystemError::SamplerUnavailable(_))
        ));
        assert!(sampler.is_disabled());
        assert!(sampler.initialize().is_err());
        assert!(sampler.tick().is_err());
        assert_eq!(starts.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_failed_tick_keeps_previous_window() {
        let t0 = Instant::now();
        let t1 = t0 + Duration::from_secs(1);
        let mut sampler = ready_sampler(vec![
            Ok(RawSample::new(t0, 0, 100)),
            Ok(RawSample::new(t1, 50, 200)),
            Err(SystemError::parse_error("torn read")),
        ]);
        sampler.tick().unwrap();
        sampler.tick().unwrap();
        assert!(sampler.tick().is_err());

        assert_eq!(sampler.retained_samples(), 2);
        assert_eq!(sampler.utilization_percent().unwrap(), 50.0);
    }

    #[test]
    fn test_procfs_source_reads_fixture_tree() {
        let root = tempfile::tempdir().unwrap();
        let paths = SamplerPaths::rooted_at(root.path());

        fs::create_dir_all(paths.proc_stat.parent().unwrap()).unwrap();
        fs::write(&paths.proc_stat, "cpu  100 0 100 800 0 0 0 0 0 0\n").unwrap();

        fs::create_dir_all(&paths.powercap).unwrap();
        fs::write(paths.powercap.join("energy_uj"), "123456\n").unwrap();
        fs::write(paths.powercap.join("max_energy_range_uj"), "262143328850\n").unwrap();

        for (cpu, khz) in [("cpu0", "3600000"), ("cpu1", "4000000")] {
            let dir = paths.cpu_root.join(cpu).join("cpufreq");
            fs::create_dir_all(&dir).unwrap();
            fs::write(dir.join("scaling_cur_freq"), khz).unwrap();
        }
        fs::create_dir_all(paths.cpu_root.join("cpufreq")).unwrap();

        let coretemp = paths.hwmon_root.join("hwmon1");
        fs::create_dir_all(&coretemp).unwrap();
        fs::write(coretemp.join("name"), "coretemp\n").unwrap();
        fs::write(coretemp.join("temp1_input"), "68000\n").unwrap();
        fs::write(coretemp.join("temp2_input"), "71500\n").unwrap();
        let nvme = paths.hwmon_root.join("hwmon2");
        fs::create_dir_all(&nvme).unwrap();
        fs::write(nvme.join("name"), "nvme\n").unwrap();
        fs::write(nvme.join("temp1_input"), "90000\n").unwrap();

        let mut source = ProcfsCounterSource::new(paths);
        source.start().unwrap();
        let sample = source.read_sample().unwrap();

        assert_eq!(sample.cpu_total_jiffies, 1_000);
        assert_eq!(sample.cpu_busy_jiffies, 200);
        assert_eq!(sample.package_energy_uj, Some(123_456));
        assert_eq!(sample.energy_range_uj, Some(262_143_328_850));
        let mut freqs = sample.core_frequencies_khz.clone();
        freqs.sort_unstable();
        assert_eq!(freqs, vec![3_600_000, 4_000_000]);
        let mut temps = sample.temperatures_c.clone();
        temps.sort_by(f64::total_cmp);
        assert_eq!(temps, vec![68.0, 71.5]);
    }

    #[test]
    fn test_procfs_source_falls_back_to_thermal_zones() {
        let root = tempfile::tempdir().unwrap();
        let paths = SamplerPaths::rooted_at(root.path());
        fs::create_dir_all(paths.proc_stat.parent().unwrap()).unwrap();
        fs::write(&paths.proc_stat, "cpu  1 1 1 1\n").unwrap();
        let zone = paths.thermal_root.join("thermal_zone0");
        fs::create_dir_all(&zone).unwrap();
        fs::write(zone.join("temp"), "55250\n").unwrap();

        let mut source = ProcfsCounterSource::new(paths);
        let sample = source.read_sample().unwrap();
        assert_eq!(sample.temperatures_c, vec![55.25]);
        assert_eq!(sample.package_energy_uj, None);
    }

    #[test]
    fn test_procfs_source_without_proc_stat_is_unavailable() {
        let root = tempfile::tempdir().unwrap();
        let mut source = ProcfsCounterSource::new(SamplerPaths::rooted_at(root.path()));
        assert!(matches!(
            source.start(),
            Err(SystemError::SamplerUnavailable(_))
        ));
    }
}
