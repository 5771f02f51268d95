//! Periodic driver of the sample → encode → deliver pipeline.
//!
//! One tokio task runs the pipeline strictly sequentially once per tick and
//! publishes each snapshot through a `watch` channel. The expensive hardware
//! queries run in a second task and hand their results over through another
//! `watch` channel, which the tick merges without waiting on it.

use crate::config::MonitorConfig;
use crate::device::{DeviceManager, FrameEncoder};
use crate::error::{Result, SystemError};
use crate::metrics::data::{CpuMetrics, HardwareInfo, MetricsSnapshot};
use crate::metrics::probe::{spawn_probe_task, CommandProbe, ProbeSchedule};
use crate::metrics::{HardwareProbe, MetricsAggregator, PerformanceSampler};
use futures_util::stream::BoxStream;
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tokio_stream::wrappers::WatchStream;
use tracing::{debug, error, info, warn};

/// Lifecycle of a [`Scheduler`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SchedulerState {
    Idle,
    Running,
    Cancelled,
}

/// The components driven on every tick, plus the last published values.
pub struct Pipeline {
    sampler: PerformanceSampler,
    aggregator: MetricsAggregator,
    device: DeviceManager,
    last: MetricsSnapshot,
    prepared: bool,
    link_up: bool,
}

impl Pipeline {
    pub fn new(
        sampler: PerformanceSampler,
        aggregator: MetricsAggregator,
        device: DeviceManager,
    ) -> Self {
        Self {
            sampler,
            aggregator,
            device,
            last: MetricsSnapshot::new(),
            prepared: false,
            link_up: false,
        }
    }

    /// Pipeline over procfs counters and the compiled-in HID backend.
    pub fn from_config(config: &MonitorConfig) -> Result<Self> {
        let device = DeviceManager::with_default_backend(
            config.vendor_id,
            config.product_id,
            config.rediscover_after_failures,
        )?;
        Ok(Self::new(
            PerformanceSampler::procfs(),
            MetricsAggregator::new(config.mount_point.clone()),
            device,
        ))
    }

    /// One-time setup before the first tick, then device discovery.
    ///
    /// Neither step is fatal: a missing sampler zeroes CPU fields and a
    /// missing device is retried by later ticks.
    pub fn prepare(&mut self) {
        if !self.prepared {
            let (model, cores) = self.aggregator.cpu_identity();
            self.last.cpu.model = model;
            self.last.cpu.core_count = cores;
            if let Err(err) = self.sampler.initialize() {
                warn!("CPU metrics unavailable, reporting zeros: {}", err);
            }
            self.prepared = true;
        }

        match self.device.discover() {
            Ok(()) => self.link_up = true,
            Err(err) => warn!("{}; metrics will still be collected", err),
        }
    }

    pub fn device(&self) -> &DeviceManager {
        &self.device
    }

    pub fn device_mut(&mut self) -> &mut DeviceManager {
        &mut self.device
    }

    /// Run one iteration and return the snapshot to publish.
    pub fn run_tick(&mut self, hardware: &HardwareInfo) -> MetricsSnapshot {
        let mut snapshot = self.last.clone();
        snapshot.touch();

        self.update_cpu(&mut snapshot.cpu);

        let core = self.aggregator.poll_core();
        let ram_frequency = snapshot.memory.frequency_mhz;
        snapshot.memory = core.memory;
        snapshot.memory.frequency_mhz = ram_frequency;
        snapshot.disk = core.disk;
        snapshot.network = core.network;

        hardware.apply_to(&mut snapshot);

        let frame = FrameEncoder::encode(&snapshot);
        snapshot.device_connected = self.deliver(&frame);

        self.last = snapshot.clone();
        snapshot
    }

    fn update_cpu(&mut self, cpu: &mut CpuMetrics) {
        if self.sampler.is_disabled() {
            cpu.utilization_percent = 0.0;
            cpu.frequency_mhz = 0.0;
            cpu.package_temp_c = 0.0;
            cpu.package_power_w = 0.0;
            return;
        }

        if let Err(err) = self.sampler.tick() {
            debug!("Sampler tick failed, keeping previous CPU metrics: {}", err);
            return;
        }

        match self.sampler.utilization_percent() {
            Ok(value) => cpu.utilization_percent = value,
            Err(err) => debug!("CPU utilization unavailable: {}", err),
        }
        if let Ok(value) = self.sampler.frequency_mhz() {
            cpu.frequency_mhz = value;
        }
        if let Ok(value) = self.sampler.package_temperature_c() {
            cpu.package_temp_c = value;
        }
        if let Ok(value) = self.sampler.package_power_w() {
            cpu.package_power_w = value;
        }
    }

    fn deliver(&mut self, frame: &crate::device::CommandFrame) -> bool {
        self.device.maybe_rediscover(Instant::now());

        let delivered = match self.device.send(frame) {
            Ok(()) => true,
            Err(err) => {
                if self.link_up {
                    warn!("Display update failed: {}", err);
                } else {
                    debug!("Display update skipped: {}", err);
                }
                false
            }
        };

        if delivered && !self.link_up {
            info!("Display link established");
        }
        self.link_up = delivered;
        delivered
    }
}

/// Owns the pipeline and runs it on a fixed interval.
pub struct Scheduler {
    config: MonitorConfig,
    state: SchedulerState,
    pipeline: Option<Pipeline>,
    probe: Arc<dyn HardwareProbe>,
    hardware: Arc<watch::Sender<HardwareInfo>>,
    snapshots: Arc<watch::Sender<MetricsSnapshot>>,
    shutdown: Option<watch::Sender<bool>>,
    task: Option<JoinHandle<Pipeline>>,
    probe_task: Option<JoinHandle<()>>,
}

impl Scheduler {
    /// Scheduler over the default hardware sources.
    pub fn new(config: MonitorConfig) -> Result<Self> {
        config.validate()?;
        let pipeline = Pipeline::from_config(&config)?;
        let probe = Arc::new(CommandProbe::new(config.query_timeout()));
        Self::with_components(config, pipeline, probe)
    }

    /// Scheduler over caller-supplied components.
    pub fn with_components(
        config: MonitorConfig,
        pipeline: Pipeline,
        probe: Arc<dyn HardwareProbe>,
    ) -> Result<Self> {
        config.validate()?;
        let (hardware, _) = watch::channel(HardwareInfo::default());
        let (snapshots, _) = watch::channel(MetricsSnapshot::new());
        Ok(Self {
            config,
            state: SchedulerState::Idle,
            pipeline: Some(pipeline),
            probe,
            hardware: Arc::new(hardware),
            snapshots: Arc::new(snapshots),
            shutdown: None,
            task: None,
            probe_task: None,
        })
    }

    pub fn state(&self) -> SchedulerState {
        self.state
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }

    /// Begin the periodic loop. Must be called from within a tokio runtime.
    pub fn start(&mut self) -> Result<()> {
        if self.state == SchedulerState::Running {
            return Err(SystemError::scheduler_error("scheduler is already running"));
        }
        let mut pipeline = self.pipeline.take().ok_or_else(|| {
            SystemError::scheduler_error("pipeline was lost by a previous run")
        })?;
        pipeline.prepare();

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let schedule = ProbeSchedule {
            profile_interval: self.config.profile_interval(),
            gpu_usage_interval: self.config.gpu_usage_interval(),
        };
        self.probe_task = Some(spawn_probe_task(
            Arc::clone(&self.probe),
            schedule,
            Arc::clone(&self.hardware),
            shutdown_rx.clone(),
        ));

        self.task = Some(tokio::spawn(run_loop(
            pipeline,
            self.config.interval(),
            self.hardware.subscribe(),
            Arc::clone(&self.snapshots),
            shutdown_rx,
        )));
        self.shutdown = Some(shutdown_tx);
        self.state = SchedulerState::Running;
        info!(
            "Scheduler started with {}ms interval",
            self.config.interval_ms
        );
        Ok(())
    }

    /// Stop the loop after its in-flight iteration completes.
    ///
    /// The hardware-probe task is signalled but not awaited; a hung external
    /// query only delays its own exit.
    pub async fn stop(&mut self) -> Result<()> {
        if self.state != SchedulerState::Running {
            return Ok(());
        }
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(true);
        }
        self.probe_task = None;

        if let Some(task) = self.task.take() {
            match task.await {
                Ok(pipeline) => self.pipeline = Some(pipeline),
                Err(err) => error!("Scheduler loop ended abnormally: {}", err),
            }
        }
        self.state = SchedulerState::Cancelled;
        info!("Scheduler stopped");
        Ok(())
    }

    /// Release the display handle. Only allowed while the loop is not running.
    pub fn disconnect_device(&mut self) -> Result<()> {
        match self.pipeline.as_mut() {
            Some(pipeline) if self.state != SchedulerState::Running => {
                pipeline.device_mut().disconnect();
                Ok(())
            }
            _ => Err(SystemError::scheduler_error(
                "cannot disconnect while the scheduler is running",
            )),
        }
    }

    /// Receiver that observes every published snapshot.
    pub fn subscribe(&self) -> watch::Receiver<MetricsSnapshot> {
        self.snapshots.subscribe()
    }

    /// Most recently published snapshot.
    pub fn latest(&self) -> MetricsSnapshot {
        self.snapshots.borrow().clone()
    }

    /// Stream of snapshots published from now on.
    pub fn stream(&self) -> BoxStream<'static, MetricsSnapshot> {
        Box::pin(WatchStream::from_changes(self.snapshots.subscribe()))
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(true);
        }
    }
}

async fn run_loop(
    mut pipeline: Pipeline,
    period: Duration,
    hardware: watch::Receiver<HardwareInfo>,
    snapshots: Arc<watch::Sender<MetricsSnapshot>>,
    mut shutdown: watch::Receiver<bool>,
) -> Pipeline {
    let mut ticker = time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
                continue;
            }
            _ = ticker.tick() => {}
        }

        let info = hardware.borrow().clone();
        let snapshot = pipeline.run_tick(&info);
        snapshots.send_replace(snapshot);
    }

    debug!("Scheduler loop exited");
    pipeline
}
