//! Scripted stand-ins for the hardware seams, used by tests and benches.

use crate::device::hid::{HidBackend, HidTransport};
use crate::error::{Result, SystemError};
use crate::metrics::sampler::RawSample;
use crate::metrics::traits::{CounterSource, GpuIdentity, HardwareProbe};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Counter source that replays a fixed list of readings.
///
/// Once the script is exhausted it keeps producing readings that advance by
/// one second and 100 jiffies (half busy), so long-running tests never starve.
pub struct ScriptedCounterSource {
    available: bool,
    script: VecDeque<Result<RawSample>>,
    starts: Arc<AtomicUsize>,
    reads: Arc<AtomicUsize>,
    last: Option<RawSample>,
}

impl ScriptedCounterSource {
    pub fn new(script: Vec<Result<RawSample>>) -> Self {
        Self {
            available: true,
            script: script.into(),
            starts: Arc::new(AtomicUsize::new(0)),
            reads: Arc::new(AtomicUsize::new(0)),
            last: None,
        }
    }

    /// A source whose `start` always fails.
    pub fn unavailable() -> Self {
        Self {
            available: false,
            ..Self::new(Vec::new())
        }
    }

    pub fn start_counter(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.starts)
    }

    pub fn read_counter(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.reads)
    }
}

impl CounterSource for ScriptedCounterSource {
    fn start(&mut self) -> Result<()> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        if self.available {
            Ok(())
        } else {
            Err(SystemError::sampler_unavailable("scripted: no counters"))
        }
    }

    fn read_sample(&mut self) -> Result<RawSample> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        let next = match self.script.pop_front() {
            Some(entry) => entry,
            None => Ok(match &self.last {
                Some(last) => {
                    let mut sample = last.clone();
                    sample.taken_at = last.taken_at + Duration::from_secs(1);
                    sample.cpu_busy_jiffies += 50;
                    sample.cpu_total_jiffies += 100;
                    sample
                }
                None => RawSample::new(Instant::now(), 0, 0),
            }),
        };
        if let Ok(sample) = &next {
            self.last = Some(sample.clone());
        }
        next
    }
}

/// HID backend that records every report written to it.
pub struct RecordingHidBackend {
    present: bool,
    fail_writes: Arc<AtomicBool>,
    writes: Arc<Mutex<Vec<Vec<u8>>>>,
    opens: Arc<AtomicUsize>,
}

impl RecordingHidBackend {
    /// A backend where the peripheral is plugged in.
    pub fn present() -> Self {
        Self {
            present: true,
            fail_writes: Arc::new(AtomicBool::new(false)),
            writes: Arc::new(Mutex::new(Vec::new())),
            opens: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// A backend where no matching peripheral exists.
    pub fn absent() -> Self {
        Self {
            present: false,
            ..Self::present()
        }
    }

    pub fn failing_writes(self, fail: bool) -> Self {
        self.fail_writes.store(fail, Ordering::SeqCst);
        self
    }

    /// Toggle write failures after the backend has been handed off.
    pub fn write_failure_switch(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.fail_writes)
    }

    pub fn writes(&self) -> Arc<Mutex<Vec<Vec<u8>>>> {
        Arc::clone(&self.writes)
    }

    pub fn opens(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.opens)
    }
}

impl HidBackend for RecordingHidBackend {
    fn open(&mut self, vendor_id: u16, product_id: u16) -> Result<Box<dyn HidTransport>> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        if !self.present {
            return Err(SystemError::DeviceNotFound {
                vendor_id,
                product_id,
            });
        }
        Ok(Box::new(RecordingTransport {
            fail_writes: Arc::clone(&self.fail_writes),
            writes: Arc::clone(&self.writes),
        }))
    }
}

struct RecordingTransport {
    fail_writes: Arc<AtomicBool>,
    writes: Arc<Mutex<Vec<Vec<u8>>>>,
}

impl HidTransport for RecordingTransport {
    fn write_report(&mut self, report: &[u8]) -> Result<usize> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(SystemError::device_write("scripted: device unplugged"));
        }
        self.writes
            .lock()
            .map_err(|_| SystemError::device_write("recording lock poisoned"))?
            .push(report.to_vec());
        Ok(report.len())
    }

    fn describe(&self) -> String {
        "recording transport".to_string()
    }
}

/// Probe returning canned answers; unset queries fail.
#[derive(Default)]
pub struct CannedProbe {
    identity: Option<std::result::Result<GpuIdentity, String>>,
    memory_frequency: Option<std::result::Result<f64, String>>,
    gpu_usage: Option<std::result::Result<f64, String>>,
    delay: Option<Duration>,
}

impl CannedProbe {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_identity(mut self, identity: Result<GpuIdentity>) -> Self {
        self.identity = Some(identity.map_err(|e| e.to_string()));
        self
    }

    pub fn with_memory_frequency(mut self, mhz: Result<f64>) -> Self {
        self.memory_frequency = Some(mhz.map_err(|e| e.to_string()));
        self
    }

    pub fn with_gpu_usage(mut self, percent: Result<f64>) -> Self {
        self.gpu_usage = Some(percent.map_err(|e| e.to_string()));
        self
    }

    /// Make every query take `delay` before answering.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    async fn answer<T: Clone + Send + Sync>(
        &self,
        query: &str,
        canned: &Option<std::result::Result<T, String>>,
    ) -> Result<T> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        match canned {
            Some(Ok(value)) => Ok(value.clone()),
            Some(Err(reason)) => Err(SystemError::external_query(query, reason.clone())),
            None => Err(SystemError::external_query(query, "no canned answer")),
        }
    }
}

#[async_trait]
impl HardwareProbe for CannedProbe {
    async fn gpu_identity(&self) -> Result<GpuIdentity> {
        self.answer("gpu identity", &self.identity).await
    }

    async fn memory_frequency(&self) -> Result<f64> {
        self.answer("memory frequency", &self.memory_frequency).await
    }

    async fn gpu_usage(&self) -> Result<f64> {
        self.answer("gpu usage", &self.gpu_usage).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scripted_source_extrapolates_after_script() {
        let t0 = Instant::now();
        let mut source = ScriptedCounterSource::new(vec![Ok(RawSample::new(t0, 10, 20))]);
        let first = source.read_sample().unwrap();
        let second = source.read_sample().unwrap();
        assert_eq!(first.cpu_busy_jiffies, 10);
        assert_eq!(second.cpu_busy_jiffies, 60);
        assert_eq!(second.cpu_total_jiffies, 120);
        assert_eq!(second.taken_at, t0 + Duration::from_secs(1));
        assert_eq!(source.read_counter().load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_recording_backend_switch() {
        let mut backend = RecordingHidBackend::present();
        let switch = backend.write_failure_switch();
        let mut transport = backend.open(1, 2).unwrap();
        assert_eq!(transport.write_report(&[0, 1, 2]).unwrap(), 3);
        switch.store(true, Ordering::SeqCst);
        assert!(transport.write_report(&[0]).is_err());
        assert_eq!(backend.writes().lock().unwrap().len(), 1);
    }
}
