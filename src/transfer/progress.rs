//! Shared progress state published by the engine and polled by observers.
//!
//! An observer (UI, status poller) reads the percent and status text from a
//! different thread of control than the one running the backup. Each field
//! is individually safe to read; no consistent percent+status pair at one
//! instant is promised, only convergence to the latest values.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tracing::info;

/// Cloneable handle over the run's progress percent and status line.
#[derive(Clone, Default)]
pub struct ProgressHandle {
    percent_bits: Arc<AtomicU64>,
    status: Arc<Mutex<String>>,
}

impl ProgressHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish a progress percentage, clamped to [0, 100].
    pub fn set_percent(&self, percent: f64) {
        let clamped = percent.clamp(0.0, 100.0);
        self.percent_bits.store(clamped.to_bits(), Ordering::Relaxed);
    }

    pub fn percent(&self) -> f64 {
        f64::from_bits(self.percent_bits.load(Ordering::Relaxed))
    }

    /// Publish a status line. Non-empty statuses are logged as they are the
    /// engine's phase announcements.
    pub fn set_status(&self, text: &str) {
        if !text.is_empty() {
            info!("{}", text);
        }
        if let Ok(mut status) = self.status.lock() {
            *status = text.to_string();
        }
    }

    pub fn status(&self) -> String {
        self.status
            .lock()
            .map(|status| status.clone())
            .unwrap_or_default()
    }

    /// Clear both fields after the post-run settle delay.
    pub fn reset(&self) {
        self.percent_bits.store(0f64.to_bits(), Ordering::Relaxed);
        if let Ok(mut status) = self.status.lock() {
            status.clear();
        }
    }
}

/// Format bytes as a human-readable string.
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit_index = 0;

    while size >= 1024.0 && unit_index < UNITS.len() - 1 {
        size /= 1024.0;
        unit_index += 1;
    }

    format!("{:.2} {}", size, UNITS[unit_index])
}
