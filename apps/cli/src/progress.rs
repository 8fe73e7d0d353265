//! Terminal output for upload notifications.

use std::collections::HashMap;
use std::sync::Mutex;

use movor_session::{UploadObserver, UploadState};
use movor_transfer::TransferError;

/// Prints progress in whole-percent steps, plus results and failures.
#[derive(Default)]
pub struct ProgressPrinter {
    last_percent: Mutex<HashMap<String, u64>>,
}

fn short(id: &str) -> &str {
    id.get(..8).unwrap_or(id)
}

impl UploadObserver for ProgressPrinter {
    fn on_progress(&self, upload_id: &str, bytes_written: u64, bytes_total: u64) {
        let percent = if bytes_total == 0 {
            100
        } else {
            (bytes_written as f64 / bytes_total as f64 * 100.0) as u64
        };
        let mut last = self.last_percent.lock().unwrap_or_else(|e| e.into_inner());
        if last.get(upload_id) == Some(&percent) {
            return;
        }
        last.insert(upload_id.to_string(), percent);
        println!(
            "{}  {percent:>3}%  {bytes_written}/{bytes_total}",
            short(upload_id)
        );
    }

    fn on_result(&self, upload_id: &str, remote_url: &str) {
        println!("{}  done  {remote_url}", short(upload_id));
    }

    fn on_failure(&self, upload_id: &str, error: &TransferError) {
        eprintln!("{}  failed: {error}", short(upload_id));
    }

    fn on_state_change(&self, upload_id: &str, state: UploadState) {
        if state == UploadState::Paused {
            println!("{}  paused", short(upload_id));
        }
    }
}
