//! Serial console recorder

use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufWriter};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::errors::LabError;
use crate::exec::local::execute;
use crate::storage::catalog::DeviceConfig;

/// How long one read may block before the stop token is checked again
const READ_POLL: Duration = Duration::from_millis(100);

/// Records a serial port into a log file, one timestamped line at a time
#[derive(Debug, Clone)]
pub struct SerialRecorder {
    port: PathBuf,
    baud: Option<String>,
    output: PathBuf,
}

impl SerialRecorder {
    pub fn new(port: impl Into<PathBuf>, baud: Option<String>, output: impl Into<PathBuf>) -> Self {
        Self {
            port: port.into(),
            baud,
            output: output.into(),
        }
    }

    /// Recorder for the device's `serial_port` at `serial_bauds`
    pub fn from_config(config: &DeviceConfig) -> Result<Self, LabError> {
        match (config.get("serial_port"), config.get("serial_bauds")) {
            (Some(port), Some(baud)) => Ok(Self::new(
                port,
                Some(baud.to_string()),
                config.get("serial_log_name").unwrap_or("serial.log"),
            )),
            _ => Err(LabError::ConfigError(format!(
                "Configuration for device {} doesn't include serial_port and/or serial_bauds.",
                config.name
            ))),
        }
    }

    pub fn output(&self) -> &Path {
        &self.output
    }

    /// Start recording until `stop` is cancelled
    pub fn spawn(self, stop: CancellationToken) -> JoinHandle<Result<(), LabError>> {
        tokio::spawn(async move {
            let result = self.record(stop).await;
            if let Err(e) = &result {
                warn!("Serial recorder stopped: {}", e);
            }
            result
        })
    }

    async fn record(&self, stop: CancellationToken) -> Result<(), LabError> {
        if let Some(baud) = &self.baud {
            let port = self.port.display().to_string();
            execute(
                &["stty", "-F", &port, baud, "raw", "-echo", "ixon"],
                Duration::from_secs(5),
                &[],
            )
            .await?;
        }

        let mut input = File::open(&self.port).await?;
        let output = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&self.output)
            .await?;
        let mut output = BufWriter::new(output);
        info!(
            "Starting recording from {} to {}.",
            self.port.display(),
            self.output.display()
        );

        let mut pending: Vec<u8> = Vec::new();
        let mut chunk = [0u8; 4096];
        while !stop.is_cancelled() {
            let read = match tokio::time::timeout(READ_POLL, input.read(&mut chunk)).await {
                Ok(read) => read?,
                Err(_) => continue,
            };
            if read == 0 {
                // Nothing new; regular files report EOF instead of blocking
                tokio::time::sleep(READ_POLL).await;
                continue;
            }

            pending.extend_from_slice(&chunk[..read]);
            if let Some(last_newline) = pending.iter().rposition(|b| *b == b'\n') {
                let lines: Vec<u8> = pending.drain(..=last_newline).collect();
                output.write_all(timestamp_lines(&lines).as_bytes()).await?;
                output.flush().await?;
            }
        }

        if !pending.is_empty() {
            output.write_all(timestamp_lines(&pending).as_bytes()).await?;
        }
        output.flush().await?;
        info!("Stopped recording {}", self.port.display());
        Ok(())
    }
}

/// Prefix each line with the current unix time. Serial consoles are not
/// guaranteed UTF-8, so bytes are decoded as Latin-1.
pub fn timestamp_lines(bytes: &[u8]) -> String {
    let now = chrono::Utc::now();
    let stamp = format!("[{}.{:06}] ", now.timestamp(), now.timestamp_subsec_micros());
    let text: String = bytes.iter().map(|b| *b as char).collect();

    let mut stamped = String::with_capacity(text.len() + stamp.len());
    for line in text.split_inclusive('\n') {
        stamped.push_str(&stamp);
        stamped.push_str(line);
    }
    stamped
}
