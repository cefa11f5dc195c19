//! # Time Synchronization Module
//!
//! Keeps an offset between the device clock and an external reference clock
//! so recordings from different devices can be aligned afterwards.
//!
//! ## Hybrid Timestamps
//! Every session stores two clocks:
//! - a monotonic `Instant` pair for elapsed time (immune to clock jumps)
//! - a reference-corrected UTC pair for cross-device alignment
//!
//! When the reference clock cannot be reached the session falls back to the
//! device UTC clock and logs a warning. Recording is never blocked on it.

use crate::error::ClockError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::net::UdpSocket;
use std::time::{Duration, Instant};

/// Seconds between 1900-01-01 (NTP epoch) and 1970-01-01
const NTP_UNIX_OFFSET_SECS: u64 = 2_208_988_800;

/// Device wall clock in milliseconds since the Unix epoch
pub fn device_now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// Source of "true" time
pub trait ReferenceClock: Send {
    fn fetch_reference_ms(&self) -> Result<i64, ClockError>;
}

/// Minimal SNTP (RFC 4330) client
pub struct SntpClock {
    server: String,
    timeout: Duration,
}

impl SntpClock {
    pub fn new(server: impl Into<String>, timeout: Duration) -> Self {
        Self {
            server: server.into(),
            timeout,
        }
    }

    fn parse_transmit_ms(packet: &[u8]) -> Result<i64, ClockError> {
        if packet.len() < 48 {
            return Err(ClockError::BadResponse(format!(
                "short packet ({} bytes)",
                packet.len()
            )));
        }

        let mode = packet[0] & 0x07;
        if mode != 4 {
            return Err(ClockError::BadResponse(format!("unexpected mode {}", mode)));
        }
        if packet[1] == 0 {
            return Err(ClockError::BadResponse("kiss-of-death (stratum 0)".to_string()));
        }

        let seconds = u32::from_be_bytes([packet[40], packet[41], packet[42], packet[43]]) as u64;
        let fraction = u32::from_be_bytes([packet[44], packet[45], packet[46], packet[47]]) as u64;
        if seconds < NTP_UNIX_OFFSET_SECS {
            return Err(ClockError::BadResponse("transmit time before 1970".to_string()));
        }

        let millis = (seconds - NTP_UNIX_OFFSET_SECS) * 1_000 + ((fraction * 1_000) >> 32);
        Ok(millis as i64)
    }
}

impl ReferenceClock for SntpClock {
    fn fetch_reference_ms(&self) -> Result<i64, ClockError> {
        let socket = UdpSocket::bind("0.0.0.0:0").map_err(ClockError::Unavailable)?;
        socket
            .set_read_timeout(Some(self.timeout))
            .map_err(ClockError::Unavailable)?;
        socket
            .connect(self.server.as_str())
            .map_err(ClockError::Unavailable)?;

        let mut request = [0u8; 48];
        // LI = 0, VN = 4, Mode = 3 (client)
        request[0] = 0x23;
        socket.send(&request).map_err(ClockError::Unavailable)?;

        let mut response = [0u8; 48];
        let len = socket.recv(&mut response).map_err(ClockError::Unavailable)?;
        Self::parse_transmit_ms(&response[..len])
    }
}

/// Offset estimate between device and reference clocks
pub struct TimeSync {
    clock: Box<dyn ReferenceClock>,
    max_uncertainty_ms: i64,
    offset_ms: i64,
    uncertainty_ms: Option<i64>,
    last_refresh: Option<DateTime<Utc>>,
}

impl TimeSync {
    pub fn new(clock: impl ReferenceClock + 'static, max_uncertainty_ms: i64) -> Self {
        Self {
            clock: Box::new(clock),
            max_uncertainty_ms,
            offset_ms: 0,
            uncertainty_ms: None,
            last_refresh: None,
        }
    }

    /// Query the reference clock and update the offset.
    ///
    /// On failure the previous estimate (if any) is kept.
    pub fn refresh(&mut self) -> Result<i64, ClockError> {
        let before = device_now_ms();
        let reference = self.clock.fetch_reference_ms()?;
        let after = device_now_ms();

        let midpoint = before + (after - before) / 2;
        self.offset_ms = reference - midpoint;
        self.uncertainty_ms = Some((after - before + 1) / 2);
        self.last_refresh = Some(Utc::now());

        log::debug!(
            "Reference clock offset {} ms (±{} ms)",
            self.offset_ms,
            self.uncertainty_ms.unwrap_or_default()
        );
        Ok(self.offset_ms)
    }

    pub fn offset_ms(&self) -> i64 {
        self.offset_ms
    }

    pub fn last_refresh(&self) -> Option<DateTime<Utc>> {
        self.last_refresh
    }

    pub fn is_synchronized(&self) -> bool {
        self.uncertainty_ms
            .is_some_and(|u| u <= self.max_uncertainty_ms)
    }

    pub fn to_reference_timestamp(&self, device_ms: i64) -> i64 {
        device_ms + self.offset_ms
    }

    pub fn to_reference_time(&self, device: DateTime<Utc>) -> DateTime<Utc> {
        device + chrono::Duration::milliseconds(self.offset_ms)
    }
}

/// Wall-clock stamps recorded alongside each session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionStamps {
    pub device_start: DateTime<Utc>,
    pub device_end: Option<DateTime<Utc>>,
    pub reference_start: DateTime<Utc>,
    pub reference_end: Option<DateTime<Utc>>,
    pub synchronized: bool,
    pub offset_ms: i64,
    pub elapsed_ms: Option<u64>,
}

/// Monotonic plus reference-corrected start/end of one session
#[derive(Debug, Clone)]
pub struct SessionClock {
    monotonic_start: Instant,
    monotonic_end: Option<Instant>,
    stamps: SessionStamps,
}

impl SessionClock {
    /// Start the session clock, refreshing the reference offset if needed
    pub fn start(sync: Option<&mut TimeSync>) -> Self {
        let monotonic_start = Instant::now();
        let device_start = Utc::now();

        let (reference_start, synchronized, offset_ms) = match sync {
            Some(sync) => {
                if !sync.is_synchronized() {
                    if let Err(e) = sync.refresh() {
                        log::warn!("{}; using device UTC time for this session", e);
                    }
                }
                if sync.is_synchronized() {
                    (sync.to_reference_time(device_start), true, sync.offset_ms())
                } else {
                    (device_start, false, 0)
                }
            }
            None => {
                log::warn!("No reference clock configured; using device UTC time");
                (device_start, false, 0)
            }
        };

        Self {
            monotonic_start,
            monotonic_end: None,
            stamps: SessionStamps {
                device_start,
                device_end: None,
                reference_start,
                reference_end: None,
                synchronized,
                offset_ms,
                elapsed_ms: None,
            },
        }
    }

    pub fn stop(&mut self) {
        let end = Instant::now();
        let device_end = Utc::now();
        self.monotonic_end = Some(end);
        self.stamps.device_end = Some(device_end);
        self.stamps.reference_end =
            Some(device_end + chrono::Duration::milliseconds(self.stamps.offset_ms));
        self.stamps.elapsed_ms = Some(end.duration_since(self.monotonic_start).as_millis() as u64);
    }

    /// Monotonic time since start (or until stop)
    pub fn elapsed(&self) -> Duration {
        self.monotonic_end
            .unwrap_or_else(Instant::now)
            .duration_since(self.monotonic_start)
    }

    pub fn stamps(&self) -> &SessionStamps {
        &self.stamps
    }
}
