//! # Sample Types and Row Format
//!
//! Raw and conditioned sensor samples plus the CSV row encoding used by the
//! durable store. One row per conditioned sample, ten fields:
//!
//! ```text
//! timestamp_ms,accel_x,accel_y,accel_z,accel_magnitude,gyro_x,gyro_y,gyro_z,event,user_feedback
//! 1250,0.01,-0.02,9.81,9.81,0.001,0.0,-0.002,1,pothole
//! ```
//!
//! The event flag is `1` or empty. Feedback containing commas or quotes is
//! quoted with inner quotes doubled (handled by the `csv` crate).

use crate::error::StorageError;

pub const CSV_HEADER: [&str; 10] = [
    "timestamp_ms",
    "accel_x",
    "accel_y",
    "accel_z",
    "accel_magnitude",
    "gyro_x",
    "gyro_y",
    "gyro_z",
    "event",
    "user_feedback",
];

/// One 6-axis reading as delivered by the sensor
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RawSample {
    pub accel_x: f64,
    pub accel_y: f64,
    pub accel_z: f64,
    pub gyro_x: f64,
    pub gyro_y: f64,
    pub gyro_z: f64,
    /// Device clock, milliseconds
    pub device_timestamp_ms: i64,
}

impl RawSample {
    pub fn new(accel: [f64; 3], gyro: [f64; 3], device_timestamp_ms: i64) -> Self {
        Self {
            accel_x: accel[0],
            accel_y: accel[1],
            accel_z: accel[2],
            gyro_x: gyro[0],
            gyro_y: gyro[1],
            gyro_z: gyro[2],
            device_timestamp_ms,
        }
    }

    pub fn accel(&self) -> [f64; 3] {
        [self.accel_x, self.accel_y, self.accel_z]
    }

    pub fn gyro(&self) -> [f64; 3] {
        [self.gyro_x, self.gyro_y, self.gyro_z]
    }

    /// All six channels, accel first
    pub fn channels(&self) -> [f64; 6] {
        [
            self.accel_x,
            self.accel_y,
            self.accel_z,
            self.gyro_x,
            self.gyro_y,
            self.gyro_z,
        ]
    }

    pub fn accel_magnitude(&self) -> f64 {
        (self.accel_x * self.accel_x + self.accel_y * self.accel_y + self.accel_z * self.accel_z)
            .sqrt()
    }
}

/// A conditioned sample, session-relative and ready to persist
#[derive(Debug, Clone, PartialEq)]
pub struct CorrectedSample {
    pub relative_timestamp_ms: i64,
    pub accel_x: f64,
    pub accel_y: f64,
    pub accel_z: f64,
    pub accel_magnitude: f64,
    pub gyro_x: f64,
    pub gyro_y: f64,
    pub gyro_z: f64,
    pub is_event: bool,
    pub user_feedback: String,
}

impl CorrectedSample {
    fn to_record(&self) -> [String; 10] {
        [
            self.relative_timestamp_ms.to_string(),
            self.accel_x.to_string(),
            self.accel_y.to_string(),
            self.accel_z.to_string(),
            self.accel_magnitude.to_string(),
            self.gyro_x.to_string(),
            self.gyro_y.to_string(),
            self.gyro_z.to_string(),
            if self.is_event { "1".to_string() } else { String::new() },
            self.user_feedback.clone(),
        ]
    }

    fn from_record(record: &csv::StringRecord) -> Result<Self, StorageError> {
        if record.len() != CSV_HEADER.len() {
            return Err(StorageError::Corrupt(format!(
                "expected {} fields, found {}",
                CSV_HEADER.len(),
                record.len()
            )));
        }

        let float = |i: usize| -> Result<f64, StorageError> {
            record[i].trim().parse::<f64>().map_err(|e| {
                StorageError::Corrupt(format!("field {} ({:?}): {}", CSV_HEADER[i], &record[i], e))
            })
        };

        let relative_timestamp_ms = record[0].trim().parse::<i64>().map_err(|e| {
            StorageError::Corrupt(format!("timestamp {:?}: {}", &record[0], e))
        })?;

        Ok(Self {
            relative_timestamp_ms,
            accel_x: float(1)?,
            accel_y: float(2)?,
            accel_z: float(3)?,
            accel_magnitude: float(4)?,
            gyro_x: float(5)?,
            gyro_y: float(6)?,
            gyro_z: float(7)?,
            is_event: record[8].trim() == "1",
            user_feedback: record[9].to_string(),
        })
    }
}

/// Late classification of a detected event
#[derive(Debug, Clone, PartialEq)]
pub struct Annotation {
    /// Session-relative timestamp of the event being classified
    pub timestamp_ms: i64,
    /// Rows within `timestamp_ms ± window_ms` are updated
    pub window_ms: i64,
    pub is_event: bool,
    pub feedback: String,
}

impl Annotation {
    pub fn matches(&self, timestamp_ms: i64) -> bool {
        (timestamp_ms - self.timestamp_ms).abs() <= self.window_ms
    }

    pub fn window_start(&self) -> i64 {
        self.timestamp_ms - self.window_ms
    }

    pub fn apply(&self, sample: &mut CorrectedSample) {
        sample.is_event = self.is_event;
        sample.user_feedback = self.feedback.clone();
    }

    /// Apply to every row inside the window; returns how many changed
    pub fn apply_all(&self, rows: &mut [CorrectedSample]) -> usize {
        let mut updated = 0;
        for row in rows
            .iter_mut()
            .filter(|row| self.matches(row.relative_timestamp_ms))
        {
            self.apply(row);
            updated += 1;
        }
        updated
    }
}

fn csv_writer() -> csv::Writer<Vec<u8>> {
    csv::WriterBuilder::new()
        .has_headers(false)
        .terminator(csv::Terminator::Any(b'\n'))
        .from_writer(Vec::new())
}

fn finish(writer: csv::Writer<Vec<u8>>) -> Result<String, StorageError> {
    let bytes = writer
        .into_inner()
        .map_err(|e| StorageError::TransientIo(format!("csv buffer: {}", e)))?;
    String::from_utf8(bytes).map_err(|e| StorageError::Corrupt(e.to_string()))
}

/// Header line including the trailing newline
pub fn header_line() -> Result<String, StorageError> {
    let mut writer = csv_writer();
    writer
        .write_record(CSV_HEADER)
        .map_err(|e| StorageError::TransientIo(format!("csv header: {}", e)))?;
    finish(writer)
}

/// Encode samples as CSV rows (no header), preserving order
pub fn encode_rows(samples: &[CorrectedSample]) -> Result<String, StorageError> {
    let mut writer = csv_writer();
    for sample in samples {
        writer
            .write_record(&sample.to_record())
            .map_err(|e| StorageError::TransientIo(format!("csv row: {}", e)))?;
    }
    finish(writer)
}

/// Parse a persisted file (header + rows)
pub fn parse_rows(text: &str) -> Result<Vec<CorrectedSample>, StorageError> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_reader(text.as_bytes());

    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record.map_err(|e| StorageError::Corrupt(e.to_string()))?;
        rows.push(CorrectedSample::from_record(&record)?);
    }
    Ok(rows)
}
