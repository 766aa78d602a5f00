//! NMEA 0183 receivers as a position source.
//!
//! RMC sentences produce fixes; the most recent GGA sentence supplies
//! altitude and HDOP for them.

use std::io;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use fieldtrack_proto::Position;
use time::{Date, Month, OffsetDateTime, PrimitiveDateTime, Time};
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tokio_serial::{SerialPortBuilderExt, SerialStream};
use tracing::{debug, info, warn};

use crate::error::{AcquisitionError, TrackerError};
use crate::source::{PositionSource, SourceEvent, Subscription, WatchOptions};

pub const DEFAULT_BAUD: u32 = 115_200;

/// User equivalent range error used to turn HDOP into meters.
const UERE_M: f64 = 5.0;
const KNOTS_TO_MPS: f64 = 0.514_444;
/// Pause before re-reading a log at EOF or a port after a read error.
const TAIL_POLL: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NmeaOrigin {
    Serial { device: String, baud: u32 },
    /// A captured log; the reader keeps tailing it at EOF. Single-shot
    /// requests answer with the newest fix already in the log.
    File { path: String },
}

/// Result of feeding one line to the parser.
#[derive(Debug, Clone, PartialEq)]
pub enum NmeaEvent {
    Fix(Position),
    /// The receiver reported an RMC sentence without a valid fix.
    NoFix,
}

#[derive(Debug, Clone, Copy, Default)]
struct GgaData {
    sats: u8,
    hdop: f64,
    altitude: Option<f64>,
}

/// Stateful line parser.
#[derive(Debug, Default)]
pub struct NmeaParser {
    last_gga: Option<GgaData>,
}

impl NmeaParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Satellites in use according to the last GGA sentence.
    pub fn satellites(&self) -> Option<u8> {
        self.last_gga.map(|g| g.sats)
    }

    pub fn parse_line(&mut self, line: &str) -> Option<NmeaEvent> {
        let body = checked_body(line.trim())?;
        let parts: Vec<&str> = body.split(',').collect();
        let tag = parts.first()?;

        if tag.ends_with("GGA") {
            if parts.len() > 9 {
                self.last_gga = Some(GgaData {
                    sats: parts[7].parse().unwrap_or(0),
                    hdop: parts[8].parse().unwrap_or(99.9),
                    altitude: parts[9].parse().ok(),
                });
            }
            return None;
        }

        if tag.ends_with("RMC") && parts.len() > 9 {
            // 1=time 2=status 3,4=lat 5,6=lon 7=speed(kn) 8=course 9=date
            if parts[2] != "A" {
                return Some(NmeaEvent::NoFix);
            }
            let latitude = parse_deg_min(parts[3], parts[4])?;
            let longitude = parse_deg_min(parts[5], parts[6])?;
            let timestamp = parse_timestamp(parts[9], parts[1]).unwrap_or_else(OffsetDateTime::now_utc);

            let gga = self.last_gga;
            return Some(NmeaEvent::Fix(Position {
                latitude,
                longitude,
                accuracy: gga.map(|g| g.hdop * UERE_M),
                altitude: gga.and_then(|g| g.altitude),
                altitude_accuracy: None,
                heading: parts[8].parse().ok(),
                speed: parts[7].parse::<f64>().ok().map(|kn| kn * KNOTS_TO_MPS),
                timestamp,
            }));
        }

        None
    }
}

/// Strips `$` and a trailing `*hh` checksum, rejecting lines whose checksum
/// doesn't match.
fn checked_body(s: &str) -> Option<&str> {
    let s = s.strip_prefix('$')?;
    match s.split_once('*') {
        Some((body, sum)) => {
            let expected = u8::from_str_radix(sum.trim(), 16).ok()?;
            if nmea_checksum(body) == expected {
                Some(body)
            } else {
                debug!("nmea checksum mismatch: {}", s);
                None
            }
        }
        None => Some(s),
    }
}

pub fn nmea_checksum(body: &str) -> u8 {
    body.bytes().fold(0, |acc, b| acc ^ b)
}

fn parse_deg_min(v: &str, hemi: &str) -> Option<f64> {
    if v.is_empty() {
        return None;
    }
    // lat: ddmm.mmmm, lon: dddmm.mmmm
    let dot = v.find('.').unwrap_or(v.len());
    let deg_len = if dot > 4 { 3 } else { 2 };
    let deg: f64 = v.get(..deg_len)?.parse().ok()?;
    let min: f64 = v.get(deg_len..)?.parse().ok()?;
    let mut out = deg + (min / 60.0);
    if hemi == "S" || hemi == "W" {
        out = -out;
    }
    Some(out)
}

// date: ddmmyy, time: hhmmss[.sss]
fn parse_timestamp(date: &str, clock: &str) -> Option<OffsetDateTime> {
    let day: u8 = date.get(0..2)?.parse().ok()?;
    let month: u8 = date.get(2..4)?.parse().ok()?;
    let yy: i32 = date.get(4..6)?.parse().ok()?;
    let year = if yy < 80 { 2000 + yy } else { 1900 + yy };
    let date = Date::from_calendar_date(year, Month::try_from(month).ok()?, day).ok()?;

    let h: u8 = clock.get(0..2)?.parse().ok()?;
    let m: u8 = clock.get(2..4)?.parse().ok()?;
    let secs: f64 = clock.get(4..)?.parse().ok()?;
    let millis = ((secs.fract() * 1000.0).round() as u16).min(999);
    let time = Time::from_hms_milli(h, m, secs.trunc() as u8, millis).ok()?;

    Some(PrimitiveDateTime::new(date, time).assume_utc())
}

enum Port {
    Serial(BufReader<SerialStream>),
    File(BufReader<File>),
}

struct NmeaReader {
    port: Port,
    /// Bytes of the line being read; kept across cancelled reads.
    buf: Vec<u8>,
}

impl NmeaReader {
    async fn open(origin: &NmeaOrigin) -> Result<Self> {
        let port = match origin {
            NmeaOrigin::Serial { device, baud } => {
                let port = tokio_serial::new(device, *baud)
                    .open_native_async()
                    .with_context(|| format!("open serial {}", device))?;
                Port::Serial(BufReader::new(port))
            }
            NmeaOrigin::File { path } => {
                let f = File::open(path).await.with_context(|| format!("open nmea file {}", path))?;
                Port::File(BufReader::new(f))
            }
        };
        Ok(Self { port, buf: Vec::new() })
    }

    /// Next complete line, or `None` once a serial stream closes. Files are
    /// tailed at EOF. Bytes that are not UTF-8 are replaced, so line noise
    /// only costs the sentence it lands in. Cancel-safe.
    async fn next_line(&mut self) -> io::Result<Option<String>> {
        loop {
            match &mut self.port {
                Port::Serial(r) => {
                    r.read_until(b'\n', &mut self.buf).await?;
                    if self.buf.is_empty() {
                        return Ok(None);
                    }
                }
                Port::File(r) => {
                    r.read_until(b'\n', &mut self.buf).await?;
                    if self.buf.last() != Some(&b'\n') {
                        // EOF: wait for the log to grow
                        tokio::time::sleep(TAIL_POLL).await;
                        continue;
                    }
                }
            }
            let line = String::from_utf8_lossy(&self.buf).into_owned();
            self.buf.clear();
            return Ok(Some(line));
        }
    }

    /// Next fix or no-fix report, or `None` at end of stream. Cancel-safe.
    async fn next_event(&mut self, parser: &mut NmeaParser) -> io::Result<Option<NmeaEvent>> {
        while let Some(line) = self.next_line().await? {
            if let Some(ev) = parser.parse_line(&line) {
                return Ok(Some(ev));
            }
        }
        Ok(None)
    }

    /// Consumes the complete lines already written to a log file and returns
    /// the newest fix among them. Serial ports yield nothing here.
    async fn drain_file(&mut self, parser: &mut NmeaParser) -> io::Result<Option<Position>> {
        let Port::File(r) = &mut self.port else {
            return Ok(None);
        };
        let mut latest = None;
        loop {
            r.read_until(b'\n', &mut self.buf).await?;
            if self.buf.last() != Some(&b'\n') {
                return Ok(latest);
            }
            let line = String::from_utf8_lossy(&self.buf).into_owned();
            self.buf.clear();
            if let Some(NmeaEvent::Fix(fix)) = parser.parse_line(&line) {
                latest = Some(fix);
            }
        }
    }
}

/// Position source backed by an NMEA receiver or log.
#[derive(Debug, Clone)]
pub struct NmeaSource {
    origin: NmeaOrigin,
    last_fix: Arc<Mutex<Option<Position>>>,
}

impl NmeaSource {
    pub fn new(origin: NmeaOrigin) -> Self {
        Self { origin, last_fix: Arc::new(Mutex::new(None)) }
    }

    pub fn serial(device: impl Into<String>, baud: u32) -> Self {
        Self::new(NmeaOrigin::Serial { device: device.into(), baud })
    }

    pub fn file(path: impl Into<String>) -> Self {
        Self::new(NmeaOrigin::File { path: path.into() })
    }

    pub fn origin(&self) -> &NmeaOrigin {
        &self.origin
    }

    fn cache(&self) -> MutexGuard<'_, Option<Position>> {
        self.last_fix.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn cached_fix(&self, options: &WatchOptions) -> Option<Position> {
        if options.maximum_age.is_zero() {
            return None;
        }
        let fix = self.cache().clone()?;
        (OffsetDateTime::now_utc() - fix.timestamp <= options.maximum_age).then_some(fix)
    }
}

#[async_trait]
impl PositionSource for NmeaSource {
    fn is_available(&self) -> bool {
        match &self.origin {
            NmeaOrigin::Serial { device, .. } => Path::new(device).exists(),
            NmeaOrigin::File { path } => Path::new(path).is_file(),
        }
    }

    fn watch(&self, options: &WatchOptions) -> crate::error::Result<Subscription> {
        let rt = tokio::runtime::Handle::try_current().map_err(|_| TrackerError::NoRuntime)?;
        let (tx, rx) = mpsc::channel(64);
        let origin = self.origin.clone();
        let last_fix = self.last_fix.clone();
        let timeout = options.timeout;

        let producer = rt.spawn(async move {
            let mut reader = match NmeaReader::open(&origin).await {
                Ok(r) => r,
                Err(e) => {
                    let _ = tx.send(Err(AcquisitionError::PositionUnavailable(format!("{:#}", e)))).await;
                    return;
                }
            };
            info!(?origin, "nmea watch started");
            let mut parser = NmeaParser::new();
            loop {
                let ev = match tokio::time::timeout(timeout, reader.next_event(&mut parser)).await {
                    Ok(Ok(Some(NmeaEvent::Fix(fix)))) => {
                        *last_fix.lock().unwrap_or_else(|e| e.into_inner()) = Some(fix.clone());
                        Ok(fix)
                    }
                    Ok(Ok(Some(NmeaEvent::NoFix))) => {
                        Err(AcquisitionError::PositionUnavailable("receiver has no fix".into()))
                    }
                    Ok(Ok(None)) => {
                        let _ = tx.send(Err(AcquisitionError::PositionUnavailable("nmea stream closed".into()))).await;
                        break;
                    }
                    Ok(Err(e)) => {
                        warn!("nmea read failed: {}", e);
                        tokio::time::sleep(TAIL_POLL).await;
                        Err(AcquisitionError::PositionUnavailable(e.to_string()))
                    }
                    Err(_) => Err(AcquisitionError::Timeout(timeout)),
                };
                if tx.send(ev).await.is_err() {
                    break;
                }
            }
            debug!("nmea watch ended");
        });

        Ok(Subscription::with_producer(rx, producer))
    }

    async fn current_position(&self, options: &WatchOptions) -> SourceEvent {
        if let Some(fix) = self.cached_fix(options) {
            return Ok(fix);
        }
        let acquire = async {
            let mut reader = NmeaReader::open(&self.origin).await?;
            let mut parser = NmeaParser::new();
            // A log already holding fixes answers with its newest one.
            if let Some(fix) = reader.drain_file(&mut parser).await? {
                return Ok::<_, anyhow::Error>(fix);
            }
            loop {
                match reader.next_event(&mut parser).await? {
                    Some(NmeaEvent::Fix(fix)) => return Ok(fix),
                    Some(NmeaEvent::NoFix) => continue,
                    None => anyhow::bail!("nmea stream closed"),
                }
            }
        };
        match tokio::time::timeout(options.timeout, acquire).await {
            Ok(Ok(fix)) => {
                *self.cache() = Some(fix.clone());
                Ok(fix)
            }
            Ok(Err(e)) => Err(AcquisitionError::PositionUnavailable(format!("{:#}", e))),
            Err(_) => Err(AcquisitionError::Timeout(options.timeout)),
        }
    }
}
