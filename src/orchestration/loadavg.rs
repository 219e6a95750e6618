//! System load sampling for admission control.

use std::io;
use std::path::PathBuf;

/// 1, 5 and 15 minute load averages.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LoadAverage {
    pub one: f64,
    pub five: f64,
    pub fifteen: f64,
}

impl LoadAverage {
    /// Parse the leading three fields of a `/proc/loadavg` line.
    pub fn parse(line: &str) -> io::Result<Self> {
        let mut fields = line.split_whitespace().map(str::parse::<f64>);
        let mut next = || match fields.next() {
            Some(Ok(value)) => Ok(value),
            _ => Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("malformed load average: {:?}", line),
            )),
        };
        Ok(Self {
            one: next()?,
            five: next()?,
            fifteen: next()?,
        })
    }
}

pub trait LoadSampler: Send + Sync {
    fn sample(&self) -> io::Result<LoadAverage>;
}

/// Reads the kernel's load average file.
#[derive(Debug, Clone)]
pub struct ProcLoadAvg {
    path: PathBuf,
}

impl ProcLoadAvg {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl Default for ProcLoadAvg {
    fn default() -> Self {
        Self::new("/proc/loadavg")
    }
}

impl LoadSampler for ProcLoadAvg {
    fn sample(&self) -> io::Result<LoadAverage> {
        LoadAverage::parse(&std::fs::read_to_string(&self.path)?)
    }
}
