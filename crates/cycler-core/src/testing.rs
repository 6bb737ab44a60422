//! Scripted instrument backend for unit tests.

use crate::instrument::{MeasureError, SupplyIo, TransportError};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Reset,
    Output(bool),
    Setpoint { volts: f64, milliamps: f64 },
    Measure,
}

#[derive(Debug, Clone)]
enum Reply {
    Reading(f64, f64),
    Malformed(String),
    TransportError,
}

#[derive(Default)]
struct Inner {
    replies: VecDeque<Reply>,
    last_reading: Option<(f64, f64)>,
    commands: Vec<Command>,
    fail_writes: bool,
    disconnected: bool,
}

/// Replays queued measurement replies and records every command it receives.
/// Once the queue runs dry the last valid reading repeats.
#[derive(Clone, Default)]
pub struct ScriptedSupply {
    inner: Arc<Mutex<Inner>>,
}

impl ScriptedSupply {
    pub fn new() -> Self {
        Self::default()
    }

    fn inner(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap()
    }

    pub fn push_reading(&self, volts: f64, amps: f64) {
        self.inner().replies.push_back(Reply::Reading(volts, amps));
    }

    pub fn push_readings(&self, readings: &[(f64, f64)]) {
        for &(volts, amps) in readings {
            self.push_reading(volts, amps);
        }
    }

    pub fn push_malformed(&self, reply: &str) {
        self.inner()
            .replies
            .push_back(Reply::Malformed(reply.to_string()));
    }

    pub fn push_transport_error(&self) {
        self.inner().replies.push_back(Reply::TransportError);
    }

    pub fn fail_writes(&self, fail: bool) {
        self.inner().fail_writes = fail;
    }

    /// Report the link as never established.
    pub fn disconnect(&self) {
        self.inner().disconnected = true;
    }

    pub fn commands(&self) -> Vec<Command> {
        self.inner().commands.clone()
    }

    pub fn setpoints(&self) -> Vec<(f64, f64)> {
        self.inner()
            .commands
            .iter()
            .filter_map(|c| match c {
                Command::Setpoint { volts, milliamps } => Some((*volts, *milliamps)),
                _ => None,
            })
            .collect()
    }

    pub fn measure_count(&self) -> usize {
        self.inner()
            .commands
            .iter()
            .filter(|c| matches!(c, Command::Measure))
            .count()
    }

    pub fn last_output(&self) -> Option<bool> {
        self.inner().commands.iter().rev().find_map(|c| match c {
            Command::Output(enabled) => Some(*enabled),
            _ => None,
        })
    }

    fn write(&self, command: Command) -> Result<(), TransportError> {
        let mut inner = self.inner();
        inner.commands.push(command);
        if inner.fail_writes {
            Err(TransportError::Link("scripted write failure".into()))
        } else {
            Ok(())
        }
    }
}

impl SupplyIo for ScriptedSupply {
    fn reset(&mut self) -> Result<(), TransportError> {
        self.write(Command::Reset)
    }

    fn set_output(&mut self, enabled: bool) -> Result<(), TransportError> {
        self.write(Command::Output(enabled))
    }

    fn set_setpoint(&mut self, volts: f64, milliamps: f64) -> Result<(), TransportError> {
        self.write(Command::Setpoint { volts, milliamps })
    }

    fn measure(&mut self) -> Result<(f64, f64), MeasureError> {
        let mut inner = self.inner();
        inner.commands.push(Command::Measure);
        match inner.replies.pop_front() {
            Some(Reply::Reading(volts, amps)) => {
                inner.last_reading = Some((volts, amps));
                Ok((volts, amps))
            }
            Some(Reply::Malformed(reply)) => Err(MeasureError::Malformed { reply }),
            Some(Reply::TransportError) => {
                Err(TransportError::Link("scripted transport failure".into()).into())
            }
            None => inner
                .last_reading
                .ok_or_else(|| TransportError::Link("script exhausted".into()).into()),
        }
    }

    fn is_connected(&self) -> bool {
        !self.inner().disconnected
    }
}
