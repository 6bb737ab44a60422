//! SCPI driver for the HP/Agilent 6632B system power supply over RS-232.

use cycler_core::instrument::{MeasureError, SupplyIo, TransportError};
use serialport::SerialPort;
use std::io::{self, Read, Write};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

pub const DEFAULT_BAUD: u32 = 9600;
pub const REPLY_TIMEOUT: Duration = Duration::from_millis(500);
/// Substring every genuine 6632B puts in its `*IDN?` reply.
pub const IDN_MARKER: &str = "HEWLETT-PACKARD,6632B";

const MAX_REPLY_LEN: usize = 256;

#[derive(Debug, Error)]
pub enum ScpiError {
    #[error("cannot open serial port {port}: {source}")]
    Open {
        port: String,
        #[source]
        source: serialport::Error,
    },
    #[error("unexpected instrument identity {reply:?}")]
    Identity { reply: String },
    #[error("unexpected reply {reply:?} to {command}")]
    Reply {
        command: &'static str,
        reply: String,
    },
    #[error(transparent)]
    Transport(#[from] TransportError),
}

fn link_error(e: io::Error) -> TransportError {
    match e.kind() {
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => TransportError::Timeout,
        _ => TransportError::Io(e),
    }
}

/// Parse a `MEAS:VOLT?;CURR?` reply such as `+4.18012E+00;+2.3E-01`.
pub fn parse_measurement(reply: &str) -> Result<(f64, f64), MeasureError> {
    let malformed = || MeasureError::Malformed {
        reply: reply.to_string(),
    };
    let mut fields = reply.trim().split(';');
    let (Some(volts), Some(amps), None) = (fields.next(), fields.next(), fields.next()) else {
        return Err(malformed());
    };
    let volts: f64 = volts.trim().parse().map_err(|_| malformed())?;
    let amps: f64 = amps.trim().parse().map_err(|_| malformed())?;
    if !volts.is_finite() || !amps.is_finite() {
        return Err(malformed());
    }
    Ok((volts, amps))
}

/// Voltage with millivolt resolution, current limit in whole milliamps.
pub fn setpoint_command(volts: f64, milliamps: f64) -> String {
    format!("SOUR:VOLT {:.3}; CURR {} MA", volts, milliamps.trunc() as u64)
}

pub struct Hp6632b<P: Read + Write + Send = Box<dyn SerialPort>> {
    port: P,
    /// Set once the instrument has answered a query.
    connected: bool,
}

impl Hp6632b<Box<dyn SerialPort>> {
    /// Open the port, reset the instrument and confirm its identity.
    pub fn open(path: &str, baud: u32) -> Result<Self, ScpiError> {
        let port = serialport::new(path, baud)
            .timeout(REPLY_TIMEOUT)
            .flow_control(serialport::FlowControl::None)
            .open()
            .map_err(|source| ScpiError::Open {
                port: path.to_string(),
                source,
            })?;
        info!(target: "facade", port = path, baud, "serial link open");

        let mut supply = Self::from_port(port);
        supply.reset()?;
        let idn = supply.identify()?;
        let output = supply.output_enabled()?;
        info!(target: "facade", idn = %idn, output, "instrument identified");
        Ok(supply)
    }
}

impl<P: Read + Write + Send> Hp6632b<P> {
    pub fn from_port(port: P) -> Self {
        Self {
            port,
            connected: false,
        }
    }

    pub fn get_ref(&self) -> &P {
        &self.port
    }

    fn write_command(&mut self, command: &str) -> Result<(), TransportError> {
        debug!(target: "facade", command, "send");
        self.port
            .write_all(command.as_bytes())
            .and_then(|()| self.port.write_all(b"\n"))
            .and_then(|()| self.port.flush())
            .map_err(link_error)
    }

    fn read_reply(&mut self) -> Result<String, TransportError> {
        let mut line = Vec::new();
        let mut byte = [0u8; 1];
        loop {
            match self.port.read(&mut byte) {
                Ok(1) if byte[0] == b'\n' => break,
                Ok(1) => {
                    line.push(byte[0]);
                    if line.len() > MAX_REPLY_LEN {
                        return Err(TransportError::Link("reply exceeds line limit".into()));
                    }
                }
                Ok(_) => return Err(TransportError::Link("serial port closed".into())),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(link_error(e)),
            }
        }
        self.connected = true;

        let reply = String::from_utf8_lossy(&line).trim_end().to_string();
        debug!(target: "facade", reply = %reply, "recv");
        Ok(reply)
    }

    fn query(&mut self, command: &str) -> Result<String, TransportError> {
        self.write_command(command)?;
        self.read_reply()
    }

    /// `*IDN?`, rejected unless it names a 6632B.
    pub fn identify(&mut self) -> Result<String, ScpiError> {
        let reply = self.query("*IDN?")?;
        if reply.contains(IDN_MARKER) {
            Ok(reply)
        } else {
            Err(ScpiError::Identity { reply })
        }
    }

    pub fn output_enabled(&mut self) -> Result<bool, ScpiError> {
        let reply = self.query("OUTP:STAT?")?;
        match reply.trim() {
            "1" => Ok(true),
            "0" => Ok(false),
            _ => Err(ScpiError::Reply {
                command: "OUTP:STAT?",
                reply,
            }),
        }
    }
}

impl<P: Read + Write + Send> SupplyIo for Hp6632b<P> {
    fn reset(&mut self) -> Result<(), TransportError> {
        self.write_command("*RST")
    }

    fn set_output(&mut self, enabled: bool) -> Result<(), TransportError> {
        self.write_command(if enabled { "OUTP:STAT 1" } else { "OUTP:STAT 0" })
    }

    fn set_setpoint(&mut self, volts: f64, milliamps: f64) -> Result<(), TransportError> {
        self.write_command(&setpoint_command(volts, milliamps))
    }

    fn measure(&mut self) -> Result<(f64, f64), MeasureError> {
        let reply = self.query("MEAS:VOLT?;CURR?")?;
        parse_measurement(&reply)
    }

    fn is_connected(&self) -> bool {
        self.connected
    }
}
