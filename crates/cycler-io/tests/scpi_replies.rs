use cycler_core::instrument::{MeasureError, SupplyIo, TransportError};
use cycler_io::hp6632b::{parse_measurement, setpoint_command, Hp6632b, ScpiError};
use std::collections::VecDeque;
use std::io::{self, Read, Write};

/// Serial port stand-in: replies are queued up front, writes are captured.
#[derive(Default)]
struct LoopbackPort {
    rx: VecDeque<u8>,
    tx: Vec<u8>,
}

impl LoopbackPort {
    fn with_replies(replies: &[&str]) -> Self {
        let mut port = Self::default();
        for reply in replies {
            port.rx.extend(reply.as_bytes());
            port.rx.extend(b"\r\n");
        }
        port
    }

    fn sent(&self) -> Vec<String> {
        String::from_utf8_lossy(&self.tx)
            .lines()
            .map(str::to_string)
            .collect()
    }
}

impl Read for LoopbackPort {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.rx.pop_front() {
            Some(byte) if !buf.is_empty() => {
                buf[0] = byte;
                Ok(1)
            }
            _ => Err(io::Error::new(io::ErrorKind::TimedOut, "no reply")),
        }
    }
}

impl Write for LoopbackPort {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.tx.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[test]
fn parses_instrument_number_format() {
    let (volts, amps) = parse_measurement("+4.18012E+00;+2.31000E-01").unwrap();
    assert!((volts - 4.18012).abs() < 1e-12);
    assert!((amps - 0.231).abs() < 1e-12);

    let (_, sinking) = parse_measurement(" 3.7;-0.5 ").unwrap();
    assert_eq!(sinking, -0.5);
}

#[test]
fn rejects_malformed_replies() {
    for reply in ["", "4.1", "4.1;0.2;0.3", "abc;0.2", "4.1;", "NaN;0.1", "9.9E+37;inf"] {
        assert!(
            matches!(
                parse_measurement(reply),
                Err(MeasureError::Malformed { .. })
            ),
            "accepted {reply:?}"
        );
    }
}

#[test]
fn formats_setpoint_with_whole_milliamps() {
    assert_eq!(setpoint_command(4.2, 250.0), "SOUR:VOLT 4.200; CURR 250 MA");
    assert_eq!(setpoint_command(3.8126, 166.67), "SOUR:VOLT 3.813; CURR 166 MA");
    assert_eq!(setpoint_command(3.5, 0.0), "SOUR:VOLT 3.500; CURR 0 MA");
}

#[test]
fn identity_check_accepts_6632b_only() {
    let mut supply = Hp6632b::from_port(LoopbackPort::with_replies(&[
        "HEWLETT-PACKARD,6632B,0,A.01.05",
    ]));
    assert!(supply.identify().unwrap().starts_with("HEWLETT-PACKARD"));
    assert_eq!(supply.get_ref().sent(), vec!["*IDN?"]);

    let mut other = Hp6632b::from_port(LoopbackPort::with_replies(&["KEITHLEY,2400,0,C30"]));
    assert!(matches!(other.identify(), Err(ScpiError::Identity { .. })));
}

#[test]
fn command_vocabulary_on_the_wire() {
    let mut supply = Hp6632b::from_port(LoopbackPort::with_replies(&["+3.70000E+00;-5.0E-01", "1"]));
    supply.reset().unwrap();
    supply.set_setpoint(1.0, 500.0).unwrap();
    supply.set_output(true).unwrap();
    assert_eq!(supply.measure().unwrap(), (3.7, -0.5));
    assert!(supply.output_enabled().unwrap());
    supply.set_output(false).unwrap();

    assert_eq!(
        supply.get_ref().sent(),
        vec![
            "*RST",
            "SOUR:VOLT 1.000; CURR 500 MA",
            "OUTP:STAT 1",
            "MEAS:VOLT?;CURR?",
            "OUTP:STAT?",
            "OUTP:STAT 0",
        ]
    );
}

#[test]
fn silent_instrument_times_out() {
    let mut supply = Hp6632b::from_port(LoopbackPort::default());
    assert!(matches!(
        supply.measure(),
        Err(MeasureError::Transport(TransportError::Timeout))
    ));
    assert!(!supply.is_connected());
}

#[test]
fn first_reply_establishes_the_link() {
    let mut supply = Hp6632b::from_port(LoopbackPort::with_replies(&["+4.0E+00;0.0E+00"]));
    supply.reset().unwrap();
    assert!(!supply.is_connected());
    supply.measure().unwrap();
    assert!(supply.is_connected());
    // A later timeout does not tear the link down.
    assert!(supply.measure().is_err());
    assert!(supply.is_connected());
}
