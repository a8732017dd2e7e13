//! MMU communication client.

use std::io::{Read, Write};
use std::time::{Duration, Instant};

use anyhow::Result;
use serialport::SerialPort;

use mmu2_link::commands::{CommandSerialiser, MmuCommand, Reply, ReplyParser};
use mmu2_link::protocol::LineAccumulator;

/// Scan USB serial adapters for one that answers a version query.
pub fn find_mmu_port(baud_rate: u32, checksum: bool) -> Result<String> {
    for port_info in serialport::available_ports()? {
        let name = &port_info.port_name;
        if !(name.contains("ttyUSB") || name.contains("ttyACM")) {
            continue;
        }

        if let Ok(mut client) = MmuClient::new(name, baud_rate, checksum) {
            client.set_timeout(Duration::from_millis(500));
            if let Ok(exchange) = client.request(MmuCommand::Version) {
                if matches!(exchange.result, Some(Reply::Ok(Some(_)))) {
                    return Ok(name.clone());
                }
            }
        }
    }

    anyhow::bail!("No MMU found - check the adapter and that the unit is powered")
}

/// Resolve a port argument - returns the port path if not "auto", otherwise auto-detects.
pub fn resolve_port(port_arg: &str, baud_rate: u32, checksum: bool) -> Result<String> {
    if port_arg == "auto" {
        find_mmu_port(baud_rate, checksum)
    } else {
        Ok(port_arg.to_string())
    }
}

/// Every line seen for one request.
#[derive(Debug, Default)]
pub struct Exchange {
    pub acked: bool,
    pub progress_reports: usize,
    /// `ok`/`<n>ok`/`E<n>`; `None` if the unit never finished
    pub result: Option<Reply>,
    /// Lines unrelated to the request (`start`, `f0`, `f1`)
    pub unsolicited: Vec<Reply>,
}

/// Client for talking to the MMU.
pub struct MmuClient {
    port: Box<dyn SerialPort>,
    timeout: Duration,
    serialiser: CommandSerialiser,
    parser: ReplyParser,
    accumulator: LineAccumulator,
}

impl MmuClient {
    /// Create a new MMU client.
    pub fn new(port_name: &str, baud_rate: u32, checksum: bool) -> Result<Self> {
        let port = serialport::new(port_name, baud_rate)
            .timeout(Duration::from_millis(50))
            .open()?;

        Ok(Self {
            port,
            timeout: Duration::from_secs(3),
            serialiser: CommandSerialiser::new(checksum),
            parser: ReplyParser::new(checksum),
            accumulator: LineAccumulator::new(),
        })
    }

    /// Set the per-line timeout.
    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Discard anything the unit printed before we connected.
    pub fn drain_buffer(&mut self) -> Result<()> {
        self.port.clear(serialport::ClearBuffer::All)?;
        self.accumulator.reset();
        // Garbage is as good as silence here; stop at the first quiet gap
        while !matches!(self.read_line(Duration::from_millis(100)), Ok(None)) {}
        Ok(())
    }

    /// Write one command frame.
    pub fn send(&mut self, command: MmuCommand) -> Result<()> {
        let frame = self
            .serialiser
            .serialise(&command)
            .map_err(|e| anyhow::anyhow!("cannot format {:?}: {:?}", command, e))?;
        self.port.write_all(frame.as_bytes())?;
        self.port.flush()?;
        Ok(())
    }

    /// Write raw bytes, bypassing the serialiser.
    pub fn send_raw(&mut self, bytes: &[u8]) -> Result<()> {
        self.port.write_all(bytes)?;
        self.port.flush()?;
        Ok(())
    }

    /// Read one line and parse it. `Ok(None)` on timeout.
    pub fn read_line(&mut self, timeout: Duration) -> Result<Option<Reply>> {
        let mut buf = [0u8; 1];
        let start = Instant::now();

        while start.elapsed() < timeout {
            match self.port.read(&mut buf) {
                Ok(1) => {
                    if let Some(line) = self.accumulator.push(buf[0]) {
                        let line = line.map_err(|e| anyhow::anyhow!("bad line: {:?}", e))?;
                        let reply = self.parser.parse(&line).map_err(|e| {
                            anyhow::anyhow!("unparseable {:?}: {:?}", String::from_utf8_lossy(&line), e)
                        })?;
                        return Ok(Some(reply));
                    }
                }
                Ok(_) => {}
                Err(e) if e.kind() == std::io::ErrorKind::TimedOut => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(None)
    }

    /// Send a command and collect lines until its result, re-arming the
    /// timeout on every line like the firmware does for `busy`.
    pub fn request(&mut self, command: MmuCommand) -> Result<Exchange> {
        self.send(command)?;

        let mut exchange = Exchange::default();
        while let Some(reply) = self.read_line(self.timeout)? {
            match reply {
                Reply::Ack => exchange.acked = true,
                Reply::Busy => exchange.progress_reports += 1,
                Reply::Ok(_) | Reply::Failed(_) => {
                    exchange.result = Some(reply);
                    break;
                }
                Reply::Start | Reply::Finda(_) => exchange.unsolicited.push(reply),
            }
        }
        Ok(exchange)
    }

    /// Wait for the `start` line after a reset.
    pub fn wait_for_start(&mut self, timeout: Duration) -> Result<bool> {
        let start = Instant::now();
        while start.elapsed() < timeout {
            match self.read_line(Duration::from_millis(100)) {
                Ok(Some(Reply::Start)) => return Ok(true),
                Ok(_) => {}
                // Boot noise is expected while the unit restarts
                Err(_) => {}
            }
        }
        Ok(false)
    }
}
