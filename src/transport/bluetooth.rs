//! # Classic Bluetooth (RFCOMM) Transport
//!
//! Talks to the print head over the Serial Port Profile through an RFCOMM
//! TTY bound by the system Bluetooth stack.
//!
//! ## Bluetooth Setup (Linux)
//!
//! The head must be paired and bound to an RFCOMM device first:
//!
//! ```bash
//! $ bluetoothctl
//! [bluetooth]# pair 00:11:62:XX:XX:XX
//! $ sudo rfcomm bind 0 00:11:62:XX:XX:XX 1
//! # creates /dev/rfcomm0
//! ```
//!
//! When [`ConnectionParameters::ClassicBluetooth`] names no device path, the
//! strategy looks the MAC up in `/proc/net/rfcomm` (then `rfcomm -a`).
//!
//! ## TTY Configuration
//!
//! The TTY is switched to raw mode so binary frames pass unmodified:
//!
//! - **No input processing**: IGNBRK, BRKINT, PARMRK, ISTRIP, INLCR, IGNCR, ICRNL
//! - **No XON/XOFF**: 0x11 and 0x13 occur in packed bitmaps
//! - **No output processing**: OPOST off
//! - **8-bit, non-canonical, no echo**
//!
//! ## Chunked Writes
//!
//! Writes are split into 4096-byte chunks with a short pause in between so
//! the adapter's buffer does not overflow.
//!
//! [`ConnectionParameters::ClassicBluetooth`]: super::ConnectionParameters::ClassicBluetooth

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read};
use std::path::Path;
use std::process::Command;
use std::thread;
use std::time::Duration;

use tracing::{debug, info};

use super::{ConnectionStrategy, DeviceInfo, TransportKind, read_error, write_fully};
use crate::error::{Result, SdkError};

/// Default chunk size for writes (bytes)
const CHUNK_SIZE: usize = 4096;

/// Delay between chunks (milliseconds)
const CHUNK_DELAY_MS: u64 = 2;

/// Read buffer size per receive call
const READ_BUFFER: usize = 1024;

/// RFCOMM TTY connection
pub struct RfcommStrategy {
    address: String,
    device: Option<String>,
    channel: u8,
    file: Option<File>,
    chunk_size: usize,
    chunk_delay: Duration,
}

impl RfcommStrategy {
    pub fn new(address: impl Into<String>, device: Option<String>, channel: u8) -> Self {
        Self {
            address: address.into(),
            device,
            channel,
            file: None,
            chunk_size: CHUNK_SIZE,
            chunk_delay: Duration::from_millis(CHUNK_DELAY_MS),
        }
    }

    /// Set the chunk size for large writes.
    pub fn set_chunk_size(&mut self, size: usize) {
        self.chunk_size = size.max(1);
    }

    /// Set the delay between chunks.
    pub fn set_chunk_delay(&mut self, delay: Duration) {
        self.chunk_delay = delay;
    }

    fn resolve_device(&self) -> Result<String> {
        if let Some(device) = &self.device {
            return Ok(device.clone());
        }
        find_rfcomm_for_mac(&self.address)?.ok_or_else(|| {
            SdkError::OpenFailed(format!(
                "no RFCOMM device bound to {} (try: rfcomm bind 0 {} {})",
                self.address, self.address, self.channel
            ))
        })
    }

    fn file(&mut self) -> Result<&mut File> {
        let address = &self.address;
        self.file
            .as_mut()
            .ok_or_else(|| SdkError::ConnectionLost(format!("{} is not open", address)))
    }
}

impl std::fmt::Debug for RfcommStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RfcommStrategy")
            .field("address", &self.address)
            .field("device", &self.device)
            .field("open", &self.file.is_some())
            .finish()
    }
}

impl ConnectionStrategy for RfcommStrategy {
    fn kind(&self) -> TransportKind {
        TransportKind::ClassicBluetooth
    }

    fn open(&mut self) -> Result<DeviceInfo> {
        self.close();
        let path = self.resolve_device()?;

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|e| match e.kind() {
                io::ErrorKind::PermissionDenied => SdkError::OpenFailed(format!(
                    "{}: permission denied (dialout group?)",
                    path
                )),
                _ => SdkError::OpenFailed(format!("{}: {}", path, e)),
            })?;

        configure_tty(&file)?;
        info!(address = %self.address, device = %path, "RFCOMM link opened");
        self.file = Some(file);

        Ok(DeviceInfo::new(
            path,
            self.address.clone(),
            TransportKind::ClassicBluetooth,
        ))
    }

    fn close(&mut self) {
        if self.file.take().is_some() {
            debug!(address = %self.address, "RFCOMM link closed");
        }
    }

    fn send(&mut self, bytes: &[u8]) -> Result<usize> {
        let chunk_size = self.chunk_size;
        let chunk_delay = self.chunk_delay;
        let file = self.file()?;

        let mut written = 0;
        for (i, chunk) in bytes.chunks(chunk_size).enumerate() {
            if i > 0 && !chunk_delay.is_zero() {
                thread::sleep(chunk_delay);
            }
            match write_fully(file, chunk) {
                Ok(n) => written += n,
                Err(SdkError::PartialWrite { written: n, .. }) => {
                    return Err(SdkError::PartialWrite {
                        written: written + n,
                        expected: bytes.len(),
                    });
                }
                Err(e) => return Err(e),
            }
        }
        Ok(written)
    }

    fn receive(&mut self, timeout: Duration) -> Result<Vec<u8>> {
        let file = self.file()?;
        wait_readable(file, timeout)?;

        let mut buf = vec![0u8; READ_BUFFER];
        match file.read(&mut buf) {
            Ok(0) => Err(SdkError::ConnectionLost("RFCOMM link hung up".into())),
            Ok(n) => {
                buf.truncate(n);
                Ok(buf)
            }
            Err(e) => Err(read_error(e)),
        }
    }

    fn is_connected(&self) -> bool {
        self.file.is_some()
    }
}

// ============================================================================
// TTY HELPERS
// ============================================================================

/// Block until `file` has data or `timeout` elapses.
#[cfg(unix)]
fn wait_readable(file: &File, timeout: Duration) -> Result<()> {
    use std::os::unix::io::AsRawFd;

    let mut pfd = libc::pollfd {
        fd: file.as_raw_fd(),
        events: libc::POLLIN,
        revents: 0,
    };
    let millis = timeout.as_millis().min(i32::MAX as u128) as i32;
    let rc = unsafe { libc::poll(&mut pfd, 1, millis) };

    match rc {
        0 => Err(SdkError::ReceiveTimeout),
        n if n < 0 => Err(read_error(io::Error::last_os_error())),
        _ if pfd.revents & libc::POLLIN != 0 => Ok(()),
        _ if pfd.revents & (libc::POLLHUP | libc::POLLERR | libc::POLLNVAL) != 0 => Err(
            SdkError::ConnectionLost("RFCOMM link hung up".into()),
        ),
        _ => Err(SdkError::ReceiveTimeout),
    }
}

#[cfg(not(unix))]
fn wait_readable(_file: &File, _timeout: Duration) -> Result<()> {
    Ok(())
}

/// Configure the RFCOMM TTY for raw binary traffic.
///
/// ## What Gets Disabled
///
/// - **Input flags**: IGNBRK, BRKINT, PARMRK, ISTRIP, INLCR, IGNCR, ICRNL, IXON, IXOFF, IXANY
/// - **Output flags**: OPOST
/// - **Local flags**: ECHO, ECHONL, ICANON, ISIG, IEXTEN
/// - **Control flags**: CSIZE, PARENB (then CS8 is set)
#[cfg(unix)]
fn configure_tty(file: &File) -> Result<()> {
    use std::mem::MaybeUninit;
    use std::os::unix::io::AsRawFd;

    let fd = file.as_raw_fd();
    let mut termios = MaybeUninit::uninit();
    let result = unsafe { libc::tcgetattr(fd, termios.as_mut_ptr()) };
    if result != 0 {
        return Err(SdkError::OpenFailed(format!(
            "tcgetattr failed: {}",
            io::Error::last_os_error()
        )));
    }
    let mut termios = unsafe { termios.assume_init() };

    termios.c_iflag &= !(libc::IGNBRK
        | libc::BRKINT
        | libc::PARMRK
        | libc::ISTRIP
        | libc::INLCR
        | libc::IGNCR
        | libc::ICRNL
        | libc::IXON
        | libc::IXOFF
        | libc::IXANY);
    termios.c_oflag &= !libc::OPOST;
    termios.c_lflag &= !(libc::ECHO | libc::ECHONL | libc::ICANON | libc::ISIG | libc::IEXTEN);
    termios.c_cflag &= !(libc::CSIZE | libc::PARENB);
    termios.c_cflag |= libc::CS8;

    let result = unsafe { libc::tcsetattr(fd, libc::TCSANOW, &termios) };
    if result != 0 {
        return Err(SdkError::OpenFailed(format!(
            "tcsetattr failed: {}",
            io::Error::last_os_error()
        )));
    }

    Ok(())
}

#[cfg(not(unix))]
fn configure_tty(_file: &File) -> Result<()> {
    Ok(())
}

// ============================================================================
// RFCOMM LOOKUP
// ============================================================================

/// Validate a Bluetooth MAC address format (XX:XX:XX:XX:XX:XX).
pub fn is_valid_mac(mac: &str) -> bool {
    let parts: Vec<&str> = mac.split(':').collect();
    if parts.len() != 6 {
        return false;
    }
    parts
        .iter()
        .all(|part| part.len() == 2 && part.chars().all(|c| c.is_ascii_hexdigit()))
}

/// One binding from `/proc/net/rfcomm` or `rfcomm -a`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RfcommBinding {
    /// e.g. "rfcomm0"
    pub name: String,
    /// Remote MAC, uppercase
    pub address: String,
    pub channel: Option<u8>,
}

impl RfcommBinding {
    pub fn device_path(&self) -> String {
        format!("/dev/{}", self.name)
    }
}

/// Parse RFCOMM binding listings.
///
/// Lines look like `rfcomm0: 00:11:62:AA:BB:CC channel 1 clean`; the
/// `rfcomm -a` form inserts the local adapter address before the remote one,
/// so the last MAC on the line is taken as the remote.
pub fn parse_rfcomm_table(contents: &str) -> Vec<RfcommBinding> {
    contents
        .lines()
        .filter_map(|line| {
            let (name, rest) = line.split_once(':')?;
            let name = name.trim();
            if !name.starts_with("rfcomm") {
                return None;
            }
            let words: Vec<&str> = rest.split_whitespace().collect();
            let address = words.iter().rev().find(|w| is_valid_mac(w))?.to_uppercase();
            let channel = words
                .iter()
                .position(|w| *w == "channel")
                .and_then(|i| words.get(i + 1))
                .and_then(|c| c.parse().ok());
            Some(RfcommBinding {
                name: name.to_string(),
                address,
                channel,
            })
        })
        .collect()
}

/// Every RFCOMM binding currently known to the system.
#[cfg(unix)]
pub fn rfcomm_bindings() -> Result<Vec<RfcommBinding>> {
    if let Ok(contents) = fs::read_to_string("/proc/net/rfcomm") {
        let bindings = parse_rfcomm_table(&contents);
        if !bindings.is_empty() {
            return Ok(bindings);
        }
    }

    let output = Command::new("rfcomm")
        .arg("-a")
        .output()
        .map_err(|e| SdkError::Io(format!("Failed to run 'rfcomm -a': {}", e)))?;
    Ok(parse_rfcomm_table(&String::from_utf8_lossy(&output.stdout)))
}

#[cfg(not(unix))]
pub fn rfcomm_bindings() -> Result<Vec<RfcommBinding>> {
    Ok(Vec::new())
}

/// Find an existing RFCOMM device bound to the given MAC address.
///
/// Returns the device path (e.g., "/dev/rfcomm0") if found.
pub fn find_rfcomm_for_mac(mac: &str) -> Result<Option<String>> {
    let mac_upper = mac.to_uppercase();
    Ok(rfcomm_bindings()?
        .into_iter()
        .filter(|b| b.address == mac_upper)
        .map(|b| b.device_path())
        .find(|path| Path::new(path).exists()))
}

// ============================================================================
// TESTS
// ============================================================================
