//! RFCOMM transport for headsets paired through the OS.
//!
//! Opens a raw `AF_BLUETOOTH` stream socket with libc, so no root and no BlueZ
//! D-Bus session are needed. The headset must already be paired and trusted
//! (e.g. via `bluetoothctl`); MindWave Mobile exposes its serial port profile
//! on channel 1.

use std::fs::File;
use std::io::Read;
use std::mem;
use std::os::fd::{AsRawFd, FromRawFd, RawFd};
use std::thread;
use std::time::Duration;

use log::{debug, info, warn};

use crate::errors::{BluetoothError, DriverError, Result};

const AF_BLUETOOTH: libc::c_ushort = 31;
const BTPROTO_RFCOMM: libc::c_int = 3;

const DEFAULT_CHANNEL: u8 = 1;
const DEFAULT_IO_TIMEOUT_MS: u64 = 100;
const MAX_CONNECT_RETRIES: u32 = 3;
const RETRY_DELAY_MS: u64 = 500;

/// Opens RFCOMM connections with retry.
///
/// `io_timeout` becomes the socket receive timeout, which is how long one read
/// may block before the read loop sees an idle tick.
#[derive(Debug, Clone)]
pub struct BluetoothConnector {
    pub channel: u8,
    pub io_timeout: Duration,
    pub max_retries: u32,
    pub retry_delay: Duration,
}

impl Default for BluetoothConnector {
    fn default() -> Self {
        Self {
            channel: DEFAULT_CHANNEL,
            io_timeout: Duration::from_millis(DEFAULT_IO_TIMEOUT_MS),
            max_retries: MAX_CONNECT_RETRIES,
            retry_delay: Duration::from_millis(RETRY_DELAY_MS),
        }
    }
}

impl BluetoothConnector {
    /// Connect to a paired headset by MAC address (e.g. `A4:DA:32:70:03:4E`).
    ///
    /// Retries with exponential backoff starting at `retry_delay`.
    pub fn connect(&self, mac: &str) -> Result<RfcommStream> {
        let addr = parse_bdaddr(mac)?;

        let mut last_error = None;
        for attempt in 0..self.max_retries.max(1) {
            if attempt > 0 {
                let delay = self.retry_delay * (1 << (attempt - 1).min(3));
                warn!(
                    "retrying RFCOMM connection after {:?} (mac={}, attempt={})",
                    delay, mac, attempt
                );
                thread::sleep(delay);
            }

            match open_rfcomm(addr, self.channel, self.io_timeout)
                .and_then(|stream| stream.verify_connected().map(|_| stream))
            {
                Ok(stream) => {
                    info!("RFCOMM connection established: mac={}", mac);
                    return Ok(stream);
                }
                Err(e) => {
                    warn!(
                        "RFCOMM connection attempt failed: mac={}, attempt={}, error={}",
                        mac, attempt, e
                    );
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| {
            DriverError::Bluetooth(BluetoothError::NotConnected("max retries exceeded".into()))
        }))
    }
}

/// Connected RFCOMM socket, readable like a file.
pub struct RfcommStream {
    file: File,
}

impl RfcommStream {
    /// Check the socket has no pending error (`SO_ERROR`).
    pub fn verify_connected(&self) -> Result<()> {
        let mut err: libc::c_int = 0;
        let mut len = mem::size_of::<libc::c_int>() as libc::socklen_t;

        let ret = unsafe {
            libc::getsockopt(
                self.file.as_raw_fd(),
                libc::SOL_SOCKET,
                libc::SO_ERROR,
                &mut err as *mut _ as *mut libc::c_void,
                &mut len,
            )
        };
        if ret < 0 {
            return Err(DriverError::Io(std::io::Error::last_os_error()));
        }
        if err != 0 {
            return Err(DriverError::Bluetooth(BluetoothError::NotConnected(
                std::io::Error::from_raw_os_error(err).to_string(),
            )));
        }
        Ok(())
    }
}

impl Read for RfcommStream {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.file.read(buf)
    }
}

#[repr(C)]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
struct BdAddr {
    b: [u8; 6],
}

#[repr(C)]
struct SockAddrRc {
    rc_family: libc::sa_family_t,
    rc_bdaddr: BdAddr,
    rc_channel: u8,
}

fn parse_bdaddr(mac: &str) -> Result<BdAddr> {
    let invalid = || DriverError::Bluetooth(BluetoothError::InvalidAddress(mac.to_string()));

    let mut bytes = [0u8; 6];
    let mut parts = mac.split(':');
    for byte in bytes.iter_mut() {
        let part = parts.next().ok_or_else(invalid)?;
        if part.len() != 2 || !part.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(invalid());
        }
        *byte = u8::from_str_radix(part, 16).map_err(|_| invalid())?;
    }
    if parts.next().is_some() {
        return Err(invalid());
    }

    // bdaddr_t is little-endian: reverse of the printed form.
    bytes.reverse();
    Ok(BdAddr { b: bytes })
}

/// Turn a negative libc return into an error, closing `fd` first.
fn check(ret: libc::c_int, fd: RawFd) -> Result<()> {
    if ret >= 0 {
        return Ok(());
    }
    let err = std::io::Error::last_os_error();
    unsafe {
        libc::close(fd);
    }
    Err(DriverError::Bluetooth(BluetoothError::Connection(
        err.to_string(),
    )))
}

fn open_rfcomm(address: BdAddr, channel: u8, timeout: Duration) -> Result<RfcommStream> {
    debug!(
        "opening RFCOMM socket: channel={}, addr_bytes={:02X?}",
        channel, address.b
    );

    let fd = unsafe {
        libc::socket(
            AF_BLUETOOTH as libc::c_int,
            libc::SOCK_STREAM,
            BTPROTO_RFCOMM,
        )
    };
    if fd < 0 {
        return Err(DriverError::Bluetooth(BluetoothError::Connection(
            std::io::Error::last_os_error().to_string(),
        )));
    }

    check(unsafe { libc::fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC) }, fd)?;

    let addr = SockAddrRc {
        rc_family: AF_BLUETOOTH as libc::sa_family_t,
        rc_bdaddr: address,
        rc_channel: channel,
    };
    check(
        unsafe {
            libc::connect(
                fd,
                &addr as *const _ as *const libc::sockaddr,
                mem::size_of::<SockAddrRc>() as libc::socklen_t,
            )
        },
        fd,
    )?;

    // Bounded reads let the read loop observe stop requests and idle links.
    let tv = libc::timeval {
        tv_sec: timeout.as_secs() as libc::time_t,
        tv_usec: timeout.subsec_micros() as libc::suseconds_t,
    };
    check(
        unsafe {
            libc::setsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_RCVTIMEO,
                &tv as *const _ as *const libc::c_void,
                mem::size_of::<libc::timeval>() as libc::socklen_t,
            )
        },
        fd,
    )?;

    let file = unsafe { File::from_raw_fd(fd) };
    Ok(RfcommStream { file })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_bdaddr_reverses_bytes() {
        let addr = parse_bdaddr("A4:DA:32:70:03:4E").unwrap();
        assert_eq!(addr.b, [0x4E, 0x03, 0x70, 0x32, 0xDA, 0xA4]);
    }

    #[test]
    fn test_parse_bdaddr_rejects_malformed() {
        let malformed = [
            "",
            "A4:DA:32:70:03",
            "A4:DA:32:70:03:4E:00",
            "A4:DA:32:70:03:ZZ",
            "A4DA:32:70:03:4E:1",
            "+F:DA:32:70:03:4E",
            "A4:DA:32:70:03:-1",
        ];
        for mac in malformed {
            assert!(
                matches!(
                    parse_bdaddr(mac),
                    Err(DriverError::Bluetooth(BluetoothError::InvalidAddress(_)))
                ),
                "{mac}"
            );
        }
    }
}
