//! Recording socket pair for tests and dry runs.

use std::io;

use super::{Endpoint, SocketPair};
use crate::config::PortConfig;

/// A datagram handed to [`MemorySocketPair::send_to`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentDatagram {
    /// Local socket used
    pub endpoint: Endpoint,
    /// Remote port
    pub port: u16,
    /// Bytes sent
    pub payload: Vec<u8>,
}

/// In-memory [`SocketPair`] that records every send.
///
/// Opens and sends can be made to fail for exercising the engine's failure
/// paths.
#[derive(Debug, Default)]
pub struct MemorySocketPair {
    main_open: bool,
    listener_open: bool,
    sent: Vec<SentDatagram>,
    opens: u32,
    listener_reopens: u32,
    fail_open: bool,
    fail_sends: bool,
}

impl MemorySocketPair {
    /// Create with both sockets closed.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent `open` fail (simulates a port already in use).
    pub fn set_fail_open(&mut self, fail: bool) {
        self.fail_open = fail;
    }

    /// Make every subsequent send fail.
    pub fn set_fail_sends(&mut self, fail: bool) {
        self.fail_sends = fail;
    }

    /// Everything sent so far, in order.
    pub fn sent(&self) -> &[SentDatagram] {
        &self.sent
    }

    /// Drain the send log.
    pub fn take_sent(&mut self) -> Vec<SentDatagram> {
        std::mem::take(&mut self.sent)
    }

    /// Number of `open` calls, including failed ones.
    pub fn opens(&self) -> u32 {
        self.opens
    }

    /// Number of times the listener was reopened after being closed.
    pub fn listener_reopens(&self) -> u32 {
        self.listener_reopens
    }
}

impl SocketPair for MemorySocketPair {
    fn open(&mut self, _host: &str, _ports: &PortConfig) -> io::Result<()> {
        self.close();
        self.opens += 1;
        if self.fail_open {
            return Err(io::Error::new(io::ErrorKind::AddrInUse, "address in use"));
        }
        self.main_open = true;
        self.listener_open = true;
        Ok(())
    }

    fn reopen_listener(&mut self, _ports: &PortConfig) -> io::Result<()> {
        if !self.listener_open {
            if self.fail_open {
                return Err(io::Error::new(io::ErrorKind::AddrInUse, "address in use"));
            }
            self.listener_open = true;
            self.listener_reopens += 1;
        }
        Ok(())
    }

    fn send_to(&mut self, endpoint: Endpoint, port: u16, payload: &[u8]) -> io::Result<()> {
        if !self.is_open(endpoint) {
            return Err(io::Error::new(
                io::ErrorKind::NotConnected,
                format!("{endpoint} socket closed"),
            ));
        }
        if self.fail_sends {
            return Err(io::Error::other("send failed"));
        }
        self.sent.push(SentDatagram {
            endpoint,
            port,
            payload: payload.to_vec(),
        });
        Ok(())
    }

    fn close_listener(&mut self) {
        self.listener_open = false;
    }

    fn close(&mut self) {
        self.main_open = false;
        self.listener_open = false;
    }

    fn is_open(&self, endpoint: Endpoint) -> bool {
        match endpoint {
            Endpoint::Main => self.main_open,
            Endpoint::Listener => self.listener_open,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_records_sends() {
        let mut pair = MemorySocketPair::new();
        pair.open("10.0.0.1", &PortConfig::default()).unwrap();
        pair.send_to(Endpoint::Main, 5000, &[0, 6, 0, 0]).unwrap();
        assert_eq!(
            pair.sent(),
            &[SentDatagram {
                endpoint: Endpoint::Main,
                port: 5000,
                payload: vec![0, 6, 0, 0],
            }]
        );
        assert_eq!(pair.take_sent().len(), 1);
        assert!(pair.sent().is_empty());
    }

    #[test]
    fn test_closed_listener_rejects_sends() {
        let mut pair = MemorySocketPair::new();
        pair.open("10.0.0.1", &PortConfig::default()).unwrap();
        pair.close_listener();
        assert!(pair.send_to(Endpoint::Listener, 5001, &[0]).is_err());

        pair.reopen_listener(&PortConfig::default()).unwrap();
        pair.reopen_listener(&PortConfig::default()).unwrap();
        assert_eq!(pair.listener_reopens(), 1);
        assert!(pair.send_to(Endpoint::Listener, 5001, &[0]).is_ok());
    }

    #[test]
    fn test_failure_injection() {
        let mut pair = MemorySocketPair::new();
        pair.set_fail_open(true);
        assert!(pair.open("10.0.0.1", &PortConfig::default()).is_err());
        assert!(!pair.is_open(Endpoint::Main));
        assert_eq!(pair.opens(), 1);

        pair.set_fail_open(false);
        pair.open("10.0.0.1", &PortConfig::default()).unwrap();
        pair.set_fail_sends(true);
        assert!(pair.send_to(Endpoint::Main, 5000, &[0]).is_err());
        assert!(pair.sent().is_empty());
    }
}
