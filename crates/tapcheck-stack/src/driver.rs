// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Frame driver contract and the smoltcp PHY bridge for tapcheck.
// Author: Lukas Bower

//! Frame driver contract consumed by the event manager.
//!
//! A [`Driver`] moves whole Ethernet frames and reports link state.
//! [`DriverPhy`] adapts any driver to the smoltcp [`Device`] interface so the
//! manager can poll it, counting frames and transmit drops along the way.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};

use smoltcp::phy::{Device, DeviceCapabilities, Medium, RxToken, TxToken};
use smoltcp::time::Instant;

/// Largest Ethernet frame exchanged with a driver (1500 byte MTU plus header).
pub const MAX_FRAME_LEN: usize = 1514;

/// Number of frames retained per direction by [`LoopbackDriver`].
pub const LOOPBACK_QUEUE_DEPTH: usize = 64;

/// Contract between the event manager and a frame-level network device.
///
/// Implementations are polled from whichever thread currently drives the
/// manager, so they must be [`Send`].
pub trait Driver: Send {
    /// Transmit one frame, returning the number of bytes accepted or 0 on failure.
    fn transmit(&mut self, frame: &[u8]) -> usize;

    /// Receive at most one frame into `buf`, returning its length or 0 when idle.
    fn receive(&mut self, buf: &mut [u8]) -> usize;

    /// Whether the device is attached to a live link.
    fn link_up(&self) -> bool;
}

impl<D: Driver + ?Sized> Driver for Box<D> {
    fn transmit(&mut self, frame: &[u8]) -> usize {
        (**self).transmit(frame)
    }

    fn receive(&mut self, buf: &mut [u8]) -> usize {
        (**self).receive(buf)
    }

    fn link_up(&self) -> bool {
        (**self).link_up()
    }
}

/// Frame counters maintained by [`DriverPhy`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PhyStats {
    /// Frames handed to the stack.
    pub rx_frames: u64,
    /// Frames accepted by the driver.
    pub tx_frames: u64,
    /// Frames the driver refused to transmit.
    pub tx_drops: u64,
}

/// smoltcp device wrapping a boxed [`Driver`].
pub struct DriverPhy {
    driver: Box<dyn Driver>,
    rx_buf: Vec<u8>,
    stats: PhyStats,
}

impl DriverPhy {
    /// Wrap a driver for use with a smoltcp interface.
    #[must_use]
    pub fn new(driver: Box<dyn Driver>) -> Self {
        Self {
            driver,
            rx_buf: vec![0; MAX_FRAME_LEN],
            stats: PhyStats::default(),
        }
    }

    /// Current frame counters.
    #[must_use]
    pub fn stats(&self) -> PhyStats {
        self.stats
    }

    /// Whether the wrapped driver reports a live link.
    #[must_use]
    pub fn link_up(&self) -> bool {
        self.driver.link_up()
    }

    /// Return ownership of the wrapped driver.
    #[must_use]
    pub fn into_driver(self) -> Box<dyn Driver> {
        self.driver
    }
}

impl Device for DriverPhy {
    type RxToken<'a>
        = FrameRxToken
    where
        Self: 'a;
    type TxToken<'a>
        = FrameTxToken<'a>
    where
        Self: 'a;

    fn receive(&mut self, _timestamp: Instant) -> Option<(Self::RxToken<'_>, Self::TxToken<'_>)> {
        if !self.driver.link_up() {
            return None;
        }
        let len = self.driver.receive(&mut self.rx_buf).min(self.rx_buf.len());
        if len == 0 {
            return None;
        }
        self.stats.rx_frames += 1;
        let frame = self.rx_buf[..len].to_vec();
        Some((FrameRxToken { frame }, FrameTxToken { phy: self }))
    }

    fn transmit(&mut self, _timestamp: Instant) -> Option<Self::TxToken<'_>> {
        if !self.driver.link_up() {
            return None;
        }
        Some(FrameTxToken { phy: self })
    }

    fn capabilities(&self) -> DeviceCapabilities {
        let mut caps = DeviceCapabilities::default();
        caps.max_transmission_unit = MAX_FRAME_LEN;
        caps.medium = Medium::Ethernet;
        caps
    }
}

/// RX token carrying one received frame.
pub struct FrameRxToken {
    frame: Vec<u8>,
}

impl RxToken for FrameRxToken {
    fn consume<R, F>(self, f: F) -> R
    where
        F: FnOnce(&[u8]) -> R,
    {
        f(&self.frame)
    }
}

/// TX token writing one frame through the driver.
pub struct FrameTxToken<'a> {
    phy: &'a mut DriverPhy,
}

impl TxToken for FrameTxToken<'_> {
    fn consume<R, F>(self, len: usize, f: F) -> R
    where
        F: FnOnce(&mut [u8]) -> R,
    {
        let mut frame = vec![0; len];
        let result = f(&mut frame);
        if self.phy.driver.transmit(&frame) == 0 {
            self.phy.stats.tx_drops += 1;
        } else {
            self.phy.stats.tx_frames += 1;
        }
        result
    }
}

type FrameQueue = Arc<Mutex<VecDeque<Vec<u8>>>>;

/// In-memory driver whose frames appear on a paired peer.
///
/// Two managers joined by [`LoopbackDriver::pair`] can talk to each other
/// without any host networking, which is how the scenarios are exercised in
/// tests.
#[derive(Debug)]
pub struct LoopbackDriver {
    inbound: FrameQueue,
    outbound: FrameQueue,
}

impl LoopbackDriver {
    /// Create two drivers wired back to back.
    #[must_use]
    pub fn pair() -> (Self, Self) {
        let a_to_b = FrameQueue::default();
        let b_to_a = FrameQueue::default();
        (
            Self {
                inbound: Arc::clone(&b_to_a),
                outbound: Arc::clone(&a_to_b),
            },
            Self {
                inbound: a_to_b,
                outbound: b_to_a,
            },
        )
    }

    /// Frames waiting to be received by this end.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.inbound
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

impl Driver for LoopbackDriver {
    fn transmit(&mut self, frame: &[u8]) -> usize {
        let mut queue = self.outbound.lock().unwrap_or_else(PoisonError::into_inner);
        if queue.len() >= LOOPBACK_QUEUE_DEPTH {
            return 0;
        }
        queue.push_back(frame.to_vec());
        frame.len()
    }

    fn receive(&mut self, buf: &mut [u8]) -> usize {
        let frame = {
            let mut queue = self.inbound.lock().unwrap_or_else(PoisonError::into_inner);
            queue.pop_front()
        };
        match frame {
            Some(frame) => {
                let len = frame.len().min(buf.len());
                buf[..len].copy_from_slice(&frame[..len]);
                len
            }
            None => 0,
        }
    }

    fn link_up(&self) -> bool {
        true
    }
}

/// Driver with no attached device: never up, never moves a frame.
#[derive(Debug, Default, Clone, Copy)]
pub struct LinkDownDriver;

impl Driver for LinkDownDriver {
    fn transmit(&mut self, _frame: &[u8]) -> usize {
        0
    }

    fn receive(&mut self, _buf: &mut [u8]) -> usize {
        0
    }

    fn link_up(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loopback_pair_crosses_frames() {
        let (mut a, mut b) = LoopbackDriver::pair();
        assert_eq!(a.transmit(b"frame-a"), 7);
        assert_eq!(b.pending(), 1);
        assert_eq!(a.pending(), 0);

        let mut buf = [0u8; 32];
        let len = b.receive(&mut buf);
        assert_eq!(&buf[..len], b"frame-a");
        assert_eq!(b.receive(&mut buf), 0);
    }

    #[test]
    fn loopback_drops_when_saturated() {
        let (mut a, _b) = LoopbackDriver::pair();
        for _ in 0..LOOPBACK_QUEUE_DEPTH {
            assert_eq!(a.transmit(&[1, 2, 3]), 3);
        }
        assert_eq!(a.transmit(&[1, 2, 3]), 0);
    }

    #[test]
    fn phy_counts_frames_and_drops() {
        let (a, mut b) = LoopbackDriver::pair();
        let mut phy = DriverPhy::new(Box::new(a));
        b.transmit(&[0xaa; 60]);

        let (rx, _) = phy.receive(Instant::from_millis(0)).expect("frame pending");
        let len = rx.consume(|frame| frame.len());
        assert_eq!(len, 60);

        let tx = phy.transmit(Instant::from_millis(0)).expect("link up");
        tx.consume(42, |frame| frame.fill(0x55));
        let mut buf = [0u8; MAX_FRAME_LEN];
        assert_eq!(b.receive(&mut buf), 42);

        let stats = phy.stats();
        assert_eq!(stats.rx_frames, 1);
        assert_eq!(stats.tx_frames, 1);
        assert_eq!(stats.tx_drops, 0);
    }

    #[test]
    fn link_down_driver_yields_no_tokens() {
        let mut phy = DriverPhy::new(Box::new(LinkDownDriver));
        assert!(!phy.link_up());
        assert!(phy.receive(Instant::from_millis(0)).is_none());
        assert!(phy.transmit(Instant::from_millis(0)).is_none());
        assert_eq!(phy.capabilities().max_transmission_unit, MAX_FRAME_LEN);
    }
}
