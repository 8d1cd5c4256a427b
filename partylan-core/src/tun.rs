//! Virtual NIC capability.
//!
//! One trait over the platform TUN device; the composition root picks the
//! implementation. `NativeTun` (behind the `native-tun` feature) wraps a
//! real kernel device via tun-rs; tests substitute an in-memory pair.

use std::io;
use std::net::Ipv4Addr;

use async_trait::async_trait;

#[async_trait]
pub trait TunDevice: Send + Sync {
    /// OS-assigned interface name.
    fn name(&self) -> String;

    /// Assign the virtual address and subnet mask.
    fn set_ipv4(&self, addr: Ipv4Addr, mask: Ipv4Addr) -> io::Result<()>;

    fn set_mtu(&self, mtu: u16) -> io::Result<()>;

    /// Bring the interface up. A no-op on platforms that activate the
    /// device on open; both semantics are accepted.
    fn bring_up(&self) -> io::Result<()>;

    /// Read one whole IPv4 frame. Blocks until a frame arrives; returns
    /// an error once the device is closed.
    async fn recv(&self, buf: &mut [u8]) -> io::Result<usize>;

    /// Write one whole IPv4 frame; returns bytes written.
    async fn send(&self, packet: &[u8]) -> io::Result<usize>;

    /// Release the device. Pending and future reads fail afterwards.
    fn close(&self);
}

#[cfg(feature = "native-tun")]
pub use native::NativeTun;

#[cfg(feature = "native-tun")]
mod native {
    use super::*;

    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    /// Kernel TUN device.
    pub struct NativeTun {
        device: Arc<tun_rs::AsyncDevice>,
        name: String,
        closed: AtomicBool,
    }

    impl NativeTun {
        /// Create the device with a name hint and initial MTU. The OS may
        /// pick a different name (Wintun in particular); `name()` reports
        /// the real one.
        pub fn open(name_hint: &str, mtu: u16) -> io::Result<Self> {
            let device = tun_rs::DeviceBuilder::new()
                .name(name_hint)
                .mtu(mtu)
                .build_async()?;
            let name = device.name().unwrap_or_else(|_| name_hint.to_string());
            tracing::info!(device = %name, mtu, "tun device created");
            Ok(Self {
                device: Arc::new(device),
                name,
                closed: AtomicBool::new(false),
            })
        }

        fn check_open(&self) -> io::Result<()> {
            if self.closed.load(Ordering::Acquire) {
                return Err(io::Error::new(io::ErrorKind::BrokenPipe, "tun closed"));
            }
            Ok(())
        }
    }

    #[async_trait]
    impl TunDevice for NativeTun {
        fn name(&self) -> String {
            self.name.clone()
        }

        fn set_ipv4(&self, addr: Ipv4Addr, mask: Ipv4Addr) -> io::Result<()> {
            self.device.set_network_address(addr, mask, None)
        }

        fn set_mtu(&self, mtu: u16) -> io::Result<()> {
            self.device.set_mtu(mtu)
        }

        fn bring_up(&self) -> io::Result<()> {
            self.device.enabled(true)
        }

        async fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
            self.check_open()?;
            self.device.recv(buf).await
        }

        async fn send(&self, packet: &[u8]) -> io::Result<usize> {
            self.check_open()?;
            self.device.send(packet).await
        }

        fn close(&self) {
            self.closed.store(true, Ordering::Release);
        }
    }
}
