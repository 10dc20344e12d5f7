//! IP terminal backed by a TUN device.
//!
//! The device fd is switched to non-blocking mode and polled through
//! `AsyncFd`. On macOS every packet carries a 4-byte address family prefix,
//! which is stripped on read and added on write.

use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::os::unix::io::{AsRawFd, RawFd};
use std::process::Command;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::io::unix::AsyncFd;
use tracing::{debug, info, warn};
use tun::platform::Device as TunDevice;
use tun::{Configuration, Device};

use super::{IpTerminal, IpTerminalFactory};
use crate::error::{Error, Result};
use crate::types::NetworkAddresses;

#[cfg(target_os = "macos")]
const AF_HEADER_LEN: usize = 4;

fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    // SAFETY: fcntl on an fd we own, with standard flags.
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    let rc = unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

fn check(rc: isize) -> io::Result<usize> {
    if rc < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(rc as usize)
    }
}

#[cfg(not(target_os = "macos"))]
fn read_fd(fd: RawFd, buf: &mut [u8]) -> io::Result<usize> {
    // SAFETY: buf is valid for buf.len() bytes.
    check(unsafe { libc::read(fd, buf.as_mut_ptr().cast(), buf.len()) })
}

#[cfg(not(target_os = "macos"))]
fn write_fd(fd: RawFd, packet: &[u8]) -> io::Result<usize> {
    // SAFETY: packet is valid for packet.len() bytes.
    check(unsafe { libc::write(fd, packet.as_ptr().cast(), packet.len()) })
}

#[cfg(target_os = "macos")]
fn read_fd(fd: RawFd, buf: &mut [u8]) -> io::Result<usize> {
    let mut family = [0u8; AF_HEADER_LEN];
    let iov = [
        libc::iovec {
            iov_base: family.as_mut_ptr().cast(),
            iov_len: family.len(),
        },
        libc::iovec {
            iov_base: buf.as_mut_ptr().cast(),
            iov_len: buf.len(),
        },
    ];
    // SAFETY: both iovecs point at live buffers of the given lengths.
    let n = check(unsafe { libc::readv(fd, iov.as_ptr(), iov.len() as libc::c_int) })?;
    Ok(n.saturating_sub(AF_HEADER_LEN))
}

#[cfg(target_os = "macos")]
fn write_fd(fd: RawFd, packet: &[u8]) -> io::Result<usize> {
    let family: u32 = match packet.first().map(|b| b >> 4) {
        Some(6) => libc::AF_INET6 as u32,
        _ => libc::AF_INET as u32,
    };
    let family = family.to_be_bytes();
    let iov = [
        libc::iovec {
            iov_base: family.as_ptr() as *mut libc::c_void,
            iov_len: family.len(),
        },
        libc::iovec {
            iov_base: packet.as_ptr() as *mut libc::c_void,
            iov_len: packet.len(),
        },
    ];
    // SAFETY: both iovecs point at live buffers; writev does not write to them.
    let n = check(unsafe { libc::writev(fd, iov.as_ptr(), iov.len() as libc::c_int) })?;
    Ok(n.saturating_sub(AF_HEADER_LEN))
}

fn run(program: &str, args: &[&str]) -> io::Result<String> {
    debug!("{} {}", program, args.join(" "));
    let output = Command::new(program).args(args).output()?;
    if !output.status.success() {
        return Err(io::Error::new(
            io::ErrorKind::Other,
            format!(
                "{program} {} failed: {}",
                args.join(" "),
                String::from_utf8_lossy(&output.stderr).trim()
            ),
        ));
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Value following `key` in whitespace-separated command output.
fn field_after<'a>(output: &'a str, key: &str) -> Option<&'a str> {
    let mut words = output.split_whitespace();
    while let Some(word) = words.next() {
        if word == key {
            return words.next();
        }
    }
    None
}

/// A route installed by us, removed again on close.
#[derive(Debug, Clone)]
struct RouteEntry {
    destination: String,
    delete_args: Vec<String>,
}

#[cfg(target_os = "linux")]
fn add_server_route(server: Ipv4Addr) -> io::Result<RouteEntry> {
    let server = server.to_string();
    let current = run("ip", &["-4", "route", "get", &server])?;
    let dev = field_after(&current, "dev")
        .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no route to server"))?;
    let host = format!("{server}/32");
    let mut args = vec!["route", "add", host.as_str()];
    if let Some(gateway) = field_after(&current, "via") {
        args.extend(["via", gateway]);
    }
    args.extend(["dev", dev]);
    run("ip", &args)?;
    Ok(RouteEntry {
        destination: host.clone(),
        delete_args: vec!["ip".into(), "route".into(), "del".into(), host],
    })
}

#[cfg(target_os = "macos")]
fn add_server_route(server: Ipv4Addr) -> io::Result<RouteEntry> {
    let server = server.to_string();
    let current = run("/sbin/route", &["-n", "get", &server])?;
    let gateway = field_after(&current, "gateway:")
        .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no gateway to server"))?;
    run("/sbin/route", &["-n", "add", "-host", &server, gateway])?;
    Ok(RouteEntry {
        destination: server.clone(),
        delete_args: vec![
            "/sbin/route".into(),
            "-n".into(),
            "delete".into(),
            "-host".into(),
            server,
        ],
    })
}

#[cfg(target_os = "linux")]
fn add_tunnel_route(ifname: &str, net: &str) -> io::Result<RouteEntry> {
    run("ip", &["route", "add", net, "dev", ifname])?;
    Ok(RouteEntry {
        destination: net.to_string(),
        delete_args: vec!["ip".into(), "route".into(), "del".into(), net.into()],
    })
}

#[cfg(target_os = "macos")]
fn add_tunnel_route(ifname: &str, net: &str) -> io::Result<RouteEntry> {
    run("/sbin/route", &["-n", "add", "-net", net, "-interface", ifname])?;
    Ok(RouteEntry {
        destination: net.to_string(),
        delete_args: vec![
            "/sbin/route".into(),
            "-n".into(),
            "delete".into(),
            "-net".into(),
            net.into(),
        ],
    })
}

#[cfg(not(any(target_os = "linux", target_os = "macos")))]
fn add_server_route(_server: Ipv4Addr) -> io::Result<RouteEntry> {
    Err(io::Error::new(io::ErrorKind::Unsupported, "routing not supported"))
}

#[cfg(not(any(target_os = "linux", target_os = "macos")))]
fn add_tunnel_route(_ifname: &str, _net: &str) -> io::Result<RouteEntry> {
    Err(io::Error::new(io::ErrorKind::Unsupported, "routing not supported"))
}

#[cfg(target_os = "macos")]
fn add_link_local(ifname: &str, address: Ipv6Addr) -> io::Result<()> {
    run(
        "/sbin/ifconfig",
        &[ifname, "inet6", &address.to_string(), "prefixlen", "64"],
    )
    .map(|_| ())
}

#[cfg(not(target_os = "macos"))]
fn add_link_local(ifname: &str, address: Ipv6Addr) -> io::Result<()> {
    run(
        "ip",
        &["-6", "addr", "add", &format!("{address}/64"), "dev", ifname],
    )
    .map(|_| ())
}

/// TUN device as an [`IpTerminal`].
pub struct TunTerminal {
    device: AsyncFd<TunDevice>,
    name: String,
    routes: Mutex<Vec<RouteEntry>>,
}

impl TunTerminal {
    pub fn name(&self) -> &str {
        &self.name
    }

    fn install_default_route(&self, server: Ipv4Addr) -> io::Result<()> {
        let mut routes = self.routes.lock();
        routes.push(add_server_route(server)?);
        // Two halves win over the existing default route without replacing it.
        for net in ["0.0.0.0/1", "128.0.0.0/1"] {
            routes.push(add_tunnel_route(&self.name, net)?);
        }
        info!("default route through {}", self.name);
        Ok(())
    }
}

#[async_trait]
impl IpTerminal for TunTerminal {
    async fn read_packet(&self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            let mut guard = self.device.readable().await?;
            match guard.try_io(|inner| read_fd(inner.as_raw_fd(), buf)) {
                Ok(result) => return result,
                Err(_would_block) => continue,
            }
        }
    }

    async fn write_packet(&self, packet: &[u8]) -> io::Result<()> {
        loop {
            let mut guard = self.device.writable().await?;
            match guard.try_io(|inner| write_fd(inner.as_raw_fd(), packet)) {
                Ok(result) => return result.map(|_| ()),
                Err(_would_block) => continue,
            }
        }
    }

    async fn close(&self) {
        let routes: Vec<RouteEntry> = self.routes.lock().drain(..).rev().collect();
        for route in routes {
            let (program, args) = match route.delete_args.split_first() {
                Some(split) => split,
                None => continue,
            };
            let args: Vec<&str> = args.iter().map(String::as_str).collect();
            if let Err(e) = run(program, &args) {
                warn!("removing route {} failed: {}", route.destination, e);
            }
        }
        debug!("{} closed", self.name);
    }
}

/// Creates [`TunTerminal`]s with the negotiated addresses.
#[derive(Debug, Clone, Default)]
pub struct TunFactory {
    /// Route all IPv4 traffic through the tunnel, keeping `server` reachable
    /// through the existing gateway.
    pub default_route: Option<Ipv4Addr>,
}

impl TunFactory {
    pub fn new(default_route: bool, server: Option<IpAddr>) -> Self {
        let server = match server {
            Some(IpAddr::V4(addr)) => Some(addr),
            _ => None,
        };
        if default_route && server.is_none() {
            warn!("default route needs the server's IPv4 address; skipping it");
        }
        Self {
            default_route: server.filter(|_| default_route),
        }
    }
}

#[async_trait]
impl IpTerminalFactory for TunFactory {
    async fn establish(
        &self,
        mtu: u16,
        addresses: &NetworkAddresses,
    ) -> Result<Arc<dyn IpTerminal>> {
        let mut config = Configuration::default();
        config.mtu(mtu as i32).up();
        if let Some(address) = addresses.ipv4 {
            config
                .address(address)
                .destination(address)
                .netmask(Ipv4Addr::new(255, 255, 255, 255));
        }

        let device = tun::create(&config).map_err(|e| Error::Terminal(e.to_string()))?;
        let name = device
            .name()
            .map_err(|e| Error::Terminal(e.to_string()))?;
        set_nonblocking(device.as_raw_fd())?;
        info!("TUN {} up, MTU {}", name, mtu);

        if let Some(address) = addresses.ipv6_link_local {
            if let Err(e) = add_link_local(&name, address) {
                warn!("assigning {} to {} failed: {}", address, name, e);
            }
        }
        if !addresses.ipv4_dns.is_empty() {
            info!("DNS servers offered: {:?}", addresses.ipv4_dns);
        }

        let terminal = TunTerminal {
            device: AsyncFd::new(device)?,
            name,
            routes: Mutex::new(Vec::new()),
        };
        if let Some(server) = self.default_route {
            if let Err(e) = terminal.install_default_route(server) {
                warn!("default route not installed: {}", e);
            }
        }
        Ok(Arc::new(terminal))
    }
}
