//! Kernel TCP statistics for a live connection.
//!
//! `SocketStats` is the introspection seam used by the sampler. On Linux the
//! counters come from `getsockopt(IPPROTO_TCP, TCP_INFO)`; other platforms
//! report `Unsupported`.

use std::io::{self, Write};

#[cfg(unix)]
pub use std::os::unix::io::RawFd;

/// Descriptor stand-in where the platform has no file descriptors.
#[cfg(not(unix))]
pub type RawFd = i32;

/// Point-in-time transport counters, laid out like the leading part of the
/// kernel's `struct tcp_info`.
///
/// Only compared by equality and flattened to CSV.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TcpCounters {
    pub state: u8,
    pub ca_state: u8,
    pub retransmits: u8,
    pub probes: u8,
    pub backoff: u8,
    pub options: u8,
    /// snd_wscale:4, rcv_wscale:4
    pub wscale: u8,
    /// delivery_rate_app_limited:1, fastopen_client_fail:2
    pub app_limited: u8,

    pub rto: u32,
    pub ato: u32,
    pub snd_mss: u32,
    pub rcv_mss: u32,

    pub unacked: u32,
    pub sacked: u32,
    pub lost: u32,
    pub retrans: u32,
    pub fackets: u32,

    pub last_data_sent: u32,
    pub last_ack_sent: u32,
    pub last_data_recv: u32,
    pub last_ack_recv: u32,

    pub pmtu: u32,
    pub rcv_ssthresh: u32,
    pub rtt: u32,
    pub rttvar: u32,
    pub snd_ssthresh: u32,
    pub snd_cwnd: u32,
    pub advmss: u32,
    pub reordering: u32,

    pub rcv_rtt: u32,
    pub rcv_space: u32,

    pub total_retrans: u32,
}

impl TcpCounters {
    /// Column names, in `values()` order.
    pub const FIELD_NAMES: [&'static str; 32] = [
        "state",
        "ca_state",
        "retransmits",
        "probes",
        "backoff",
        "options",
        "wscale",
        "app_limited",
        "rto",
        "ato",
        "snd_mss",
        "rcv_mss",
        "unacked",
        "sacked",
        "lost",
        "retrans",
        "fackets",
        "last_data_sent",
        "last_ack_sent",
        "last_data_recv",
        "last_ack_recv",
        "pmtu",
        "rcv_ssthresh",
        "rtt",
        "rttvar",
        "snd_ssthresh",
        "snd_cwnd",
        "advmss",
        "reordering",
        "rcv_rtt",
        "rcv_space",
        "total_retrans",
    ];

    pub fn values(&self) -> [u32; 32] {
        [
            self.state as u32,
            self.ca_state as u32,
            self.retransmits as u32,
            self.probes as u32,
            self.backoff as u32,
            self.options as u32,
            self.wscale as u32,
            self.app_limited as u32,
            self.rto,
            self.ato,
            self.snd_mss,
            self.rcv_mss,
            self.unacked,
            self.sacked,
            self.lost,
            self.retrans,
            self.fackets,
            self.last_data_sent,
            self.last_ack_sent,
            self.last_data_recv,
            self.last_ack_recv,
            self.pmtu,
            self.rcv_ssthresh,
            self.rtt,
            self.rttvar,
            self.snd_ssthresh,
            self.snd_cwnd,
            self.advmss,
            self.reordering,
            self.rcv_rtt,
            self.rcv_space,
            self.total_retrans,
        ]
    }

    /// Write the counters as comma-separated values (no trailing newline).
    pub fn write_csv<W: Write + ?Sized>(&self, out: &mut W) -> io::Result<()> {
        for (i, value) in self.values().iter().enumerate() {
            if i > 0 {
                out.write_all(b",")?;
            }
            write!(out, "{value}")?;
        }
        Ok(())
    }

    /// CSV header for the sampler's output file.
    pub fn csv_header() -> String {
        format!("#timestamp,message-id,{}", Self::FIELD_NAMES.join(","))
    }
}

/// Source of transport counters.
pub trait SocketStats {
    fn snapshot(&self) -> io::Result<TcpCounters>;
}

/// Capability to reach the OS socket underneath a (possibly wrapped) stream.
pub trait RawSocketAccessor {
    fn raw_socket(&self) -> Option<RawFd>;
}

/// Borrowed platform socket of a live connection.
///
/// The descriptor is owned by the transport; once the connection is gone
/// snapshots fail with an OS error instead of reading stale state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SocketHandle {
    fd: RawFd,
}

impl SocketHandle {
    pub fn new(fd: RawFd) -> Self {
        Self { fd }
    }

    /// Resolve the OS socket of any stream exposing one.
    pub fn of<S: RawSocketAccessor + ?Sized>(stream: &S) -> Option<Self> {
        stream.raw_socket().map(Self::new)
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }
}

impl SocketStats for SocketHandle {
    #[cfg(target_os = "linux")]
    fn snapshot(&self) -> io::Result<TcpCounters> {
        let mut counters = TcpCounters::default();
        let mut len = std::mem::size_of::<TcpCounters>() as libc::socklen_t;

        // SAFETY: `counters` is a repr(C) plain-old-data buffer of `len` bytes;
        // the kernel writes at most `len` bytes and updates `len`.
        let rc = unsafe {
            libc::getsockopt(
                self.fd,
                libc::IPPROTO_TCP,
                libc::TCP_INFO,
                &mut counters as *mut TcpCounters as *mut libc::c_void,
                &mut len,
            )
        };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(counters)
    }

    #[cfg(not(target_os = "linux"))]
    fn snapshot(&self) -> io::Result<TcpCounters> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "TCP_INFO sampling is only supported on Linux",
        ))
    }
}

impl RawSocketAccessor for std::net::TcpStream {
    #[cfg(unix)]
    fn raw_socket(&self) -> Option<RawFd> {
        use std::os::unix::io::AsRawFd;
        Some(self.as_raw_fd())
    }

    #[cfg(not(unix))]
    fn raw_socket(&self) -> Option<RawFd> {
        None
    }
}
