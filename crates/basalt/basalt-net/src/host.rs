//! Host and address resolution.
//!
//! Resolution failures are deliberately soft: a symbolic name that cannot be
//! looked up yields an endpoint named [`UNRESOLVABLE`] instead of an error, and
//! a failed reverse lookup falls back to the numeric text.

use crate::NetError;
use std::ffi::CStr;
use std::mem::{size_of, zeroed};
use std::net::{IpAddr, Ipv4Addr, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use tracing::{debug, warn};

/// Name given to endpoints whose symbolic lookup failed.
pub const UNRESOLVABLE: &str = "unresolvable IP address";

/// Longest dotted-quad text, "255.255.255.255".
const MAX_NUMERIC_LEN: usize = 15;

/// A resolved IPv4 host.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Endpoint {
    addr: Ipv4Addr,
    name: String,
}

impl Endpoint {
    /// Parse dotted-quad text. Exactly four decimal fields, each 0..=255.
    pub fn resolve_numeric(text: &str) -> Result<Self, NetError> {
        let invalid = || NetError::InvalidAddress(text.to_string());
        if text.is_empty() || text.len() > MAX_NUMERIC_LEN {
            return Err(invalid());
        }

        let mut octets = [0u8; 4];
        let mut fields = text.split('.');
        for octet in octets.iter_mut() {
            let field = fields.next().ok_or_else(invalid)?;
            // u8::from_str would also take a leading '+'
            if field.is_empty() || !field.bytes().all(|b| b.is_ascii_digit()) {
                return Err(invalid());
            }
            *octet = field.parse().map_err(|_| invalid())?;
        }
        if fields.next().is_some() {
            return Err(invalid());
        }

        Ok(Self {
            addr: Ipv4Addr::from(octets),
            name: text.to_string(),
        })
    }

    /// Look `text` up by name. Never fails; see [`UNRESOLVABLE`].
    pub fn resolve_symbolic(text: &str) -> Self {
        let found = (text, 0u16).to_socket_addrs().ok().and_then(|mut addrs| {
            addrs.find_map(|a| match a.ip() {
                IpAddr::V4(v4) => Some(v4),
                IpAddr::V6(_) => None,
            })
        });

        match found {
            Some(addr) => {
                debug!(host = text, %addr, "resolved host");
                Self {
                    addr,
                    name: text.to_string(),
                }
            }
            None => {
                warn!(host = text, "host lookup failed");
                Self {
                    addr: Ipv4Addr::UNSPECIFIED,
                    name: UNRESOLVABLE.to_string(),
                }
            }
        }
    }

    /// Numeric text goes through [`resolve_numeric`](Self::resolve_numeric),
    /// anything else through [`resolve_symbolic`](Self::resolve_symbolic).
    pub fn resolve(text: &str) -> Result<Self, NetError> {
        if !text.is_empty() && text.bytes().all(|b| b.is_ascii_digit() || b == b'.') {
            Self::resolve_numeric(text)
        } else if text.is_empty() {
            Err(NetError::InvalidAddress(String::new()))
        } else {
            Ok(Self::resolve_symbolic(text))
        }
    }

    /// Endpoint from a packed address, most significant octet first.
    pub fn from_ipv4(packed: u32) -> Self {
        let addr = Ipv4Addr::from(packed);
        Self {
            addr,
            name: addr.to_string(),
        }
    }

    /// The host this process runs on.
    pub fn local() -> Self {
        let mut buf = [0 as libc::c_char; 256];
        // SAFETY: buf is writable for its full length; gethostname NUL-terminates
        // on success when the name fits, and the last byte stays 0 regardless.
        let rc = unsafe { libc::gethostname(buf.as_mut_ptr(), buf.len() - 1) };
        if rc != 0 {
            warn!("gethostname failed; using loopback");
            return Self {
                addr: Ipv4Addr::LOCALHOST,
                name: "localhost".to_string(),
            };
        }
        // SAFETY: buf is NUL-terminated (see above)
        let name = unsafe { CStr::from_ptr(buf.as_ptr()) }.to_string_lossy();
        Self::resolve_symbolic(&name)
    }

    #[inline]
    pub fn addr(&self) -> Ipv4Addr {
        self.addr
    }

    #[inline]
    pub fn octets(&self) -> [u8; 4] {
        self.addr.octets()
    }

    #[inline]
    pub fn ipv4(&self) -> u32 {
        u32::from(self.addr)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_resolved(&self) -> bool {
        self.name != UNRESOLVABLE
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.name == self.addr.to_string() {
            write!(f, "{}", self.addr)
        } else {
            write!(f, "{} ({})", self.name, self.addr)
        }
    }
}

/// Reverse (address to name) lookups with a sticky numeric-only fallback.
///
/// After `failure_limit` consecutive failed lookups the resolver stops asking
/// and answers every query with the numeric text.
#[derive(Debug)]
pub struct HostResolver {
    numeric_only: AtomicBool,
    consecutive_failures: AtomicU32,
    failure_limit: u32,
}

static GLOBAL_RESOLVER: HostResolver = HostResolver::new(3);

impl HostResolver {
    pub const fn new(failure_limit: u32) -> Self {
        Self {
            numeric_only: AtomicBool::new(false),
            consecutive_failures: AtomicU32::new(0),
            failure_limit,
        }
    }

    /// The process-wide resolver.
    pub fn global() -> &'static HostResolver {
        &GLOBAL_RESOLVER
    }

    pub fn is_numeric_only(&self) -> bool {
        self.numeric_only.load(Ordering::Relaxed)
    }

    pub fn set_numeric_only(&self, on: bool) {
        self.numeric_only.store(on, Ordering::Relaxed);
    }

    /// Symbolic name for dotted-quad `numeric`, or `numeric` itself when the
    /// lookup fails or the resolver has gone numeric-only.
    pub fn numeric_to_symbolic(&self, numeric: &str) -> String {
        if self.is_numeric_only() {
            return numeric.to_string();
        }
        let Ok(endpoint) = Endpoint::resolve_numeric(numeric) else {
            return numeric.to_string();
        };

        match reverse_lookup(endpoint.addr()) {
            Some(name) => {
                self.consecutive_failures.store(0, Ordering::Relaxed);
                name
            }
            None => {
                let failures = self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
                if failures >= self.failure_limit && !self.numeric_only.swap(true, Ordering::Relaxed)
                {
                    warn!(failures, "reverse lookups keep failing; switching to numeric names");
                }
                numeric.to_string()
            }
        }
    }
}

fn reverse_lookup(addr: Ipv4Addr) -> Option<String> {
    // SAFETY: sockaddr_in is plain old data; all-zero is a valid value
    let mut sin: libc::sockaddr_in = unsafe { zeroed() };
    sin.sin_family = libc::AF_INET as libc::sa_family_t;
    sin.sin_addr = libc::in_addr {
        s_addr: u32::from(addr).to_be(),
    };

    let mut host = [0 as libc::c_char; 1025];
    // SAFETY: sin is a valid sockaddr_in of the length passed; host is writable
    // for host.len() bytes; no service buffer is requested.
    let rc = unsafe {
        libc::getnameinfo(
            &sin as *const libc::sockaddr_in as *const libc::sockaddr,
            size_of::<libc::sockaddr_in>() as libc::socklen_t,
            host.as_mut_ptr(),
            host.len() as libc::socklen_t,
            std::ptr::null_mut(),
            0,
            libc::NI_NAMEREQD,
        )
    };
    if rc != 0 {
        return None;
    }
    // SAFETY: getnameinfo NUL-terminates host on success
    let name = unsafe { CStr::from_ptr(host.as_ptr()) };
    Some(name.to_string_lossy().into_owned())
}
