//! Interface queries over AF_INET ioctls.
//!
//! Each query opens a transient datagram socket, issues one `SIOCGIF*`
//! ioctl and closes the socket again; the agent holds no long-lived
//! descriptors.

use std::io;

#[repr(C)]
struct IfReq {
    ifr_name: [u8; libc::IFNAMSIZ],
    ifr_addr: libc::sockaddr,
    _padding: [u8; 8],
}

impl IfReq {
    fn new(name: &str) -> io::Result<IfReq> {
        if name.len() >= libc::IFNAMSIZ {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "interface name too long",
            ));
        }
        let mut ifr: IfReq = unsafe { std::mem::zeroed() };
        ifr.ifr_name[..name.len()].copy_from_slice(name.as_bytes());
        Ok(ifr)
    }

    fn addr_v4(&self) -> [u8; 4] {
        let sin =
            unsafe { &*(&self.ifr_addr as *const libc::sockaddr as *const libc::sockaddr_in) };
        sin.sin_addr.s_addr.to_ne_bytes()
    }
}

fn query(name: &str, request: libc::Ioctl) -> io::Result<IfReq> {
    let mut ifr = IfReq::new(name)?;

    let fd = unsafe { libc::socket(libc::AF_INET, libc::SOCK_DGRAM | libc::SOCK_CLOEXEC, 0) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }

    let rc = unsafe { libc::ioctl(fd, request, &mut ifr) };
    let err = io::Error::last_os_error();
    unsafe { libc::close(fd) };

    if rc < 0 {
        return Err(err);
    }
    Ok(ifr)
}

/// Six-byte hardware address of `name`.
pub fn hardware_address(name: &str) -> io::Result<[u8; 6]> {
    let ifr = query(name, libc::SIOCGIFHWADDR)?;
    let mut mac = [0u8; 6];
    for (out, raw) in mac.iter_mut().zip(&ifr.ifr_addr.sa_data[..6]) {
        *out = *raw as u8;
    }
    Ok(mac)
}

/// IPv4 address of `name` in network byte order.
pub fn address(name: &str) -> io::Result<[u8; 4]> {
    Ok(query(name, libc::SIOCGIFADDR)?.addr_v4())
}

/// Raw IPv4 netmask of `name`: the kernel's network-order value read as a
/// native integer.
pub fn netmask(name: &str) -> io::Result<u32> {
    Ok(u32::from_ne_bytes(
        query(name, libc::SIOCGIFNETMASK)?.addr_v4(),
    ))
}

/// Prefix length as the tools protocol reports it: the number of right
/// shifts of the signed 32-bit raw mask until it reaches zero. Not a
/// popcount; non-octet masks round up to the highest set bit and a /32
/// mask (negative in the signed view) reports 0.
pub fn prefix_len(raw_mask: u32) -> u32 {
    let mut n = raw_mask as i32;
    let mut bits = 0;
    while n > 0 {
        n >>= 1;
        bits += 1;
    }
    bits
}

/// `xx:xx:xx:xx:xx:xx` rendering of a hardware address.
pub fn format_mac(mac: [u8; 6]) -> [u8; 17] {
    let text = format!(
        "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
        mac[0], mac[1], mac[2], mac[3], mac[4], mac[5]
    );
    let mut out = [0u8; 17];
    out.copy_from_slice(text.as_bytes());
    out
}

/// Number of consecutively numbered `eth*` interfaces, at least one.
pub fn interface_count() -> u32 {
    let mut n = 0u32;
    while hardware_address(&format!("eth{n}")).is_ok() {
        n += 1;
    }
    n.max(1)
}
