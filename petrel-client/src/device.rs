//! The request character device.
//!
//! The kernel module posts upcalls on `/dev/petrel-req`; the daemon reads
//! them tagged, services them, and writes tagged downcalls back as a
//! scatter list. The device also exports the two mapped buffer pools and
//! the remount ioctl.
//!
//! Device reads are non-blocking: the request loop drains pending upcalls
//! each iteration and sleeps only in the engine's `testany`.

use std::fs::{File, OpenOptions};
use std::io::{self, Read};
use std::os::fd::{AsRawFd, RawFd};

use crate::buffers::{BufferPool, PoolParams};

/// Default device node.
pub const DEVICE_PATH: &str = "/dev/petrel-req";

/// Upper bound on a single upcall read: fixed section plus the largest
/// trailer the kernel may attach (iox offset/length lists).
pub const MAX_UPCALL_READ: usize = 16 + petrel_abi::UPCALL_SIZE + 64 * 1024;

// ioctl request codes, shared with the kernel module.
const IOC_MAP_IO_POOL: libc::c_ulong = 0x5001;
const IOC_MAP_READDIR_POOL: libc::c_ulong = 0x5002;
const IOC_REMOUNT: libc::c_ulong = 0x5003;

#[repr(C)]
struct MapParams {
    count: u64,
    size: u64,
}

/// One upcall as read from the device.
#[derive(Debug)]
pub struct UnexpectedInfo {
    pub tag: u64,
    /// Fixed upcall section plus trailer bytes.
    pub buf: Vec<u8>,
}

/// Issues the blocking remount ioctl from the helper thread.
pub trait Remounter: Send {
    fn remount(&self) -> io::Result<()>;
}

/// The device seam used by the request loop.
pub trait VfsDevice {
    /// Next pending upcall, if any. Never blocks.
    fn recv_unexpected(&mut self) -> io::Result<Option<UnexpectedInfo>>;

    /// Write a downcall as a `{header, trailer}` scatter list.
    fn write_downcall(&mut self, tag: u64, primary: &[u8], trailer: Option<&[u8]>)
    -> io::Result<()>;

    /// Acquire the two mapped pools.
    fn map_pools(&mut self, io: PoolParams, readdir: PoolParams)
    -> io::Result<(BufferPool, BufferPool)>;

    /// A handle for the blocking remount ioctl, usable from another thread.
    fn remounter(&self) -> Box<dyn Remounter>;
}

/// Production device backed by the character device node.
pub struct CharDevice {
    file: File,
    scratch: Vec<u8>,
}

impl CharDevice {
    pub fn open(path: &str) -> io::Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let fd = file.as_raw_fd();
        // Non-blocking reads; the loop's only sleep is the engine poll.
        unsafe {
            let flags = libc::fcntl(fd, libc::F_GETFL);
            if flags < 0 || libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) < 0 {
                return Err(io::Error::last_os_error());
            }
        }
        Ok(Self {
            file,
            scratch: vec![0u8; MAX_UPCALL_READ],
        })
    }
}

struct FdRemounter {
    fd: RawFd,
}

impl Remounter for FdRemounter {
    fn remount(&self) -> io::Result<()> {
        let rc = unsafe { libc::ioctl(self.fd, IOC_REMOUNT, 0usize) };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

impl VfsDevice for CharDevice {
    fn recv_unexpected(&mut self) -> io::Result<Option<UnexpectedInfo>> {
        let n = match self.file.read(&mut self.scratch) {
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(None),
            Err(e) if e.raw_os_error() == Some(libc::EINTR) => return Ok(None),
            Err(e) => return Err(e),
        };
        if n < 16 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("short read from device: {n} bytes"),
            ));
        }
        let tag = u64::from_le_bytes(self.scratch[0..8].try_into().unwrap());
        let size = u64::from_le_bytes(self.scratch[8..16].try_into().unwrap()) as usize;
        if 16 + size > n {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "device read shorter than advertised upcall size",
            ));
        }
        Ok(Some(UnexpectedInfo {
            tag,
            buf: self.scratch[16..16 + size].to_vec(),
        }))
    }

    fn write_downcall(
        &mut self,
        tag: u64,
        primary: &[u8],
        trailer: Option<&[u8]>,
    ) -> io::Result<()> {
        let tag_bytes = tag.to_le_bytes();
        let mut iov = [
            libc::iovec {
                iov_base: tag_bytes.as_ptr() as *mut libc::c_void,
                iov_len: tag_bytes.len(),
            },
            libc::iovec {
                iov_base: primary.as_ptr() as *mut libc::c_void,
                iov_len: primary.len(),
            },
            libc::iovec {
                iov_base: std::ptr::null_mut(),
                iov_len: 0,
            },
        ];
        let mut iovcnt = 2;
        if let Some(trailer) = trailer {
            iov[2].iov_base = trailer.as_ptr() as *mut libc::c_void;
            iov[2].iov_len = trailer.len();
            iovcnt = 3;
        }
        let total: usize = iov[..iovcnt].iter().map(|v| v.iov_len).sum();
        let written =
            unsafe { libc::writev(self.file.as_raw_fd(), iov.as_ptr(), iovcnt as libc::c_int) };
        if written < 0 {
            return Err(io::Error::last_os_error());
        }
        if written as usize != total {
            return Err(io::Error::new(
                io::ErrorKind::WriteZero,
                "partial downcall write",
            ));
        }
        Ok(())
    }

    fn map_pools(
        &mut self,
        io_params: PoolParams,
        readdir_params: PoolParams,
    ) -> io::Result<(BufferPool, BufferPool)> {
        io_params.validate()?;
        readdir_params.validate()?;
        let fd = self.file.as_raw_fd();
        let mut offset: libc::off_t = 0;
        let mut map_one = |ioc: libc::c_ulong, params: PoolParams| -> io::Result<BufferPool> {
            let request = MapParams {
                count: params.count as u64,
                size: params.size as u64,
            };
            let rc = unsafe { libc::ioctl(fd, ioc, &request as *const MapParams) };
            if rc < 0 {
                return Err(io::Error::last_os_error());
            }
            let ptr = unsafe {
                libc::mmap(
                    std::ptr::null_mut(),
                    params.total_bytes(),
                    libc::PROT_READ | libc::PROT_WRITE,
                    libc::MAP_SHARED,
                    fd,
                    offset,
                )
            };
            if ptr == libc::MAP_FAILED {
                return Err(io::Error::last_os_error());
            }
            offset += params.total_bytes() as libc::off_t;
            Ok(unsafe { BufferPool::from_mmap(ptr.cast(), params.count, params.size) })
        };
        let io_pool = map_one(IOC_MAP_IO_POOL, io_params)?;
        let readdir_pool = map_one(IOC_MAP_READDIR_POOL, readdir_params)?;
        Ok((io_pool, readdir_pool))
    }

    fn remounter(&self) -> Box<dyn Remounter> {
        Box::new(FdRemounter {
            fd: self.file.as_raw_fd(),
        })
    }
}
