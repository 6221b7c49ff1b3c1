//! Shared ABI definitions between the Petrel kernel module and the
//! userspace client core.
//!
//! This crate contains the operation codes, upcall/downcall wire structures,
//! khandle layout, and error codes that both sides of the character device
//! protocol need to agree on.

#![cfg_attr(not(feature = "std"), no_std)]

#[cfg(feature = "std")]
extern crate std;

extern crate alloc;

pub mod dirent;

use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

// =============================================================================
// Protocol constants
// =============================================================================

/// Maximum length of a single path component, excluding the terminator.
pub const NAME_MAX: usize = 255;

/// Size of the fixed name field in wire structures.
pub const WIRE_NAME_SIZE: usize = NAME_MAX + 1;

/// Maximum length of a `proto://server/fsname` mount specification.
pub const SERVER_MAX: usize = 256;

/// Maximum size of a single extended attribute key.
pub const MAX_XATTR_KEY: usize = 256;

/// Maximum size of a single extended attribute value.
pub const MAX_XATTR_VALUE: usize = 4096;

/// Maximum number of keys returned by one listxattr operation.
pub const MAX_XATTR_LIST: usize = 64;

/// Maximum number of directory entries in one readdir page.
pub const MAX_DIRENTS: usize = 512;

/// Size of the shared-key buffer in the fs-key downcall.
pub const FS_KEY_MAX: usize = 128;

/// Size of the perf-counter text buffer in the perf downcall.
pub const PERF_BUF_SIZE: usize = 2048;

/// Sentinel in the I/O upcall's `readahead_size` field: the kernel has no
/// readahead estimate and the client should fall back to its configured
/// default read count.
pub const RA_READCNT_UNSET: i32 = -1;

/// Feature bit advertised in the features downcall when the client core
/// runs with the readahead cache enabled.
pub const FEATURE_READAHEAD: u64 = 1 << 0;

/// Iteration token starting a fresh readdir or listxattr walk.
pub const ITERATE_START: u64 = u64::MAX - 1;

// =============================================================================
// Operation codes
// =============================================================================

/// Upcall/downcall operation codes.
///
/// The numeric values are wire ABI; they match the kernel module and must
/// never be reordered.
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpKind {
    Lookup = 1,
    Create = 2,
    Symlink = 3,
    Getattr = 4,
    Setattr = 5,
    Remove = 6,
    Mkdir = 7,
    Readdir = 8,
    ReaddirPlus = 9,
    Rename = 10,
    Truncate = 11,
    GetXattr = 12,
    SetXattr = 13,
    RemoveXattr = 14,
    ListXattr = 15,
    Statfs = 16,
    Mount = 17,
    Umount = 18,
    PerfCount = 19,
    Param = 20,
    FsKey = 21,
    FileIo = 22,
    FileIox = 23,
    RaFlush = 24,
    Cancel = 25,
    Fsync = 26,
    Features = 27,
}

impl OpKind {
    /// Try to convert from a raw wire value.
    pub const fn from_i32(value: i32) -> Option<Self> {
        match value {
            1 => Some(Self::Lookup),
            2 => Some(Self::Create),
            3 => Some(Self::Symlink),
            4 => Some(Self::Getattr),
            5 => Some(Self::Setattr),
            6 => Some(Self::Remove),
            7 => Some(Self::Mkdir),
            8 => Some(Self::Readdir),
            9 => Some(Self::ReaddirPlus),
            10 => Some(Self::Rename),
            11 => Some(Self::Truncate),
            12 => Some(Self::GetXattr),
            13 => Some(Self::SetXattr),
            14 => Some(Self::RemoveXattr),
            15 => Some(Self::ListXattr),
            16 => Some(Self::Statfs),
            17 => Some(Self::Mount),
            18 => Some(Self::Umount),
            19 => Some(Self::PerfCount),
            20 => Some(Self::Param),
            21 => Some(Self::FsKey),
            22 => Some(Self::FileIo),
            23 => Some(Self::FileIox),
            24 => Some(Self::RaFlush),
            25 => Some(Self::Cancel),
            26 => Some(Self::Fsync),
            27 => Some(Self::Features),
            _ => None,
        }
    }

    /// Operation name for log lines.
    pub const fn name(self) -> &'static str {
        match self {
            Self::Lookup => "lookup",
            Self::Create => "create",
            Self::Symlink => "symlink",
            Self::Getattr => "getattr",
            Self::Setattr => "setattr",
            Self::Remove => "remove",
            Self::Mkdir => "mkdir",
            Self::Readdir => "readdir",
            Self::ReaddirPlus => "readdirplus",
            Self::Rename => "rename",
            Self::Truncate => "truncate",
            Self::GetXattr => "getxattr",
            Self::SetXattr => "setxattr",
            Self::RemoveXattr => "removexattr",
            Self::ListXattr => "listxattr",
            Self::Statfs => "statfs",
            Self::Mount => "mount",
            Self::Umount => "umount",
            Self::PerfCount => "perf-count",
            Self::Param => "param",
            Self::FsKey => "fs-key",
            Self::FileIo => "file-io",
            Self::FileIox => "file-iox",
            Self::RaFlush => "ra-flush",
            Self::Cancel => "cancel",
            Self::Fsync => "fsync",
            Self::Features => "features",
        }
    }
}

// =============================================================================
// Error codes
// =============================================================================

/// Negative-errno status codes carried in the downcall header.
///
/// The kernel maps these straight onto Linux errnos, so only
/// POSIX-mappable values may appear on the wire.
pub mod err {
    pub const EPERM: i32 = -1;
    pub const ENOENT: i32 = -2;
    pub const EINTR: i32 = -4;
    pub const EIO: i32 = -5;
    pub const EAGAIN: i32 = -11;
    pub const ENOMEM: i32 = -12;
    pub const EACCES: i32 = -13;
    pub const EEXIST: i32 = -17;
    pub const ENODEV: i32 = -19;
    pub const EINVAL: i32 = -22;
    pub const ENOSYS: i32 = -38;
    pub const ETIMEDOUT: i32 = -110;
    pub const ECANCELED: i32 = -125;
}

// =============================================================================
// Handles
// =============================================================================

/// The kernel-side 16-byte object handle.
///
/// The scalar handle occupies bytes 0..4 (low word) and 12..16 (high word)
/// with 8 zero bytes between. The kernel derives inode numbers from the two
/// outer words, so this layout must be preserved exactly.
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct Khandle(pub [u8; 16]);

impl Khandle {
    pub const NULL: Self = Self([0; 16]);

    /// Expand a scalar handle into the kernel layout.
    pub fn from_handle(handle: u64) -> Self {
        let mut bytes = [0u8; 16];
        bytes[0..4].copy_from_slice(&(handle as u32).to_le_bytes());
        bytes[12..16].copy_from_slice(&((handle >> 32) as u32).to_le_bytes());
        Self(bytes)
    }

    /// Collapse the kernel layout back into a scalar handle.
    pub fn to_handle(self) -> u64 {
        let lo = u32::from_le_bytes([self.0[0], self.0[1], self.0[2], self.0[3]]);
        let hi = u32::from_le_bytes([self.0[12], self.0[13], self.0[14], self.0[15]]);
        (hi as u64) << 32 | lo as u64
    }

    pub fn is_null(self) -> bool {
        self.0 == [0; 16]
    }
}

/// A kernel-side object reference: khandle plus filesystem id.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct KernelRef {
    pub khandle: Khandle,
    pub fs_id: i32,
    pub _pad: u32,
}

impl KernelRef {
    pub const NULL: Self = Self {
        khandle: Khandle::NULL,
        fs_id: 0,
        _pad: 0,
    };

    pub fn new(handle: u64, fs_id: i32) -> Self {
        Self {
            khandle: Khandle::from_handle(handle),
            fs_id,
            _pad: 0,
        }
    }
}

// =============================================================================
// Fixed-size strings
// =============================================================================

/// A NUL-padded name field in a wire structure.
#[repr(transparent)]
#[derive(Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct WireName(pub [u8; WIRE_NAME_SIZE]);

impl WireName {
    pub const EMPTY: Self = Self([0; WIRE_NAME_SIZE]);

    /// Build from a string, truncating at `NAME_MAX` bytes.
    pub fn from_str(s: &str) -> Self {
        let mut buf = [0u8; WIRE_NAME_SIZE];
        let len = s.len().min(NAME_MAX);
        buf[..len].copy_from_slice(&s.as_bytes()[..len]);
        Self(buf)
    }

    /// Bytes up to the first NUL.
    pub fn as_bytes(&self) -> &[u8] {
        let len = self.0.iter().position(|&b| b == 0).unwrap_or(NAME_MAX);
        &self.0[..len]
    }

    pub fn as_str(&self) -> &str {
        core::str::from_utf8(self.as_bytes()).unwrap_or("")
    }

    pub fn is_empty(&self) -> bool {
        self.0[0] == 0
    }
}

impl core::fmt::Debug for WireName {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{:?}", self.as_str())
    }
}

impl PartialEq for WireName {
    fn eq(&self, other: &Self) -> bool {
        self.as_bytes() == other.as_bytes()
    }
}

impl Eq for WireName {}

// =============================================================================
// Attributes
// =============================================================================

/// Object type discriminants carried in [`WireAttr::objtype`].
pub mod objtype {
    pub const NONE: i32 = 0;
    pub const FILE: i32 = 1;
    pub const DIRECTORY: i32 = 2;
    pub const SYMLINK: i32 = 3;
}

/// Attribute mask bits.
pub mod attrmask {
    pub const COMMON: u32 = 1 << 0;
    pub const SIZE: u32 = 1 << 1;
    pub const LNK_TARGET: u32 = 1 << 2;
    pub const ALL: u32 = COMMON | SIZE | LNK_TARGET;
}

/// Fixed-size attribute block shared by setattr upcalls, getattr downcalls
/// and the readdirplus trailer.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct WireAttr {
    pub owner: u32,
    pub group: u32,
    pub perms: u32,
    pub mask: u32,
    pub atime: i64,
    pub mtime: i64,
    pub ctime: i64,
    pub size: i64,
    pub objtype: i32,
    pub _pad: u32,
}

impl WireAttr {
    pub const ZERO: Self = Self {
        owner: 0,
        group: 0,
        perms: 0,
        mask: 0,
        atime: 0,
        mtime: 0,
        ctime: 0,
        size: 0,
        objtype: objtype::NONE,
        _pad: 0,
    };

    pub fn is_symlink(&self) -> bool {
        self.objtype == objtype::SYMLINK
    }
}

// =============================================================================
// I/O types
// =============================================================================

/// Direction of a file-io or file-iox transfer.
pub mod io_type {
    pub const READ: i32 = 1;
    pub const WRITE: i32 = 2;
}

/// One (offset, length) pair in a file-iox trailer.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct RwxPair {
    pub off: i64,
    pub len: i64,
}

// =============================================================================
// Param / perf subsystems
// =============================================================================

/// Cache subsystems addressed by param and perf-count upcalls.
pub mod subsystem {
    pub const ACACHE: u32 = 0;
    pub const NCACHE: u32 = 1;
    pub const CCACHE: u32 = 2;
    pub const CAPCACHE: u32 = 3;
}

/// Param operation selector.
pub mod param_op {
    pub const GET: u32 = 1;
    pub const SET: u32 = 2;
}

/// Parameter selector within a subsystem.
pub mod param_kind {
    pub const TIMEOUT_MSECS: u32 = 0;
    pub const SOFT_LIMIT: u32 = 1;
    pub const HARD_LIMIT: u32 = 2;
    pub const RECLAIM_PERCENTAGE: u32 = 3;
}

// =============================================================================
// Upcall wire format
// =============================================================================

/// Size reserved for the per-kind payload union in an upcall.
pub const UPCALL_DATA_AREA: usize = 640;

/// Total fixed size of an upcall as read from the device. Trailer bytes,
/// when present, follow immediately after.
pub const UPCALL_SIZE: usize = core::mem::size_of::<UpcallHeader>() + UPCALL_DATA_AREA;

/// Fixed upcall header preceding the per-kind payload.
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct UpcallHeader {
    pub kind: i32,
    pub uid: u32,
    pub gid: u32,
    pub _pad: u32,
    pub trailer_size: i64,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct LookupRequest {
    pub parent: KernelRef,
    pub sym_follow: i32,
    pub _pad: u32,
    pub name: WireName,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct CreateRequest {
    pub parent: KernelRef,
    pub attributes: WireAttr,
    pub name: WireName,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct SymlinkRequest {
    pub parent: KernelRef,
    pub attributes: WireAttr,
    pub name: WireName,
    pub target: WireName,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct GetattrRequest {
    pub refn: KernelRef,
    pub mask: u32,
    pub _pad: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct SetattrRequest {
    pub refn: KernelRef,
    pub attributes: WireAttr,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct RemoveRequest {
    pub parent: KernelRef,
    /// The object being unlinked, for cache invalidation.
    pub refn: KernelRef,
    pub name: WireName,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct MkdirRequest {
    pub parent: KernelRef,
    pub attributes: WireAttr,
    pub name: WireName,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct ReaddirRequest {
    pub refn: KernelRef,
    pub token: u64,
    pub count: u32,
    pub buf_index: i32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct ReaddirPlusRequest {
    pub refn: KernelRef,
    pub token: u64,
    pub count: u32,
    pub buf_index: i32,
    pub mask: u32,
    pub _pad: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct RenameRequest {
    pub old_parent: KernelRef,
    pub new_parent: KernelRef,
    pub old_name: WireName,
    pub new_name: WireName,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct TruncateRequest {
    pub refn: KernelRef,
    pub size: i64,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct GetXattrRequest {
    pub refn: KernelRef,
    pub key: WireName,
}

/// The value bytes travel in the upcall trailer.
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct SetXattrRequest {
    pub refn: KernelRef,
    pub flags: i32,
    pub val_sz: u32,
    pub key: WireName,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct RemoveXattrRequest {
    pub refn: KernelRef,
    pub key: WireName,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct ListXattrRequest {
    pub refn: KernelRef,
    pub token: u64,
    pub requested_count: u32,
    pub _pad: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct StatfsRequest {
    pub fs_id: i32,
    pub _pad: u32,
}

/// Mount specification in `proto://server/fsname` form.
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct MountRequest {
    pub config_server: WireName,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct UmountRequest {
    pub id: i32,
    pub fs_id: i32,
    pub config_server: WireName,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct PerfCountRequest {
    pub kind: u32,
    pub _pad: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct ParamRequest {
    pub op: u32,
    pub subsystem: u32,
    pub param: u32,
    pub _pad: u32,
    pub value: i64,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct FsKeyRequest {
    pub fs_id: i32,
    pub _pad: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct IoRequest {
    pub io_type: i32,
    pub buf_index: i32,
    pub count: i64,
    pub offset: i64,
    pub refn: KernelRef,
    /// Advisory readahead extent in bytes, or [`RA_READCNT_UNSET`].
    pub readahead_size: i32,
    pub _pad: u32,
}

/// The (offset, length) pairs travel in the upcall trailer as [`RwxPair`]s.
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct IoxRequest {
    pub io_type: i32,
    pub buf_index: i32,
    pub count: i64,
    pub refn: KernelRef,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct RaFlushRequest {
    pub refn: KernelRef,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct CancelRequest {
    pub op_tag: u64,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct FsyncRequest {
    pub refn: KernelRef,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct FeaturesRequest {
    pub mask: u64,
}

/// A decoded upcall payload.
#[derive(Debug, Clone, Copy)]
pub enum UpcallData {
    Lookup(LookupRequest),
    Create(CreateRequest),
    Symlink(SymlinkRequest),
    Getattr(GetattrRequest),
    Setattr(SetattrRequest),
    Remove(RemoveRequest),
    Mkdir(MkdirRequest),
    Readdir(ReaddirRequest),
    ReaddirPlus(ReaddirPlusRequest),
    Rename(RenameRequest),
    Truncate(TruncateRequest),
    GetXattr(GetXattrRequest),
    SetXattr(SetXattrRequest),
    RemoveXattr(RemoveXattrRequest),
    ListXattr(ListXattrRequest),
    Statfs(StatfsRequest),
    Mount(MountRequest),
    Umount(UmountRequest),
    PerfCount(PerfCountRequest),
    Param(ParamRequest),
    FsKey(FsKeyRequest),
    FileIo(IoRequest),
    FileIox(IoxRequest),
    RaFlush(RaFlushRequest),
    Cancel(CancelRequest),
    Fsync(FsyncRequest),
    Features(FeaturesRequest),
}

/// A decoded upcall.
#[derive(Debug, Clone, Copy)]
pub struct Upcall {
    pub kind: OpKind,
    pub uid: u32,
    pub gid: u32,
    pub trailer_size: i64,
    pub data: UpcallData,
}

/// Decode error for the fixed upcall section.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeError {
    /// Fewer than [`UPCALL_SIZE`] bytes available.
    Truncated,
    /// Unknown operation code.
    UnknownOp(i32),
}

impl Upcall {
    /// Decode the fixed section of an upcall buffer. Returns the upcall and
    /// the trailing bytes (which hold the trailer when `trailer_size > 0`).
    pub fn decode(buf: &[u8]) -> Result<(Upcall, &[u8]), DecodeError> {
        if buf.len() < UPCALL_SIZE {
            return Err(DecodeError::Truncated);
        }
        let (header, rest) =
            UpcallHeader::read_from_prefix(buf).map_err(|_| DecodeError::Truncated)?;
        let kind = OpKind::from_i32(header.kind).ok_or(DecodeError::UnknownOp(header.kind))?;
        let payload = &rest[..UPCALL_DATA_AREA];
        let trailer = &buf[UPCALL_SIZE..];

        fn read<T: FromBytes>(payload: &[u8]) -> Result<T, DecodeError> {
            T::read_from_prefix(payload)
                .map(|(v, _)| v)
                .map_err(|_| DecodeError::Truncated)
        }

        let data = match kind {
            OpKind::Lookup => UpcallData::Lookup(read(payload)?),
            OpKind::Create => UpcallData::Create(read(payload)?),
            OpKind::Symlink => UpcallData::Symlink(read(payload)?),
            OpKind::Getattr => UpcallData::Getattr(read(payload)?),
            OpKind::Setattr => UpcallData::Setattr(read(payload)?),
            OpKind::Remove => UpcallData::Remove(read(payload)?),
            OpKind::Mkdir => UpcallData::Mkdir(read(payload)?),
            OpKind::Readdir => UpcallData::Readdir(read(payload)?),
            OpKind::ReaddirPlus => UpcallData::ReaddirPlus(read(payload)?),
            OpKind::Rename => UpcallData::Rename(read(payload)?),
            OpKind::Truncate => UpcallData::Truncate(read(payload)?),
            OpKind::GetXattr => UpcallData::GetXattr(read(payload)?),
            OpKind::SetXattr => UpcallData::SetXattr(read(payload)?),
            OpKind::RemoveXattr => UpcallData::RemoveXattr(read(payload)?),
            OpKind::ListXattr => UpcallData::ListXattr(read(payload)?),
            OpKind::Statfs => UpcallData::Statfs(read(payload)?),
            OpKind::Mount => UpcallData::Mount(read(payload)?),
            OpKind::Umount => UpcallData::Umount(read(payload)?),
            OpKind::PerfCount => UpcallData::PerfCount(read(payload)?),
            OpKind::Param => UpcallData::Param(read(payload)?),
            OpKind::FsKey => UpcallData::FsKey(read(payload)?),
            OpKind::FileIo => UpcallData::FileIo(read(payload)?),
            OpKind::FileIox => UpcallData::FileIox(read(payload)?),
            OpKind::RaFlush => UpcallData::RaFlush(read(payload)?),
            OpKind::Cancel => UpcallData::Cancel(read(payload)?),
            OpKind::Fsync => UpcallData::Fsync(read(payload)?),
            OpKind::Features => UpcallData::Features(read(payload)?),
        };

        Ok((
            Upcall {
                kind,
                uid: header.uid,
                gid: header.gid,
                trailer_size: header.trailer_size,
                data,
            },
            trailer,
        ))
    }

    /// Encode into a fixed-size upcall buffer (kernel-side form; used by
    /// tests and tooling).
    pub fn encode(&self, out: &mut [u8]) {
        assert!(out.len() >= UPCALL_SIZE);
        out[..UPCALL_SIZE].fill(0);
        let header = UpcallHeader {
            kind: self.kind as i32,
            uid: self.uid,
            gid: self.gid,
            _pad: 0,
            trailer_size: self.trailer_size,
        };
        let header_size = core::mem::size_of::<UpcallHeader>();
        out[..header_size].copy_from_slice(header.as_bytes());
        let payload = &mut out[header_size..UPCALL_SIZE];

        fn put<T: IntoBytes + Immutable>(payload: &mut [u8], value: &T) {
            let bytes = value.as_bytes();
            payload[..bytes.len()].copy_from_slice(bytes);
        }

        match &self.data {
            UpcallData::Lookup(v) => put(payload, v),
            UpcallData::Create(v) => put(payload, v),
            UpcallData::Symlink(v) => put(payload, v),
            UpcallData::Getattr(v) => put(payload, v),
            UpcallData::Setattr(v) => put(payload, v),
            UpcallData::Remove(v) => put(payload, v),
            UpcallData::Mkdir(v) => put(payload, v),
            UpcallData::Readdir(v) => put(payload, v),
            UpcallData::ReaddirPlus(v) => put(payload, v),
            UpcallData::Rename(v) => put(payload, v),
            UpcallData::Truncate(v) => put(payload, v),
            UpcallData::GetXattr(v) => put(payload, v),
            UpcallData::SetXattr(v) => put(payload, v),
            UpcallData::RemoveXattr(v) => put(payload, v),
            UpcallData::ListXattr(v) => put(payload, v),
            UpcallData::Statfs(v) => put(payload, v),
            UpcallData::Mount(v) => put(payload, v),
            UpcallData::Umount(v) => put(payload, v),
            UpcallData::PerfCount(v) => put(payload, v),
            UpcallData::Param(v) => put(payload, v),
            UpcallData::FsKey(v) => put(payload, v),
            UpcallData::FileIo(v) => put(payload, v),
            UpcallData::FileIox(v) => put(payload, v),
            UpcallData::RaFlush(v) => put(payload, v),
            UpcallData::Cancel(v) => put(payload, v),
            UpcallData::Fsync(v) => put(payload, v),
            UpcallData::Features(v) => put(payload, v),
        }
    }
}

// =============================================================================
// Downcall wire format
// =============================================================================

/// Size reserved for the per-kind payload union in a downcall.
pub const DOWNCALL_DATA_AREA: usize = 4608;

/// Total fixed size of the primary downcall section. A trailer, when
/// present, is written as a second scatter element.
pub const DOWNCALL_SIZE: usize = core::mem::size_of::<DowncallHeader>() + DOWNCALL_DATA_AREA;

/// Fixed downcall header preceding the per-kind payload.
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct DowncallHeader {
    pub kind: i32,
    pub status: i32,
    pub trailer_size: i64,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct RefDown {
    pub refn: KernelRef,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct GetattrDown {
    pub attributes: WireAttr,
    /// Symlink targets are copied inline so the kernel path needs no extra
    /// buffer.
    pub link_target: WireName,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct ReaddirDown {
    pub token: u64,
    pub directory_version: u64,
    pub entry_count: u32,
    pub _pad: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct StatfsDown {
    pub block_size: i64,
    pub blocks_total: i64,
    pub blocks_avail: i64,
    pub files_total: i64,
    pub files_avail: i64,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct IoDown {
    pub amt_complete: i64,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct GetXattrDown {
    pub val_sz: u32,
    pub _pad: u32,
    pub val: [u8; MAX_XATTR_VALUE],
}

/// Size of the packed key buffer in the listxattr downcall.
pub const XATTR_LIST_BUF: usize = 4096;

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct ListXattrDown {
    pub token: u64,
    pub returned_count: u32,
    pub keylen: u32,
    pub lengths: [u32; MAX_XATTR_LIST],
    pub key: [u8; XATTR_LIST_BUF],
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct MountDown {
    pub fs_id: i32,
    pub id: i32,
    pub root_khandle: Khandle,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct PerfCountDown {
    pub buffer: [u8; PERF_BUF_SIZE],
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct ParamDown {
    pub value: i64,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct FsKeyDown {
    pub keylen: i32,
    pub _pad: u32,
    pub key: [u8; FS_KEY_MAX],
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct FeaturesDown {
    pub features: u64,
}

/// A downcall payload under construction.
#[derive(Debug, Clone, Copy)]
pub enum DowncallData {
    /// Status-only reply (setattr, remove, rename, fsync, cancel, ...).
    Empty,
    Ref(RefDown),
    Getattr(GetattrDown),
    Readdir(ReaddirDown),
    Statfs(StatfsDown),
    Io(IoDown),
    GetXattr(GetXattrDown),
    ListXattr(ListXattrDown),
    Mount(MountDown),
    PerfCount(PerfCountDown),
    Param(ParamDown),
    FsKey(FsKeyDown),
    Features(FeaturesDown),
}

/// A complete downcall primary section.
#[derive(Debug, Clone, Copy)]
pub struct Downcall {
    pub kind: OpKind,
    pub status: i32,
    pub trailer_size: i64,
    pub data: DowncallData,
}

impl Downcall {
    pub fn new(kind: OpKind) -> Self {
        Self {
            kind,
            status: 0,
            trailer_size: 0,
            data: DowncallData::Empty,
        }
    }

    /// Encode the fixed primary section into `out`.
    pub fn encode(&self, out: &mut [u8]) {
        assert!(out.len() >= DOWNCALL_SIZE);
        out[..DOWNCALL_SIZE].fill(0);
        let header = DowncallHeader {
            kind: self.kind as i32,
            status: self.status,
            trailer_size: self.trailer_size,
        };
        let header_size = core::mem::size_of::<DowncallHeader>();
        out[..header_size].copy_from_slice(header.as_bytes());
        let payload = &mut out[header_size..DOWNCALL_SIZE];

        fn put<T: IntoBytes + Immutable>(payload: &mut [u8], value: &T) {
            let bytes = value.as_bytes();
            payload[..bytes.len()].copy_from_slice(bytes);
        }

        match &self.data {
            DowncallData::Empty => {}
            DowncallData::Ref(v) => put(payload, v),
            DowncallData::Getattr(v) => put(payload, v),
            DowncallData::Readdir(v) => put(payload, v),
            DowncallData::Statfs(v) => put(payload, v),
            DowncallData::Io(v) => put(payload, v),
            DowncallData::GetXattr(v) => put(payload, v),
            DowncallData::ListXattr(v) => put(payload, v),
            DowncallData::Mount(v) => put(payload, v),
            DowncallData::PerfCount(v) => put(payload, v),
            DowncallData::Param(v) => put(payload, v),
            DowncallData::FsKey(v) => put(payload, v),
            DowncallData::Features(v) => put(payload, v),
        }
    }

    /// Decode the header of an encoded downcall (used by tests).
    pub fn decode_header(buf: &[u8]) -> Result<DowncallHeader, DecodeError> {
        DowncallHeader::read_from_prefix(buf)
            .map(|(h, _)| h)
            .map_err(|_| DecodeError::Truncated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn khandle_round_trips_scalar_handle() {
        for handle in [0u64, 1, 0xdead_beef, u64::MAX, 0x0123_4567_89ab_cdef] {
            assert_eq!(Khandle::from_handle(handle).to_handle(), handle);
        }
    }

    #[test]
    fn khandle_middle_bytes_are_zero() {
        let kh = Khandle::from_handle(u64::MAX);
        assert_eq!(&kh.0[4..12], &[0u8; 8]);
    }

    #[test]
    fn wire_name_truncates_and_round_trips() {
        let name = WireName::from_str("hello");
        assert_eq!(name.as_str(), "hello");
        let long = "x".repeat(300);
        assert_eq!(WireName::from_str(&long).as_bytes().len(), NAME_MAX);
    }

    #[test]
    fn every_upcall_payload_fits_the_data_area() {
        use core::mem::size_of;
        assert!(size_of::<LookupRequest>() <= UPCALL_DATA_AREA);
        assert!(size_of::<CreateRequest>() <= UPCALL_DATA_AREA);
        assert!(size_of::<SymlinkRequest>() <= UPCALL_DATA_AREA);
        assert!(size_of::<GetattrRequest>() <= UPCALL_DATA_AREA);
        assert!(size_of::<SetattrRequest>() <= UPCALL_DATA_AREA);
        assert!(size_of::<RemoveRequest>() <= UPCALL_DATA_AREA);
        assert!(size_of::<MkdirRequest>() <= UPCALL_DATA_AREA);
        assert!(size_of::<ReaddirRequest>() <= UPCALL_DATA_AREA);
        assert!(size_of::<ReaddirPlusRequest>() <= UPCALL_DATA_AREA);
        assert!(size_of::<RenameRequest>() <= UPCALL_DATA_AREA);
        assert!(size_of::<TruncateRequest>() <= UPCALL_DATA_AREA);
        assert!(size_of::<GetXattrRequest>() <= UPCALL_DATA_AREA);
        assert!(size_of::<SetXattrRequest>() <= UPCALL_DATA_AREA);
        assert!(size_of::<RemoveXattrRequest>() <= UPCALL_DATA_AREA);
        assert!(size_of::<ListXattrRequest>() <= UPCALL_DATA_AREA);
        assert!(size_of::<StatfsRequest>() <= UPCALL_DATA_AREA);
        assert!(size_of::<MountRequest>() <= UPCALL_DATA_AREA);
        assert!(size_of::<UmountRequest>() <= UPCALL_DATA_AREA);
        assert!(size_of::<PerfCountRequest>() <= UPCALL_DATA_AREA);
        assert!(size_of::<ParamRequest>() <= UPCALL_DATA_AREA);
        assert!(size_of::<FsKeyRequest>() <= UPCALL_DATA_AREA);
        assert!(size_of::<IoRequest>() <= UPCALL_DATA_AREA);
        assert!(size_of::<IoxRequest>() <= UPCALL_DATA_AREA);
        assert!(size_of::<RaFlushRequest>() <= UPCALL_DATA_AREA);
        assert!(size_of::<CancelRequest>() <= UPCALL_DATA_AREA);
        assert!(size_of::<FsyncRequest>() <= UPCALL_DATA_AREA);
        assert!(size_of::<FeaturesRequest>() <= UPCALL_DATA_AREA);
    }

    #[test]
    fn every_downcall_payload_fits_the_data_area() {
        use core::mem::size_of;
        assert!(size_of::<RefDown>() <= DOWNCALL_DATA_AREA);
        assert!(size_of::<GetattrDown>() <= DOWNCALL_DATA_AREA);
        assert!(size_of::<ReaddirDown>() <= DOWNCALL_DATA_AREA);
        assert!(size_of::<StatfsDown>() <= DOWNCALL_DATA_AREA);
        assert!(size_of::<IoDown>() <= DOWNCALL_DATA_AREA);
        assert!(size_of::<GetXattrDown>() <= DOWNCALL_DATA_AREA);
        assert!(size_of::<ListXattrDown>() <= DOWNCALL_DATA_AREA);
        assert!(size_of::<MountDown>() <= DOWNCALL_DATA_AREA);
        assert!(size_of::<PerfCountDown>() <= DOWNCALL_DATA_AREA);
        assert!(size_of::<ParamDown>() <= DOWNCALL_DATA_AREA);
        assert!(size_of::<FsKeyDown>() <= DOWNCALL_DATA_AREA);
        assert!(size_of::<FeaturesDown>() <= DOWNCALL_DATA_AREA);
    }

    #[test]
    fn upcall_io_round_trip() {
        let up = Upcall {
            kind: OpKind::FileIo,
            uid: 1000,
            gid: 1000,
            trailer_size: 0,
            data: UpcallData::FileIo(IoRequest {
                io_type: io_type::READ,
                buf_index: 3,
                count: 4096,
                offset: 8192,
                refn: KernelRef::new(0x42, 7),
                readahead_size: RA_READCNT_UNSET,
                _pad: 0,
            }),
        };
        let mut buf = [0u8; UPCALL_SIZE];
        up.encode(&mut buf);
        let (decoded, trailer) = Upcall::decode(&buf).unwrap();
        assert!(trailer.is_empty());
        assert_eq!(decoded.kind, OpKind::FileIo);
        assert_eq!(decoded.uid, 1000);
        match decoded.data {
            UpcallData::FileIo(io) => {
                assert_eq!(io.offset, 8192);
                assert_eq!(io.count, 4096);
                assert_eq!(io.refn.khandle.to_handle(), 0x42);
                assert_eq!(io.readahead_size, RA_READCNT_UNSET);
            }
            other => panic!("wrong payload: {other:?}"),
        }
    }

    #[test]
    fn upcall_decode_rejects_short_buffer() {
        let buf = [0u8; UPCALL_SIZE - 1];
        match Upcall::decode(&buf) {
            Err(DecodeError::Truncated) => {}
            other => panic!("expected Truncated: {other:?}"),
        }
    }

    #[test]
    fn upcall_decode_rejects_unknown_op() {
        let mut buf = [0u8; UPCALL_SIZE];
        buf[..4].copy_from_slice(&999i32.to_le_bytes());
        match Upcall::decode(&buf) {
            Err(DecodeError::UnknownOp(999)) => {}
            other => panic!("expected UnknownOp: {other:?}"),
        }
    }

    #[test]
    fn downcall_encodes_header_and_payload() {
        let mut dc = Downcall::new(OpKind::FileIo);
        dc.status = 0;
        dc.data = DowncallData::Io(IoDown { amt_complete: 512 });
        let mut buf = [0u8; DOWNCALL_SIZE];
        dc.encode(&mut buf);
        let header = Downcall::decode_header(&buf).unwrap();
        assert_eq!(header.kind, OpKind::FileIo as i32);
        assert_eq!(header.status, 0);
        let payload_off = core::mem::size_of::<DowncallHeader>();
        let amt = i64::from_le_bytes(buf[payload_off..payload_off + 8].try_into().unwrap());
        assert_eq!(amt, 512);
    }
}
