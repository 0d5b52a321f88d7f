// src/docroot.rs
//
// Filesystem collaborator: resolves request targets under the document
// root and produces read-only memory mappings of the files it serves.
use std::ffi::{CString, OsStr};
use std::io;
use std::mem;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use std::ptr;

use libc::c_void;

/// Longest docroot-relative target accepted, matching the request path
/// buffer bound.
pub const MAX_TARGET_LEN: usize = 512;

/// Outcome of resolving a request target against the document root.
#[derive(Debug)]
pub enum Lookup {
    File(FileMeta),
    NotFound,
    /// Exists but is not other-readable.
    Forbidden,
    Directory,
    /// Escapes the root or exceeds the path bound.
    Invalid,
}

/// Metadata for a resolved, servable file.
#[derive(Debug, Clone)]
pub struct FileMeta {
    pub path: PathBuf,
    pub len: u64,
}

pub struct DocRoot {
    root: PathBuf,
}

impl DocRoot {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Join the target onto the root and classify what is there. The
    /// target must start with '/' (the parser guarantees it). Targets
    /// with `..` segments are rejected before touching the filesystem.
    pub fn resolve(&self, target: &[u8]) -> Lookup {
        if target.len() > MAX_TARGET_LEN {
            return Lookup::Invalid;
        }
        if target.split(|&b| b == b'/').any(|seg| seg == b"..") {
            return Lookup::Invalid;
        }

        let rel = OsStr::from_bytes(&target[1..]);
        let path = self.root.join(rel);

        let st = match stat_path(&path) {
            Ok(st) => st,
            Err(_) => return Lookup::NotFound,
        };
        if st.st_mode & libc::S_IROTH == 0 {
            return Lookup::Forbidden;
        }
        if st.st_mode & libc::S_IFMT == libc::S_IFDIR {
            return Lookup::Directory;
        }

        Lookup::File(FileMeta {
            path,
            len: st.st_size as u64,
        })
    }

    /// Map the resolved file read-only and private. The descriptor is
    /// closed right after mapping; the mapping keeps the pages alive.
    pub fn map(&self, meta: &FileMeta) -> io::Result<Mapping> {
        if meta.len == 0 {
            // mmap rejects zero-length maps; an empty file has no body.
            return Ok(Mapping::empty());
        }

        let cpath = CString::new(meta.path.as_os_str().as_bytes())
            .map_err(|_| io::Error::from(io::ErrorKind::InvalidInput))?;
        unsafe {
            let fd = libc::open(cpath.as_ptr(), libc::O_RDONLY);
            if fd < 0 {
                return Err(io::Error::last_os_error());
            }
            let ptr = libc::mmap(
                ptr::null_mut(),
                meta.len as usize,
                libc::PROT_READ,
                libc::MAP_PRIVATE,
                fd,
                0,
            );
            libc::close(fd);
            if ptr == libc::MAP_FAILED {
                return Err(io::Error::last_os_error());
            }
            Ok(Mapping {
                ptr: ptr as *mut u8,
                len: meta.len as usize,
            })
        }
    }
}

fn stat_path(path: &Path) -> io::Result<libc::stat> {
    let cpath = CString::new(path.as_os_str().as_bytes())?;
    unsafe {
        let mut st: libc::stat = mem::zeroed();
        if libc::stat(cpath.as_ptr(), &mut st) < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(st)
    }
}

/// An exclusively-owned, read-only private mapping of a served file.
/// Unmapped on drop.
pub struct Mapping {
    ptr: *mut u8,
    len: usize,
}

// The region is private, read-only, and only ever touched by the one
// context currently driving the connection.
unsafe impl Send for Mapping {}

impl Mapping {
    fn empty() -> Self {
        Self {
            ptr: ptr::null_mut(),
            len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_slice(&self) -> &[u8] {
        if self.ptr.is_null() {
            &[]
        } else {
            unsafe { std::slice::from_raw_parts(self.ptr, self.len) }
        }
    }
}

impl Drop for Mapping {
    fn drop(&mut self) {
        if !self.ptr.is_null() {
            unsafe {
                libc::munmap(self.ptr as *mut c_void, self.len);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::os::unix::fs::PermissionsExt;

    fn fixture_root(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("etude-docroot-{}-{}", tag, std::process::id()));
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn resolves_readable_file() {
        let root = fixture_root("file");
        fs::write(root.join("hello.html"), b"<p>hi</p>").unwrap();
        let docroot = DocRoot::new(&root);
        match docroot.resolve(b"/hello.html") {
            Lookup::File(meta) => assert_eq!(meta.len, 9),
            other => panic!("expected File, got {other:?}"),
        }
    }

    #[test]
    fn missing_file_is_not_found() {
        let root = fixture_root("missing");
        let docroot = DocRoot::new(&root);
        assert!(matches!(docroot.resolve(b"/nope.html"), Lookup::NotFound));
    }

    #[test]
    fn unreadable_file_is_forbidden() {
        let root = fixture_root("forbidden");
        let path = root.join("secret.html");
        fs::write(&path, b"hidden").unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o600)).unwrap();
        let docroot = DocRoot::new(&root);
        assert!(matches!(docroot.resolve(b"/secret.html"), Lookup::Forbidden));
    }

    #[test]
    fn directory_target_is_flagged() {
        let root = fixture_root("dir");
        fs::create_dir(root.join("sub")).unwrap();
        let docroot = DocRoot::new(&root);
        assert!(matches!(docroot.resolve(b"/sub"), Lookup::Directory));
    }

    #[test]
    fn traversal_is_rejected_without_stat() {
        let root = fixture_root("traversal");
        let docroot = DocRoot::new(&root);
        assert!(matches!(docroot.resolve(b"/../etc/passwd"), Lookup::Invalid));
        assert!(matches!(docroot.resolve(b"/a/../../b"), Lookup::Invalid));
    }

    #[test]
    fn oversized_target_is_rejected() {
        let root = fixture_root("long");
        let docroot = DocRoot::new(&root);
        let long = [b'a'; MAX_TARGET_LEN + 1];
        assert!(matches!(docroot.resolve(&long), Lookup::Invalid));
    }

    #[test]
    fn mapping_round_trips_file_bytes() {
        let root = fixture_root("map");
        fs::write(root.join("data.bin"), b"0123456789").unwrap();
        let docroot = DocRoot::new(&root);
        let meta = match docroot.resolve(b"/data.bin") {
            Lookup::File(meta) => meta,
            other => panic!("expected File, got {other:?}"),
        };
        let mapping = docroot.map(&meta).unwrap();
        assert_eq!(mapping.as_slice(), b"0123456789");
    }

    #[test]
    fn empty_file_maps_to_empty_slice() {
        let root = fixture_root("empty");
        fs::write(root.join("empty.html"), b"").unwrap();
        let docroot = DocRoot::new(&root);
        let meta = match docroot.resolve(b"/empty.html") {
            Lookup::File(meta) => meta,
            other => panic!("expected File, got {other:?}"),
        };
        let mapping = docroot.map(&meta).unwrap();
        assert!(mapping.is_empty());
        assert_eq!(mapping.as_slice(), b"");
    }
}
