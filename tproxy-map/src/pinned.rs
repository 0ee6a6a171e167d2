use std::io;
use std::mem::{self, MaybeUninit};
use std::os::fd::{AsFd, AsRawFd};
use std::path::Path;

use aya::maps::{HashMap, IterableMap, Map, MapData};
use tracing::debug;

use tproxy_map_common::{RuleKey, RuleRecord};

use crate::error::UpdateError;
use crate::store::{StoreClient, StoreError};

/// `BPF_ANY`: create the element or replace an existing one.
const UPDATE_ANY: u64 = 0;

const BPF_MAP_LOOKUP_ELEM: libc::c_long = 1;

/// The `BPF_MAP_*_ELEM` member of `union bpf_attr`.
#[repr(C)]
struct MapElemAttr {
    map_fd: u32,
    _pad: u32,
    key: u64,
    value: u64,
    flags: u64,
}

/// [`StoreClient`] over the hash map pinned by the tc redirect program.
///
/// The map fd is owned by the inner `MapData` and closed on drop.
///
/// Records are too large to pass by value, so lookups go straight into a
/// heap buffer instead of through `HashMap::get`.
pub struct PinnedStore {
    map: HashMap<MapData, RuleKey, RuleRecord>,
}

impl PinnedStore {
    /// Opens the pinned map and checks that its key and value sizes match
    /// [`RuleKey`] and [`RuleRecord`].
    pub fn open<P: AsRef<Path>>(pin_path: P) -> Result<Self, UpdateError> {
        let pin = pin_path.as_ref();
        let open_error = |source| UpdateError::StoreOpen {
            path: pin.display().to_string(),
            source,
        };

        let map_data = MapData::from_pin(pin).map_err(open_error)?;
        let map = HashMap::<_, RuleKey, RuleRecord>::try_from(Map::HashMap(map_data))
            .map_err(open_error)?;

        debug!(path = %pin.display(), "opened pinned rule map");
        Ok(Self { map })
    }
}

impl StoreClient for PinnedStore {
    fn get(&self, key: &RuleKey) -> Result<Option<Box<RuleRecord>>, StoreError> {
        let fd = self.map.map().fd().as_fd().as_raw_fd();
        let mut record = Box::<RuleRecord>::new_zeroed();
        let found = lookup_outcome(lookup_elem(fd, key, &mut record))?;
        // SAFETY: the buffer starts zeroed and RuleRecord is plain old data.
        Ok(found.then(|| unsafe { record.assume_init() }))
    }

    fn put(&mut self, key: &RuleKey, record: &RuleRecord) -> Result<(), StoreError> {
        self.map
            .insert(key, record, UPDATE_ANY)
            .map_err(|e| StoreError::Write(e.to_string()))
    }
}

fn lookup_elem(
    fd: libc::c_int,
    key: &RuleKey,
    value: &mut MaybeUninit<RuleRecord>,
) -> io::Result<()> {
    let attr = MapElemAttr {
        map_fd: fd as u32,
        _pad: 0,
        key: key as *const RuleKey as u64,
        value: value.as_mut_ptr() as u64,
        flags: 0,
    };
    // SAFETY: attr points at a live key and a writable buffer of the map's
    // value size, which `PinnedStore::open` checked.
    let ret = unsafe {
        libc::syscall(
            libc::SYS_bpf,
            BPF_MAP_LOOKUP_ELEM,
            &attr as *const MapElemAttr,
            mem::size_of::<MapElemAttr>() as libc::c_uint,
        )
    };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// `ENOENT` is a miss; any other failure is a lookup error.
fn lookup_outcome(result: io::Result<()>) -> Result<bool, StoreError> {
    match result {
        Ok(()) => Ok(true),
        Err(e) if e.raw_os_error() == Some(libc::ENOENT) => Ok(false),
        Err(e) => Err(StoreError::Lookup(format!("bpf_map_lookup_elem failed: {e}"))),
    }
}
