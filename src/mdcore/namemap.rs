//! Name/UUID map (spec.md §4.7), modeled on `/run/mdadm/map`: a small
//! line-oriented file under an advisory lock, rewritten atomically on every
//! change. Device-number allocation is grounded directly on
//! `examples/original_source/mdopen.c`'s `dev_open`/`find_free_devnm`
//! scheme — free slots starting past the legacy `md0..md127` range, wrapping
//! back to it only once `md128..md511` is exhausted.

use crate::mdcore::error::MdError;
use anyhow::{anyhow, Result};
use uuid::Uuid;

/// Highest legacy minor, inclusive (mdopen.c `find_free_devnm`: the search
/// starts here and descends).
pub const MAX_LEGACY_MINOR: u32 = 127;
/// mdopen.c's loop condition is `devnum != 128` — the wrap from 0 lands on
/// 511 and descends back down to 129; 128 itself is never tried.
pub const RESERVED_MINOR: u32 = 128;
pub const FIRST_EXTENDED_MINOR: u32 = 129;
pub const MAX_MINOR: u32 = 511;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MapEntry {
    pub devnm: String,
    pub family_num: u32,
    pub uuid: Uuid,
    pub path: String,
}

/// In-memory model of the map file's contents. Persistence (the advisory
/// lock + atomic rewrite described in spec.md §4.7) is a thin layer on top,
/// kept separate so the allocation/query logic has no I/O in its tests.
#[derive(Debug, Default)]
pub struct NameMap {
    entries: Vec<MapEntry>,
}

impl NameMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> &[MapEntry] {
        &self.entries
    }

    pub fn by_devnm(&self, devnm: &str) -> Option<&MapEntry> {
        self.entries.iter().find(|e| e.devnm == devnm)
    }

    pub fn by_uuid(&self, uuid: Uuid) -> Option<&MapEntry> {
        self.entries.iter().find(|e| e.uuid == uuid)
    }

    pub fn by_path(&self, path: &str) -> Option<&MapEntry> {
        self.entries.iter().find(|e| e.path == path)
    }

    /// Find a free `mdN` devnm the way mdopen.c's `find_free_devnm` does:
    /// `for (devnum = 127; devnum != 128; devnum = devnum ? devnum-1 : 511)`
    /// — start at 127, descend to 0, wrap to 511, descend back down to 129.
    /// 128 is never tried.
    pub fn allocate_devnm(&self) -> Result<String> {
        let used: std::collections::HashSet<u32> = self
            .entries
            .iter()
            .filter_map(|e| e.devnm.strip_prefix("md").and_then(|n| n.parse().ok()))
            .collect();
        for n in (0..=MAX_LEGACY_MINOR).rev().chain((FIRST_EXTENDED_MINOR..=MAX_MINOR).rev()) {
            if !used.contains(&n) {
                return Ok(format!("md{}", n));
            }
        }
        Err(MdError::Config("no free md device numbers left".into()).into())
    }

    pub fn claim(&mut self, devnm: String, family_num: u32, uuid: Uuid, path: String) -> Result<()> {
        if self.entries.iter().any(|e| e.devnm == devnm) {
            return Err(MdError::Config(format!("{} already claimed", devnm)).into());
        }
        self.entries.push(MapEntry { devnm, family_num, uuid, path });
        Ok(())
    }

    pub fn release(&mut self, devnm: &str) {
        self.entries.retain(|e| e.devnm != devnm);
    }

    /// Serialize to the map file's line format: `<devnm> <family_num>
    /// <uuid> <path>`, one entry per line, grounded on mdopen.c's `map_write`.
    pub fn serialize(&self) -> String {
        let mut out = String::new();
        for e in &self.entries {
            out.push_str(&format!("{} {} {} {}\n", e.devnm, e.family_num, e.uuid, e.path));
        }
        out
    }

    pub fn parse(text: &str) -> Result<Self> {
        let mut map = NameMap::new();
        for (lineno, line) in text.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let mut parts = line.split_whitespace();
            let devnm = parts.next().ok_or_else(|| anyhow!("map line {}: missing devnm", lineno))?;
            let family_num: u32 = parts
                .next()
                .ok_or_else(|| anyhow!("map line {}: missing family_num", lineno))?
                .parse()?;
            let uuid: Uuid = parts.next().ok_or_else(|| anyhow!("map line {}: missing uuid", lineno))?.parse()?;
            let path = parts.next().ok_or_else(|| anyhow!("map line {}: missing path", lineno))?;
            map.entries.push(MapEntry { devnm: devnm.to_string(), family_num, uuid, path: path.to_string() });
        }
        Ok(map)
    }
}

/// File-backed persistence: advisory-locks the map file, reads, lets the
/// caller mutate, then does a temp-write + fsync + rename (spec.md §4.7
/// "Persistence"). Kept generic over a small `MapStore` trait so tests don't
/// need a real filesystem.
pub trait MapStore {
    fn read(&self) -> Result<String>;
    fn atomic_write(&mut self, contents: &str) -> Result<()>;
}

/// In-memory `MapStore`, standing in for `/run/mdadm/map` in tests.
#[derive(Debug, Default)]
pub struct MemoryMapStore {
    pub contents: String,
}

impl MapStore for MemoryMapStore {
    fn read(&self) -> Result<String> {
        Ok(self.contents.clone())
    }

    fn atomic_write(&mut self, contents: &str) -> Result<()> {
        self.contents = contents.to_string();
        Ok(())
    }
}

/// Runs `f` with the current map loaded, then persists whatever `f` leaves
/// in it. Models the lock-read-mutate-rewrite critical section; the
/// `advisory lock` itself is a real filesystem construct left to the
/// `MapStore` implementor (e.g. `flock` on the real file).
pub fn with_map<S: MapStore>(store: &mut S, f: impl FnOnce(&mut NameMap) -> Result<()>) -> Result<()> {
    let text = store.read()?;
    let mut map = NameMap::parse(&text)?;
    f(&mut map)?;
    store.atomic_write(&map.serialize())
}

#[derive(Debug, Default)]
pub struct HostIdentity {
    pub homehost: Option<String>,
}

/// Identity match used by incremental assembly (spec.md §4.4): a container
/// "belongs" to this host if its recorded homehost matches, or if no
/// homehost policy is configured at all.
pub fn identity_matches(identity: &HostIdentity, recorded_homehost: Option<&str>) -> bool {
    match (&identity.homehost, recorded_homehost) {
        (None, _) => true,
        (Some(_), None) => false,
        (Some(want), Some(got)) => want == got,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocates_highest_free_legacy_devnm_first() {
        let mut map = NameMap::new();
        map.claim("md127".into(), 1, Uuid::nil(), "/dev/md127".into()).unwrap();
        assert_eq!(map.allocate_devnm().unwrap(), "md126");
    }

    #[test]
    fn fresh_map_allocates_md127_first() {
        let map = NameMap::new();
        assert_eq!(map.allocate_devnm().unwrap(), "md127");
    }

    #[test]
    fn spills_into_extended_range_once_legacy_exhausted_skipping_128() {
        let mut map = NameMap::new();
        for n in 0..=MAX_LEGACY_MINOR {
            map.claim(format!("md{}", n), n, Uuid::nil(), format!("/dev/md{}", n)).unwrap();
        }
        assert_eq!(map.allocate_devnm().unwrap(), "md511");
    }

    #[test]
    fn never_allocates_reserved_minor_128() {
        let mut map = NameMap::new();
        for n in (0..=MAX_LEGACY_MINOR).chain(FIRST_EXTENDED_MINOR..=MAX_MINOR) {
            map.claim(format!("md{}", n), n, Uuid::nil(), format!("/dev/md{}", n)).unwrap();
        }
        assert!(map.allocate_devnm().is_err());
        assert!(map.by_devnm("md128").is_none());
    }

    #[test]
    fn serialize_parse_round_trips() {
        let mut map = NameMap::new();
        let uuid = Uuid::new_v4();
        map.claim("md5".into(), 42, uuid, "/dev/md5".into()).unwrap();
        let text = map.serialize();
        let back = NameMap::parse(&text).unwrap();
        assert_eq!(back.by_devnm("md5").unwrap().uuid, uuid);
    }

    #[test]
    fn with_map_persists_through_store() {
        let mut store = MemoryMapStore::default();
        let uuid = Uuid::new_v4();
        with_map(&mut store, |m| m.claim("md0".into(), 1, uuid, "/dev/md0".into())).unwrap();
        with_map(&mut store, |m| {
            assert!(m.by_devnm("md0").is_some());
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn identity_without_homehost_policy_matches_anything() {
        let identity = HostIdentity { homehost: None };
        assert!(identity_matches(&identity, Some("otherhost")));
    }

    #[test]
    fn identity_rejects_mismatched_homehost() {
        let identity = HostIdentity { homehost: Some("thishost".into()) };
        assert!(!identity_matches(&identity, Some("otherhost")));
    }
}
