//! Relation filename classification (§4.4 LISTED step): parse a PGDATA
//! path into tablespace/db/rel/segment/fork, decide whether it's a
//! relation segment at all, and filter temp relations and non-init forks
//! of unlogged relations.

use camino::Utf8Path;

use pg_ffi::{FSM_FORKNUM, GLOBALTABLESPACE_OID, INIT_FORKNUM, MAIN_FORKNUM, VISIBILITYMAP_FORKNUM};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RelId {
    pub tblspcnode: u32,
    pub dbnode: u32,
    pub relnode: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PathClass {
    pub tblspcnode: u32,
    pub dbnode: u32,
    pub relnode: u32,
    pub segno: u32,
    pub forknum: u8,
    pub is_temp: bool,
}

impl PathClass {
    pub fn rel_id(&self) -> RelId {
        RelId {
            tblspcnode: self.tblspcnode,
            dbnode: self.dbnode,
            relnode: self.relnode,
        }
    }
}

/// Classify a PGDATA-relative path. Returns `None` for paths that aren't
/// relation segments at all (config files, `pg_wal/`, etc.) — those are
/// handled as plain files by the orchestrator.
pub fn classify_path(rel_path: &Utf8Path) -> Option<PathClass> {
    let mut components = rel_path.components();
    let first = components.next()?.as_str();

    let (tblspcnode, dbnode, remainder): (u32, u32, &Utf8Path) = match first {
        "global" => (GLOBALTABLESPACE_OID, 0, rel_path.strip_prefix("global").ok()?),
        "base" => {
            let after_base = rel_path.strip_prefix("base").ok()?;
            let mut it = after_base.components();
            let dbnode: u32 = it.next()?.as_str().parse().ok()?;
            (
                pg_ffi::DEFAULTTABLESPACE_OID,
                dbnode,
                after_base.strip_prefix(Utf8Path::new(&dbnode.to_string())).ok()?,
            )
        }
        "pg_tblspc" => {
            // pg_tblspc/<oid>/<version>/<dbnode>/<relfile>
            let mut it = rel_path.components();
            it.next(); // pg_tblspc
            let tblspc: u32 = it.next()?.as_str().parse().ok()?;
            let _version_dir = it.next()?;
            let dbnode: u32 = it.next()?.as_str().parse().ok()?;
            (tblspc, dbnode, it.as_path())
        }
        _ => return None,
    };

    let filename = remainder.file_name()?;
    parse_relfilename(filename).map(|(relnode, segno, forknum, is_temp)| PathClass {
        tblspcnode,
        dbnode,
        relnode,
        segno,
        forknum,
        is_temp,
    })
}

/// Parse `<relnode>[_<fork>][.<segno>]`, optionally temp-prefixed `t<N>_`.
fn parse_relfilename(name: &str) -> Option<(u32, u32, u8, bool)> {
    let is_temp = name.starts_with('t');
    let stripped = if is_temp {
        let rest = name.trim_start_matches('t');
        rest.split_once('_').map(|(_, r)| r)?
    } else {
        name
    };

    let (base, segno) = match stripped.split_once('.') {
        Some((b, s)) => (b, s.parse().ok()?),
        None => (stripped, 0u32),
    };

    let (relnode_str, forknum) = match base.split_once('_') {
        Some((r, "fsm")) => (r, FSM_FORKNUM),
        Some((r, "vm")) => (r, VISIBILITYMAP_FORKNUM),
        Some((r, "init")) => (r, INIT_FORKNUM),
        _ => (base, MAIN_FORKNUM),
    };

    let relnode: u32 = relnode_str.parse().ok()?;
    Some((relnode, segno, forknum, is_temp))
}

/// Should this fork be kept at all? Only the init fork of unlogged
/// relations is copied; main/fsm/vm of an unlogged relation are rebuilt
/// by the server on restart and would just bloat the backup (§4.4).
pub fn keep_fork(forknum: u8, relation_is_unlogged: bool) -> bool {
    if relation_is_unlogged {
        forknum == INIT_FORKNUM
    } else {
        true
    }
}

/// Detect a CFS (compressed) tablespace: a `pg_compression` marker file
/// sitting alongside the relation files in the tablespace version
/// directory (§4.4, GLOSSARY).
pub fn has_cfs_marker(tablespace_version_dir: &Utf8Path) -> bool {
    tablespace_version_dir.join("pg_compression").exists()
}
