//! SQLite connection tuning shared by every store handle
//!
//! WAL journal, NORMAL sync, in-memory temp tables, 256 MB mmap, 64 MB page
//! cache, checkpoint every 1000 pages, 5 s busy timeout.

use rusqlite::Connection;
use std::time::Duration;

const MMAP_SIZE_BYTES: i64 = 256 * 1024 * 1024;
/// Negative cache_size is in KiB
const CACHE_SIZE_KIB: i64 = -64 * 1024;
const WAL_AUTOCHECKPOINT_PAGES: i64 = 1000;
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Apply the write-optimized PRAGMA set to a freshly opened connection
///
/// Returns the journal mode SQLite actually selected (`memory` for
/// in-memory databases, `wal` otherwise).
pub fn apply_optimized_pragmas(conn: &Connection) -> rusqlite::Result<String> {
    let journal_mode: String =
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    conn.pragma_update(None, "temp_store", "MEMORY")?;
    conn.pragma_update(None, "mmap_size", MMAP_SIZE_BYTES)?;
    conn.pragma_update(None, "cache_size", CACHE_SIZE_KIB)?;
    conn.pragma_update(None, "wal_autocheckpoint", WAL_AUTOCHECKPOINT_PAGES)?;
    conn.busy_timeout(BUSY_TIMEOUT)?;

    log::debug!("📊 SQLite pragmas applied (journal_mode={})", journal_mode);
    Ok(journal_mode.to_lowercase())
}
