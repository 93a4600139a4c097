//! Operator-published lists of banned names.
//!
//! A ban list is plain text. The first line is the version tag [`BAN_LIST_VERSION`]; every other
//! non-blank line is one name, surrounding whitespace ignored:
//!
//! ```text
//! FNBAN:v1
//! spam
//! malware-host
//! ```
//!
//! Banned names are refused by the update queue. Fetching the lists is left to the embedder.

use std::time::SystemTime;

use crate::{
    events::{BanListImportedEvent, Event},
    kv::{pluggables::KVStore, with_write_batch},
    utils::observable::Observable,
};

use super::ImportError;

pub const BAN_LIST_VERSION: &str = "FNBAN:v1";

pub fn parse_ban_list(text: &str) -> Result<Vec<String>, ImportError> {
    let mut lines = text.lines();
    let version = lines.next().unwrap_or("").trim();
    if version != BAN_LIST_VERSION {
        return Err(ImportError::BanListVersion(version.to_string()));
    }
    Ok(lines
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(String::from)
        .collect())
}

/// Parse every list in `lists` and ban the names they contain. Nothing is written unless all lists
/// parse. Returns the number of names banned.
pub fn import_ban_lists<K: KVStore>(
    kv: &mut K,
    lists: &[String],
    now: u64,
    events: &Observable<Event>,
) -> Result<usize, ImportError> {
    let names = lists
        .iter()
        .map(|list| parse_ban_list(list))
        .collect::<Result<Vec<_>, _>>()?
        .concat();
    with_write_batch(kv, |wb| {
        for name in &names {
            wb.set_name_ban(name);
        }
        wb.set_last_ban_list_import_at(now);
        Ok::<_, ImportError>(())
    })?;
    log::info!("imported {} banned names from {} lists", names.len(), lists.len());
    events.emit(Event::BanListImported(BanListImportedEvent {
        timestamp: SystemTime::now(),
        count: names.len(),
    }));
    Ok(names.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::{mem_db::MemDB, pluggables::KVGet};

    #[test]
    fn names_follow_the_version_line() {
        let names = parse_ban_list("FNBAN:v1\n spam \n\n\tmalware-host\n").unwrap();
        assert_eq!(names, vec!["spam".to_string(), "malware-host".to_string()]);
        assert!(parse_ban_list("FNBAN:v1").unwrap().is_empty());
    }

    #[test]
    fn other_versions_are_rejected() {
        assert!(matches!(
            parse_ban_list("FNBAN:v2\nspam"),
            Err(ImportError::BanListVersion(v)) if v == "FNBAN:v2"
        ));
        assert!(matches!(parse_ban_list(""), Err(ImportError::BanListVersion(_))));
    }

    #[test]
    fn imports_are_all_or_nothing() {
        let mut kv = MemDB::new();
        let events = Observable::new();
        let good = "FNBAN:v1\nspam".to_string();
        let bad = "nope\nother".to_string();

        assert!(import_ban_lists(&mut kv, &[good.clone(), bad], 100, &events).is_err());
        assert!(!kv.is_name_banned("spam"));
        assert_eq!(kv.last_ban_list_import_at().unwrap(), None);

        assert_eq!(import_ban_lists(&mut kv, &[good], 100, &events).unwrap(), 1);
        assert!(kv.is_name_banned("spam"));
        assert_eq!(kv.last_ban_list_import_at().unwrap(), Some(100));
    }
}
