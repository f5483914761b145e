use crate::prebake::entry::ConversationEntry;
use std::collections::{HashMap, HashSet};
use tracing::{info, warn};

pub const RETAINED_CHILD_REASON: &str =
    "Message has children that are being kept - preserving parent-child relationship";
pub const ISOLATED_PARENT_REASON: &str =
    "Removing would isolate parent message - preserving conversation flow";

/// Parent/child links of one artifact, keyed by uuid.
#[derive(Debug, Clone, Default)]
pub struct RelationshipMap {
    parents: HashMap<String, String>,
    children: HashMap<String, Vec<String>>,
}

impl RelationshipMap {
    pub fn build(entries: &[ConversationEntry]) -> Self {
        let mut map = Self::default();
        for entry in entries {
            if let Some(parent) = entry.parent_uuid.as_deref() {
                map.parents.insert(entry.uuid.clone(), parent.to_string());
                map.children
                    .entry(parent.to_string())
                    .or_default()
                    .push(entry.uuid.clone());
            }
        }
        map
    }

    pub fn parent(&self, uuid: &str) -> Option<&str> {
        self.parents.get(uuid).map(String::as_str)
    }

    pub fn children(&self, uuid: &str) -> &[String] {
        self.children.get(uuid).map(Vec::as_slice).unwrap_or(&[])
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropVerdict {
    Safe,
    Unsafe(&'static str),
}

/// Decides whether dropping `uuid` is safe given the entries retained so far.
pub fn check_drop(map: &RelationshipMap, uuid: &str, retained: &HashSet<String>) -> DropVerdict {
    let children = map.children(uuid);
    if children.iter().any(|child| retained.contains(child)) {
        return DropVerdict::Unsafe(RETAINED_CHILD_REASON);
    }
    if let Some(parent) = map.parent(uuid)
        && retained.contains(parent)
        && children.is_empty()
    {
        let sibling_retained = map
            .children(parent)
            .iter()
            .any(|sibling| sibling != uuid && retained.contains(sibling));
        if !sibling_retained {
            return DropVerdict::Unsafe(ISOLATED_PARENT_REASON);
        }
    }
    DropVerdict::Safe
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForcedKeep {
    pub index: usize,
    pub uuid: String,
    pub reason: &'static str,
}

/// Applies the guard to tentative `keep` decisions, latest entry first, so
/// every child is settled before its parent is judged. Afterwards every
/// retained entry's parent is retained too, as long as parents precede
/// children in `entries`.
pub fn enforce_retention(entries: &[ConversationEntry], keep: &mut [bool]) -> Vec<ForcedKeep> {
    let map = RelationshipMap::build(entries);
    let mut retained: HashSet<String> = entries
        .iter()
        .zip(keep.iter())
        .filter(|(_, kept)| **kept)
        .map(|(entry, _)| entry.uuid.clone())
        .collect();

    let mut forced = Vec::new();
    for (index, entry) in entries.iter().enumerate().rev() {
        if keep[index] {
            continue;
        }
        if let DropVerdict::Unsafe(reason) = check_drop(&map, &entry.uuid, &retained) {
            keep[index] = true;
            retained.insert(entry.uuid.clone());
            info!(uuid = %entry.uuid, index, reason, "integrity guard kept entry");
            forced.push(ForcedKeep {
                index,
                uuid: entry.uuid.clone(),
                reason,
            });
        }
    }
    forced.reverse();
    forced
}

/// Hand-off repair applied while an artifact is written: parent links must
/// point at an entry already written, and uuids must be unique.
#[derive(Debug, Default)]
pub struct LinkRepair {
    seen: HashSet<String>,
    pub cleared_parents: usize,
    pub rekeyed: usize,
}

impl LinkRepair {
    pub fn admit(&mut self, entry: &mut ConversationEntry) {
        if self.seen.contains(&entry.uuid) {
            let fresh = uuid::Uuid::new_v4().to_string();
            warn!(old = %entry.uuid, new = %fresh, "re-keyed duplicate uuid");
            entry.uuid = fresh;
            self.rekeyed += 1;
        }
        if let Some(parent) = entry.parent_uuid.as_deref()
            && !self.seen.contains(parent)
        {
            warn!(uuid = %entry.uuid, parent, "cleared parent not present earlier in the log");
            entry.parent_uuid = None;
            self.cleared_parents += 1;
        }
        self.seen.insert(entry.uuid.clone());
    }
}

/// Retained entries whose parent is missing or appears later.
pub fn dangling_parents(entries: &[ConversationEntry]) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for entry in entries {
        if let Some(parent) = entry.parent_uuid.as_deref()
            && !seen.contains(parent)
        {
            out.push(entry.uuid.clone());
        }
        seen.insert(entry.uuid.as_str());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::{
        DropVerdict, ISOLATED_PARENT_REASON, LinkRepair, RETAINED_CHILD_REASON, RelationshipMap,
        check_drop, dangling_parents, enforce_retention,
    };
    use crate::prebake::entry::{ContentBlock, ConversationEntry, EntryKind};
    use std::collections::HashSet;

    fn entry(uuid: &str, parent: Option<&str>) -> ConversationEntry {
        ConversationEntry::new(
            uuid,
            parent,
            EntryKind::Assistant,
            vec![ContentBlock::text(uuid)],
            "2025-01-01T00:00:00Z",
            "s1",
        )
    }

    #[test]
    fn chain_keeps_dropped_middle_when_descendant_survives() {
        let entries = vec![
            entry("A", None),
            entry("B", Some("A")),
            entry("C", Some("B")),
            entry("D", Some("C")),
        ];
        let mut keep = vec![true, true, false, true];
        let forced = enforce_retention(&entries, &mut keep);
        assert_eq!(keep, vec![true, true, true, true]);
        assert_eq!(forced.len(), 1);
        assert_eq!(forced[0].uuid, "C");
        assert_eq!(forced[0].reason, RETAINED_CHILD_REASON);
        assert!(dangling_parents(&entries).is_empty());
    }

    #[test]
    fn closure_holds_for_every_retained_entry() {
        let entries = vec![
            entry("A", None),
            entry("B", Some("A")),
            entry("C", Some("A")),
            entry("D", Some("B")),
            entry("E", Some("D")),
            entry("F", Some("C")),
        ];
        let mut keep = vec![false, false, false, false, true, false];
        enforce_retention(&entries, &mut keep);
        let kept: Vec<_> = entries
            .iter()
            .zip(&keep)
            .filter(|(_, k)| **k)
            .map(|(e, _)| e.clone())
            .collect();
        assert!(dangling_parents(&kept).is_empty());
        assert!(keep[0] && keep[1] && keep[3] && keep[4]);
    }

    #[test]
    fn only_leaf_under_retained_parent_is_kept() {
        let entries = vec![entry("P", None), entry("L", Some("P"))];
        let map = RelationshipMap::build(&entries);
        let retained: HashSet<String> = ["P".to_string()].into_iter().collect();
        assert_eq!(
            check_drop(&map, "L", &retained),
            DropVerdict::Unsafe(ISOLATED_PARENT_REASON)
        );
    }

    #[test]
    fn leaf_with_retained_sibling_may_be_dropped() {
        let entries = vec![entry("P", None), entry("L1", Some("P")), entry("L2", Some("P"))];
        let map = RelationshipMap::build(&entries);
        let retained: HashSet<String> = ["P", "L2"].iter().map(|s| s.to_string()).collect();
        assert_eq!(check_drop(&map, "L1", &retained), DropVerdict::Safe);
    }

    #[test]
    fn link_repair_clears_forward_refs_and_rekeys_duplicates() {
        let mut repair = LinkRepair::default();
        let mut first = entry("A", Some("Z"));
        let mut dup = entry("A", Some("A"));
        repair.admit(&mut first);
        repair.admit(&mut dup);
        assert!(first.parent_uuid.is_none());
        assert_ne!(dup.uuid, "A");
        assert_eq!(dup.parent_uuid.as_deref(), Some("A"));
        assert_eq!((repair.cleared_parents, repair.rekeyed), (1, 1));
    }
}
