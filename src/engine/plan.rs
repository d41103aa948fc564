use std::collections::HashMap;

use super::error::SyncWarning;
use super::index::RemoteIndex;
use super::record::Record;

#[derive(Debug, Clone, Default)]
pub struct SyncPlan {
    /// `(row number, record)` for keys already present remotely, in input order.
    pub updates: Vec<(u32, Record)>,
    /// Records whose key is not present remotely, in input order.
    pub inserts: Vec<Record>,
    pub warnings: Vec<SyncWarning>,
}

impl SyncPlan {
    pub fn is_empty(&self) -> bool {
        self.updates.is_empty() && self.inserts.is_empty()
    }

    pub fn len(&self) -> usize {
        self.updates.len() + self.inserts.len()
    }
}

/// Splits `records` into updates and inserts against `index`.
///
/// Duplicate keys keep the last occurrence, placed where that last occurrence
/// appears in the input. Records with an empty key are dropped.
pub fn plan(records: Vec<Record>, key_column: &str, index: &RemoteIndex) -> SyncPlan {
    let keyed: Vec<(String, Record)> = records
        .into_iter()
        .map(|record| (record.cell(key_column), record))
        .collect();

    let mut last_seen: HashMap<&str, usize> = HashMap::new();
    let mut occurrences: HashMap<&str, usize> = HashMap::new();
    let mut empty_keys = 0usize;
    for (pos, (key, _)) in keyed.iter().enumerate() {
        if key.is_empty() {
            empty_keys += 1;
            continue;
        }
        last_seen.insert(key.as_str(), pos);
        *occurrences.entry(key.as_str()).or_insert(0) += 1;
    }

    let mut warnings: Vec<SyncWarning> = keyed
        .iter()
        .enumerate()
        .filter(|(pos, (key, _))| !key.is_empty() && last_seen.get(key.as_str()) == Some(pos))
        .filter_map(|(_, (key, _))| {
            let count = occurrences.get(key.as_str()).copied().unwrap_or(1);
            (count > 1).then(|| SyncWarning::DuplicateKey {
                key: key.clone(),
                dropped: count - 1,
            })
        })
        .collect();
    if empty_keys > 0 {
        warnings.push(SyncWarning::EmptyKey { count: empty_keys });
    }

    let winners: Vec<usize> = last_seen.values().copied().collect();
    let mut keep = vec![false; keyed.len()];
    for pos in winners {
        keep[pos] = true;
    }

    let mut out = SyncPlan {
        warnings,
        ..SyncPlan::default()
    };
    for ((key, record), keep) in keyed.into_iter().zip(keep) {
        if !keep {
            continue;
        }
        match index.row_of(&key) {
            Some(row) => out.updates.push((row, record)),
            None => out.inserts.push(record),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::record::Value;

    fn index_with(keys: &[(&str, u32)]) -> RemoteIndex {
        let mut index = RemoteIndex::empty();
        for (key, row) in keys {
            index.rows.insert(key.to_string(), *row);
        }
        index.header = Some(vec!["id".into()]);
        index.next_free_row = keys.iter().map(|(_, r)| r + 1).max().unwrap_or(2);
        index
    }

    fn rec(id: &str, note: &str) -> Record {
        Record::new().with("id", id).with("note", note)
    }

    #[test]
    fn empty_remote_means_all_inserts() {
        let records: Vec<Record> = (1..=1000).map(|i| rec(&i.to_string(), "n")).collect();
        let plan = plan(records, "id", &RemoteIndex::empty());
        assert_eq!(plan.updates.len(), 0);
        assert_eq!(plan.inserts.len(), 1000);
        assert!(plan.warnings.is_empty());
    }

    #[test]
    fn known_keys_become_updates_targeting_their_rows() {
        let index = index_with(&[("a", 2), ("b", 3)]);
        let plan = plan(vec![rec("b", "x"), rec("c", "y"), rec("a", "z")], "id", &index);
        let targets: Vec<(u32, String)> = plan
            .updates
            .iter()
            .map(|(row, r)| (*row, r.cell("id")))
            .collect();
        assert_eq!(targets, vec![(3, "b".to_string()), (2, "a".to_string())]);
        assert_eq!(plan.inserts.len(), 1);
        assert_eq!(plan.inserts[0].cell("id"), "c");
    }

    #[test]
    fn neighbouring_large_integer_keys_stay_distinct() {
        let records = vec![
            Record::new().with("id", Value::Integer(12_345_678_901_234_567)),
            Record::new().with("id", Value::Integer(12_345_678_901_234_568)),
        ];
        let plan = plan(records, "id", &RemoteIndex::empty());
        assert_eq!(plan.inserts.len(), 2);
        assert!(plan.warnings.is_empty());
        assert_eq!(plan.inserts[0].cell("id"), "12345678901234567");
    }

    #[test]
    fn duplicate_keys_keep_the_last_occurrence() {
        let plan = plan(
            vec![rec("K1", "first"), rec("K2", "only"), rec("K1", "second")],
            "id",
            &RemoteIndex::empty(),
        );
        let notes: Vec<String> = plan.inserts.iter().map(|r| r.cell("note")).collect();
        assert_eq!(notes, vec!["only", "second"]);
        assert_eq!(
            plan.warnings,
            vec![SyncWarning::DuplicateKey {
                key: "K1".into(),
                dropped: 1
            }]
        );
    }

    #[test]
    fn empty_keys_are_dropped_and_reported() {
        let plan = plan(
            vec![rec("", "blank"), rec("  ", "spaces"), rec("x", "ok")],
            "id",
            &RemoteIndex::empty(),
        );
        assert_eq!(plan.len(), 1);
        assert_eq!(plan.warnings, vec![SyncWarning::EmptyKey { count: 2 }]);
    }
}
