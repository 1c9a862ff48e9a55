// SPDX-License-Identifier: MIT
// Copyright (c) 2025 Jesof

//! Helpers over result-row lists: indexing, grouping, pagination, sorting

use std::cmp::Ordering;
use std::collections::HashMap;

use crate::protocol::Row;

/// Index rows by the value of `key`. Rows without the key are skipped;
/// later rows win on collisions.
#[must_use]
pub fn index_by(rows: &[Row], key: &str) -> HashMap<String, Row> {
    let mut index = HashMap::with_capacity(rows.len());
    for row in rows {
        if let Some(value) = row.get(key) {
            index.insert(value.clone(), row.clone());
        }
    }
    index
}

/// Group rows by the value of `key`. Rows without the key land under the
/// empty string.
#[must_use]
pub fn group_by(rows: &[Row], key: &str) -> HashMap<String, Vec<Row>> {
    let mut groups: HashMap<String, Vec<Row>> = HashMap::new();
    for row in rows {
        let group = row.get(key).cloned().unwrap_or_default();
        groups.entry(group).or_default().push(row.clone());
    }
    groups
}

/// One page of rows. Pages are numbered from 1; an out-of-range page is
/// empty.
#[must_use]
pub fn paginate(rows: &[Row], page: usize, page_size: usize) -> Vec<Row> {
    if page == 0 || page_size == 0 {
        return Vec::new();
    }
    rows.iter()
        .skip((page - 1) * page_size)
        .take(page_size)
        .cloned()
        .collect()
}

/// Sort rows by the value of `key`, numerically when both values parse as
/// numbers, lexically otherwise. Missing values sort first.
pub fn sort_by(rows: &mut [Row], key: &str, descending: bool) {
    rows.sort_by(|a, b| {
        let ordering = compare_values(a.get(key), b.get(key));
        if descending {
            ordering.reverse()
        } else {
            ordering
        }
    });
}

fn compare_values(a: Option<&String>, b: Option<&String>) -> Ordering {
    match (a, b) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        (Some(a), Some(b)) => match (a.parse::<f64>(), b.parse::<f64>()) {
            (Ok(x), Ok(y)) => x.partial_cmp(&y).unwrap_or(Ordering::Equal),
            _ => a.cmp(b),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(pairs: &[(&str, &str)]) -> Row {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect()
    }

    fn interfaces() -> Vec<Row> {
        vec![
            row(&[("name", "ether2"), ("mtu", "1500"), ("type", "ether")]),
            row(&[("name", "ether10"), ("mtu", "9000"), ("type", "ether")]),
            row(&[("name", "bridge1"), ("mtu", "1500"), ("type", "bridge")]),
        ]
    }

    #[test]
    fn test_index_by() {
        let index = index_by(&interfaces(), "name");
        assert_eq!(index.len(), 3);
        assert_eq!(
            index["ether10"].get("mtu").map(String::as_str),
            Some("9000")
        );
    }

    #[test]
    fn test_index_by_skips_missing_key() {
        let rows = vec![row(&[("name", "a")]), row(&[("mtu", "1500")])];
        assert_eq!(index_by(&rows, "name").len(), 1);
    }

    #[test]
    fn test_group_by() {
        let groups = group_by(&interfaces(), "type");
        assert_eq!(groups["ether"].len(), 2);
        assert_eq!(groups["bridge"].len(), 1);
    }

    #[test]
    fn test_paginate() {
        let rows = interfaces();
        assert_eq!(paginate(&rows, 1, 2).len(), 2);
        assert_eq!(paginate(&rows, 2, 2).len(), 1);
        assert_eq!(paginate(&rows, 3, 2).len(), 0);
        assert_eq!(paginate(&rows, 0, 2).len(), 0);
    }

    #[test]
    fn test_sort_numeric_aware() {
        let mut rows = interfaces();
        sort_by(&mut rows, "mtu", false);
        assert_eq!(rows[0].get("mtu").map(String::as_str), Some("1500"));
        assert_eq!(rows[2].get("mtu").map(String::as_str), Some("9000"));

        sort_by(&mut rows, "name", false);
        let names: Vec<&str> = rows.iter().filter_map(|r| r.get("name")).map(String::as_str).collect();
        // Lexical: "bridge1" < "ether10" < "ether2"
        assert_eq!(names, vec!["bridge1", "ether10", "ether2"]);
    }

    #[test]
    fn test_sort_descending() {
        let mut rows = interfaces();
        sort_by(&mut rows, "mtu", true);
        assert_eq!(rows[0].get("mtu").map(String::as_str), Some("9000"));
    }
}
