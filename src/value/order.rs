use std::cmp::Ordering;

use crate::value::{FirestoreValue, MapValue, ValueKind};

/// Rank of a value within the cross-type total order used for sorting query
/// results: null < boolean < number < timestamp < string < bytes < reference
/// < geopoint < array < map.
pub fn value_type_rank(value: &FirestoreValue) -> u8 {
    match value.kind() {
        ValueKind::Null => 0,
        ValueKind::Boolean(_) => 1,
        ValueKind::Integer(_) | ValueKind::Double(_) => 2,
        ValueKind::Timestamp(_) => 3,
        ValueKind::String(_) => 4,
        ValueKind::Bytes(_) => 5,
        ValueKind::Reference(_) => 6,
        ValueKind::GeoPoint(_) => 7,
        ValueKind::Array(_) => 8,
        ValueKind::Map(_) => 9,
        // Sentinels never reach the comparator: they are stripped into field
        // transforms before a value enters the cache.
        ValueKind::Sentinel(_) => 10,
    }
}

/// Total order across all value types. Values of different types order by
/// their type rank; values of the same type order naturally.
pub fn compare_values(left: &FirestoreValue, right: &FirestoreValue) -> Ordering {
    let rank = value_type_rank(left).cmp(&value_type_rank(right));
    if rank != Ordering::Equal {
        return rank;
    }

    match (left.kind(), right.kind()) {
        (ValueKind::Null, ValueKind::Null) => Ordering::Equal,
        (ValueKind::Boolean(a), ValueKind::Boolean(b)) => a.cmp(b),
        (ValueKind::Integer(a), ValueKind::Integer(b)) => a.cmp(b),
        (ValueKind::Double(a), ValueKind::Double(b)) => a.total_cmp(b),
        (ValueKind::Integer(a), ValueKind::Double(b)) => (*a as f64).total_cmp(b),
        (ValueKind::Double(a), ValueKind::Integer(b)) => a.total_cmp(&(*b as f64)),
        (ValueKind::Timestamp(a), ValueKind::Timestamp(b)) => a.cmp(b),
        (ValueKind::String(a), ValueKind::String(b)) => a.cmp(b),
        (ValueKind::Bytes(a), ValueKind::Bytes(b)) => a.cmp(b),
        (ValueKind::Reference(a), ValueKind::Reference(b)) => a.cmp(b),
        (ValueKind::GeoPoint(a), ValueKind::GeoPoint(b)) => a.compare(b),
        (ValueKind::Array(a), ValueKind::Array(b)) => {
            for (l, r) in a.values().iter().zip(b.values().iter()) {
                let ordering = compare_values(l, r);
                if ordering != Ordering::Equal {
                    return ordering;
                }
            }
            a.values().len().cmp(&b.values().len())
        }
        (ValueKind::Map(a), ValueKind::Map(b)) => compare_maps(a, b),
        _ => Ordering::Equal,
    }
}

fn compare_maps(left: &MapValue, right: &MapValue) -> Ordering {
    let mut left_iter = left.fields().iter();
    let mut right_iter = right.fields().iter();
    loop {
        match (left_iter.next(), right_iter.next()) {
            (Some((lk, lv)), Some((rk, rv))) => {
                let key_order = lk.cmp(rk);
                if key_order != Ordering::Equal {
                    return key_order;
                }
                let value_order = compare_values(lv, rv);
                if value_order != Ordering::Equal {
                    return value_order;
                }
            }
            (Some(_), None) => return Ordering::Greater,
            (None, Some(_)) => return Ordering::Less,
            (None, None) => return Ordering::Equal,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Timestamp;
    use std::collections::BTreeMap;

    #[test]
    fn type_ladder_is_total() {
        let ladder = vec![
            FirestoreValue::null(),
            FirestoreValue::from_bool(true),
            FirestoreValue::from_integer(42),
            FirestoreValue::from_timestamp(Timestamp::new(1, 0)),
            FirestoreValue::from_string("a"),
            FirestoreValue::from_bytes(vec![1u8]),
            FirestoreValue::from_reference("cities/sf"),
            FirestoreValue::from_array(vec![]),
            FirestoreValue::from_map(BTreeMap::new()),
        ];
        for window in ladder.windows(2) {
            assert_eq!(compare_values(&window[0], &window[1]), Ordering::Less);
        }
    }

    #[test]
    fn numbers_compare_across_integer_and_double() {
        assert_eq!(
            compare_values(
                &FirestoreValue::from_integer(2),
                &FirestoreValue::from_double(2.5)
            ),
            Ordering::Less
        );
        assert_eq!(
            compare_values(
                &FirestoreValue::from_double(3.0),
                &FirestoreValue::from_integer(3)
            ),
            Ordering::Equal
        );
    }

    #[test]
    fn arrays_compare_elementwise_then_length() {
        let short = FirestoreValue::from_array(vec![FirestoreValue::from_integer(1)]);
        let long = FirestoreValue::from_array(vec![
            FirestoreValue::from_integer(1),
            FirestoreValue::from_integer(2),
        ]);
        assert_eq!(compare_values(&short, &long), Ordering::Less);
    }

    #[test]
    fn maps_compare_by_sorted_entries() {
        let mut a = BTreeMap::new();
        a.insert("a".to_string(), FirestoreValue::from_integer(1));
        let mut b = BTreeMap::new();
        b.insert("a".to_string(), FirestoreValue::from_integer(2));
        assert_eq!(
            compare_values(&FirestoreValue::from_map(a), &FirestoreValue::from_map(b)),
            Ordering::Less
        );
    }
}
