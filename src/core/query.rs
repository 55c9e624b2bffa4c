use std::cmp::Ordering;
use std::fmt::Write as _;

use crate::error::{invalid_argument, FirestoreResult};
use crate::model::{Document, DocumentKey, FieldPath, ResourcePath};
use crate::value::{compare_values, value_type_rank, FirestoreValue, ValueKind};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FilterOperator {
    Equal,
    NotEqual,
    LessThan,
    LessThanOrEqual,
    GreaterThan,
    GreaterThanOrEqual,
    ArrayContains,
    ArrayContainsAny,
    In,
    NotIn,
}

impl FilterOperator {
    fn as_str(&self) -> &'static str {
        match self {
            FilterOperator::Equal => "==",
            FilterOperator::NotEqual => "!=",
            FilterOperator::LessThan => "<",
            FilterOperator::LessThanOrEqual => "<=",
            FilterOperator::GreaterThan => ">",
            FilterOperator::GreaterThanOrEqual => ">=",
            FilterOperator::ArrayContains => "array-contains",
            FilterOperator::ArrayContainsAny => "array-contains-any",
            FilterOperator::In => "in",
            FilterOperator::NotIn => "not-in",
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct FieldFilter {
    field: FieldPath,
    op: FilterOperator,
    value: FirestoreValue,
}

impl FieldFilter {
    pub fn new(field: FieldPath, op: FilterOperator, value: FirestoreValue) -> Self {
        Self { field, op, value }
    }

    pub fn field(&self) -> &FieldPath {
        &self.field
    }

    pub fn operator(&self) -> FilterOperator {
        self.op
    }

    pub fn value(&self) -> &FirestoreValue {
        &self.value
    }

    /// Evaluates the filter against a document field value. A missing field
    /// or a value of a different type never satisfies the filter.
    pub fn matches(&self, field_value: Option<&FirestoreValue>) -> bool {
        let value = match field_value {
            Some(value) => value,
            None => return false,
        };

        match self.op {
            FilterOperator::Equal => values_equal(value, &self.value),
            FilterOperator::NotEqual => {
                comparable_types(value, &self.value) && !values_equal(value, &self.value)
            }
            FilterOperator::LessThan => compare_same_type(value, &self.value)
                .is_some_and(|ordering| ordering == Ordering::Less),
            FilterOperator::LessThanOrEqual => compare_same_type(value, &self.value)
                .is_some_and(|ordering| ordering != Ordering::Greater),
            FilterOperator::GreaterThan => compare_same_type(value, &self.value)
                .is_some_and(|ordering| ordering == Ordering::Greater),
            FilterOperator::GreaterThanOrEqual => compare_same_type(value, &self.value)
                .is_some_and(|ordering| ordering != Ordering::Less),
            FilterOperator::ArrayContains => match value.kind() {
                ValueKind::Array(array) => array
                    .values()
                    .iter()
                    .any(|candidate| values_equal(candidate, &self.value)),
                _ => false,
            },
            FilterOperator::ArrayContainsAny => match (value.kind(), self.value.kind()) {
                (ValueKind::Array(array), ValueKind::Array(needles)) => needles
                    .values()
                    .iter()
                    .any(|needle| array.values().iter().any(|v| values_equal(v, needle))),
                _ => false,
            },
            FilterOperator::In => match self.value.kind() {
                ValueKind::Array(candidates) => candidates
                    .values()
                    .iter()
                    .any(|candidate| values_equal(candidate, value)),
                _ => false,
            },
            FilterOperator::NotIn => match self.value.kind() {
                ValueKind::Array(candidates) => {
                    !matches!(value.kind(), ValueKind::Null)
                        && candidates
                            .values()
                            .iter()
                            .all(|candidate| !values_equal(candidate, value))
                }
                _ => false,
            },
        }
    }
}

fn comparable_types(left: &FirestoreValue, right: &FirestoreValue) -> bool {
    value_type_rank(left) == value_type_rank(right)
}

fn compare_same_type(left: &FirestoreValue, right: &FirestoreValue) -> Option<Ordering> {
    comparable_types(left, right).then(|| compare_values(left, right))
}

fn values_equal(left: &FirestoreValue, right: &FirestoreValue) -> bool {
    comparable_types(left, right) && compare_values(left, right) == Ordering::Equal
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OrderDirection {
    Ascending,
    Descending,
}

impl OrderDirection {
    fn as_str(&self) -> &'static str {
        match self {
            OrderDirection::Ascending => "asc",
            OrderDirection::Descending => "desc",
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct OrderBy {
    field: FieldPath,
    direction: OrderDirection,
}

impl OrderBy {
    pub fn new(field: FieldPath, direction: OrderDirection) -> Self {
        Self { field, direction }
    }

    pub fn field(&self) -> &FieldPath {
        &self.field
    }

    pub fn direction(&self) -> OrderDirection {
        self.direction
    }
}

/// A cursor over the ordered result set.
#[derive(Clone, Debug, PartialEq)]
pub struct Bound {
    values: Vec<FirestoreValue>,
    inclusive: bool,
}

impl Bound {
    pub fn new(values: Vec<FirestoreValue>, inclusive: bool) -> Self {
        Self { values, inclusive }
    }

    pub fn values(&self) -> &[FirestoreValue] {
        &self.values
    }

    pub fn inclusive(&self) -> bool {
        self.inclusive
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum LimitType {
    #[default]
    First,
    Last,
}

/// The structural description of a query: a collection path or collection
/// group, filters, ordering, cursors, and a limit.
///
/// Equality is structural: two queries built independently from the same
/// components compare equal (via the canonical id).
#[derive(Clone, Debug)]
pub struct Query {
    path: ResourcePath,
    collection_group: Option<String>,
    filters: Vec<FieldFilter>,
    explicit_order_by: Vec<OrderBy>,
    start_at: Option<Bound>,
    end_at: Option<Bound>,
    limit: Option<i32>,
    limit_type: LimitType,
}

impl Query {
    /// A query over a single collection.
    pub fn collection(path: ResourcePath) -> FirestoreResult<Self> {
        if path.is_empty() || path.len() % 2 == 0 {
            return Err(invalid_argument(format!(
                "Invalid collection path '{}': collections have an odd number of segments",
                path.canonical_string()
            )));
        }
        Ok(Self {
            path,
            collection_group: None,
            filters: Vec::new(),
            explicit_order_by: Vec::new(),
            start_at: None,
            end_at: None,
            limit: None,
            limit_type: LimitType::First,
        })
    }

    /// A query matching exactly one document. Used for limbo resolution,
    /// where a single document's server state must be re-fetched.
    pub fn document(key: DocumentKey) -> Self {
        Self {
            path: key.path().clone(),
            collection_group: None,
            filters: Vec::new(),
            explicit_order_by: Vec::new(),
            start_at: None,
            end_at: None,
            limit: None,
            limit_type: LimitType::First,
        }
    }

    /// A query over every collection with the given id, anywhere in the tree.
    pub fn collection_group(collection_id: impl Into<String>) -> FirestoreResult<Self> {
        let collection_id = collection_id.into();
        if collection_id.is_empty() || collection_id.contains('/') {
            return Err(invalid_argument(
                "Collection group ids must be non-empty and cannot contain '/'",
            ));
        }
        Ok(Self {
            path: ResourcePath::root(),
            collection_group: Some(collection_id),
            filters: Vec::new(),
            explicit_order_by: Vec::new(),
            start_at: None,
            end_at: None,
            limit: None,
            limit_type: LimitType::First,
        })
    }

    pub fn path(&self) -> &ResourcePath {
        &self.path
    }

    pub fn collection_group_id(&self) -> Option<&str> {
        self.collection_group.as_deref()
    }

    pub fn filters(&self) -> &[FieldFilter] {
        &self.filters
    }

    pub fn limit(&self) -> Option<i32> {
        self.limit
    }

    pub fn limit_type(&self) -> LimitType {
        self.limit_type
    }

    pub fn start_at(&self) -> Option<&Bound> {
        self.start_at.as_ref()
    }

    pub fn end_at(&self) -> Option<&Bound> {
        self.end_at.as_ref()
    }

    pub fn with_filter(mut self, filter: FieldFilter) -> Self {
        self.filters.push(filter);
        self
    }

    pub fn with_order_by(mut self, order: OrderBy) -> Self {
        self.explicit_order_by.push(order);
        self
    }

    pub fn with_limit(mut self, limit: i32, limit_type: LimitType) -> FirestoreResult<Self> {
        if limit <= 0 {
            return Err(invalid_argument("Query limits must be positive"));
        }
        self.limit = Some(limit);
        self.limit_type = limit_type;
        Ok(self)
    }

    pub fn with_start_at(mut self, bound: Bound) -> Self {
        self.start_at = Some(bound);
        self
    }

    pub fn with_end_at(mut self, bound: Bound) -> Self {
        self.end_at = Some(bound);
        self
    }

    /// The effective ordering: the explicit order-by list followed by the
    /// implicit document-key tiebreak (direction of the last explicit term).
    pub fn normalized_order_by(&self) -> Vec<OrderBy> {
        let mut order_by = self.explicit_order_by.clone();
        let has_key_order = order_by
            .iter()
            .any(|order| order.field().is_document_id());
        if !has_key_order {
            let direction = order_by
                .last()
                .map(OrderBy::direction)
                .unwrap_or(OrderDirection::Ascending);
            order_by.push(OrderBy::new(FieldPath::document_id(), direction));
        }
        order_by
    }

    /// Whether `key` could belong to this query's result set, ignoring
    /// filters. Used to invalidate views on cache writes.
    pub fn matches_key(&self, key: &DocumentKey) -> bool {
        match &self.collection_group {
            Some(group) => {
                key.collection_id() == group && self.path.is_prefix_of(key.path())
            }
            None => {
                if self.path.len() % 2 == 0 {
                    // Document query: exactly one key matches.
                    key.path() == &self.path
                } else {
                    key.collection_path() == self.path
                }
            }
        }
    }

    /// Full match: path, filters, and cursor bounds.
    pub fn matches(&self, document: &Document) -> bool {
        document.exists()
            && self.matches_key(document.key())
            && self
                .filters
                .iter()
                .all(|filter| filter.matches(field_value(document, filter.field()).as_ref()))
            && self.matches_bounds(document)
    }

    fn matches_bounds(&self, document: &Document) -> bool {
        let order_by = self.normalized_order_by();
        if let Some(bound) = &self.start_at {
            if bound_compare(bound, document, &order_by) == Ordering::Greater
                || (!bound.inclusive()
                    && bound_compare(bound, document, &order_by) == Ordering::Equal)
            {
                return false;
            }
        }
        if let Some(bound) = &self.end_at {
            if bound_compare(bound, document, &order_by) == Ordering::Less
                || (!bound.inclusive()
                    && bound_compare(bound, document, &order_by) == Ordering::Equal)
            {
                return false;
            }
        }
        true
    }

    /// Orders two documents per the query ordering, ties broken by key.
    pub fn compare(&self, left: &Document, right: &Document) -> Ordering {
        for order in self.normalized_order_by() {
            let ordering = if order.field().is_document_id() {
                left.key().cmp(right.key())
            } else {
                let left_value =
                    field_value(left, order.field()).unwrap_or_else(FirestoreValue::null);
                let right_value =
                    field_value(right, order.field()).unwrap_or_else(FirestoreValue::null);
                compare_values(&left_value, &right_value)
            };
            let ordering = match order.direction() {
                OrderDirection::Ascending => ordering,
                OrderDirection::Descending => ordering.reverse(),
            };
            if ordering != Ordering::Equal {
                return ordering;
            }
        }
        Ordering::Equal
    }

    /// Canonical structural identity; two queries are the same target iff
    /// their canonical ids match.
    pub fn canonical_id(&self) -> String {
        let mut id = self.path.canonical_string();
        if let Some(group) = &self.collection_group {
            let _ = write!(id, "|cg:{group}");
        }
        let _ = write!(id, "|f:");
        for filter in &self.filters {
            let _ = write!(
                id,
                "{}{}{:?},",
                filter.field().canonical_string(),
                filter.operator().as_str(),
                filter.value()
            );
        }
        let _ = write!(id, "|ob:");
        for order in self.normalized_order_by() {
            let _ = write!(
                id,
                "{}{},",
                order.field().canonical_string(),
                order.direction().as_str()
            );
        }
        if let Some(limit) = self.limit {
            let _ = write!(id, "|l:{limit}{:?}", self.limit_type);
        }
        if let Some(bound) = &self.start_at {
            let _ = write!(id, "|sa:{}{:?}", bound.inclusive(), bound.values());
        }
        if let Some(bound) = &self.end_at {
            let _ = write!(id, "|ea:{}{:?}", bound.inclusive(), bound.values());
        }
        id
    }
}

impl PartialEq for Query {
    fn eq(&self, other: &Self) -> bool {
        self.canonical_id() == other.canonical_id()
    }
}

impl Eq for Query {}

/// Structural equality helper mirroring the public `queriesEqual` API.
pub fn queries_equal(left: &Query, right: &Query) -> bool {
    left == right
}

/// Resolves a field value for ordering/filtering, treating `__name__` as the
/// document's full path.
pub fn field_value(document: &Document, field: &FieldPath) -> Option<FirestoreValue> {
    if field.is_document_id() {
        return Some(FirestoreValue::from_reference(
            document.key().canonical_string(),
        ));
    }
    document
        .fields()
        .and_then(|map| map.field(field))
        .cloned()
}

/// Position of `bound` relative to `document` under `order_by`: `Less` means
/// the bound sorts before the document.
fn bound_compare(bound: &Bound, document: &Document, order_by: &[OrderBy]) -> Ordering {
    for (index, order) in order_by.iter().enumerate() {
        let bound_value = match bound.values().get(index) {
            Some(value) => value,
            None => break,
        };
        let doc_value = if order.field().is_document_id() {
            FirestoreValue::from_reference(document.key().canonical_string())
        } else {
            field_value(document, order.field()).unwrap_or_else(FirestoreValue::null)
        };
        let mut ordering = compare_values(bound_value, &doc_value);
        if order.direction() == OrderDirection::Descending {
            ordering = ordering.reverse();
        }
        if ordering != Ordering::Equal {
            return ordering;
        }
    }
    Ordering::Equal
}
