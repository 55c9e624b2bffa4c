mod array_value;
mod bytes_value;
mod map_value;
mod order;
mod value;

pub use array_value::ArrayValue;
pub use bytes_value::BytesValue;
pub use map_value::{remove_field, resolve_field, set_field, MapValue};
pub use order::{compare_values, value_type_rank};
pub use value::{FirestoreValue, SentinelValue, ValueKind};
