mod header;
mod objects;
mod value;

pub use header::{Header, HeaderFlags, ObjectType};
pub use objects::{Bytes, Tuple, scan_object};
pub use value::Value;
