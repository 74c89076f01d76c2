pub mod error;
pub mod types;
pub mod value;

pub use error::{DatabaseError, Result, StoreError, StoreResult};
pub use types::{CLIENT_ID_FIELD, ClientId, Document, ID_FIELD, ObjectId};
pub use value::{compare_values, get_path, values_equal};
