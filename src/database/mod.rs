pub mod destructor;
pub mod keys;
pub mod store;

pub use destructor::KeyDestructor;
pub use store::{SetDb, WRITE_CHUNK};
