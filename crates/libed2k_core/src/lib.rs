pub mod constants;
pub mod ed2k_link;
pub mod filehash;
pub mod hash_id;
pub mod lengths;

pub use hash_id::Md4Hash;
