//! Cryptographic building blocks: the key exchange and both digests.

pub mod hash;
pub mod keys;
pub mod md5;
