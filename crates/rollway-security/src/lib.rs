mod checksum;

pub use checksum::{constant_time_eq_hex, sha256_file_hex, sha256_hex};
